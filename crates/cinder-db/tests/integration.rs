//! Integration tests for ledgers: documents end to end, compaction under
//! load, and key gossip between peers through the meta merger.

use cinder_blockstore::{GatewayRegistry, LedgerConfigBuilder, MemoryGateway};
use cinder_core::wire::MetaFormat;
use cinder_db::{ChangesOptions, DbError, Ledger, MergerSync};
use cinder_merger::{Connection, MetaMerger};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_batch_is_one_event_and_one_commit() {
    init_tracing();
    let registry = GatewayRegistry::new();
    let ledger = Ledger::open(LedgerConfigBuilder::new("batch").build(), &registry)
        .await
        .unwrap();

    let res = ledger
        .bulk(vec![json!({"_id": "a", "n": 1}), json!({"_id": "b", "n": 2})])
        .await
        .unwrap();
    assert_eq!(res.ids, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(res.clock.len(), 1);
    assert_eq!(ledger.car_log_len(), 1);
    assert_eq!(ledger.clock_vis().await.unwrap().len(), 1);

    assert_eq!(ledger.get("a").await.unwrap()["n"], json!(1));
    assert_eq!(ledger.get("b").await.unwrap()["n"], json!(2));

    let changes = ledger.changes(&[], ChangesOptions::default()).await.unwrap();
    let ids: BTreeSet<&str> = changes.rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, BTreeSet::from(["a", "b"]));
}

#[tokio::test]
async fn test_newer_write_wins_and_diff_is_idempotent() {
    let registry = GatewayRegistry::new();
    let ledger = Ledger::open(LedgerConfigBuilder::new("ordering").build(), &registry)
        .await
        .unwrap();
    ledger.put(json!({"_id": "k", "v": "first"})).await.unwrap();
    let second = ledger.put(json!({"_id": "k", "v": "second"})).await.unwrap();
    assert_eq!(ledger.get("k").await.unwrap()["v"], json!("second"));

    let none = ledger.changes(&second.clock, ChangesOptions::default()).await.unwrap();
    assert!(none.rows.is_empty());
    assert_eq!(none.clock, second.clock);
}

#[tokio::test]
async fn test_failed_commit_leaves_head_unchanged() {
    let registry = GatewayRegistry::new();
    let gateway = Arc::new(MemoryGateway::new());
    registry.insert("memory://broken", gateway.clone()).unwrap();
    let config = LedgerConfigBuilder::new("broken").store_url("memory://broken").build();
    let ledger = Ledger::open(config, &registry).await.unwrap();
    let ok = ledger.put(json!({"_id": "a"})).await.unwrap();

    gateway.fail_writes(true);
    let err = ledger.put(json!({"_id": "b"})).await.unwrap_err();
    assert!(matches!(err, DbError::Store(_)));
    assert_eq!(ledger.head().await, ok.clock);
    assert_eq!(ledger.car_log_len(), 1);
    assert_eq!(ledger.store().open_transactions(), 0);

    gateway.fail_writes(false);
    assert!(ledger.get("b").await.unwrap_err().is_not_found());
    ledger.put(json!({"_id": "b"})).await.unwrap();
    assert_eq!(ledger.all_docs().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_docs_survive_concurrent_compaction() {
    init_tracing();
    let registry = GatewayRegistry::new();
    let config = LedgerConfigBuilder::new("busy").auto_compact(4).build();
    let ledger = Arc::new(Ledger::open(config.clone(), &registry).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..30 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger.put(json!({"_id": format!("doc-{i:02}"), "i": i})).await.unwrap();
            if i % 7 == 0 {
                ledger.compact().await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    ledger.store().wait_for_compaction().await;

    let docs = ledger.all_docs().await.unwrap();
    assert_eq!(docs.len(), 30);

    let reopened = Ledger::open(config, &registry).await.unwrap();
    assert_eq!(reopened.head().await, ledger.head().await);
    let ids: Vec<String> = reopened
        .all_docs()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d["_id"].as_str().unwrap_or_default().to_string())
        .collect();
    let expected: Vec<String> = (0..30).map(|i| format!("doc-{i:02}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_files_round_trip() {
    let registry = GatewayRegistry::new();
    let config = LedgerConfigBuilder::new("files").file_chunk_size(100).build();
    let ledger = Ledger::open(config, &registry).await.unwrap();
    let data: Vec<u8> = (0..=255u8).cycle().take(1234).collect();
    let file = ledger.put_file(&data).await.unwrap();
    assert_eq!(ledger.read_file(&file, 0, 1234).await.unwrap(), data);
    assert_eq!(ledger.read_file(&file, 250, 10).await.unwrap(), data[250..260].to_vec());
}

#[tokio::test]
async fn test_gossiped_key_lets_peer_decrypt() {
    init_tracing();
    let registry = GatewayRegistry::new();
    let cloud = Arc::new(MemoryGateway::new());
    registry.insert("memory://cloud", cloud).unwrap();
    let merger = Arc::new(MetaMerger::open_in_memory("hub").unwrap());

    let p1 = Ledger::open(
        LedgerConfigBuilder::new("shared")
            .store_url("memory://p1")
            .remote("memory://cloud")
            .build(),
        &registry,
    )
    .await
    .unwrap();
    let p2 = Ledger::open(
        LedgerConfigBuilder::new("shared")
            .store_url("memory://p2")
            .remote("memory://cloud")
            .build(),
        &registry,
    )
    .await
    .unwrap();

    p1.bulk(vec![json!({"_id": "a", "from": "p1"}), json!({"_id": "b", "from": "p1"})])
        .await
        .unwrap();

    // without the key the archive cannot be opened
    let mut keyless = p1.outgoing_meta().unwrap().unwrap();
    keyless.keys.clear();
    assert!(p2.apply_remote(&keyless).await.is_err());
    assert!(p2.head().await.is_empty());

    let s1 = MergerSync::new(merger.clone(), Connection::new("acme", "shared", "p1", "p1"));
    let s2 = MergerSync::new(merger.clone(), Connection::new("acme", "shared", "p2", "p2"));
    assert_eq!(s1.push(&p1).await.unwrap(), 1);

    let report = s2.pull(&p2).await.unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.head, p1.head().await);
    assert_eq!(p2.get("a").await.unwrap()["from"], json!("p1"));

    // a second pull delivers nothing new
    assert_eq!(s2.pull(&p2).await.unwrap().merged, 0);

    // and the way back
    p2.put(json!({"_id": "c", "from": "p2"})).await.unwrap();
    s2.push(&p2).await.unwrap();
    let back = s1.pull(&p1).await.unwrap();
    assert_eq!(back.merged, 1);
    assert_eq!(p1.get("c").await.unwrap()["from"], json!("p2"));
    assert_eq!(p1.head().await, p2.head().await);
}

#[tokio::test]
async fn test_legacy_payload_is_accepted() {
    let registry = GatewayRegistry::new();
    let cloud = Arc::new(MemoryGateway::new());
    registry.insert("memory://legacy-cloud", cloud).unwrap();
    let writer = Ledger::open(
        LedgerConfigBuilder::new("legacy")
            .store_url("memory://legacy-a")
            .remote("memory://legacy-cloud")
            .build(),
        &registry,
    )
    .await
    .unwrap();
    let reader = Ledger::open(
        LedgerConfigBuilder::new("legacy")
            .store_url("memory://legacy-b")
            .remote("memory://legacy-cloud")
            .build(),
        &registry,
    )
    .await
    .unwrap();

    writer.put(json!({"_id": "x", "v": 1})).await.unwrap();
    let raw = writer.export_meta(MetaFormat::V1).unwrap().unwrap();
    let report = reader.import_meta(&raw).await.unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(reader.get("x").await.unwrap()["v"], json!(1));
}
