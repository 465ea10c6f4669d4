//! Integration tests for the clock: causal reads over real block stores and
//! property tests for first-seen-wins resolution.

use async_trait::async_trait;
use cinder_blockstore::{
    BlockFetcher, CommitOpts, DbMeta, EncryptedBlockStore, GatewayRegistry, LedgerConfigBuilder,
    Transaction,
};
use cinder_clock::{ChangesOptions, Crdt, DocUpdate};
use cinder_core::{Block, Hash};
use cinder_keybag::KeyBag;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

struct TxOnly<'a>(&'a Transaction);

#[async_trait]
impl BlockFetcher for TxOnly<'_> {
    async fn get_block(&self, address: &Hash) -> cinder_blockstore::Result<Option<Block>> {
        Ok(self.0.get(address))
    }
}

#[tokio::test]
async fn test_events_survive_commit_and_reopen() {
    let registry = GatewayRegistry::new();
    let keybag = KeyBag::memory();
    let config = LedgerConfigBuilder::new("clock").build();
    let store = EncryptedBlockStore::open(config.clone(), &registry, &keybag)
        .await
        .unwrap();
    let crdt = Crdt::new();

    let mut head = Vec::new();
    for i in 0..3 {
        let tx = store.open_transaction();
        let fetcher = store.fetcher(&tx);
        let result = crdt
            .apply_bulk_update(
                &fetcher,
                &tx,
                &head,
                &[DocUpdate::put(format!("doc-{i}"), json!({"n": i}))],
            )
            .await
            .unwrap();
        store
            .commit_transaction(&tx, DbMeta { head: result.head.clone() }.into(), CommitOpts::default())
            .await
            .unwrap();
        head = result.head;
    }

    let reopened = EncryptedBlockStore::open(config, &registry, &keybag)
        .await
        .unwrap();
    let meta = reopened.ready().await.unwrap().unwrap();
    assert_eq!(meta.head(), Some(head.as_slice()));

    let fresh = Crdt::new();
    assert_eq!(
        fresh.get_value(&reopened, &head, "doc-1").await.unwrap(),
        json!({"n": 1})
    );
    let all = fresh.all_entries(&reopened, &head).await.unwrap();
    assert_eq!(all.len(), 3);
    let changes = fresh
        .changes_since(&reopened, &head, &[], ChangesOptions::default())
        .await
        .unwrap();
    let ids: Vec<&str> = changes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2"]);
}

#[tokio::test]
async fn test_concurrent_branches_merge() {
    let tx = Transaction::new();
    let f = TxOnly(&tx);
    let crdt = Crdt::new();
    let base = crdt
        .apply_bulk_update(&f, &tx, &[], &[DocUpdate::put("a", json!(0))])
        .await
        .unwrap();
    let left = crdt
        .apply_bulk_update(&f, &tx, &base.head, &[DocUpdate::put("left", json!(1))])
        .await
        .unwrap();
    let right = crdt
        .apply_bulk_update(&f, &tx, &base.head, &[DocUpdate::delete("a")])
        .await
        .unwrap();

    let head = crdt.advance(&f, &left.head, &right.event).await.unwrap();
    assert!(crdt.get_value(&f, &head, "a").await.is_err());
    assert_eq!(crdt.get_value(&f, &head, "left").await.unwrap(), json!(1));

    let since_left = crdt
        .changes_since(&f, &head, &left.head, ChangesOptions::default())
        .await
        .unwrap();
    assert_eq!(since_left, vec![DocUpdate::delete("a")]);
}

fn write_strategy() -> impl Strategy<Value = Vec<(u8, i64)>> {
    prop::collection::vec((0u8..6, any::<i64>()), 1..24)
}

async fn apply_all(
    crdt: &Crdt,
    tx: &Transaction,
    writes: &[(u8, i64)],
) -> Vec<Vec<Hash>> {
    let f = TxOnly(tx);
    let mut heads = vec![Vec::new()];
    for (key, value) in writes {
        let head = heads.last().cloned().unwrap_or_default();
        let result = crdt
            .apply_bulk_update(&f, tx, &head, &[DocUpdate::put(format!("k{key}"), json!(value))])
            .await
            .unwrap();
        heads.push(result.head);
    }
    heads
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_latest_write_wins(writes in write_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let tx = Transaction::new();
            let crdt = Crdt::new();
            let heads = apply_all(&crdt, &tx, &writes).await;
            let head = heads.last().unwrap();
            let f = TxOnly(&tx);

            let mut latest: HashMap<String, i64> = HashMap::new();
            let mut order: Vec<String> = Vec::new();
            for (key, value) in &writes {
                let key = format!("k{key}");
                latest.insert(key.clone(), *value);
                order.retain(|k| k != &key);
                order.push(key);
            }
            for (key, value) in &latest {
                assert_eq!(crdt.get_value(&f, head, key).await.unwrap(), json!(value));
            }
            let changes = crdt
                .changes_since(&f, head, &[], ChangesOptions::default())
                .await
                .unwrap();
            let ids: Vec<String> = changes.iter().map(|c| c.id.clone()).collect();
            assert_eq!(ids, order);
            for change in &changes {
                assert_eq!(change.value, Some(json!(latest[&change.id])));
            }
        });
    }

    #[test]
    fn prop_diff_is_idempotent(writes in write_strategy(), split in any::<prop::sample::Index>()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let tx = Transaction::new();
            let crdt = Crdt::new();
            let heads = apply_all(&crdt, &tx, &writes).await;
            let head = heads.last().unwrap();
            let f = TxOnly(&tx);

            let none = crdt
                .changes_since(&f, head, head, ChangesOptions::default())
                .await
                .unwrap();
            assert!(none.is_empty());

            let at = split.index(heads.len());
            let since = &heads[at];
            let diff = crdt
                .changes_since(&f, head, since, ChangesOptions::default())
                .await
                .unwrap();
            let mut expected: Vec<String> = Vec::new();
            for (key, _) in &writes[at..] {
                let key = format!("k{key}");
                expected.retain(|k| k != &key);
                expected.push(key);
            }
            let ids: Vec<String> = diff.iter().map(|c| c.id.clone()).collect();
            assert_eq!(ids, expected);

            let again = crdt
                .changes_since(&f, head, since, ChangesOptions::default())
                .await
                .unwrap();
            assert_eq!(again, diff);
        });
    }
}
