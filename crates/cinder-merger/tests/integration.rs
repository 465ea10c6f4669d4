//! Integration tests for the meta merger on a shared database file.

use chrono::Utc;
use cinder_core::wire::{SerializedMeta, SerializedMetaKey};
use cinder_merger::{Connection, MetaMerger};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn push(tag: String) -> SerializedMetaKey {
    SerializedMetaKey {
        metas: vec![SerializedMeta::from_payload(tag.as_bytes(), vec![])],
        keys: vec![format!("key-{tag}")],
    }
}

#[test]
fn test_concurrent_writers_and_readers_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merger.sqlite");
    let mergers: Vec<Arc<MetaMerger>> = (0..3)
        .map(|i| Arc::new(MetaMerger::open(format!("node-{i}"), &path).unwrap()))
        .collect();

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let merger = mergers[w].clone();
            thread::spawn(move || {
                let conn = Connection::new("acme", "ledger", format!("w{w}"), "res");
                for i in 0..10 {
                    merger.add_meta(&conn, &push(format!("{w}-{i}")), Utc::now()).unwrap();
                }
            })
        })
        .collect();

    // readers poll while the writers run; nothing may arrive twice
    let readers: Vec<_> = (0..3)
        .map(|r| {
            let merger = mergers[r].clone();
            thread::spawn(move || {
                let conn = Connection::new("acme", "ledger", format!("r{r}"), "res");
                let mut seen = Vec::new();
                for _ in 0..20 {
                    let delta = merger.meta_to_send(&conn, Utc::now()).unwrap();
                    seen.extend(delta.metas.into_iter().map(|m| m.cid));
                    thread::yield_now();
                }
                seen
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    for (r, handle) in readers.into_iter().enumerate() {
        let mut seen = handle.join().unwrap();
        let conn = Connection::new("acme", "ledger", format!("r{r}"), "res");
        let rest = mergers[0].meta_to_send(&conn, Utc::now()).unwrap();
        seen.extend(rest.metas.into_iter().map(|m| m.cid));

        let unique: HashSet<&String> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len(), "reader {r} got a duplicate");
        assert_eq!(seen.len(), 30);
    }
}

#[test]
fn test_reopen_keeps_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merger.sqlite");
    let conn = Connection::new("acme", "ledger", "req", "res");
    {
        let merger = MetaMerger::open("a", &path).unwrap();
        merger.add_meta(&conn, &push("one".into()), Utc::now()).unwrap();
        assert_eq!(merger.meta_to_send(&conn, Utc::now()).unwrap().metas.len(), 1);
    }
    let merger = MetaMerger::open("b", &path).unwrap();
    assert!(merger.meta_to_send(&conn, Utc::now()).unwrap().metas.is_empty());

    let fresh = Connection::new("acme", "ledger", "req-2", "res");
    let backlog = merger.meta_to_send(&fresh, Utc::now()).unwrap();
    assert_eq!(backlog.metas.len(), 1);
    assert_eq!(backlog.keys, vec!["key-one".to_string()]);
}
