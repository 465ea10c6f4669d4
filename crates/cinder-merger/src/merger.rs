//! The meta merger.

use chrono::{DateTime, SecondsFormat, Utc};
use cinder_core::wire::{SerializedMeta, SerializedMetaKey};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantLedger {
    pub tenant: String,
    pub ledger: String,
}

/// Identity of one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionId {
    pub req_id: String,
    pub res_id: String,
}

/// A connection bound to a tenant's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub tenant: TenantLedger,
    pub conn: ConnectionId,
}

impl Connection {
    pub fn new(
        tenant: impl Into<String>,
        ledger: impl Into<String>,
        req_id: impl Into<String>,
        res_id: impl Into<String>,
    ) -> Self {
        Connection {
            tenant: TenantLedger {
                tenant: tenant.into(),
                ledger: ledger.into(),
            },
            conn: ConnectionId {
                req_id: req_id.into(),
                res_id: res_id.into(),
            },
        }
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Records head metas and gossiped keys per `(tenant, ledger)` and hands
/// each of them to every connection exactly once.
///
/// All methods are synchronous; callers on an async runtime should run them
/// on a blocking thread.
pub struct MetaMerger {
    id: String,
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl MetaMerger {
    /// Wrap an existing connection, creating the schema if needed.
    pub fn new(id: impl Into<String>, db: Arc<Mutex<rusqlite::Connection>>) -> Result<Self> {
        schema::init_schema(&db.lock())?;
        Ok(MetaMerger { id: id.into(), db })
    }

    pub fn open_in_memory(id: impl Into<String>) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::new(id, Arc::new(Mutex::new(conn)))
    }

    /// Open a database file. Several mergers may share one file; their
    /// writes serialize on the database lock.
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::new(id, Arc::new(Mutex::new(conn)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the metas and keys a connection pushed. Re-adding a known meta
    /// cid or key string changes nothing.
    pub fn add_meta(
        &self,
        connection: &Connection,
        meta: &SerializedMetaKey,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if meta.metas.is_empty() && meta.keys.is_empty() {
            return Ok(0);
        }
        let created = timestamp(now);
        let TenantLedger { tenant, ledger } = &connection.tenant;
        let ConnectionId { req_id, res_id } = &connection.conn;

        let mut db = self.db.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO Tenant(tenant, createdAt) VALUES (?1, ?2)",
            params![tenant, created],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO TenantLedger(tenant, ledger, createdAt) VALUES (?1, ?2, ?3)",
            params![tenant, ledger, created],
        )?;
        {
            let mut insert_key = tx.prepare_cached(
                "INSERT OR IGNORE INTO KeyByTenantLedger(tenant, ledger, key, createdAt)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for key in &meta.keys {
                insert_key.execute(params![tenant, ledger, key, created])?;
            }
        }
        let mut inserted = 0;
        {
            let mut insert_meta = tx.prepare_cached(
                "INSERT OR IGNORE INTO MetaByTenantLedger(tenant, ledger, metaCID, meta, reqId, resId, createdAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for m in &meta.metas {
                let json = serde_json::to_string(m)?;
                inserted += insert_meta.execute(params![tenant, ledger, m.cid, json, req_id, res_id, created])?;
            }
        }
        tx.commit()?;
        debug!(merger = %self.id, %tenant, %ledger, inserted, keys = meta.keys.len(), "added metas");
        Ok(inserted)
    }

    /// Reset a connection's delivery cursor to what it still holds: cursor
    /// rows for metas and keys not listed in `meta` are cleared, so those
    /// records are delivered again. Meta records themselves are never
    /// removed.
    pub fn del_meta(&self, connection: &Connection, meta: &SerializedMetaKey) -> Result<usize> {
        let TenantLedger { tenant, ledger } = &connection.tenant;
        let ConnectionId { req_id, res_id } = &connection.conn;
        let keep_metas: HashSet<&str> = meta.metas.iter().map(|m| m.cid.as_str()).collect();
        let keep_keys: HashSet<&str> = meta.keys.iter().map(String::as_str).collect();

        let mut db = self.db.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut cleared = 0;
        {
            let sent: Vec<String> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT metaCID FROM MetaSend
                     WHERE tenant = ?1 AND ledger = ?2 AND reqId = ?3 AND resId = ?4",
                )?;
                let rows = stmt.query_map(params![tenant, ledger, req_id, res_id], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut delete = tx.prepare_cached(
                "DELETE FROM MetaSend
                 WHERE metaCID = ?1 AND tenant = ?2 AND ledger = ?3 AND reqId = ?4 AND resId = ?5",
            )?;
            for cid in sent.iter().filter(|c| !keep_metas.contains(c.as_str())) {
                cleared += delete.execute(params![cid, tenant, ledger, req_id, res_id])?;
            }
        }
        {
            let sent: Vec<String> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT key FROM KeySend
                     WHERE tenant = ?1 AND ledger = ?2 AND reqId = ?3 AND resId = ?4",
                )?;
                let rows = stmt.query_map(params![tenant, ledger, req_id, res_id], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut delete = tx.prepare_cached(
                "DELETE FROM KeySend
                 WHERE key = ?1 AND tenant = ?2 AND ledger = ?3 AND reqId = ?4 AND resId = ?5",
            )?;
            for key in sent.iter().filter(|k| !keep_keys.contains(k.as_str())) {
                cleared += delete.execute(params![key, tenant, ledger, req_id, res_id])?;
            }
        }
        tx.commit()?;
        debug!(merger = %self.id, %tenant, %ledger, %req_id, %res_id, cleared, "reset delivery cursor");
        Ok(cleared)
    }

    /// Everything this connection has not seen yet. The delta is read and
    /// marked delivered in one immediate transaction.
    pub fn meta_to_send(&self, connection: &Connection, now: DateTime<Utc>) -> Result<SerializedMetaKey> {
        let send_at = timestamp(now);
        let TenantLedger { tenant, ledger } = &connection.tenant;
        let ConnectionId { req_id, res_id } = &connection.conn;

        let mut db = self.db.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let metas: Vec<(String, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT t.metaCID, t.meta FROM MetaByTenantLedger AS t
                 WHERE t.tenant = ?1 AND t.ledger = ?2
                 AND NOT EXISTS (
                     SELECT 1 FROM MetaSend AS s
                     WHERE s.metaCID = t.metaCID AND s.tenant = t.tenant AND s.ledger = t.ledger
                     AND s.reqId = ?3 AND s.resId = ?4
                 )
                 ORDER BY t.createdAt, t.metaCID",
            )?;
            let rows = stmt.query_map(params![tenant, ledger, req_id, res_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let keys: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT k.key FROM KeyByTenantLedger AS k
                 WHERE k.tenant = ?1 AND k.ledger = ?2
                 AND NOT EXISTS (
                     SELECT 1 FROM KeySend AS s
                     WHERE s.key = k.key AND s.tenant = k.tenant AND s.ledger = k.ledger
                     AND s.reqId = ?3 AND s.resId = ?4
                 )
                 ORDER BY k.key",
            )?;
            let rows = stmt.query_map(params![tenant, ledger, req_id, res_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        {
            let mut mark = tx.prepare_cached(
                "INSERT INTO MetaSend(metaCID, tenant, ledger, reqId, resId, sendAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (cid, _) in &metas {
                mark.execute(params![cid, tenant, ledger, req_id, res_id, send_at])?;
            }
            let mut mark = tx.prepare_cached(
                "INSERT INTO KeySend(key, tenant, ledger, reqId, resId, sendAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for key in &keys {
                mark.execute(params![key, tenant, ledger, req_id, res_id, send_at])?;
            }
        }
        tx.commit()?;

        let metas = metas
            .into_iter()
            .map(|(_, json)| serde_json::from_str::<SerializedMeta>(&json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !metas.is_empty() {
            info!(merger = %self.id, %tenant, %ledger, %req_id, metas = metas.len(), keys = keys.len(), "delivering metas");
        }
        Ok(SerializedMetaKey { metas, keys })
    }

    /// Number of meta records stored for a tenant's ledger.
    pub fn meta_count(&self, tenant: &TenantLedger) -> Result<usize> {
        let db = self.db.lock();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM MetaByTenantLedger WHERE tenant = ?1 AND ledger = ?2",
            params![tenant.tenant, tenant.ledger],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// When a tenant was first seen.
    pub fn tenant_created_at(&self, tenant: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock();
        let raw: Option<String> = db
            .query_row(
                "SELECT createdAt FROM Tenant WHERE tenant = ?1",
                params![tenant],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(tag: &str) -> SerializedMeta {
        SerializedMeta::from_payload(tag.as_bytes(), vec![])
    }

    fn batch(tags: &[&str], keys: &[&str]) -> SerializedMetaKey {
        SerializedMetaKey {
            metas: tags.iter().map(|t| meta(t)).collect(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let merger = MetaMerger::open_in_memory("test").unwrap();
        let conn = Connection::new("t1", "l1", "req", "res");
        let now = Utc::now();
        assert_eq!(merger.add_meta(&conn, &batch(&["a", "b"], &["k"]), now).unwrap(), 2);
        assert_eq!(merger.add_meta(&conn, &batch(&["a", "b"], &["k"]), now).unwrap(), 0);
        assert_eq!(merger.meta_count(&conn.tenant).unwrap(), 2);
        assert!(merger.tenant_created_at("t1").unwrap().is_some());
    }

    #[test]
    fn test_empty_add_creates_nothing() {
        let merger = MetaMerger::open_in_memory("test").unwrap();
        let conn = Connection::new("t1", "l1", "req", "res");
        assert_eq!(merger.add_meta(&conn, &SerializedMetaKey::default(), Utc::now()).unwrap(), 0);
        assert!(merger.tenant_created_at("t1").unwrap().is_none());
    }

    #[test]
    fn test_once_each_delivery() {
        let merger = MetaMerger::open_in_memory("test").unwrap();
        let writer = Connection::new("t1", "l1", "w", "w");
        let reader = Connection::new("t1", "l1", "r", "r");
        merger.add_meta(&writer, &batch(&["a", "b"], &["k1"]), Utc::now()).unwrap();

        let first = merger.meta_to_send(&reader, Utc::now()).unwrap();
        assert_eq!(first.metas.len(), 2);
        assert_eq!(first.keys, vec!["k1".to_string()]);
        let second = merger.meta_to_send(&reader, Utc::now()).unwrap();
        assert!(second.metas.is_empty());
        assert!(second.keys.is_empty());

        merger.add_meta(&writer, &batch(&["c"], &["k1", "k2"]), Utc::now()).unwrap();
        let third = merger.meta_to_send(&reader, Utc::now()).unwrap();
        assert_eq!(third.metas, vec![meta("c")]);
        assert_eq!(third.keys, vec!["k2".to_string()]);
    }

    #[test]
    fn test_tenant_isolation() {
        let merger = MetaMerger::open_in_memory("test").unwrap();
        let a = Connection::new("tenant-a", "shared", "x", "x");
        let b = Connection::new("tenant-b", "shared", "x", "x");
        merger.add_meta(&a, &batch(&["secret"], &["key-a"]), Utc::now()).unwrap();
        let delta = merger.meta_to_send(&b, Utc::now()).unwrap();
        assert!(delta.metas.is_empty());
        assert!(delta.keys.is_empty());
        assert_eq!(merger.meta_to_send(&a, Utc::now()).unwrap().metas.len(), 1);
    }

    #[test]
    fn test_del_meta_resets_cursor() {
        let merger = MetaMerger::open_in_memory("test").unwrap();
        let conn = Connection::new("t1", "l1", "r", "r");
        merger.add_meta(&conn, &batch(&["a", "b"], &["k"]), Utc::now()).unwrap();
        merger.meta_to_send(&conn, Utc::now()).unwrap();

        // the client still holds "a"; everything else comes again
        let cleared = merger.del_meta(&conn, &batch(&["a"], &[])).unwrap();
        assert_eq!(cleared, 2);
        let again = merger.meta_to_send(&conn, Utc::now()).unwrap();
        assert_eq!(again.metas, vec![meta("b")]);
        assert_eq!(again.keys, vec!["k".to_string()]);
        assert_eq!(merger.meta_count(&conn.tenant).unwrap(), 2);
    }
}
