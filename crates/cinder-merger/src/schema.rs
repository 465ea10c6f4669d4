//! Relational layout of the merger.
//!
//! Meta records and gossiped keys are partitioned by `(tenant, ledger)`.
//! `MetaSend` and `KeySend` are the per-connection delivery cursors: a row
//! means that record was handed to that `(reqId, resId)` identity.

use rusqlite::Connection;

const TABLES: &[(&str, &str)] = &[
    (
        "Tenant",
        "CREATE TABLE IF NOT EXISTS Tenant (
            tenant TEXT NOT NULL PRIMARY KEY,
            createdAt TEXT NOT NULL
        )",
    ),
    (
        "TenantLedger",
        "CREATE TABLE IF NOT EXISTS TenantLedger (
            tenant TEXT NOT NULL,
            ledger TEXT NOT NULL,
            createdAt TEXT NOT NULL,
            PRIMARY KEY (tenant, ledger),
            FOREIGN KEY (tenant) REFERENCES Tenant(tenant)
        )",
    ),
    (
        "MetaByTenantLedger",
        "CREATE TABLE IF NOT EXISTS MetaByTenantLedger (
            tenant TEXT NOT NULL,
            ledger TEXT NOT NULL,
            metaCID TEXT NOT NULL,
            meta TEXT NOT NULL,
            reqId TEXT NOT NULL,
            resId TEXT NOT NULL,
            createdAt TEXT NOT NULL,
            PRIMARY KEY (tenant, ledger, metaCID),
            FOREIGN KEY (tenant, ledger) REFERENCES TenantLedger(tenant, ledger)
        )",
    ),
    (
        "KeyByTenantLedger",
        "CREATE TABLE IF NOT EXISTS KeyByTenantLedger (
            tenant TEXT NOT NULL,
            ledger TEXT NOT NULL,
            key TEXT NOT NULL,
            createdAt TEXT NOT NULL,
            PRIMARY KEY (tenant, ledger, key),
            FOREIGN KEY (tenant, ledger) REFERENCES TenantLedger(tenant, ledger)
        )",
    ),
    (
        "MetaSend",
        "CREATE TABLE IF NOT EXISTS MetaSend (
            metaCID TEXT NOT NULL,
            tenant TEXT NOT NULL,
            ledger TEXT NOT NULL,
            reqId TEXT NOT NULL,
            resId TEXT NOT NULL,
            sendAt TEXT NOT NULL,
            PRIMARY KEY (metaCID, tenant, ledger, reqId, resId),
            FOREIGN KEY (tenant, ledger, metaCID) REFERENCES MetaByTenantLedger(tenant, ledger, metaCID)
        )",
    ),
    (
        "KeySend",
        "CREATE TABLE IF NOT EXISTS KeySend (
            key TEXT NOT NULL,
            tenant TEXT NOT NULL,
            ledger TEXT NOT NULL,
            reqId TEXT NOT NULL,
            resId TEXT NOT NULL,
            sendAt TEXT NOT NULL,
            PRIMARY KEY (key, tenant, ledger, reqId, resId),
            FOREIGN KEY (tenant, ledger, key) REFERENCES KeyByTenantLedger(tenant, ledger, key)
        )",
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS MetaByTenantLedgerReqIdResId
        ON MetaByTenantLedger(tenant, ledger, reqId, resId)",
    "CREATE INDEX IF NOT EXISTS MetaSendByConnection
        ON MetaSend(tenant, ledger, reqId, resId)",
    "CREATE INDEX IF NOT EXISTS KeySendByConnection
        ON KeySend(tenant, ledger, reqId, resId)",
];

/// Create every table and index if missing.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    for (_, sql) in TABLES {
        conn.execute(sql, [])?;
    }
    for sql in INDEXES {
        conn.execute(sql, [])?;
    }
    Ok(())
}

/// Drop every table, dependents first.
pub fn drop_schema(conn: &Connection) -> rusqlite::Result<()> {
    for (name, _) in TABLES.iter().rev() {
        conn.execute(&format!("DROP TABLE IF EXISTS {name}"), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(table_count(&conn), TABLES.len() as i64);
    }

    #[test]
    fn test_drop_then_recreate() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        drop_schema(&conn).unwrap();
        assert_eq!(table_count(&conn), 0);
        init_schema(&conn).unwrap();
        assert_eq!(table_count(&conn), TABLES.len() as i64);
    }
}
