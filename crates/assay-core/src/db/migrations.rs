//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1_STATEMENTS).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2_STATEMENTS).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: synchronizable entity tables.
///
/// Every table carries `modified` as Unix milliseconds and an index on
/// `(modified, id)`, the order change sets are read in.
const V1_STATEMENTS: [&str; 10] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        modified INTEGER NOT NULL,
        pwhash BLOB,
        salt BLOB,
        role TEXT,
        name TEXT,
        phone TEXT,
        phonetwo TEXT,
        email TEXT,
        companyemail TEXT,
        fax TEXT,
        addressone TEXT,
        addresstwo TEXT,
        area TEXT,
        mailpw TEXT,
        orientation TEXT,
        billing INTEGER,
        coupon INTEGER,
        created INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_users_modified ON users(modified, id)",
    "CREATE INDEX IF NOT EXISTS idx_users_phone ON users(phone)",
    "CREATE TABLE IF NOT EXISTS assay_results (
        id INTEGER PRIMARY KEY,
        modified INTEGER NOT NULL,
        customer INTEGER,
        itemcode TEXT,
        formcode INTEGER,
        collector TEXT,
        incharge TEXT,
        color INTEGER,
        sampleweight REAL,
        samplereturn REAL,
        fwa INTEGER,
        fwb INTEGER,
        lwa INTEGER,
        lwb INTEGER,
        silverpct INTEGER,
        resulta REAL,
        resultb REAL,
        preresult REAL,
        loss REAL,
        finalresult REAL,
        ready INTEGER NOT NULL DEFAULT 0,
        created INTEGER,
        returndate INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_assay_results_modified ON assay_results(modified, id)",
    "CREATE TABLE IF NOT EXISTS spoil_records (
        id INTEGER PRIMARY KEY,
        modified INTEGER NOT NULL,
        customer INTEGER,
        itemcode TEXT,
        formcode INTEGER,
        collector TEXT,
        incharge TEXT,
        color INTEGER,
        sampleweight REAL,
        samplereturn REAL,
        fwa INTEGER,
        fwb INTEGER,
        lwa INTEGER,
        lwb INTEGER,
        silverpct INTEGER,
        resulta REAL,
        resultb REAL,
        preresult REAL,
        loss REAL,
        finalresult REAL,
        created INTEGER,
        returndate INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_spoil_records_modified ON spoil_records(modified, id)",
    "CREATE TABLE IF NOT EXISTS losses (
        id INTEGER PRIMARY KEY,
        modified INTEGER NOT NULL,
        low REAL,
        high REAL,
        pct REAL,
        created INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_losses_modified ON losses(modified, id)",
];

/// Version 2: customer notifications.
///
/// `assay_id` has no foreign key; notifications outlive removed assay rows.
const V2_STATEMENTS: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        assay_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        read INTEGER NOT NULL DEFAULT 0,
        created INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_notifications_assay ON notifications(assay_id, read)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created DESC)",
];

/// Apply one migration's statements and record its version atomically.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            libsql::params![version],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut rows = conn
            .query(&format!("PRAGMA table_info({table})"), ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(1).unwrap());
        }
        names
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entity_tables_match_field_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for kind in EntityKind::ALL {
            let mut expected = vec!["id".to_string(), "modified".to_string()];
            expected.extend(kind.fields().iter().map(|field| field.name.to_string()));
            assert_eq!(columns(&conn, kind.table()).await, expected, "{kind}");
        }
    }
}
