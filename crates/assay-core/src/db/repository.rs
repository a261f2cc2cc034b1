//! Entity repository implementation

use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{EntityKind, EntityRow, FieldValue};
use crate::timestamp::Timestamp;
use libsql::{Connection, Value};

/// One page of rows read in `(modified, id)` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePage {
    pub rows: Vec<EntityRow>,
    /// More rows exist beyond the last `modified` value in `rows`
    pub truncated: bool,
}

/// Trait for synchronizable entity storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Get a row by kind and id
    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRow>>;

    /// Insert a new row with whichever fields it carries
    async fn insert(&self, row: &EntityRow) -> Result<()>;

    /// Overwrite the given fields and stamp `modified`
    async fn update(
        &self,
        kind: EntityKind,
        id: i64,
        changes: &BTreeMap<&'static str, FieldValue>,
        modified: Timestamp,
    ) -> Result<()>;

    /// Rows with `modified > since`, ordered by `(modified, id)`.
    ///
    /// The bound is strict: a row stamped exactly `since` was already handed
    /// out by the pull that returned `since` as its watermark.
    ///
    /// At most `limit` rows plus whatever is needed to finish the group of
    /// rows sharing the last returned `modified`.
    async fn changed_since(
        &self,
        kind: EntityKind,
        since: Timestamp,
        limit: usize,
    ) -> Result<ChangePage>;

    /// Role of the user registered with `phone`, if any
    async fn find_role_by_phone(&self, phone: &str) -> Result<Option<String>>;
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn select_list(kind: EntityKind) -> String {
        let mut columns = vec!["id", "modified"];
        columns.extend(kind.fields().iter().map(|field| field.name));
        columns.join(", ")
    }

    /// Parse an entity row from a database row in `select_list` order
    fn parse_row(kind: EntityKind, row: &libsql::Row) -> Result<EntityRow> {
        let id: i64 = row.get(0)?;
        let modified: i64 = row.get(1)?;
        let mut parsed = EntityRow::new(kind, id, Timestamp::from_millis(modified));
        for (index, field) in (2..).zip(kind.fields()) {
            let value = FieldValue::from_sql(field.ty, row.get_value(index)?)?;
            parsed.values.insert(field.name, value);
        }
        Ok(parsed)
    }

    async fn collect(&self, kind: EntityKind, sql: &str, params: Vec<Value>) -> Result<Vec<EntityRow>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(Self::parse_row(kind, &row)?);
        }
        Ok(out)
    }

    async fn exists_after(&self, kind: EntityKind, after: Timestamp) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE modified > ?)",
            kind.table()
        );
        let mut rows = self
            .conn
            .query(&sql, libsql::params![after.as_millis()])
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        })
    }
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn get(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            Self::select_list(kind),
            kind.table()
        );
        let mut rows = self.collect(kind, &sql, vec![Value::Integer(id)]).await?;
        Ok(rows.pop())
    }

    async fn insert(&self, row: &EntityRow) -> Result<()> {
        let mut columns = vec!["id", "modified"];
        let mut params = vec![
            Value::Integer(row.id),
            Value::Integer(row.modified.as_millis()),
        ];
        for field in row.kind.fields() {
            if let Some(value) = row.values.get(field.name) {
                columns.push(field.name);
                params.push(value.to_sql());
            }
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            row.kind.table(),
            columns.join(", ")
        );
        self.conn.execute(&sql, params).await?;
        Ok(())
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: i64,
        changes: &BTreeMap<&'static str, FieldValue>,
        modified: Timestamp,
    ) -> Result<()> {
        let mut assignments = vec!["modified = ?".to_string()];
        let mut params = vec![Value::Integer(modified.as_millis())];
        for (name, value) in changes {
            assignments.push(format!("{name} = ?"));
            params.push(value.to_sql());
        }
        params.push(Value::Integer(id));

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            kind.table(),
            assignments.join(", ")
        );
        let affected = self.conn.execute(&sql, params).await?;
        if affected == 0 {
            return Err(crate::Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    async fn changed_since(
        &self,
        kind: EntityKind,
        since: Timestamp,
        limit: usize,
    ) -> Result<ChangePage> {
        let limit = limit.max(1);
        let sql = format!(
            "SELECT {} FROM {} WHERE modified > ? ORDER BY modified, id LIMIT ?",
            Self::select_list(kind),
            kind.table()
        );
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let mut rows = self
            .collect(
                kind,
                &sql,
                vec![Value::Integer(since.as_millis()), Value::Integer(fetch)],
            )
            .await?;

        if rows.len() <= limit {
            return Ok(ChangePage {
                rows,
                truncated: false,
            });
        }

        rows.truncate(limit);
        let Some(last) = rows.last() else {
            return Ok(ChangePage {
                rows,
                truncated: false,
            });
        };
        let (boundary, last_id) = (last.modified, last.id);

        // Never split a group of rows sharing one `modified` across pages.
        let group_sql = format!(
            "SELECT {} FROM {} WHERE modified = ? AND id > ? ORDER BY id",
            Self::select_list(kind),
            kind.table()
        );
        let rest = self
            .collect(
                kind,
                &group_sql,
                vec![Value::Integer(boundary.as_millis()), Value::Integer(last_id)],
            )
            .await?;
        rows.extend(rest);

        let truncated = self.exists_after(kind, boundary).await?;
        Ok(ChangePage { rows, truncated })
    }

    async fn find_role_by_phone(&self, phone: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT role FROM users WHERE phone = ? ORDER BY id LIMIT 1",
                libsql::params![phone],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<String>>(0)?),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn loss(id: i64, modified: i64) -> EntityRow {
        EntityRow::new(EntityKind::Loss, id, Timestamp::from_millis(modified))
            .with("pct", FieldValue::Real(0.5))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());

        let row = EntityRow::new(EntityKind::AssayResult, 11, Timestamp::from_millis(100))
            .with("customer", FieldValue::Integer(4))
            .with("itemcode", FieldValue::Text("A-1".into()));
        repo.insert(&row).await.unwrap();

        let fetched = repo.get(EntityKind::AssayResult, 11).await.unwrap().unwrap();
        assert_eq!(fetched.modified, Timestamp::from_millis(100));
        assert_eq!(fetched.get("itemcode"), Some(&FieldValue::Text("A-1".into())));
        // Column default applies to fields the row did not carry.
        assert_eq!(fetched.get("ready"), Some(&FieldValue::Bool(false)));
        assert_eq!(fetched.get("collector"), Some(&FieldValue::Null));
        assert_eq!(fetched.values.len(), EntityKind::AssayResult.fields().len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_missing() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        assert!(repo.get(EntityKind::User, 1).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_only_touches_given_fields() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.insert(&loss(1, 10).with("low", FieldValue::Real(1.0)))
            .await
            .unwrap();

        let mut changes = BTreeMap::new();
        changes.insert("pct", FieldValue::Real(0.75));
        repo.update(EntityKind::Loss, 1, &changes, Timestamp::from_millis(20))
            .await
            .unwrap();

        let fetched = repo.get(EntityKind::Loss, 1).await.unwrap().unwrap();
        assert_eq!(fetched.modified, Timestamp::from_millis(20));
        assert_eq!(fetched.get("pct"), Some(&FieldValue::Real(0.75)));
        assert_eq!(fetched.get("low"), Some(&FieldValue::Real(1.0)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_missing_row_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let err = repo
            .update(EntityKind::Loss, 9, &BTreeMap::new(), Timestamp::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_changed_since_is_strict_and_ordered() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        for (id, modified) in [(3, 20), (1, 30), (2, 20), (4, 10)] {
            repo.insert(&loss(id, modified)).await.unwrap();
        }

        let page = repo
            .changed_since(EntityKind::Loss, Timestamp::from_millis(10), 100)
            .await
            .unwrap();
        let ids: Vec<_> = page.rows.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(!page.truncated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_changed_since_completes_timestamp_group() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        for (id, modified) in [(1, 10), (2, 20), (3, 20), (4, 20), (5, 30)] {
            repo.insert(&loss(id, modified)).await.unwrap();
        }

        let page = repo
            .changed_since(EntityKind::Loss, Timestamp::EPOCH, 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.rows.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(page.truncated);

        let next = repo
            .changed_since(EntityKind::Loss, Timestamp::from_millis(20), 2)
            .await
            .unwrap();
        assert_eq!(next.rows.len(), 1);
        assert!(!next.truncated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_role_by_phone() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let user = EntityRow::new(EntityKind::User, 1, Timestamp::from_millis(1))
            .with("phone", FieldValue::Text("555-0100".into()))
            .with("role", FieldValue::Text("worker".into()));
        repo.insert(&user).await.unwrap();

        assert_eq!(
            repo.find_role_by_phone("555-0100").await.unwrap().as_deref(),
            Some("worker")
        );
        assert!(repo.find_role_by_phone("555-0199").await.unwrap().is_none());
    }
}
