//! Notification repository implementation

use crate::error::Result;
use crate::models::Notification;
use crate::timestamp::Timestamp;
use libsql::Connection;

/// Trait for notification storage operations (async)
#[allow(async_fn_in_trait)]
pub trait NotificationRepository {
    /// Insert an unread notification and return it with its assigned id
    async fn create(
        &self,
        user_id: i64,
        assay_id: i64,
        title: &str,
        message: &str,
        created: Timestamp,
    ) -> Result<Notification>;

    /// Delete the unread notifications about an assay, returning how many went
    async fn delete_unread_for_assay(&self, assay_id: i64) -> Result<u64>;

    /// List notifications about an assay, oldest first
    async fn list_for_assay(&self, assay_id: i64) -> Result<Vec<Notification>>;

    /// List a user's notifications, newest first
    async fn list_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<Notification>>;
}

/// libSQL implementation of `NotificationRepository`
pub struct LibSqlNotificationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlNotificationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &libsql::Row) -> Result<Notification> {
        Ok(Notification {
            id: row.get(0)?,
            user_id: row.get(1)?,
            assay_id: row.get(2)?,
            title: row.get(3)?,
            message: row.get(4)?,
            read: row.get::<i64>(5)? != 0,
            created: Timestamp::from_millis(row.get(6)?),
        })
    }

    async fn collect(&self, sql: &str, params: Vec<libsql::Value>) -> Result<Vec<Notification>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(Self::parse_row(&row)?);
        }
        Ok(notifications)
    }
}

const COLUMNS: &str = "id, user_id, assay_id, title, message, read, created";

impl NotificationRepository for LibSqlNotificationRepository<'_> {
    async fn create(
        &self,
        user_id: i64,
        assay_id: i64,
        title: &str,
        message: &str,
        created: Timestamp,
    ) -> Result<Notification> {
        self.conn
            .execute(
                "INSERT INTO notifications (user_id, assay_id, title, message, read, created)
                 VALUES (?, ?, ?, ?, 0, ?)",
                libsql::params![user_id, assay_id, title, message, created.as_millis()],
            )
            .await?;

        Ok(Notification {
            id: self.conn.last_insert_rowid(),
            user_id,
            assay_id,
            title: title.to_string(),
            message: message.to_string(),
            read: false,
            created,
        })
    }

    async fn delete_unread_for_assay(&self, assay_id: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM notifications WHERE assay_id = ? AND read = 0",
                libsql::params![assay_id],
            )
            .await?;
        Ok(deleted)
    }

    async fn list_for_assay(&self, assay_id: i64) -> Result<Vec<Notification>> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE assay_id = ? ORDER BY id");
        self.collect(&sql, vec![libsql::Value::Integer(assay_id)])
            .await
    }

    async fn list_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM notifications WHERE user_id = ? ORDER BY created DESC, id DESC LIMIT ?"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.collect(
            &sql,
            vec![libsql::Value::Integer(user_id), libsql::Value::Integer(limit)],
        )
        .await
    }
}
