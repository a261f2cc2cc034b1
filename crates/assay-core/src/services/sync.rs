//! Shared sync service used by the API surface.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    Database, EntityRepository, LibSqlEntityRepository, LibSqlNotificationRepository,
    NotificationRepository,
};
use crate::models::Notification;
use crate::notify::PushOutbox;
use crate::sync::{change_set, ChangeSet, PullRequest, PushApplier, PushBatch, PushSummary};
use crate::sync::{ReadyChange, RowReport};
use crate::timestamp::Timestamp;
use crate::{Error, Result, RowError};

/// Default per-kind row cap for one pull.
pub const DEFAULT_MAX_PULL_ROWS: usize = 5000;

/// Thread-safe service for pulls, pushes and readiness changes.
///
/// The store lock is taken per row during a push, so other calls interleave
/// between rows of a large batch.
#[derive(Clone)]
pub struct SyncService {
    db: Arc<Mutex<Database>>,
    outbox: PushOutbox,
    max_pull_rows: usize,
}

impl SyncService {
    /// Open a sync service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>, outbox: PushOutbox) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path).await?;
        tracing::info!(path = %db_path.display(), "Opened assay database");
        Ok(Self::new(db, outbox))
    }

    /// Open an in-memory sync service (primarily for tests).
    pub async fn open_in_memory(outbox: PushOutbox) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::new(db, outbox))
    }

    pub fn new(db: Database, outbox: PushOutbox) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            outbox,
            max_pull_rows: DEFAULT_MAX_PULL_ROWS,
        }
    }

    #[must_use]
    pub fn with_max_pull_rows(mut self, max_pull_rows: usize) -> Self {
        self.max_pull_rows = max_pull_rows.max(1);
        self
    }

    /// Rows changed after the request's cursor.
    pub async fn pull(&self, request: &PullRequest) -> Result<ChangeSet> {
        let db = self.db.lock().await;
        change_set::build(db.connection(), request, self.max_pull_rows).await
    }

    /// Apply a push batch row by row.
    ///
    /// Every row gets an outcome in the summary. Once a transaction cannot be
    /// started the remaining decodable rows are reported as transient store
    /// failures without being attempted; rows committed before that stay
    /// committed.
    pub async fn push(&self, batch: &PushBatch) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        let mut unavailable: Option<RowError> = None;

        for (index, pushed) in batch.rows.iter().enumerate() {
            let row = match pushed.decode() {
                Ok(row) => row,
                Err(error) => {
                    tracing::warn!(index, %error, "Rejected pushed row");
                    summary.record(RowReport::rejected(index, pushed, &error));
                    continue;
                }
            };

            if let Some(error) = &unavailable {
                summary.record(RowReport::rejected(index, pushed, error));
                continue;
            }

            let applied = {
                let db = self.db.lock().await;
                PushApplier::new(db.connection())
                    .apply(&row, Timestamp::now())
                    .await
            };

            match applied {
                Ok(applied) => {
                    summary.notifications_created += applied.effects.notifications_created;
                    self.outbox.send(applied.effects.events);
                    summary.record(RowReport::accepted(index, &row, applied.status));
                }
                Err(error @ Error::StoreUnavailable(_)) => {
                    tracing::error!(
                        index,
                        applied = summary.applied,
                        remaining = batch.len() - index,
                        %error,
                        "Store unavailable; skipping the rest of the push batch"
                    );
                    let error = RowError::from(error);
                    summary.record(RowReport::rejected(index, pushed, &error));
                    unavailable = Some(error);
                }
                Err(error) => {
                    let error = RowError::from(error);
                    tracing::warn!(index, entity = %row.kind, id = row.id, %error, "Row rolled back");
                    summary.record(RowReport::rejected(index, pushed, &error));
                }
            }
        }

        tracing::info!(
            rows = batch.len(),
            applied = summary.applied,
            ignored = summary.ignored,
            rejected = summary.rejected,
            notifications = summary.notifications_created,
            "Processed push batch"
        );
        Ok(summary)
    }

    /// Set or toggle an assay's ready flag on behalf of staff.
    pub async fn set_ready(&self, assay_id: i64, ready: Option<bool>) -> Result<ReadyChange> {
        let change = {
            let db = self.db.lock().await;
            PushApplier::new(db.connection())
                .set_ready(assay_id, ready, Timestamp::now())
                .await?
        };
        self.outbox.send(change.effects.events.clone());
        Ok(change)
    }

    /// Notifications about one assay, oldest first.
    pub async fn notifications_for_assay(&self, assay_id: i64) -> Result<Vec<Notification>> {
        let db = self.db.lock().await;
        let repo = LibSqlNotificationRepository::new(db.connection());
        repo.list_for_assay(assay_id).await
    }

    /// Role of the user registered with `phone`.
    pub async fn role_for_phone(&self, phone: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.find_role_by_phone(phone).await
    }
}
