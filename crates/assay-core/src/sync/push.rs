//! Push side: merging locally authored rows into the cloud store

use std::collections::BTreeMap;

use libsql::Connection;
use serde::Serialize;
use serde_json::Value as Json;

use crate::db::{self, EntityRepository, LibSqlEntityRepository};
use crate::error::{Error, Result, RowError, RowErrorKind};
use crate::models::{EntityKind, EntityRow, FieldValue, Ownership};
use crate::notify::{self, Effects, NotificationEngine};
use crate::sync::watermark::{incoming_wins, next_modified};
use crate::timestamp::Timestamp;

const TAGGED_ROWS_KEY: &str = "rows";

/// One pushed row before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedRow {
    /// Entity tag as sent; `None` when a tagged row left it out
    pub entity: Option<String>,
    pub data: Json,
}

impl PushedRow {
    pub fn new(entity: impl Into<String>, data: Json) -> Self {
        Self {
            entity: Some(entity.into()),
            data,
        }
    }

    /// Resolve the entity tag and parse the payload against its field table.
    pub fn decode(&self) -> std::result::Result<EntityRow, RowError> {
        let tag = self
            .entity
            .as_deref()
            .ok_or_else(|| RowError::malformed("missing `entity` tag"))?;
        let kind: EntityKind = tag.parse()?;
        let mut row = EntityRow::from_json(kind, &self.data)?;

        // `ready` is NOT NULL in storage; null means not ready.
        if row.get("ready") == Some(&FieldValue::Null) {
            row.values.insert("ready", FieldValue::Bool(false));
        }
        Ok(row)
    }

    fn label(&self) -> String {
        self.entity
            .as_deref()
            .map(|tag| EntityKind::parse(tag).map_or_else(|| tag.to_string(), |k| k.to_string()))
            .unwrap_or_default()
    }

    fn id_hint(&self) -> Option<i64> {
        self.data.get("id").and_then(Json::as_i64)
    }
}

/// Rows of one push request, in application order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushBatch {
    pub rows: Vec<PushedRow>,
}

impl PushBatch {
    /// Read a push body in grouped form, tagged form, or both.
    ///
    /// Grouped collections come first (users, assay results, spoil records,
    /// losses), then arrays under unrecognised keys, then tagged rows.
    pub fn from_json(body: &Json) -> Result<Self> {
        let object = body
            .as_object()
            .ok_or_else(|| Error::InvalidInput("push body must be a JSON object".into()))?;
        let mut rows = Vec::new();

        for kind in EntityKind::ALL {
            if let Some(value) = object.get(kind.collection()) {
                let items = value.as_array().ok_or_else(|| {
                    Error::InvalidInput(format!("`{}` must be an array", kind.collection()))
                })?;
                rows.extend(
                    items
                        .iter()
                        .map(|item| PushedRow::new(kind.collection(), item.clone())),
                );
            }
        }

        for (key, value) in object {
            let known = key == TAGGED_ROWS_KEY
                || EntityKind::ALL.iter().any(|kind| kind.collection() == key);
            if known {
                continue;
            }
            match value {
                Json::Array(items) => {
                    rows.extend(items.iter().map(|item| PushedRow::new(key, item.clone())));
                }
                _ => tracing::debug!(key = %key, "Ignoring non-array key in push body"),
            }
        }

        if let Some(value) = object.get(TAGGED_ROWS_KEY) {
            let items = value
                .as_array()
                .ok_or_else(|| Error::InvalidInput("`rows` must be an array".into()))?;
            rows.extend(items.iter().map(|item| PushedRow {
                entity: item
                    .get("entity")
                    .and_then(Json::as_str)
                    .map(ToString::to_string),
                data: item.get("data").cloned().unwrap_or(Json::Null),
            }));
        }

        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// How a pushed row will change the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MergePlan {
    Insert,
    Update {
        changes: BTreeMap<&'static str, FieldValue>,
        modified: Timestamp,
    },
    NoOp,
}

/// Decide what writing `incoming` over `stored` changes, field by field.
///
/// Local fields overwrite, cloud fields are never touched by an update and
/// shared fields overwrite only when `incoming` is strictly newer.
pub fn plan_merge(stored: Option<&EntityRow>, incoming: &EntityRow) -> MergePlan {
    let Some(stored) = stored else {
        return MergePlan::Insert;
    };
    let shared_wins = incoming_wins(incoming.modified, stored.modified);

    let mut changes = BTreeMap::new();
    for (&name, value) in &incoming.values {
        let Some(field) = incoming.kind.field(name) else {
            continue;
        };
        let writable = match field.ownership {
            Ownership::Local => true,
            Ownership::Cloud => false,
            Ownership::Shared => shared_wins,
        };
        if writable && stored.get(name) != Some(value) {
            changes.insert(name, value.clone());
        }
    }

    if changes.is_empty() {
        MergePlan::NoOp
    } else {
        MergePlan::Update {
            changes,
            modified: next_modified(stored.modified, incoming.modified),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Applied,
    IgnoredNoOp,
    Rejected,
}

/// Outcome of one pushed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowReport {
    /// Position in the batch
    pub index: usize,
    pub entity: String,
    pub id: Option<i64>,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RowErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RowReport {
    pub fn rejected(index: usize, row: &PushedRow, error: &RowError) -> Self {
        Self {
            index,
            entity: row.label(),
            id: row.id_hint(),
            status: RowStatus::Rejected,
            error: Some(error.kind()),
            reason: Some(error.reason().to_string()),
        }
    }

    pub fn accepted(index: usize, row: &EntityRow, status: RowStatus) -> Self {
        Self {
            index,
            entity: row.kind.to_string(),
            id: Some(row.id),
            status,
            error: None,
            reason: None,
        }
    }
}

/// Per-row outcomes of a push, with counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub rows: Vec<RowReport>,
    pub applied: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub notifications_created: usize,
}

impl PushSummary {
    pub fn record(&mut self, report: RowReport) {
        match report.status {
            RowStatus::Applied => self.applied += 1,
            RowStatus::IgnoredNoOp => self.ignored += 1,
            RowStatus::Rejected => self.rejected += 1,
        }
        self.rows.push(report);
    }
}

/// A row that went through the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRow {
    /// `Applied` or `IgnoredNoOp`
    pub status: RowStatus,
    pub effects: Effects,
}

/// Result of an administrative ready toggle.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyChange {
    /// The assay as stored afterwards
    pub assay: EntityRow,
    pub changed: bool,
    pub effects: Effects,
}

impl ReadyChange {
    pub fn ready(&self) -> bool {
        notify::is_ready(&self.assay)
    }
}

/// Writes rows one transaction at a time.
pub struct PushApplier<'a> {
    conn: &'a Connection,
}

impl<'a> PushApplier<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Merge one row and run its notification side effects atomically.
    ///
    /// Returns [`Error::StoreUnavailable`] only when no transaction could be
    /// started; any other error means this row was rolled back.
    pub async fn apply(&self, row: &EntityRow, now: Timestamp) -> Result<AppliedRow> {
        db::begin(self.conn).await?;
        let result = self.merge(row, now).await;
        self.finish(result).await
    }

    /// Set (or toggle, when `ready` is `None`) an assay's ready flag.
    pub async fn set_ready(
        &self,
        assay_id: i64,
        ready: Option<bool>,
        now: Timestamp,
    ) -> Result<ReadyChange> {
        db::begin(self.conn).await?;
        let result = self.toggle_ready(assay_id, ready, now).await;
        self.finish(result).await
    }

    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                db::commit(self.conn).await?;
                Ok(value)
            }
            Err(error) => {
                db::rollback(self.conn).await;
                Err(error)
            }
        }
    }

    async fn merge(&self, row: &EntityRow, now: Timestamp) -> Result<AppliedRow> {
        let repo = LibSqlEntityRepository::new(self.conn);
        let stored = repo.get(row.kind, row.id).await?;

        match plan_merge(stored.as_ref(), row) {
            MergePlan::NoOp => {
                return Ok(AppliedRow {
                    status: RowStatus::IgnoredNoOp,
                    effects: Effects::default(),
                })
            }
            MergePlan::Insert => repo.insert(row).await?,
            MergePlan::Update { changes, modified } => {
                repo.update(row.kind, row.id, &changes, modified).await?;
            }
        }

        let effects = if row.kind == EntityKind::AssayResult {
            let after = self.reload(&repo, row.kind, row.id).await?;
            NotificationEngine::new(self.conn)
                .observe(stored.as_ref(), &after, now)
                .await?
        } else {
            Effects::default()
        };

        Ok(AppliedRow {
            status: RowStatus::Applied,
            effects,
        })
    }

    async fn toggle_ready(
        &self,
        assay_id: i64,
        ready: Option<bool>,
        now: Timestamp,
    ) -> Result<ReadyChange> {
        let repo = LibSqlEntityRepository::new(self.conn);
        let stored = self
            .reload(&repo, EntityKind::AssayResult, assay_id)
            .await?;

        let current = notify::is_ready(&stored);
        let target = ready.unwrap_or(!current);
        if target == current {
            return Ok(ReadyChange {
                assay: stored,
                changed: false,
                effects: Effects::default(),
            });
        }

        let mut changes = BTreeMap::new();
        changes.insert("ready", FieldValue::Bool(target));
        let modified = now.max(stored.modified.successor());
        repo.update(EntityKind::AssayResult, assay_id, &changes, modified)
            .await?;

        let after = self
            .reload(&repo, EntityKind::AssayResult, assay_id)
            .await?;
        let effects = NotificationEngine::new(self.conn)
            .observe(Some(&stored), &after, now)
            .await?;

        Ok(ReadyChange {
            assay: after,
            changed: true,
            effects,
        })
    }

    async fn reload(
        &self,
        repo: &LibSqlEntityRepository<'_>,
        kind: EntityKind,
        id: i64,
    ) -> Result<EntityRow> {
        repo.get(kind, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::Database;

    fn ts(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn assay(modified: i64, ready: bool) -> EntityRow {
        EntityRow::new(EntityKind::AssayResult, 1, ts(modified))
            .with("customer", FieldValue::Integer(4))
            .with("itemcode", FieldValue::Text("A-1".into()))
            .with("ready", FieldValue::Bool(ready))
    }

    #[test]
    fn grouped_and_tagged_forms_combine() {
        let body = json!({
            "losses": [{ "id": 1, "modified": 10 }],
            "users": [{ "id": 2, "modified": 10 }],
            "gizmos": [{ "id": 3 }],
            "client": "bench-2",
            "rows": [{ "entity": "assay_result", "data": { "id": 4, "modified": 10 } }]
        });
        let batch = PushBatch::from_json(&body).unwrap();
        let tags: Vec<_> = batch
            .rows
            .iter()
            .map(|row| row.entity.clone().unwrap())
            .collect();
        assert_eq!(tags, vec!["users", "losses", "gizmos", "assay_result"]);
    }

    #[test]
    fn non_array_collection_is_invalid() {
        let err = PushBatch::from_json(&json!({ "users": {} })).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(PushBatch::from_json(&json!([1])).is_err());
    }

    #[test]
    fn decode_reports_row_errors() {
        let unknown = PushedRow::new("gizmos", json!({ "id": 1, "modified": 1 }));
        assert_eq!(
            unknown.decode().unwrap_err(),
            RowError::UnknownEntityType("gizmos".into())
        );

        let untagged = PushedRow {
            entity: None,
            data: json!({ "id": 1, "modified": 1 }),
        };
        assert!(matches!(
            untagged.decode().unwrap_err(),
            RowError::MalformedRow(_)
        ));

        let null_ready = PushedRow::new(
            "assay_results",
            json!({ "id": 1, "modified": 1, "ready": null }),
        );
        assert_eq!(
            null_ready.decode().unwrap().get("ready"),
            Some(&FieldValue::Bool(false))
        );
    }

    #[test]
    fn rejected_report_keeps_raw_tag_and_id() {
        let row = PushedRow::new("gizmos", json!({ "id": 8 }));
        let error = row.decode().unwrap_err();
        let report = RowReport::rejected(2, &row, &error);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            json!({
                "index": 2,
                "entity": "gizmos",
                "id": 8,
                "status": "rejected",
                "error": "unknown_entity_type",
                "reason": "gizmos"
            })
        );
    }

    #[test]
    fn missing_row_is_inserted() {
        assert_eq!(plan_merge(None, &assay(5, true)), MergePlan::Insert);
    }

    #[test]
    fn older_shared_write_loses() {
        let plan = plan_merge(Some(&assay(5, false)), &assay(3, true));
        assert_eq!(plan, MergePlan::NoOp);
    }

    #[test]
    fn newer_shared_write_wins() {
        let plan = plan_merge(Some(&assay(5, false)), &assay(7, true));
        let mut changes = BTreeMap::new();
        changes.insert("ready", FieldValue::Bool(true));
        assert_eq!(
            plan,
            MergePlan::Update {
                changes,
                modified: ts(7)
            }
        );
    }

    #[test]
    fn equal_shared_timestamps_keep_stored() {
        assert_eq!(
            plan_merge(Some(&assay(5, false)), &assay(5, true)),
            MergePlan::NoOp
        );
    }

    #[test]
    fn stale_local_change_still_lands_past_stored_watermark() {
        let incoming = assay(3, false).with("itemcode", FieldValue::Text("A-2".into()));
        let plan = plan_merge(Some(&assay(5, false)), &incoming);
        let mut changes = BTreeMap::new();
        changes.insert("itemcode", FieldValue::Text("A-2".into()));
        assert_eq!(
            plan,
            MergePlan::Update {
                changes,
                modified: ts(6)
            }
        );
    }

    #[test]
    fn cloud_fields_never_update() {
        let stored = EntityRow::new(EntityKind::User, 1, ts(5))
            .with("role", FieldValue::Text("worker".into()))
            .with("pwhash", FieldValue::Blob(vec![1]));
        let incoming = EntityRow::new(EntityKind::User, 1, ts(500))
            .with("role", FieldValue::Text("admin".into()))
            .with("pwhash", FieldValue::Blob(vec![9]));
        assert_eq!(plan_merge(Some(&stored), &incoming), MergePlan::NoOp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_inserts_then_ignores_repeat() {
        let db = Database::open_in_memory().await.unwrap();
        let applier = PushApplier::new(db.connection());

        let first = applier.apply(&assay(5, true), ts(100)).await.unwrap();
        assert_eq!(first.status, RowStatus::Applied);
        assert_eq!(first.effects.notifications_created, 1);

        let second = applier.apply(&assay(5, true), ts(101)).await.unwrap();
        assert_eq!(second.status, RowStatus::IgnoredNoOp);
        assert_eq!(second.effects, Effects::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_rolls_back_failed_row() {
        let db = Database::open_in_memory().await.unwrap();
        db.connection()
            .execute("DROP TABLE losses", ())
            .await
            .unwrap();
        let applier = PushApplier::new(db.connection());

        let row = EntityRow::new(EntityKind::Loss, 1, ts(5));
        let err = applier.apply(&row, ts(10)).await.unwrap_err();
        assert!(!matches!(err, Error::StoreUnavailable(_)));

        // The connection is usable again after the rollback.
        let next = applier.apply(&assay(5, false), ts(10)).await.unwrap();
        assert_eq!(next.status, RowStatus::Applied);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_ready_toggles_and_stamps() {
        let db = Database::open_in_memory().await.unwrap();
        let applier = PushApplier::new(db.connection());
        applier.apply(&assay(5, false), ts(6)).await.unwrap();

        let change = applier.set_ready(1, None, ts(2)).await.unwrap();
        assert!(change.changed);
        assert!(change.ready());
        // A clock behind the stored watermark still moves it forward.
        assert_eq!(change.assay.modified, ts(6));
        assert_eq!(change.effects.notifications_created, 1);

        let unchanged = applier.set_ready(1, Some(true), ts(50)).await.unwrap();
        assert!(!unchanged.changed);
        assert_eq!(unchanged.assay.modified, ts(6));

        let back = applier.set_ready(1, Some(false), ts(50)).await.unwrap();
        assert!(!back.ready());
        assert_eq!(back.assay.modified, ts(50));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_ready_on_missing_assay_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let applier = PushApplier::new(db.connection());
        let err = applier.set_ready(42, None, ts(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
