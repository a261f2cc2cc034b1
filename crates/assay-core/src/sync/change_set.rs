//! Pull side: collecting the rows a caller has not seen yet

use std::collections::BTreeMap;

use libsql::Connection;
use serde::Serialize;

use crate::db::{EntityRepository, LibSqlEntityRepository};
use crate::error::{Result, RowError};
use crate::models::{EntityKind, EntityRow};
use crate::sync::watermark::Watermark;
use crate::timestamp::Timestamp;

/// What a caller asks for when pulling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Exclusive lower bound on `modified`
    pub since: Timestamp,
    /// Kinds to include; `None` means all of them
    pub entities: Option<Vec<EntityKind>>,
    /// Requested per-kind row cap, clamped to the server maximum
    pub limit: Option<usize>,
}

impl PullRequest {
    pub const fn since(since: Timestamp) -> Self {
        Self {
            since,
            entities: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_entities(mut self, entities: Vec<EntityKind>) -> Self {
        self.entities = Some(entities);
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse a comma-separated entity filter such as `users,assay_results`.
    pub fn parse_entities(raw: &str) -> std::result::Result<Vec<EntityKind>, RowError> {
        let mut kinds = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let kind: EntityKind = part.parse()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    fn kinds(&self) -> Vec<EntityKind> {
        match &self.entities {
            Some(selected) => EntityKind::ALL
                .into_iter()
                .filter(|kind| selected.contains(kind))
                .collect(),
            None => EntityKind::ALL.to_vec(),
        }
    }
}

/// Rows changed since a cursor, grouped by kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub rows: BTreeMap<EntityKind, Vec<EntityRow>>,
    /// Highest `modified` returned, or the cursor when nothing was
    pub max_modified: Timestamp,
    /// Another pull from `max_modified` has rows waiting
    pub has_more: bool,
}

impl ChangeSet {
    pub fn rows(&self, kind: EntityKind) -> &[EntityRow] {
        self.rows.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the change set for `request`, returning at most `max_rows` rows per
/// kind (plus the tail of a same-timestamp group).
pub async fn build(conn: &Connection, request: &PullRequest, max_rows: usize) -> Result<ChangeSet> {
    let limit = request.limit.unwrap_or(max_rows).clamp(1, max_rows.max(1));
    let repo = LibSqlEntityRepository::new(conn);

    let mut rows = BTreeMap::new();
    let mut boundary: Option<Timestamp> = None;
    for kind in request.kinds() {
        let page = repo.changed_since(kind, request.since, limit).await?;
        if page.truncated {
            if let Some(last) = page.rows.last() {
                boundary = Some(boundary.map_or(last.modified, |b| b.min(last.modified)));
            }
        }
        rows.insert(kind, page.rows);
    }

    // Withhold anything past the lowest truncation point so the returned
    // watermark never jumps over rows still to be paged in.
    if let Some(boundary) = boundary {
        for kind_rows in rows.values_mut() {
            kind_rows.retain(|row| row.modified <= boundary);
        }
    }

    let mut watermark = Watermark::new(request.since);
    for row in rows.values().flatten() {
        watermark.observe(row.modified);
    }

    let change_set = ChangeSet {
        rows,
        max_modified: watermark.value(),
        has_more: boundary.is_some(),
    };
    tracing::debug!(
        since = %request.since,
        rows = change_set.len(),
        max_modified = %change_set.max_modified,
        has_more = change_set.has_more,
        "Built change set"
    );
    Ok(change_set)
}

/// Wire form of a pull response.
#[derive(Debug, Clone, Serialize)]
pub struct PullResponse {
    pub users: Vec<EntityRow>,
    pub assay_results: Vec<EntityRow>,
    pub spoil_records: Vec<EntityRow>,
    pub losses: Vec<EntityRow>,
    pub max_modified: Timestamp,
    pub has_more: bool,
    pub server_time: Timestamp,
}

impl PullResponse {
    pub fn new(mut change_set: ChangeSet, server_time: Timestamp) -> Self {
        let mut take = |kind| change_set.rows.remove(&kind).unwrap_or_default();
        Self {
            users: take(EntityKind::User),
            assay_results: take(EntityKind::AssayResult),
            spoil_records: take(EntityKind::SpoilRecord),
            losses: take(EntityKind::Loss),
            max_modified: change_set.max_modified,
            has_more: change_set.has_more,
            server_time,
        }
    }
}
