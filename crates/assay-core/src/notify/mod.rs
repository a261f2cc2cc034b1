//! Notification side effects of assay readiness changes

mod outbox;

pub use outbox::PushOutbox;

use libsql::Connection;

use crate::db::{LibSqlNotificationRepository, NotificationRepository};
use crate::error::Result;
use crate::models::{EntityKind, EntityRow, FieldValue, MessageKind, PushEvent};
use crate::timestamp::Timestamp;

/// Change of an assay's `ready` flag across one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyTransition {
    BecameReady,
    BecameNotReady,
    Unchanged,
}

impl ReadyTransition {
    /// `before` is `None` for a freshly inserted assay, which counts as not ready.
    pub const fn classify(before: Option<bool>, after: bool) -> Self {
        let before = matches!(before, Some(true));
        match (before, after) {
            (false, true) => Self::BecameReady,
            (true, false) => Self::BecameNotReady,
            _ => Self::Unchanged,
        }
    }
}

/// What observing one write produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub notifications_created: usize,
    pub notifications_removed: u64,
    /// Handed to the outbox once the write commits
    pub events: Vec<PushEvent>,
}

pub(crate) fn is_ready(row: &EntityRow) -> bool {
    row.get("ready")
        .and_then(FieldValue::as_bool)
        .unwrap_or(false)
}

/// Creates and retracts customer notifications inside a row's transaction.
pub struct NotificationEngine<'a> {
    conn: &'a Connection,
}

impl<'a> NotificationEngine<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Compare an assay's stored state before and after a write and record
    /// the notifications the transition calls for.
    pub async fn observe(
        &self,
        before: Option<&EntityRow>,
        after: &EntityRow,
        now: Timestamp,
    ) -> Result<Effects> {
        if after.kind != EntityKind::AssayResult {
            return Ok(Effects::default());
        }

        let transition = ReadyTransition::classify(before.map(is_ready), is_ready(after));
        if transition == ReadyTransition::Unchanged {
            return Ok(Effects::default());
        }

        let Some(customer) = after.get("customer").and_then(FieldValue::as_integer) else {
            tracing::warn!(
                assay_id = after.id,
                ?transition,
                "Assay has no customer; skipping notification"
            );
            return Ok(Effects::default());
        };
        let itemcode = after
            .get("itemcode")
            .and_then(FieldValue::as_text)
            .map(ToString::to_string);

        let repo = LibSqlNotificationRepository::new(self.conn);
        let mut effects = Effects::default();
        let kind = match transition {
            ReadyTransition::BecameReady => {
                let kind = MessageKind::Ready;
                repo.create(
                    customer,
                    after.id,
                    kind.title(),
                    &kind.body(itemcode.as_deref()),
                    now,
                )
                .await?;
                effects.notifications_created = 1;
                kind
            }
            ReadyTransition::BecameNotReady => {
                effects.notifications_removed = repo.delete_unread_for_assay(after.id).await?;
                MessageKind::NotReady
            }
            ReadyTransition::Unchanged => return Ok(effects),
        };

        tracing::info!(
            assay_id = after.id,
            customer,
            message_kind = ?kind,
            removed = effects.notifications_removed,
            "Assay readiness changed"
        );
        effects
            .events
            .push(PushEvent::new(customer, after.id, kind, itemcode));
        Ok(effects)
    }
}
