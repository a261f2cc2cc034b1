//! Notification records and push-trigger events

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// A customer-facing notification about one assay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    /// Recipient (the assay's customer)
    pub user_id: i64,
    pub assay_id: i64,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created: Timestamp,
}

/// What a push-trigger event tells the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Ready,
    NotReady,
}

impl MessageKind {
    pub const fn title(self) -> &'static str {
        match self {
            Self::Ready => "Assay Ready",
            Self::NotReady => "Assay Not Ready",
        }
    }

    pub fn body(self, itemcode: Option<&str>) -> String {
        match (self, itemcode) {
            (Self::Ready, Some(code)) => format!("Your assay {code} is ready for pickup"),
            (Self::Ready, None) => "Your assay is ready for pickup".to_string(),
            (Self::NotReady, Some(code)) => format!("Your assay {code} is no longer ready"),
            (Self::NotReady, None) => "Your assay is no longer ready".to_string(),
        }
    }
}

/// Request to the push-delivery collaborator.
///
/// Device-token lookup, platform routing and retries all happen on the far
/// side of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub recipient: i64,
    pub assay_id: i64,
    pub message_kind: MessageKind,
    pub title: String,
    pub body: String,
    pub itemcode: Option<String>,
}

impl PushEvent {
    pub fn new(
        recipient: i64,
        assay_id: i64,
        message_kind: MessageKind,
        itemcode: Option<String>,
    ) -> Self {
        Self {
            recipient,
            assay_id,
            message_kind,
            title: message_kind.title().to_string(),
            body: message_kind.body(itemcode.as_deref()),
            itemcode,
        }
    }

    /// Lets devices replace an older alert about the same assay.
    pub fn collapse_id(&self) -> String {
        format!("assay-ready-{}", self.assay_id)
    }
}
