//! Data models for the assay backend

mod entity;
mod notification;
mod row;

pub use entity::{EntityKind, FieldSpec, FieldType, Ownership};
pub use notification::{MessageKind, Notification, PushEvent};
pub use row::{EntityRow, FieldValue};
