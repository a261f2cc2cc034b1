//! assay-core - Core library for the assay sync backend
//!
//! This crate contains the entity models, the libSQL store, the watermark
//! pull/push protocol and the readiness notification engine used by the
//! API binary.

pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod services;
pub mod sync;
pub mod timestamp;

pub use error::{Error, Result, RowError, RowErrorKind};
pub use models::{EntityKind, EntityRow, FieldValue};
pub use services::SyncService;
pub use timestamp::Timestamp;
