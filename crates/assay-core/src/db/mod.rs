//! Database layer for the assay backend

mod connection;
mod migrations;
mod notification_repository;
mod repository;

pub(crate) use connection::{begin, commit, rollback};
pub use connection::Database;
pub use notification_repository::{LibSqlNotificationRepository, NotificationRepository};
pub use repository::{ChangePage, EntityRepository, LibSqlEntityRepository};
