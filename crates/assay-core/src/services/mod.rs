//! Services shared by the binaries

mod sync;

pub use sync::{SyncService, DEFAULT_MAX_PULL_ROWS};
