//! Watermark-based pull and ownership-aware push

pub mod change_set;
pub mod push;
pub mod watermark;

pub use change_set::{ChangeSet, PullRequest, PullResponse};
pub use push::{
    plan_merge, AppliedRow, MergePlan, PushApplier, PushBatch, PushSummary, PushedRow,
    ReadyChange, RowReport, RowStatus,
};
pub use watermark::Watermark;
