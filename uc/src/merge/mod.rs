//! Serial merge queue over parallel workers

pub(crate) mod git;
mod item;
mod queue;

pub use git::{MergeOutcome, RebaseOutcome, create_branch, current_branch, delete_branch, merge_branch, push_branch, rebase_branch};
pub use item::{MergeItemStatus, MergeQueueItem};
pub use queue::{ConflictSeverity, MergeQueue, QueueConflict};
