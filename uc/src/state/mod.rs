//! State management
//!
//! A single actor owns the embedded store; every component talks to it
//! through [`StateManager`]. Batch recovery lives alongside it.

mod manager;
mod messages;
mod migrate;
mod recovery;

pub use manager::{BoardMetrics, StateEvent, StateManager};
pub use messages::{StateCommand, StateError, StateResult};
pub use migrate::migrate_legacy;
pub use recovery::{Batch, BatchStatus, RecoveryStats, find_interrupted_batch, recover};
