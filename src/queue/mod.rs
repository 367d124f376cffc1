//! Offline queue of mutations waiting for connectivity.

mod store;
mod types;

pub use store::QueueStore;
pub use types::{FailOutcome, MutationId, MutationStatus, PendingSnapshot, QueuedMutation};
