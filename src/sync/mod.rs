//! Feed synchronization: merging fetched entries into stored history and
//! deciding when each subscription is due.
//!
//! - [`merge`](mod@merge) - the pure reconciliation of fresh entries against history
//! - [`scheduler`] - due-ness, fetch-and-merge and the periodic driver loop
//! - [`SubscriptionLocks`] - at most one writer per subscription at a time

pub mod merge;
mod locks;
pub mod scheduler;

pub use locks::SubscriptionLocks;
pub use merge::{merge, MergeOutcome};
pub use scheduler::{is_due, FetchOutcome, Scheduler, TickReport};
