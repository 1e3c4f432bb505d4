//! Eventual resolution of unfinished attempts
//!
//! Two background subsystems finish what an attempt's client could not:
//!
//! - [`CleanupQueue`]: attempts this client handed off (post-commit
//!   failures, expiry, deferred rollback), processed once their expiry plus
//!   a grace window has passed
//! - [`LostCleanup`]: a periodic sweep of ATR shards for expired attempts
//!   whose client is gone altogether
//!
//! Both drive the same [`Cleaner`] continuation.

pub mod cleaner;
pub mod client_record;
mod lost;
mod queue;
mod request;

pub use cleaner::{Cleaner, CleanupAttempt, CleanupOutcome};
pub use client_record::{ClientAssignment, ClientHeartbeat, ClientRecord, CLIENT_RECORD_KEY};
pub use lost::{LostCleanup, LostCleanupSettings, SweepReport};
pub use queue::CleanupQueue;
pub use request::CleanupRequest;
