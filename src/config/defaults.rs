//! Default constants for transactions configuration
//!
//! These constants define the values used when no explicit value is
//! provided, or when a zero duration is supplied.

use std::time::Duration;

/// Default time an attempt may run before it is considered expired
pub const DEFAULT_EXPIRATION_TIME: Duration = Duration::from_millis(10_000);

/// Default timeout for a single key-value request
pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2_500);

/// Default period in which every owned ATR shard is swept once
pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_millis(60_000);

/// Default grace period added to an attempt's expiry before the client
/// cleanup queue acts on it
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_millis(1_000);

/// Default capacity of the client cleanup queue
pub const DEFAULT_CLEANUP_QUEUE_CAPACITY: usize = 100_000;

/// Default number of ATR shards per location
pub const DEFAULT_NUM_ATRS: u32 = 1024;

/// Maximum number of ATR shards per location
pub const MAX_NUM_ATRS: u32 = 1024;

/// Default time after which a silent sweeper is considered gone
pub const DEFAULT_CLIENT_STALENESS_THRESHOLD: Duration = Duration::from_millis(80_000);

/// Minimum timeout applied to durable requests
pub const DURABILITY_TIMEOUT_FLOOR: Duration = Duration::from_millis(1_500);

/// Number of times a failed client cleanup request is requeued
pub const DEFAULT_CLEANUP_MAX_RETRIES: u32 = 3;

/// Delay before a failed client cleanup request is retried
pub const DEFAULT_CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(500);
