//! Tuning constants for the dispatch engine.
//!
//! All invariants verified at compile time via `const` assertions.

use std::time::Duration;

// =============================================================================
// Polling
// =============================================================================

/// Sleep interval for every polling loop in the engine: the submitter when its
/// queue is empty or the backend rejects a submission, the reaper when no
/// completion is ready, and each callback worker when its queue is empty.
///
/// Uniform fixed-interval polling trades tens of microseconds of latency and
/// some idle CPU for loops that never block on a notification primitive.
pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Bounded wait used by the native-AIO completion poll (`io_getevents`).
/// Short enough that the reaper stays responsive to cancellation.
pub const REAP_WAIT: Duration = Duration::from_micros(10);

// =============================================================================
// Capacity bounds
// =============================================================================

/// Minimum backend queue depth.
pub const QUEUE_DEPTH_MIN: u32 = 1;

/// Maximum backend queue depth. Matches the largest submission ring the
/// kernel accepts for `io_uring`.
pub const QUEUE_DEPTH_MAX: u32 = 32_768;

/// Maximum number of callback pool workers.
pub const POOL_WORKERS_MAX: usize = 256;

/// Maximum supported buffer alignment (64 KiB covers large-block devices).
pub const BUF_ALIGN_MAX: usize = 65_536;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(POLL_INTERVAL.as_micros() > 0);
const _: () = assert!(
    POLL_INTERVAL.as_millis() < 10,
    "Polling interval must stay in the microsecond range"
);
const _: () = assert!(REAP_WAIT.as_nanos() > 0);
const _: () = assert!(
    REAP_WAIT.as_nanos() <= POLL_INTERVAL.as_nanos(),
    "Reap wait must not exceed the poll interval"
);

const _: () = assert!(QUEUE_DEPTH_MIN >= 1);
const _: () = assert!(QUEUE_DEPTH_MIN <= QUEUE_DEPTH_MAX);
const _: () = assert!(
    QUEUE_DEPTH_MAX.is_power_of_two(),
    "Depth bound must be a power of two to match ring sizing"
);

const _: () = assert!(POOL_WORKERS_MAX >= 1);
const _: () = assert!(
    BUF_ALIGN_MAX.is_power_of_two(),
    "Alignment bound must be a power of two"
);

// =============================================================================
// Tests
// =============================================================================
