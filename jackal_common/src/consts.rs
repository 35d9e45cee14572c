//! Workspace-wide constants.
//!
//! These are the single source of truth for segment geometry, timing defaults
//! and the diagnostic channel layout. Other crates import from here.

/// Page granularity of shared memory segments in bytes.
pub const SHM_PAGE_SIZE: usize = 4096;

/// Maximum shared memory segment size in bytes (1GB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// Maximum number of entries the segment registry will hold.
pub const SHM_REGISTRY_MAX_ENTRIES: usize = 256;

/// CPU cache line size in bytes.
///
/// Used to keep producer and consumer cursors on separate lines.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default sample rate [Hz].
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default period size [frames].
pub const DEFAULT_PERIOD_FRAMES: u32 = 256;

/// Default SCHED_FIFO priority for the process thread.
pub const DEFAULT_RT_PRIORITY: i32 = 70;

/// Default upper bound on simultaneously registered clients.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Default upper bound on simultaneously registered ports.
pub const DEFAULT_MAX_PORTS: usize = 256;

/// Number of diagnostic message slots. Must be a power of two.
pub const DIAG_SLOTS: usize = 32;

/// Maximum length of one diagnostic message in bytes (longer messages are truncated).
pub const DIAG_MESSAGE_LEN: usize = 256;

/// Number of cycle durations kept for the rolling CPU load estimate.
pub const LOAD_ROLLING_COUNT: usize = 32;

/// Interval between CPU load recomputations [ms].
pub const LOAD_ROLLING_INTERVAL_MS: u64 = 1024;

const _: () = assert!(DIAG_SLOTS.is_power_of_two());
const _: () = assert!(SHM_PAGE_SIZE.is_power_of_two());
