//! Client-wide tunables. Values follow the conventions of long-running
//! BOINC-style clients: minutes-to-hours backoff windows, a week-scale
//! fairness horizon.

/// Scheduler RPC retry window (seconds).
pub const SCHED_RETRY_DELAY_MIN: f64 = 60.0;
pub const SCHED_RETRY_DELAY_MAX: f64 = 4.0 * 3600.0;

/// Persistent file transfer retry window (seconds).
pub const PERS_RETRY_DELAY_MIN: f64 = 60.0;
pub const PERS_RETRY_DELAY_MAX: f64 = 4.0 * 3600.0;

/// Base of the shared exponential backoff formula.
pub const RETRY_BASE_PERIOD: f64 = 30.0;

/// Consecutive-failure count beyond which the delay no longer grows.
pub const RETRY_CAP: u32 = 10;

/// Every this many consecutive scheduler RPC failures, re-fetch the
/// project's master file in case the server list itself changed.
pub const MASTER_FETCH_PERIOD: u32 = 10;

/// Period of the persistent-transfer poll (seconds); calls in between
/// are no-ops.
pub const PERS_XFER_POLL_PERIOD: f64 = 1.0;

/// A gap between transfer-time samples longer than this is treated as a
/// suspension interval and excluded from accumulated transfer time.
pub const XFER_IDLE_GAP: f64 = 5.0;

/// How much of a worker's stderr is copied into its result record.
pub const STDERR_TAIL_LEN: usize = 63 * 1024;

/// Half-life of long-term debt decay (seconds); about a week.
pub const DEBT_HALF_LIFE: f64 = 7.0 * 86_400.0;

/// Averaging horizon for per-project recent CPU consumption (seconds).
pub const CPU_AVG_HALF_LIFE: f64 = 86_400.0;

/// Duration-correction-factor sanity window. Outside it, flop-based
/// estimates are unusable and work requests fall back to one second.
pub const DCF_MIN: f64 = 0.02;
pub const DCF_MAX: f64 = 80.0;

/// A single work request never exceeds this multiple of the configured
/// work buffer.
pub const WORK_REQUEST_CAP_MULT: f64 = 2.0;

/// Per-project statistics history retention (days).
pub const STATS_RETENTION_DAYS: i64 = 30;

/// Exit status values recorded on results that never ran to completion.
pub const ERR_COULD_NOT_START: i32 = -185;
pub const ERR_FILE_XFER: i32 = -186;
pub const ERR_ABORTED_VIA_GUI: i32 = -164;
pub const ERR_RESTART_FAILED: i32 = -187;

/// HTTP statuses with dedicated transfer-failure handling.
pub const HTTP_STATUS_NOT_FOUND: u16 = 404;
pub const HTTP_STATUS_RANGE_ERROR: u16 = 416;
pub const HTTP_STATUS_OK: u16 = 200;

/// Fallback benchmark figure when none has been measured (flops).
pub const DEFAULT_FPOPS: f64 = 1e9;

/// Version reported to schedulers.
pub const CORE_MAJOR_VERSION: i32 = 1;
pub const CORE_MINOR_VERSION: i32 = 0;
