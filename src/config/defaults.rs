//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Worker
// ============================================================================

/// Poll interval of the worker loop (seconds).
pub const POLL_INTERVAL_SECS: u64 = 60;

/// Data directory holding the sled database and the lock file.
pub const DATA_DIR: &str = "./data";

/// Most empty minute windows one rollover may emit.
///
/// 120 = two hours of idle line.
pub const MAX_GAP_MINUTES: u32 = 120;

/// Upper bound on output rows queued while the store is failing.
///
/// One busy minute with 16 recipes produces ~35 rows; this holds roughly
/// a day of outage.
pub const MAX_PENDING_WRITES: usize = 50_000;

// ============================================================================
// Companion Service
// ============================================================================

/// Base URL of the companion backend.
pub const COMPANION_BACKEND_URL: &str = "http://localhost:5001";

/// Request timeout for companion notifications (milliseconds).
pub const COMPANION_TIMEOUT_MS: u64 = 2_000;

/// Header carrying the shared secret.
pub const COMPANION_SECRET_HEADER: &str = "x-plc-secret";

// ============================================================================
// Schedule
// ============================================================================

/// Delay before a schedule wraps from its last entry to its first (minutes).
pub const SCHEDULE_WRAP_MINUTES: u64 = 180;

// ============================================================================
// Files
// ============================================================================

/// Local config file consulted when `BATCHLINE_CONFIG` is unset.
pub const CONFIG_FILE: &str = "batchline.toml";

/// Subdirectory of the data dir holding the sled database.
pub const DB_SUBDIR: &str = "kpi.sled";
