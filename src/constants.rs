//! Centralized constants for telequeue.
//!
//! This module contains the tuned constants that control admission,
//! resource sampling and stall detection. Values that operators are expected
//! to change live in `config.rs` instead.

use std::time::Duration;

// ============================================================================
// Resource Sampling Settings
// ============================================================================

/// Readings younger than this are served from cache
pub const SAMPLE_CACHE_TTL: Duration = Duration::from_secs(1);

/// Constraint level is recomputed at most this often unless forced
pub const LEVEL_CACHE_TTL: Duration = Duration::from_secs(2);

/// Lenient thresholds apply while the process is younger than this
pub const STARTUP_DURATION: Duration = Duration::from_secs(5 * 60);

/// Steady-state constraint thresholds, `(memory%, cpu%)`
pub const CRITICAL_THRESHOLDS: (f32, f32) = (85.0, 90.0);
pub const MODERATE_THRESHOLDS: (f32, f32) = (75.0, 80.0);

/// Startup-phase constraint thresholds, `(memory%, cpu%)`
pub const STARTUP_CRITICAL_THRESHOLDS: (f32, f32) = (95.0, 98.0);
pub const STARTUP_MODERATE_THRESHOLDS: (f32, f32) = (85.0, 90.0);

/// New submissions are queued outright above these, `(memory%, cpu%)`
pub const FORCE_QUEUE_THRESHOLDS: (f32, f32) = (90.0, 95.0);
pub const STARTUP_FORCE_QUEUE_THRESHOLDS: (f32, f32) = (95.0, 98.0);

/// Promotions allowed per pass under MODERATE / CRITICAL load
pub const MODERATE_MAX_TASKS: usize = 2;
pub const CRITICAL_MAX_TASKS: usize = 1;

// ============================================================================
// Monitor Loop Settings
// ============================================================================

/// Number of initial cycles that run at a dampened interval
pub const STARTUP_CYCLES: u32 = 10;

/// Interval multiplier during the startup cycles
pub const STARTUP_INTERVAL_FACTOR: u32 = 3;

/// How often the monitor loop logs a summary line
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// Stall Detection Settings
// ============================================================================

/// Size above which a transfer counts as memory intensive
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Slow-starting kinds are exempt from the zero-speed check until
/// `elapsed >= SLOW_START_FACTOR * elapsed_threshold`
pub const SLOW_START_FACTOR: f64 = 1.5;

/// Fraction of the elapsed threshold during which a kind is exempt from
/// every stall check
pub const GRACE_YTDLP: f64 = 0.5;
pub const GRACE_JD: f64 = 0.75;
pub const GRACE_NZB: f64 = 0.75;
pub const GRACE_STREAMRIP: f64 = 0.6;
pub const GRACE_ZOTIFY: f64 = 0.6;
pub const GRACE_YOUTUBE_UPLOAD: f64 = 0.8;

/// Multiplier applied to the speed threshold per kind
pub const SPEED_FACTOR_YTDLP: f64 = 0.75;
pub const SPEED_FACTOR_JD: f64 = 0.8;
pub const SPEED_FACTOR_NZB: f64 = 0.8;
pub const SPEED_FACTOR_STREAMRIP: f64 = 0.7;
pub const SPEED_FACTOR_ZOTIFY: f64 = 0.7;
pub const SPEED_FACTOR_YOUTUBE_UPLOAD: f64 = 0.6;

// ============================================================================
// Aria2 / Telegram Settings
// ============================================================================

/// Timeout for aria2 operations (pause, unpause, remove)
pub const ARIA2_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of retries for aria2 operations
pub const ARIA2_MAX_RETRIES: u32 = 3;

/// Delay between aria2 operation retries
pub const ARIA2_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Timeout for polling the task list from aria2
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between aria2 task list polls
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum length for brief task names in notices
pub const MAX_BRIEF_NAME_LEN: usize = 40;

/// Telegram rejects messages longer than this many characters
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;
