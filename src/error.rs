use thiserror::Error;

/// Rejected configuration, reported at load time.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("monitor.{field} must be a percentage in 0..=100, got {value}")]
    Percentage { field: &'static str, value: u32 },
    #[error("monitor.{low} ({low_value}) must not exceed monitor.{high} ({high_value})")]
    Inverted {
        low: &'static str,
        low_value: u32,
        high: &'static str,
        high_value: u32,
    },
    #[error("monitor.{0} must be greater than zero")]
    Zero(&'static str),
}

/// Failure reported by a job runner when asked to cancel a task.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("task already finished")]
    Finished,
    #[error("job runner panicked while cancelling")]
    Panicked,
    #[error("job runner unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
