//! The view of a job that the scheduler needs from the job runner.
//!
//! Jobs are owned by whatever runs them; the scheduler only keeps an
//! `Arc<dyn TaskHandle>` and reads a [`TaskSnapshot`] once per monitor cycle.

use std::time::Duration;

use smol_str::SmolStr;

use crate::{constants::*, error::CancelError};

/// Submission id, stable for the lifetime of a job.
pub type Mid = u64;
/// Transfer id, stable per attempt.
pub type Gid = SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Downloading,
    QueuedDownload,
    Uploading,
    QueuedUpload,
    Seeding,
    Paused,
    Ffmpeg,
    Convert,
    Compress,
    Archive,
    Extract,
    Split,
    Other,
}

impl TaskStatus {
    /// Statuses that are checked for stalls.
    #[inline]
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            TaskStatus::Downloading
                | TaskStatus::QueuedDownload
                | TaskStatus::Uploading
                | TaskStatus::QueuedUpload
        )
    }

    /// Post-processing statuses that burn CPU.
    #[inline]
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            TaskStatus::Ffmpeg
                | TaskStatus::Convert
                | TaskStatus::Compress
                | TaskStatus::Archive
                | TaskStatus::Extract
        )
    }

    #[inline]
    pub fn is_transfer(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Uploading)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskKind {
    #[default]
    Generic,
    Ytdlp,
    Jd,
    Nzb,
    Streamrip,
    Zotify,
    YoutubeUpload,
}

impl TaskKind {
    /// Fraction of the elapsed threshold during which the task is exempt from
    /// every stall check.
    pub fn grace_factor(self) -> f64 {
        match self {
            TaskKind::Generic => 0.0,
            TaskKind::Ytdlp => GRACE_YTDLP,
            TaskKind::Jd => GRACE_JD,
            TaskKind::Nzb => GRACE_NZB,
            TaskKind::Streamrip => GRACE_STREAMRIP,
            TaskKind::Zotify => GRACE_ZOTIFY,
            TaskKind::YoutubeUpload => GRACE_YOUTUBE_UPLOAD,
        }
    }

    /// Multiplier applied to the configured speed threshold.
    pub fn speed_factor(self) -> f64 {
        match self {
            TaskKind::Generic => 1.0,
            TaskKind::Ytdlp => SPEED_FACTOR_YTDLP,
            TaskKind::Jd => SPEED_FACTOR_JD,
            TaskKind::Nzb => SPEED_FACTOR_NZB,
            TaskKind::Streamrip => SPEED_FACTOR_STREAMRIP,
            TaskKind::Zotify => SPEED_FACTOR_ZOTIFY,
            TaskKind::YoutubeUpload => SPEED_FACTOR_YOUTUBE_UPLOAD,
        }
    }

    #[inline]
    pub fn is_slow_starting(self) -> bool {
        self != TaskKind::Generic
    }
}

/// Accessors a job runner exposes for every active job.
///
/// Implementations must not block: cache the last known values if reading
/// them needs I/O.
pub trait TaskHandle: Send + Sync {
    fn gid(&self) -> Gid;
    fn status(&self) -> TaskStatus;
    /// Bytes per second.
    fn speed(&self) -> u64;
    /// `None` when unknown or unbounded.
    fn eta(&self) -> Option<Duration>;
    fn size(&self) -> u64;
    fn processed_bytes(&self) -> u64;
    fn elapsed(&self) -> Duration;
    fn cancel(&self) -> Result<(), CancelError>;
    fn is_cancelled(&self) -> bool;
    fn kind(&self) -> TaskKind {
        TaskKind::Generic
    }
}

/// Values read from a handle in one go, so a monitoring sweep evaluates a
/// consistent picture without going back to the handle.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub mid: Mid,
    pub gid: Gid,
    pub status: TaskStatus,
    pub kind: TaskKind,
    pub speed: u64,
    pub eta: Option<Duration>,
    pub size: u64,
    pub processed: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl TaskSnapshot {
    pub fn capture(mid: Mid, handle: &dyn TaskHandle) -> Self {
        Self {
            mid,
            gid: handle.gid(),
            status: handle.status(),
            kind: handle.kind(),
            speed: handle.speed(),
            eta: handle.eta(),
            size: handle.size(),
            processed: handle.processed_bytes(),
            elapsed: handle.elapsed(),
            cancelled: handle.is_cancelled(),
        }
    }

    #[inline]
    pub fn remaining_bytes(&self) -> u64 {
        self.size.saturating_sub(self.processed)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct FakeState {
        pub status: TaskStatus,
        pub kind: TaskKind,
        pub speed: u64,
        pub eta: Option<Duration>,
        pub size: u64,
        pub processed: u64,
        pub elapsed: Duration,
        pub cancelled: bool,
        pub fail_cancel: bool,
        pub panic_on_cancel: bool,
    }

    impl Default for FakeState {
        fn default() -> Self {
            Self {
                status: TaskStatus::Downloading,
                kind: TaskKind::Generic,
                speed: 0,
                eta: None,
                size: 0,
                processed: 0,
                elapsed: Duration::ZERO,
                cancelled: false,
                fail_cancel: false,
                panic_on_cancel: false,
            }
        }
    }

    /// In-memory handle with a counter of cancel calls.
    pub struct FakeTask {
        gid: Gid,
        pub state: Mutex<FakeState>,
        pub cancel_calls: AtomicUsize,
    }

    impl FakeTask {
        pub fn new(gid: &str, state: FakeState) -> Self {
            Self {
                gid: gid.into(),
                state: Mutex::new(state),
                cancel_calls: AtomicUsize::new(0),
            }
        }

        pub fn cancel_calls(&self) -> usize {
            self.cancel_calls.load(Ordering::SeqCst)
        }
    }

    impl TaskHandle for FakeTask {
        fn gid(&self) -> Gid {
            self.gid.clone()
        }
        fn status(&self) -> TaskStatus {
            self.state.lock().status
        }
        fn speed(&self) -> u64 {
            self.state.lock().speed
        }
        fn eta(&self) -> Option<Duration> {
            self.state.lock().eta
        }
        fn size(&self) -> u64 {
            self.state.lock().size
        }
        fn processed_bytes(&self) -> u64 {
            self.state.lock().processed
        }
        fn elapsed(&self) -> Duration {
            self.state.lock().elapsed
        }
        fn cancel(&self) -> Result<(), CancelError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.state.lock().panic_on_cancel {
                panic!("cancel hook crashed");
            }
            let mut state = self.state.lock();
            if state.fail_cancel {
                return Err(CancelError::Unavailable("runner gone".into()));
            }
            state.cancelled = true;
            Ok(())
        }
        fn is_cancelled(&self) -> bool {
            self.state.lock().cancelled
        }
        fn kind(&self) -> TaskKind {
            self.state.lock().kind
        }
    }
}
