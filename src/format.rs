use std::{
    fmt::{Error, Formatter},
    sync::Arc,
    time::Duration,
};

use crate::{constants::MAX_BRIEF_NAME_LEN, scheduler::QueueCounts, task::Mid};

pub trait MessageFmt {
    fn fmt_message<const DETAILED: bool>(&self, f: &mut Formatter<'_>) -> Result<(), Error>;
}

impl<T: MessageFmt> MessageFmt for &T {
    fn fmt_message<const DETAILED: bool>(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        (**self).fmt_message::<DETAILED>(f)
    }
}

impl<T: MessageFmt> MessageFmt for Arc<T> {
    fn fmt_message<const DETAILED: bool>(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        (**self).fmt_message::<DETAILED>(f)
    }
}

pub struct MessageFmtDetailed<T>(pub T);
impl<T: MessageFmt> std::fmt::Display for MessageFmtDetailed<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        self.0.fmt_message::<true>(f)
    }
}

pub struct MessageFmtBrief<T>(pub T);
impl<T: MessageFmt> std::fmt::Display for MessageFmtBrief<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        self.0.fmt_message::<false>(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Warn,
    Cancel,
    Queued,
    Resumed,
}

/// A user-facing message about one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub mid: Mid,
    pub name: Option<String>,
    pub reason: String,
}

impl MessageFmt for Notice {
    fn fmt_message<const DETAILED: bool>(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let (icon, title) = match self.kind {
            NoticeKind::Warn => ("⚠️", "Task may be stalled"),
            NoticeKind::Cancel => ("❌", "Task cancelled"),
            NoticeKind::Queued => ("🕒", "Task queued"),
            NoticeKind::Resumed => ("▶️", "Task resumed"),
        };
        if DETAILED {
            writeln!(f, "{icon} {title}")?;
            if let Some(name) = &self.name {
                writeln!(f, "Task Name: {name}")?;
            }
            writeln!(f, "Task ID: {}", self.mid)?;
            write!(f, "Reason: {}", self.reason)?;
        } else {
            write!(f, "{icon}|{}|", self.mid)?;
            if let Some(name) = &self.name {
                write!(f, "{}|", brief_name(name))?;
            }
            write!(f, "{}", self.reason)?;
        }
        Ok(())
    }
}

impl MessageFmt for QueueCounts {
    fn fmt_message<const DETAILED: bool>(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        if DETAILED {
            writeln!(f, "Tasks: {}", self.tasks)?;
            writeln!(
                f,
                "Running: {} (download {}, upload {})",
                self.running(),
                self.running_download,
                self.running_upload
            )?;
            writeln!(
                f,
                "Queued: {} (download {}, upload {})",
                self.queued(),
                self.queued_download,
                self.queued_upload
            )?;
            write!(f, "Queued by monitor: {}", self.parked)?;
        } else {
            write!(
                f,
                "{} tasks, {} running, {} queued, {} queued by monitor",
                self.tasks,
                self.running(),
                self.queued(),
                self.parked
            )?;
        }
        Ok(())
    }
}

/// Strips the scheme and truncates to the brief display length.
pub fn brief_name(name: &str) -> String {
    name.trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .take(MAX_BRIEF_NAME_LEN)
        .collect()
}

pub struct SizeFormatter(pub u64);
impl std::fmt::Display for SizeFormatter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        macro_rules! clamp_size {
            ($size: expr, $unit_var: expr, $unit: literal) => {
                if $size > 1024.0 {
                    $size /= 1024.0;
                    $unit_var = $unit;
                }
            };
        }

        let mut size = self.0 as f64;
        let mut unit = "B";
        clamp_size!(size, unit, "KiB");
        clamp_size!(size, unit, "MiB");
        clamp_size!(size, unit, "GiB");
        clamp_size!(size, unit, "TiB");
        clamp_size!(size, unit, "PiB");
        write!(f, "{:.2} {}", size, unit)
    }
}

/// Two most significant units, e.g. `1h 5m` or `15m 0s`.
pub struct DurationFormatter(pub Duration);
impl std::fmt::Display for DurationFormatter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        const DAY: u64 = 24 * HOUR;

        let secs = self.0.as_secs();
        match secs {
            s if s >= DAY => write!(f, "{}d {}h", s / DAY, s % DAY / HOUR),
            s if s >= HOUR => write!(f, "{}h {}m", s / HOUR, s % HOUR / MINUTE),
            s if s >= MINUTE => write!(f, "{}m {}s", s / MINUTE, s % MINUTE),
            s => write!(f, "{s}s"),
        }
    }
}
