//! Host CPU and memory sampling mapped to a discrete constraint level.
//!
//! Sampling is cheap to call repeatedly: readings are cached for
//! [`SAMPLE_CACHE_TTL`] and the derived level for [`LEVEL_CACHE_TTL`]. A failed
//! reading is treated as an idle host so admission never blocks on the
//! monitor itself.

use std::time::Instant;

use parking_lot::Mutex;
use sysinfo::System;

use crate::constants::*;

/// CPU and memory utilisation in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Usage {
    pub cpu: f32,
    pub memory: f32,
}

impl Usage {
    #[inline]
    fn exceeds(&self, (memory, cpu): (f32, f32)) -> bool {
        self.memory > memory || self.cpu > cpu
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintLevel {
    Normal,
    Moderate,
    Critical,
}

impl ConstraintLevel {
    /// Derive the level from a reading.
    pub fn classify(usage: Usage, startup: bool) -> Self {
        let (critical, moderate) = if startup {
            (STARTUP_CRITICAL_THRESHOLDS, STARTUP_MODERATE_THRESHOLDS)
        } else {
            (CRITICAL_THRESHOLDS, MODERATE_THRESHOLDS)
        };
        if usage.exceeds(critical) {
            ConstraintLevel::Critical
        } else if usage.exceeds(moderate) {
            ConstraintLevel::Moderate
        } else {
            ConstraintLevel::Normal
        }
    }

    /// Promotions allowed per pass; `None` is unbounded.
    pub fn max_tasks(self) -> Option<usize> {
        match self {
            ConstraintLevel::Normal => None,
            ConstraintLevel::Moderate => Some(MODERATE_MAX_TASKS),
            ConstraintLevel::Critical => Some(CRITICAL_MAX_TASKS),
        }
    }

    /// Monitor loop interval multiplier.
    pub fn interval_factor(self) -> u32 {
        match self {
            ConstraintLevel::Normal => 1,
            ConstraintLevel::Moderate => 2,
            ConstraintLevel::Critical => 3,
        }
    }
}

impl std::fmt::Display for ConstraintLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintLevel::Normal => write!(f, "NORMAL"),
            ConstraintLevel::Moderate => write!(f, "MODERATE"),
            ConstraintLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Source of raw readings.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> anyhow::Result<Usage>;
}

/// Reads the host through `sysinfo`.
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // The first CPU reading is relative to this refresh.
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> anyhow::Result<Usage> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            anyhow::bail!("total memory reported as zero");
        }
        let memory = self.system.used_memory() as f64 / total as f64 * 100.0;
        let cpu = self.system.global_cpu_usage();
        if !cpu.is_finite() {
            anyhow::bail!("cpu usage is not a number");
        }
        Ok(Usage {
            cpu,
            memory: memory as f32,
        })
    }
}

struct MonitorInner {
    probe: Box<dyn ResourceProbe>,
    last_sample: Option<(Instant, Usage)>,
    last_level: Option<(Instant, ConstraintLevel)>,
}

pub struct ResourceMonitor {
    inner: Mutex<MonitorInner>,
    started_at: Instant,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_probe(SystemProbe::new(), Instant::now())
    }

    pub fn with_probe<P: ResourceProbe + 'static>(probe: P, started_at: Instant) -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                probe: Box::new(probe),
                last_sample: None,
                last_level: None,
            }),
            started_at,
        }
    }

    #[inline]
    pub fn sample(&self) -> Usage {
        self.sample_at(Instant::now())
    }

    pub fn sample_at(&self, now: Instant) -> Usage {
        let mut inner = self.inner.lock();
        Self::sample_locked(&mut inner, now)
    }

    fn sample_locked(inner: &mut MonitorInner, now: Instant) -> Usage {
        if let Some((at, usage)) = inner.last_sample {
            if now.saturating_duration_since(at) < SAMPLE_CACHE_TTL {
                return usage;
            }
        }
        match inner.probe.sample() {
            Ok(usage) => {
                inner.last_sample = Some((now, usage));
                usage
            }
            Err(e) => {
                tracing::debug!("Resource sampling failed, assuming idle host: {e}");
                Usage::default()
            }
        }
    }

    pub fn is_startup_phase_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) < STARTUP_DURATION
    }

    #[inline]
    pub fn constraint_level(&self, force_refresh: bool) -> ConstraintLevel {
        self.constraint_level_at(Instant::now(), force_refresh)
    }

    pub fn constraint_level_at(&self, now: Instant, force_refresh: bool) -> ConstraintLevel {
        let startup = self.is_startup_phase_at(now);
        let mut inner = self.inner.lock();
        if !force_refresh {
            if let Some((at, level)) = inner.last_level {
                if now.saturating_duration_since(at) < LEVEL_CACHE_TTL {
                    return level;
                }
            }
        }
        let usage = Self::sample_locked(&mut inner, now);
        let level = ConstraintLevel::classify(usage, startup);
        inner.last_level = Some((now, level));
        level
    }

    #[inline]
    pub fn should_force_queue(&self) -> Option<String> {
        self.should_force_queue_at(Instant::now())
    }

    /// Near-saturation check for brand-new submissions. Returns the reason
    /// when the submission must be queued regardless of free slots.
    pub fn should_force_queue_at(&self, now: Instant) -> Option<String> {
        let thresholds = if self.is_startup_phase_at(now) {
            STARTUP_FORCE_QUEUE_THRESHOLDS
        } else {
            FORCE_QUEUE_THRESHOLDS
        };
        let usage = self.sample_at(now);
        usage.exceeds(thresholds).then(|| {
            format!(
                "critical resources: CPU {:.1}%, memory {:.1}%",
                usage.cpu, usage.memory
            )
        })
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
