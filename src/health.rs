//! Stall detection for transfers.
//!
//! Each `gid` moves through `Healthy -> Warned -> (Cancelled | Healthy)`. A
//! task that has run past the elapsed threshold with no usable ETA is warned
//! first and cancelled once the warning has aged past the configured wait.
//! Tasks that are provably stuck (a full window of slow or zero-speed
//! samples) are cancelled without the warning grace.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    time::{Duration, Instant},
};

use crate::{
    config::MonitorConfig,
    constants::SLOW_START_FACTOR,
    error::CancelError,
    format::DurationFormatter,
    task::{Gid, TaskHandle, TaskSnapshot},
    utils::SampleWindow,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Bytes per second.
    pub speed: u64,
    pub consecutive_checks: usize,
    pub elapsed: Duration,
    pub long_eta: Duration,
    pub wait_before_cancel: Duration,
    pub long_completion: Duration,
}

impl From<&MonitorConfig> for HealthThresholds {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            speed: cfg.speed_threshold(),
            consecutive_checks: cfg.consecutive_checks,
            elapsed: Duration::from_secs(cfg.elapsed_threshold_secs),
            long_eta: Duration::from_secs(cfg.long_eta_threshold_secs),
            wait_before_cancel: Duration::from_secs(cfg.wait_before_cancel_secs),
            long_completion: Duration::from_secs(cfg.long_completion_threshold_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarningRecord {
    pub sent: bool,
    pub sent_at: Instant,
    pub reason: String,
    pub notified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not subject to stall checks this cycle.
    Skip,
    Healthy,
    Warn {
        reason: String,
        /// True exactly once per warning.
        notify: bool,
        cancel_in: Duration,
    },
    Cancel {
        reason: String,
    },
}

#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled,
    /// The runner refused or panicked; the task is still treated as terminal.
    Failed(CancelError),
}

pub struct TaskHealthMonitor {
    thresholds: HealthThresholds,
    speeds: HashMap<Gid, SampleWindow<u64>>,
    warnings: HashMap<Gid, WarningRecord>,
    cancelled: HashSet<Gid>,
}

impl TaskHealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            speeds: HashMap::new(),
            warnings: HashMap::new(),
            cancelled: HashSet::new(),
        }
    }

    pub fn warning(&self, gid: &str) -> Option<&WarningRecord> {
        self.warnings.get(gid)
    }

    pub fn is_cancelled(&self, gid: &str) -> bool {
        self.cancelled.contains(gid)
    }

    pub fn tracked(&self) -> usize {
        self.speeds.len()
    }

    /// Forget every `gid` that is no longer active.
    pub fn retain_active(&mut self, active: &HashSet<Gid>) {
        self.speeds.retain(|gid, _| active.contains(gid));
        self.warnings.retain(|gid, _| active.contains(gid));
        self.cancelled.retain(|gid| active.contains(gid));
    }

    /// Record the latest sample for `snap` and evaluate it.
    pub fn observe(&mut self, snap: &TaskSnapshot, now: Instant) -> Verdict {
        if snap.cancelled || self.cancelled.contains(&snap.gid) || !snap.status.is_monitored() {
            return Verdict::Skip;
        }
        let t = self.thresholds;
        let window = self
            .speeds
            .entry(snap.gid.clone())
            .or_insert_with(|| SampleWindow::new(t.consecutive_checks));
        window.push(snap.speed);

        let grace = t.elapsed.mul_f64(snap.kind.grace_factor());
        if snap.elapsed < grace {
            return Verdict::Healthy;
        }

        let limit = (t.speed as f64 * snap.kind.speed_factor()) as u64;
        let slow = window.full_and_all(|&speed| speed <= limit);
        let stalled = window.full_and_all(|&speed| speed == 0);
        let mean_speed = window.mean().unwrap_or(0);
        let no_usable_eta = snap.eta.map_or(true, |eta| eta > t.long_eta);
        let overdue = snap.elapsed > t.elapsed;
        let slow_start_exempt = snap.kind.is_slow_starting()
            && snap.elapsed < t.elapsed.mul_f64(SLOW_START_FACTOR);

        if stalled && overdue && !slow_start_exempt {
            return Verdict::Cancel {
                reason: format!(
                    "no progress for {} consecutive checks after {}",
                    t.consecutive_checks,
                    DurationFormatter(snap.elapsed)
                ),
            };
        }
        if slow && no_usable_eta && overdue {
            return Verdict::Cancel {
                reason: format!(
                    "consistently slow with no usable ETA after {}",
                    DurationFormatter(snap.elapsed)
                ),
            };
        }
        if slow {
            let completion = estimated_completion(snap.remaining_bytes(), snap.size, mean_speed);
            if completion.map_or(true, |c| c > t.long_completion) {
                return Verdict::Cancel {
                    reason: match completion {
                        Some(c) => format!(
                            "consistently slow, estimated completion in {}",
                            DurationFormatter(c)
                        ),
                        None => "consistently slow, completion cannot be estimated".to_string(),
                    },
                };
            }
        }

        if no_usable_eta && overdue {
            return self.warn(snap, now);
        }

        // Recovered.
        self.warnings.remove(&snap.gid);
        Verdict::Healthy
    }

    fn warn(&mut self, snap: &TaskSnapshot, now: Instant) -> Verdict {
        let wait = self.thresholds.wait_before_cancel;
        let record = self.warnings.entry(snap.gid.clone()).or_insert_with(|| {
            let eta = match snap.eta {
                Some(eta) => format!("ETA {}", DurationFormatter(eta)),
                None => "no ETA".to_string(),
            };
            WarningRecord {
                sent: true,
                sent_at: now,
                reason: format!(
                    "running for {} with {eta}",
                    DurationFormatter(snap.elapsed)
                ),
                notified: false,
            }
        });

        let waited = now.saturating_duration_since(record.sent_at);
        if waited > wait {
            return Verdict::Cancel {
                reason: format!("{}; not resolved after warning", record.reason),
            };
        }

        let notify = !record.notified;
        record.notified = true;
        Verdict::Warn {
            reason: record.reason.clone(),
            notify,
            cancel_in: wait - waited,
        }
    }

    /// Mark `gid` as cancelled and drop its history. Returns false if it
    /// already was. The handle itself is cancelled with [`cancel_task`],
    /// outside any lock.
    pub fn mark_cancelled(&mut self, gid: &Gid) -> bool {
        if !self.cancelled.insert(gid.clone()) {
            return false;
        }
        self.warnings.remove(gid);
        self.speeds.remove(gid);
        true
    }
}

/// Ask the runner to cancel `handle`. A panicking runner counts as a failed
/// cancel.
pub fn cancel_task(gid: &Gid, handle: &dyn TaskHandle) -> CancelOutcome {
    let res = std::panic::catch_unwind(AssertUnwindSafe(|| handle.cancel()))
        .unwrap_or(Err(CancelError::Panicked));
    match res {
        Ok(()) => CancelOutcome::Cancelled,
        Err(e) => {
            tracing::warn!("Cancelling task {gid} failed, treating it as cancelled: {e}");
            CancelOutcome::Failed(e)
        }
    }
}

/// Time left at the observed mean speed; `None` when it cannot finish.
fn estimated_completion(remaining: u64, size: u64, mean_speed: u64) -> Option<Duration> {
    if size == 0 {
        // Unknown size: nothing to project.
        return Some(Duration::ZERO);
    }
    if mean_speed == 0 {
        return None;
    }
    Some(Duration::from_secs(remaining / mean_speed))
}
