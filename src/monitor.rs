//! The periodic sweep: resources, stall detection, resource parking and
//! promotion, in that order.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    admission::MidState,
    classifier::ResourceClass,
    constants::{STARTUP_CYCLES, STARTUP_INTERVAL_FACTOR, SUMMARY_INTERVAL},
    format::{DurationFormatter, MessageFmtBrief},
    health::{self, Verdict},
    promotion::{self, Promotion},
    resource::ConstraintLevel,
    scheduler::Scheduler,
    task::{Gid, Mid, TaskSnapshot},
};

/// What one sweep did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub level: ConstraintLevel,
    pub warned: Vec<Mid>,
    pub cancelled: Vec<Mid>,
    pub parked: Vec<(Mid, ResourceClass)>,
    pub resumed: Vec<Mid>,
    pub promotion: Promotion,
}

/// Stops the monitor loop when dropped.
pub struct MonitorGuard {
    _drop: tokio::sync::oneshot::Receiver<()>,
}

impl Scheduler {
    pub fn monitor_cycle(&self, now: Instant) -> CycleReport {
        let usage = self.resources.sample_at(now);
        let level = self.resources.constraint_level_at(now, true);

        let table = self.task_table();
        let snapshots: Vec<TaskSnapshot> = table
            .iter()
            .filter_map(|(mid, handle)| {
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    TaskSnapshot::capture(*mid, handle.as_ref())
                }))
                .map_err(|_| tracing::error!("Reading task {mid} failed, skipping it this cycle"))
                .ok()
            })
            .collect();

        let active: HashSet<Gid> = snapshots.iter().map(|snap| snap.gid.clone()).collect();
        self.health.lock().retain_active(&active);

        let states: HashMap<Mid, MidState> = {
            let admission = self.admission.lock();
            snapshots
                .iter()
                .filter_map(|snap| admission.state_of(snap.mid).map(|state| (snap.mid, state)))
                .collect()
        };
        let parked: HashSet<Mid> = states
            .iter()
            .filter(|(_, state)| matches!(state, MidState::Parked(..)))
            .map(|(&mid, _)| mid)
            .collect();

        let mut report = CycleReport {
            level,
            warned: Vec::new(),
            cancelled: Vec::new(),
            parked: Vec::new(),
            resumed: Vec::new(),
            promotion: Promotion::default(),
        };

        let resumable = {
            let mut classifier = self.classifier.lock();
            classifier.record(usage);
            classifier.rebuild(
                snapshots
                    .iter()
                    .filter(|snap| matches!(states.get(&snap.mid), Some(MidState::Running(_)))),
                &parked,
            );
            [ResourceClass::Cpu, ResourceClass::Memory]
                .into_iter()
                .filter(|&class| classifier.can_resume(class))
                .collect::<Vec<_>>()
        };
        for class in resumable {
            let resumed = {
                let mut admission = self.admission.lock();
                promotion::resume_parked(&mut admission, &self.caps, class)
            };
            for (mid, direction) in resumed {
                tracing::info!("Resumed {direction} task {mid}: {class} usage recovered");
                self.notifier
                    .on_resumed(mid, &format!("{class} usage recovered"));
                report.resumed.push(mid);
            }
        }

        let handles: HashMap<Mid, _> = table.into_iter().collect();
        for snap in &snapshots {
            match states.get(&snap.mid) {
                // Not making an attempt yet.
                Some(MidState::Queued(_)) | Some(MidState::Parked(..)) => continue,
                _ => (),
            }
            let Some(handle) = handles.get(&snap.mid) else {
                continue;
            };

            let verdict = self.health.lock().observe(snap, now);
            match verdict {
                Verdict::Warn {
                    reason,
                    notify,
                    cancel_in,
                } => {
                    if notify {
                        tracing::warn!("Task {} ({}) warned: {reason}", snap.mid, snap.gid);
                        self.notifier.on_warn(
                            snap.mid,
                            &format!(
                                "{reason}; it will be cancelled in {} unless it recovers",
                                DurationFormatter(cancel_in)
                            ),
                        );
                        report.warned.push(snap.mid);
                    }
                    continue;
                }
                Verdict::Cancel { reason } => {
                    if !self.health.lock().mark_cancelled(&snap.gid) {
                        continue;
                    }
                    health::cancel_task(&snap.gid, handle.as_ref());
                    tracing::info!("Task {} ({}) cancelled: {reason}", snap.mid, snap.gid);
                    self.admission.lock().remove(snap.mid);
                    self.notifier.on_cancel(snap.mid, &reason);
                    report.cancelled.push(snap.mid);
                    continue;
                }
                Verdict::Healthy | Verdict::Skip => (),
            }

            if snap.cancelled {
                continue;
            }
            let pressure = self.classifier.lock().pressure_for(snap.mid);
            if let Some((class, reason)) = pressure {
                if self.admission.lock().park(snap.mid, class).is_some() {
                    tracing::warn!("Task {} queued by monitor: {reason}", snap.mid);
                    self.notifier.on_queued(snap.mid, &reason);
                    report.parked.push((snap.mid, class));
                }
            }
        }

        report.promotion = self.promote_with_level(level);
        report
    }

    /// Sleep between sweeps: the base interval scaled by load, and by the
    /// startup factor for the first few cycles.
    pub fn monitor_interval(&self, cycle: u32, level: ConstraintLevel) -> Duration {
        let mut factor = level.interval_factor();
        if cycle < STARTUP_CYCLES {
            factor = factor.max(STARTUP_INTERVAL_FACTOR);
        }
        self.monitor_config.check_interval() * factor
    }

    /// Run sweeps until `shutdown` resolves.
    pub async fn run_monitor_loop<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(
            "Task monitor started, checking every {}",
            DurationFormatter(self.monitor_config.check_interval())
        );

        let mut cycle: u32 = 0;
        let mut last_summary = Instant::now();
        loop {
            let report = self.monitor_cycle(Instant::now());
            if !report.promotion.promoted.is_empty() {
                tracing::debug!(
                    "Monitor cycle {cycle} promoted {} task(s)",
                    report.promotion.promoted.len()
                );
            }
            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                tracing::info!(
                    "Monitor summary ({}): {}",
                    report.level,
                    MessageFmtBrief(self.counts())
                );
                last_summary = Instant::now();
            }

            let interval = self.monitor_interval(cycle, report.level);
            cycle = cycle.saturating_add(1);
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Task monitor stopped");
    }

    /// Start the monitor loop in the background, unless disabled. The loop
    /// stops when the returned guard is dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> Option<MonitorGuard> {
        if !self.monitor_config.enabled {
            tracing::info!("Task monitor disabled");
            return None;
        }
        let (mut drop_tx, _drop) = tokio::sync::oneshot::channel::<()>();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_monitor_loop(async move { drop_tx.closed().await })
                .await;
        });
        Some(MonitorGuard { _drop })
    }
}
