//! The [`Scheduler`] owns all shared admission and monitoring state.
//!
//! Lock order: the task table (`tasks`) is always taken before the
//! admission lock. Task handles are never queried while either is held.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    admission::{Admission, AdmissionState, Caps, ForceFlags, MidState},
    classifier::{PressureThresholds, ResourceIntensiveClassifier},
    config::{MonitorConfig, Param, QueueConfig},
    health::{HealthThresholds, TaskHealthMonitor},
    notify::Notifier,
    promotion::{self, Promotion},
    resource::{ConstraintLevel, ResourceMonitor},
    signal::Wake,
    task::{Direction, Mid, TaskHandle},
};

/// Point-in-time counters, for summaries and the status command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub tasks: usize,
    pub running_download: usize,
    pub running_upload: usize,
    pub queued_download: usize,
    pub queued_upload: usize,
    /// Parked by the resource monitor.
    pub parked: usize,
}

impl QueueCounts {
    #[inline]
    pub fn running(&self) -> usize {
        self.running_download + self.running_upload
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.queued_download + self.queued_upload
    }
}

pub struct Scheduler {
    pub(crate) caps: Caps,
    pub(crate) monitor_config: MonitorConfig,
    pub(crate) tasks: RwLock<HashMap<Mid, Arc<dyn TaskHandle>>>,
    pub(crate) admission: Mutex<AdmissionState>,
    pub(crate) resources: ResourceMonitor,
    pub(crate) health: Mutex<TaskHealthMonitor>,
    pub(crate) classifier: Mutex<ResourceIntensiveClassifier>,
    pub(crate) notifier: Arc<dyn Notifier>,
}

impl Scheduler {
    pub fn new<C: Param<QueueConfig> + Param<MonitorConfig>>(
        cfg: &C,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_resources(cfg, notifier, ResourceMonitor::new())
    }

    pub fn with_resources<C: Param<QueueConfig> + Param<MonitorConfig>>(
        cfg: &C,
        notifier: Arc<dyn Notifier>,
        resources: ResourceMonitor,
    ) -> Self {
        let queue_config = Param::<QueueConfig>::param(cfg);
        let monitor_config = Param::<MonitorConfig>::param(cfg);
        Self {
            caps: queue_config.caps(),
            health: Mutex::new(TaskHealthMonitor::new(HealthThresholds::from(
                &monitor_config,
            ))),
            classifier: Mutex::new(ResourceIntensiveClassifier::new(
                PressureThresholds::from(&monitor_config),
                monitor_config.consecutive_checks,
            )),
            monitor_config,
            tasks: RwLock::new(HashMap::new()),
            admission: Mutex::new(AdmissionState::new()),
            resources,
            notifier,
        }
    }

    #[inline]
    pub fn caps(&self) -> Caps {
        self.caps
    }

    #[inline]
    pub fn monitor_config(&self) -> &MonitorConfig {
        &self.monitor_config
    }

    #[inline]
    pub fn resources(&self) -> &ResourceMonitor {
        &self.resources
    }

    pub fn register_task(&self, mid: Mid, handle: Arc<dyn TaskHandle>) {
        self.tasks.write().insert(mid, handle);
    }

    pub fn unregister_task(&self, mid: Mid) -> Option<Arc<dyn TaskHandle>> {
        self.tasks.write().remove(&mid)
    }

    /// Copy of the task table, so handles can be queried without the lock.
    pub(crate) fn task_table(&self) -> Vec<(Mid, Arc<dyn TaskHandle>)> {
        self.tasks
            .read()
            .iter()
            .map(|(&mid, handle)| (mid, handle.clone()))
            .collect()
    }

    /// Decide whether `mid` may start now.
    ///
    /// A resource force-queue is evaluated before the caps and is not skipped
    /// by any of the `force` flags.
    pub fn admit(&self, mid: Mid, direction: Direction, force: ForceFlags) -> Admission {
        // Sampled before taking the admission lock.
        let force_queue = self.resources.should_force_queue();
        let admission = self.admission.lock().admit(
            mid,
            direction,
            &self.caps,
            force,
            force_queue,
        );

        match &admission {
            Admission::Running => {
                tracing::info!("Task {mid} admitted for {direction}");
            }
            Admission::Queued {
                reason: Some(reason),
                ..
            } => {
                tracing::warn!("Task {mid} force-queued for {direction}: {reason}");
                self.notifier.on_queued(mid, reason);
            }
            Admission::Queued { reason: None, .. } => {
                tracing::info!("Task {mid} queued for {direction}: limit reached");
                self.notifier
                    .on_queued(mid, &format!("waiting for a free {direction} slot"));
            }
        }
        admission
    }

    /// Admit `mid` and wait until it may run.
    ///
    /// Resolves immediately with [`Wake::Promoted`] when admitted, otherwise
    /// once the task is promoted or released from the queue.
    pub async fn submit(&self, mid: Mid, direction: Direction, force: ForceFlags) -> Wake {
        match self.admit(mid, direction, force) {
            Admission::Running => Wake::Promoted,
            Admission::Queued { wait, .. } => wait.wait().await,
        }
    }

    /// Terminal completion, error or cancellation of `mid`.
    pub fn release(&self, mid: Mid) -> Promotion {
        if let Some(state) = self.admission.lock().remove(mid) {
            tracing::debug!("Released task {mid} ({state:?})");
        }
        self.promote_eligible()
    }

    /// A download finished ahead of post-processing. Its slot is only handed
    /// back early when there is no global cap to account it against.
    pub fn finish_download(&self, mid: Mid) -> Option<Promotion> {
        if self.caps.all.is_some() {
            return None;
        }
        if !self.admission.lock().vacate_download(mid) {
            return None;
        }
        tracing::debug!("Task {mid} released its download slot");
        Some(self.promote_eligible())
    }

    pub fn promote_eligible(&self) -> Promotion {
        let level = self.resources.constraint_level(false);
        self.promote_with_level(level)
    }

    pub(crate) fn promote_with_level(&self, level: ConstraintLevel) -> Promotion {
        let cancelled = self.cancelled_mids();
        let mut state = self.admission.lock();
        promotion::promote_eligible(&mut state, &self.caps, level, &cancelled)
    }

    fn cancelled_mids(&self) -> HashSet<Mid> {
        self.task_table()
            .into_iter()
            .filter(|(_, handle)| handle.is_cancelled())
            .map(|(mid, _)| mid)
            .collect()
    }

    pub fn state_of(&self, mid: Mid) -> Option<MidState> {
        self.admission.lock().state_of(mid)
    }

    pub fn counts(&self) -> QueueCounts {
        let tasks = self.tasks.read().len();
        let state = self.admission.lock();
        QueueCounts {
            tasks,
            running_download: state.running_count(Direction::Download),
            running_upload: state.running_count(Direction::Upload),
            queued_download: state.queued_count(Direction::Download),
            queued_upload: state.queued_count(Direction::Upload),
            parked: state.parked_count(),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::{testing::*, *};
    use crate::{
        notify::testing::Event,
        resource::testing::ScriptedProbe,
        task::testing::{FakeState, FakeTask},
    };

    #[test]
    fn test_four_downloads_with_caps() {
        let (s, notifier) = scheduler(&config(3, 2, 2), ScriptedProbe::new(5.0, 20.0));
        let admitted: Vec<bool> = (1..=4)
            .map(|mid| s.admit(mid, Direction::Download, ForceFlags::default()).is_running())
            .collect();
        assert_eq!(admitted, vec![true, true, false, false]);
        assert_eq!(
            notifier.count(|e| matches!(e, Event::Queued(..))),
            2
        );

        let promotion = s.release(1);
        assert_eq!(promotion.promoted, vec![(3, Direction::Download)]);
        let counts = s.counts();
        assert_eq!(counts.running_download, 2);
        assert_eq!(counts.queued_download, 1);
        assert!(counts.running() <= 3);
    }

    #[test]
    fn test_startup_force_queue_ignores_free_slots() {
        let (s, notifier) = scheduler(&config(0, 5, 0), ScriptedProbe::new(10.0, 96.0));
        let force = ForceFlags {
            run: true,
            ..Default::default()
        };
        match s.admit(1, Direction::Download, force) {
            Admission::Queued {
                reason: Some(reason),
                ..
            } => assert!(reason.contains("critical")),
            other => panic!("expected forced queue, got {other:?}"),
        }
        assert_eq!(s.counts().running(), 0);
        assert!(matches!(
            notifier.events().as_slice(),
            [Event::Queued(1, reason)] if reason.contains("critical")
        ));
    }

    #[test]
    fn test_direction_hand_off() {
        let (s, _) = scheduler(&config(0, 1, 1), ScriptedProbe::new(5.0, 20.0));
        assert!(s.admit(1, Direction::Download, ForceFlags::default()).is_running());
        assert!(!s.admit(2, Direction::Download, ForceFlags::default()).is_running());

        assert!(s.admit(1, Direction::Upload, ForceFlags::default()).is_running());
        assert_eq!(s.state_of(1), Some(MidState::Running(Direction::Upload)));
        assert_eq!(s.counts().running_download, 0);

        s.promote_eligible();
        assert_eq!(s.state_of(2), Some(MidState::Running(Direction::Download)));
    }

    #[test]
    fn test_finish_download_only_without_global_cap() {
        let (capped, _) = scheduler(&config(2, 1, 0), ScriptedProbe::new(5.0, 20.0));
        capped.admit(1, Direction::Download, ForceFlags::default());
        assert!(capped.finish_download(1).is_none());
        assert_eq!(capped.state_of(1), Some(MidState::Running(Direction::Download)));

        let (open, _) = scheduler(&config(0, 1, 0), ScriptedProbe::new(5.0, 20.0));
        open.admit(1, Direction::Download, ForceFlags::default());
        open.admit(2, Direction::Download, ForceFlags::default());
        let promotion = open.finish_download(1).unwrap();
        assert_eq!(promotion.promoted, vec![(2, Direction::Download)]);
        assert_eq!(open.state_of(1), None);
    }

    #[test]
    fn test_cancelled_handle_is_not_promoted() {
        let (s, _) = scheduler(&config(1, 0, 0), ScriptedProbe::new(5.0, 20.0));
        s.admit(1, Direction::Download, ForceFlags::default());
        s.admit(2, Direction::Download, ForceFlags::default());
        s.admit(3, Direction::Download, ForceFlags::default());
        s.register_task(
            2,
            Arc::new(FakeTask::new(
                "g2",
                FakeState {
                    cancelled: true,
                    ..Default::default()
                },
            )),
        );

        let promotion = s.release(1);
        assert_eq!(promotion.discarded, vec![2]);
        assert_eq!(promotion.promoted, vec![(3, Direction::Download)]);
    }

    #[tokio::test]
    async fn test_submit_waits_for_release() {
        let (s, _) = scheduler(&config(1, 0, 0), ScriptedProbe::new(5.0, 20.0));
        assert_eq!(
            s.submit(1, Direction::Download, ForceFlags::default()).await,
            Wake::Promoted
        );

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.submit(2, Direction::Download, ForceFlags::default()).await })
        };
        while s.counts().queued_download == 0 {
            tokio::task::yield_now().await;
        }
        s.release(1);
        assert_eq!(waiter.await.unwrap(), Wake::Promoted);
        assert_eq!(s.state_of(2), Some(MidState::Running(Direction::Download)));
    }

    #[tokio::test]
    async fn test_release_of_queued_task_wakes_as_released() {
        let (s, _) = scheduler(&config(1, 0, 0), ScriptedProbe::new(5.0, 20.0));
        s.admit(1, Direction::Download, ForceFlags::default());
        let Admission::Queued { wait, .. } = s.admit(2, Direction::Download, ForceFlags::default())
        else {
            panic!("should be queued");
        };
        s.release(2);
        assert_eq!(wait.wait().await, Wake::Released);
        assert_eq!(s.state_of(1), Some(MidState::Running(Direction::Download)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_respect_caps() {
        const CAP_ALL: usize = 3;
        const CAP_DIRECTION: usize = 2;

        let (s, _) = scheduler(
            &config(CAP_ALL, CAP_DIRECTION, CAP_DIRECTION),
            ScriptedProbe::new(5.0, 20.0),
        );
        let active = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..40u64)
            .map(|mid| {
                let s = s.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let direction = if mid % 3 == 0 {
                        Direction::Upload
                    } else {
                        Direction::Download
                    };
                    let slot = &active[direction as usize];
                    assert_eq!(
                        s.submit(mid, direction, ForceFlags::default()).await,
                        Wake::Promoted
                    );
                    let mine = slot.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(mine <= CAP_DIRECTION);
                    let total = active[0].load(Ordering::SeqCst) + active[1].load(Ordering::SeqCst);
                    peak.fetch_max(total, Ordering::SeqCst);

                    let counts = s.counts();
                    assert!(counts.running() <= CAP_ALL);
                    assert!(counts.running_download <= CAP_DIRECTION);
                    assert!(counts.running_upload <= CAP_DIRECTION);

                    tokio::time::sleep(Duration::from_millis(2)).await;
                    slot.fetch_sub(1, Ordering::SeqCst);
                    s.release(mid);
                })
            })
            .collect();

        for job in jobs {
            job.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= CAP_ALL);
        assert_eq!(s.counts(), QueueCounts::default());
    }
}
