//! Feeds aria2 downloads through the scheduler.
//!
//! Every new gid becomes a job with its own `mid`. Queued jobs are paused in
//! aria2 and unpaused once promoted; finished or vanished gids are released.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use aria2_rs::status::Status;
use parking_lot::RwLock;
use telequeue::{
    admission::{Admission, ForceFlags},
    constants::{REFRESH_INTERVAL, REFRESH_TIMEOUT},
    notify::Notifier,
    scheduler::Scheduler,
    signal::Wake,
    task::{Direction, Gid, Mid, TaskHandle},
};
use tokio::sync::mpsc;

use crate::aria2::{Aria2Client, Aria2Task, TaskExt};

#[derive(Default)]
pub struct Jobs {
    by_gid: HashMap<Gid, Arc<Aria2Task>>,
    by_mid: HashMap<Mid, Arc<Aria2Task>>,
}

impl Jobs {
    pub fn get(&self, mid: Mid) -> Option<&Arc<Aria2Task>> {
        self.by_mid.get(&mid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Aria2Task>> {
        self.by_mid.values()
    }

    fn insert(&mut self, gid: Gid, task: Arc<Aria2Task>) {
        self.by_mid.insert(task.mid(), task.clone());
        self.by_gid.insert(gid, task);
    }

    fn remove(&mut self, gid: &str) -> Option<Arc<Aria2Task>> {
        let task = self.by_gid.remove(gid)?;
        self.by_mid.remove(&task.mid());
        Some(task)
    }
}

pub type SharedJobs = Arc<RwLock<Jobs>>;

#[derive(Debug)]
enum Action {
    Pause(Gid),
    Unpause(Gid),
}

/// Runs aria2 pause/unpause requests one at a time, in submission order.
#[derive(Clone)]
pub struct Actions {
    tx: mpsc::UnboundedSender<Action>,
}

impl Actions {
    pub fn spawn(client: Aria2Client) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(action) = rx.recv().await {
                let (name, res) = match &action {
                    Action::Pause(gid) => ("pause", client.pause(gid).await),
                    Action::Unpause(gid) => ("unpause", client.resume(gid).await),
                };
                if let Err(e) = res {
                    tracing::warn!("Failed to {name} aria2 task: {action:?}: {e}");
                }
            }
        });
        Self { tx }
    }

    fn send(&self, action: Action) {
        if self.tx.send(action).is_err() {
            tracing::warn!("aria2 action worker stopped");
        }
    }

    pub fn pause(&self, gid: Gid) {
        self.send(Action::Pause(gid));
    }

    pub fn unpause(&self, gid: Gid) {
        self.send(Action::Unpause(gid));
    }
}

/// Pauses and unpauses aria2 downloads as the scheduler queues and resumes
/// them, then forwards the event.
pub struct Aria2Notifier {
    jobs: SharedJobs,
    actions: Actions,
    inner: Arc<dyn Notifier>,
}

impl Aria2Notifier {
    pub fn new(jobs: SharedJobs, actions: Actions, inner: Arc<dyn Notifier>) -> Self {
        Self {
            jobs,
            actions,
            inner,
        }
    }

    fn gid_of(&self, mid: Mid) -> Option<Gid> {
        self.jobs.read().get(mid).map(|task| task.gid())
    }
}

impl Notifier for Aria2Notifier {
    fn on_warn(&self, mid: Mid, reason: &str) {
        self.inner.on_warn(mid, reason);
    }

    fn on_cancel(&self, mid: Mid, reason: &str) {
        self.inner.on_cancel(mid, reason);
    }

    fn on_queued(&self, mid: Mid, reason: &str) {
        match self.gid_of(mid) {
            Some(gid) => self.actions.pause(gid),
            None => tracing::debug!("Queued task {mid} has no aria2 download"),
        }
        self.inner.on_queued(mid, reason);
    }

    fn on_resumed(&self, mid: Mid, reason: &str) {
        if let Some(gid) = self.gid_of(mid) {
            self.actions.unpause(gid);
        }
        self.inner.on_resumed(mid, reason);
    }
}

pub struct Runner {
    client: Aria2Client,
    scheduler: Arc<Scheduler>,
    jobs: SharedJobs,
    actions: Actions,
    next_mid: AtomicU64,
}

impl Runner {
    pub fn new(
        client: Aria2Client,
        scheduler: Arc<Scheduler>,
        jobs: SharedJobs,
        actions: Actions,
    ) -> Self {
        Self {
            client,
            scheduler,
            jobs,
            actions,
            next_mid: AtomicU64::new(1),
        }
    }

    /// Poll aria2 until the returned receiver is dropped.
    pub fn spawn(self: &Arc<Self>) -> tokio::sync::oneshot::Receiver<()> {
        let (mut drop_tx, _drop) = tokio::sync::oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::pin! {
                let drop = drop_tx.closed();
            }
            loop {
                tokio::select! {
                    _ = &mut drop => {
                        break;
                    }
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                        match tokio::time::timeout(REFRESH_TIMEOUT, this.client.get_tasks()).await {
                            Ok(Ok(tasks)) => this.sync(tasks),
                            Ok(Err(e)) => tracing::warn!("Failed to fetch aria2 tasks: {e}"),
                            Err(_) => tracing::warn!("Fetching aria2 tasks timed out"),
                        }
                    }
                }
            }
        });
        _drop
    }

    fn sync(&self, statuses: Vec<Status>) {
        let mut seen = HashSet::with_capacity(statuses.len());
        for status in statuses {
            let Some(gid) = status.gid.as_deref().map(Gid::from) else {
                continue;
            };
            seen.insert(gid.clone());
            let status = Arc::new(status);

            let existing = self.jobs.read().by_gid.get(&gid).cloned();
            match existing {
                Some(task) => {
                    let finished = status.is_finished();
                    task.update(status);
                    if finished {
                        self.finish(&gid);
                    }
                }
                None if !status.is_finished() => self.submit(gid, status),
                None => (),
            }
        }

        let vanished: Vec<Gid> = self
            .jobs
            .read()
            .by_gid
            .keys()
            .filter(|gid| !seen.contains(*gid))
            .cloned()
            .collect();
        for gid in vanished {
            self.finish(&gid);
        }
    }

    fn submit(&self, gid: Gid, status: Arc<Status>) {
        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Aria2Task::new(mid, gid.clone(), status, self.client.clone()));
        tracing::info!("Tracking aria2 task {gid} as {mid}: {}", task.name());
        self.jobs.write().insert(gid.clone(), task.clone());
        self.scheduler.register_task(mid, task);

        match self
            .scheduler
            .admit(mid, Direction::Download, ForceFlags::default())
        {
            Admission::Running => (),
            Admission::Queued { wait, .. } => {
                let actions = self.actions.clone();
                tokio::spawn(async move {
                    match wait.wait().await {
                        Wake::Promoted => actions.unpause(gid),
                        Wake::Released => tracing::debug!("Queued task {mid} released"),
                    }
                });
            }
        }
    }

    fn finish(&self, gid: &str) {
        let Some(task) = self.jobs.write().remove(gid) else {
            return;
        };
        let mid = task.mid();
        self.scheduler.unregister_task(mid);
        let promotion = self.scheduler.release(mid);
        tracing::info!(
            "aria2 task {gid} ({mid}) finished, {} promoted",
            promotion.promoted.len()
        );
    }
}
