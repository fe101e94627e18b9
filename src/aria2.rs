use std::{
    fmt::{Error, Formatter},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use aria2_rs::{
    call::{TellActiveCall, TellStoppedCall, TellWaitingCall},
    status::{BittorrentStatus, Status, TaskStatus as Aria2Status},
    BatchClient, ConnectionMeta,
};
use parking_lot::RwLock;
use telequeue::{
    config::{Aria2Config, Param},
    constants::{ARIA2_MAX_RETRIES, ARIA2_OP_TIMEOUT, ARIA2_RETRY_DELAY},
    error::CancelError,
    format::{brief_name, MessageFmt, SizeFormatter},
    task::{Gid, Mid, TaskHandle, TaskStatus},
};

async fn retry_call<T, F, Fut>(op_name: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, aria2_rs::Error>>,
{
    let mut last_err = None;
    for attempt in 0..ARIA2_MAX_RETRIES {
        match tokio::time::timeout(ARIA2_OP_TIMEOUT, f()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => {
                tracing::warn!(
                    "{} attempt {}/{} failed: {}",
                    op_name,
                    attempt + 1,
                    ARIA2_MAX_RETRIES,
                    e
                );
                last_err = Some(anyhow::Error::from(e));
            }
            Err(_) => {
                tracing::warn!(
                    "{} attempt {}/{} timed out",
                    op_name,
                    attempt + 1,
                    ARIA2_MAX_RETRIES
                );
                last_err = Some(anyhow::anyhow!("{op_name} timed out"));
            }
        }
        if attempt + 1 < ARIA2_MAX_RETRIES {
            tokio::time::sleep(ARIA2_RETRY_DELAY).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{op_name} was never attempted")))
}

#[derive(Clone)]
pub struct Aria2Client {
    cli: BatchClient,
}

impl Aria2Client {
    const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100;
    const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub async fn connect<C: Param<Aria2Config>>(cfg: &C) -> Result<Self> {
        let aria_config = cfg.param();

        let conn_meta = ConnectionMeta {
            url: aria_config.rpc_url,
            token: Some(aria_config.token),
        };
        let cli = BatchClient::connect(
            conn_meta,
            aria_config
                .channel_buffer_size
                .unwrap_or(Self::DEFAULT_CHANNEL_BUFFER_SIZE),
            aria_config
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(Self::DEFAULT_INTERVAL),
        )
        .await?;
        Ok(Self { cli })
    }

    pub async fn get_tasks(&self) -> Result<Vec<Status>> {
        let (mut active, waiting, stopped) = tokio::try_join!(
            self.cli.call(TellActiveCall::default()),
            self.cli.call(TellWaitingCall {
                offset: 0,
                num: 1000,
                keys: Default::default(),
            }),
            self.cli.call(TellStoppedCall {
                offset: 0,
                num: 1000,
                keys: Default::default(),
            })
        )?;

        active.extend(waiting.into_iter());
        active.extend(stopped.into_iter());

        Ok(active)
    }

    pub async fn pause(&self, gid: &str) -> Result<()> {
        let call = aria2_rs::call::PauseCall { gid: gid.into() };
        retry_call("pause", || self.cli.call_instantly(&call)).await?;
        Ok(())
    }

    pub async fn resume(&self, gid: &str) -> Result<()> {
        let call = aria2_rs::call::UnpauseCall { gid: gid.into() };
        retry_call("resume", || self.cli.call_instantly(&call)).await?;
        Ok(())
    }

    pub async fn remove(&self, gid: &str) -> Result<()> {
        let call = aria2_rs::call::RemoveCall { gid: gid.into() };
        retry_call("remove", || self.cli.call_instantly(&call)).await?;
        Ok(())
    }
}

pub trait TaskExt {
    fn name(&self) -> &str;
    fn progress(&self) -> f64;
    fn is_finished(&self) -> bool;
}

impl TaskExt for Status {
    fn name(&self) -> &str {
        match &self {
            // Use torrent name as task name
            Status {
                bittorrent:
                    Some(BittorrentStatus {
                        info: Some(info), ..
                    }),
                ..
            } => info.name.as_str(),
            // Use first file uri or path as task name
            Status {
                files: Some(files), ..
            } => files
                .first()
                .map(|f| match f.uris.first() {
                    Some(uri) => uri.uri.as_str(),
                    None => f.path.as_str(),
                })
                .unwrap_or("Unknown Task Name"),
            _ => self.gid.as_deref().unwrap_or("Unknown Task Name"),
        }
    }

    fn progress(&self) -> f64 {
        match (self.completed_length, self.total_length) {
            (_, Some(0)) => 1.0,
            (completed, Some(total)) => completed.unwrap_or(0) as f64 / total as f64,
            _ => 0.0,
        }
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.status,
            Some(Aria2Status::Complete) | Some(Aria2Status::Error) | Some(Aria2Status::Removed)
        )
    }
}

/// Maps an aria2 status onto the scheduler's view.
pub fn task_status(status: &Status) -> TaskStatus {
    match status.status {
        Some(Aria2Status::Active) => {
            let seeding = status.bittorrent.is_some()
                && matches!(
                    (status.completed_length, status.total_length),
                    (Some(done), Some(total)) if total > 0 && done >= total
                );
            if seeding {
                TaskStatus::Seeding
            } else {
                TaskStatus::Downloading
            }
        }
        Some(Aria2Status::Waiting) => TaskStatus::QueuedDownload,
        Some(Aria2Status::Paused) => TaskStatus::Paused,
        _ => TaskStatus::Other,
    }
}

/// A tracked aria2 download. Reads come from the last polled status.
pub struct Aria2Task {
    mid: Mid,
    gid: Gid,
    status: RwLock<Arc<Status>>,
    started_at: Instant,
    cancelled: AtomicBool,
    client: Aria2Client,
}

impl Aria2Task {
    pub fn new(mid: Mid, gid: Gid, status: Arc<Status>, client: Aria2Client) -> Self {
        Self {
            mid,
            gid,
            status: RwLock::new(status),
            started_at: Instant::now(),
            cancelled: AtomicBool::new(false),
            client,
        }
    }

    #[inline]
    pub fn mid(&self) -> Mid {
        self.mid
    }

    pub fn update(&self, status: Arc<Status>) {
        *self.status.write() = status;
    }

    pub fn current(&self) -> Arc<Status> {
        self.status.read().clone()
    }

    pub fn name(&self) -> String {
        self.current().name().to_string()
    }
}

impl TaskHandle for Aria2Task {
    fn gid(&self) -> Gid {
        self.gid.clone()
    }

    fn status(&self) -> TaskStatus {
        task_status(&self.current())
    }

    fn speed(&self) -> u64 {
        self.current().download_speed.unwrap_or(0)
    }

    fn eta(&self) -> Option<Duration> {
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        Some(Duration::from_secs(
            self.size().saturating_sub(self.processed_bytes()) / speed,
        ))
    }

    fn size(&self) -> u64 {
        self.current().total_length.unwrap_or(0)
    }

    fn processed_bytes(&self) -> u64 {
        self.current().completed_length.unwrap_or(0)
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn cancel(&self) -> Result<(), CancelError> {
        if self.current().is_finished() {
            self.cancelled.store(true, Ordering::Release);
            return Err(CancelError::Finished);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CancelError::Unavailable(e.to_string()))?;
        self.cancelled.store(true, Ordering::Release);

        let client = self.client.clone();
        let gid = self.gid.clone();
        runtime.spawn(async move {
            if let Err(e) = client.remove(&gid).await {
                tracing::warn!("Failed to remove aria2 task {gid}: {e}");
            }
        });
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl MessageFmt for Aria2Task {
    fn fmt_message<const DETAILED: bool>(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let status = self.current();
        let (done, total) = (
            status.completed_length.unwrap_or(0),
            status.total_length.unwrap_or(0),
        );
        if DETAILED {
            writeln!(f, "Task Name: {}", status.name())?;
            writeln!(f, "GID: {}", self.gid)?;
            writeln!(f, "Task ID: {}", self.mid)?;
            write!(
                f,
                "Progress: {:.3}% {}/{}",
                status.progress() * 100.,
                SizeFormatter(done),
                SizeFormatter(total)
            )?;
        } else {
            let icon = match status.status {
                Some(Aria2Status::Active) => "⏬",
                Some(Aria2Status::Waiting) => "🕒",
                Some(Aria2Status::Paused) => "⏸️",
                Some(Aria2Status::Error) => "❌",
                Some(Aria2Status::Complete) => "✅",
                Some(Aria2Status::Removed) => "❎",
                None => "❔",
            };
            write!(
                f,
                "{icon}|{:.1}%|{}/{}|{}",
                status.progress() * 100.,
                SizeFormatter(done),
                SizeFormatter(total),
                brief_name(status.name())
            )?;
        }
        Ok(())
    }
}
