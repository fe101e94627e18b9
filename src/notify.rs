use crate::task::Mid;

/// Receives user-facing events from the scheduler.
///
/// Calls are made without any scheduler lock held, but implementations must
/// still return quickly; anything slow should be spawned.
pub trait Notifier: Send + Sync {
    /// A task has been warned about a possible stall. Sent once per warning.
    fn on_warn(&self, mid: Mid, reason: &str);
    /// A task has been cancelled by the health monitor.
    fn on_cancel(&self, mid: Mid, reason: &str);
    /// A task has been queued or parked.
    fn on_queued(&self, mid: Mid, reason: &str);
    /// A parked task has been resumed.
    fn on_resumed(&self, _mid: Mid, _reason: &str) {}
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn on_warn(&self, mid: Mid, reason: &str) {
        tracing::warn!("Task {mid} may be stalled: {reason}");
    }

    fn on_cancel(&self, mid: Mid, reason: &str) {
        tracing::warn!("Task {mid} cancelled: {reason}");
    }

    fn on_queued(&self, mid: Mid, reason: &str) {
        tracing::info!("Task {mid} queued: {reason}");
    }

    fn on_resumed(&self, mid: Mid, reason: &str) {
        tracing::info!("Task {mid} resumed: {reason}");
    }
}
