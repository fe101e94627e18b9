//! One-shot wake-up handed to a submitter that was queued.

use thiserror::Error;
use tokio::sync::watch;

/// Why a queued submitter was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Moved into the running set; start the transfer.
    Promoted,
    /// Dropped from the queue (cancelled, errored, or superseded).
    Released,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal already fired")]
    AlreadyFired,
}

/// Firing half, kept in the queue entry.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<Option<Wake>>,
}

/// Waiting half, returned to the submitter.
#[derive(Debug)]
pub struct WaitSignal {
    rx: watch::Receiver<Option<Wake>>,
}

pub fn channel() -> (Signal, WaitSignal) {
    let (tx, rx) = watch::channel(None);
    (Signal { tx }, WaitSignal { rx })
}

impl Signal {
    /// Fire once. Later calls leave the first value in place.
    pub fn fire(&self, wake: Wake) -> Result<(), SignalError> {
        let fired = self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(wake);
            true
        });
        if fired {
            Ok(())
        } else {
            Err(SignalError::AlreadyFired)
        }
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl WaitSignal {
    /// Suspend until fired. A signal dropped without firing counts as released.
    pub async fn wait(mut self) -> Wake {
        let fired = self.rx.wait_for(Option::is_some).await.map(|wake| *wake);
        match fired {
            Ok(Some(wake)) => wake,
            _ => Wake::Released,
        }
    }

    pub fn try_wake(&self) -> Option<Wake> {
        *self.rx.borrow()
    }
}
