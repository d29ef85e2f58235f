//! Timer/timeout utility implemented using `tokio::time::Sleep` on a spawned
//! sleeper task, connected with the caller through `tokio::sync::watch` and
//! `tokio::sync::Notify` channels. Suitable only for coarse-grained timeout
//! intervals (e.g., the establish-term state timeout).

use std::sync::Arc;

use crate::utils::ConclaveError;

use futures::future::FutureExt;

use tokio::sync::{watch, Notify};
use tokio::time::{self, Duration, Instant};

/// Timer utility for signalling after a given timeout.
///
/// Supports resetting with a different duration. Must be used within the
/// context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Deadline setting channel (caller side sender).
    tx_deadline: watch::Sender<Option<Instant>>,

    /// Timeout notification channel (caller side receiver).
    notify: Arc<Notify>,
}

impl Timer {
    /// Creates a new timer utility; spawns the background sleeper task.
    pub fn new() -> Self {
        let (tx_deadline, mut rx_deadline) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let notify_ref = notify.clone();

        tokio::spawn(async move {
            let sleep = time::sleep(Duration::ZERO);
            tokio::pin!(sleep);

            // terminates implicitly when the sender side gets dropped
            while rx_deadline.changed().await.is_ok() {
                let deadline = *rx_deadline.borrow();
                if let Some(ddl) = deadline {
                    sleep.as_mut().reset(ddl);
                    (&mut sleep).await;

                    // suppress the notification if the deadline has been
                    // moved since this wakeup was scheduled
                    if let Ok(false) = rx_deadline.has_changed() {
                        notify_ref.notify_one();
                    }
                }
            }
        });

        Timer {
            tx_deadline,
            notify,
        }
    }

    /// Kicks off the timer with the given duration. Every call to `kickoff()`
    /// leads to one or zero permits inserted into the notify; a new call made
    /// before the active one fires restarts the countdown at the new
    /// deadline.
    pub fn kickoff(&self, dur: Duration) -> Result<(), ConclaveError> {
        if dur.is_zero() {
            return Err(ConclaveError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.tx_deadline.send(Some(Instant::now() + dur))?;
        Ok(())
    }

    /// Cancels the currently scheduled timeout if one is kicked-off or
    /// already ticked; drains any timeout notification already queued.
    pub fn cancel(&self) -> Result<(), ConclaveError> {
        self.tx_deadline.send(None)?;

        while self.notify.notified().now_or_never().is_some() {}

        Ok(())
    }

    /// Waits for a timeout notification. Typically used as a branch of a
    /// `tokio::select!`.
    pub async fn timeout(&self) {
        self.notify.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
