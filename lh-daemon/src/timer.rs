//! Single-shot cancellable alarm
//!
//! A fired timer never runs handler code itself: it posts its event onto the
//! broker queue, so expiry is processed in the same serialized context as
//! inbound messages and engine callbacks.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

/// Dropping a `Timer` cancels it.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Post `event` onto `queue` once `delay` has elapsed.
    pub fn start<E>(delay: Duration, queue: UnboundedSender<E>, event: E) -> Self
    where
        E: Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if queue.send(event).is_err() {
                trace!("Timer fired after the event queue closed");
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
