use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::error::{Operation, Result, SessionError};

/// Single-flight flag for one operation, plus a signal fired whenever it
/// is released.
#[derive(Debug, Default)]
pub(crate) struct Flight {
    busy: AtomicBool,
    released: Notify,
}

impl Flight {
    /// Claim the flag with one compare-and-swap. Contention fails fast.
    pub(crate) fn acquire(&self, operation: Operation) -> Result<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::ConcurrentOperation(operation))?;
        Ok(FlightGuard { flight: self })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Wait until no call holds the flag.
    pub(crate) async fn idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            released.await;
        }
    }
}

/// Releases its [`Flight`] on drop, including when the owning future is
/// cancelled.
pub(crate) struct FlightGuard<'a> {
    flight: &'a Flight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
        self.flight.released.notify_waiters();
    }
}
