//! Bounded and cancellable busy-waits
//!
//! Blocking receives spin on a ring. By default they spin forever; a
//! [`WaitPolicy`] can bound the spin with a timeout, a [`CancelToken`], or both.

use crate::error::{LinkError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Spins between clock reads while a deadline is armed
const CLOCK_CHECK_INTERVAL: u32 = 256;

/// Shared flag that aborts a pending wait
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How long a blocking call may spin
#[derive(Clone, Debug, Default)]
pub struct WaitPolicy {
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl WaitPolicy {
    /// Spin until something arrives
    pub fn forever() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Call `poll` until it yields a value or the policy gives up
    pub(crate) fn spin_until<T>(&self, mut poll: impl FnMut() -> Option<T>) -> Result<T> {
        let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));
        let mut spins: u32 = 0;

        loop {
            if let Some(value) = poll() {
                return Ok(value);
            }

            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(LinkError::Cancelled);
                }
            }

            spins = spins.wrapping_add(1);
            if let Some(deadline) = deadline {
                if spins % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                    return Err(LinkError::TimedOut);
                }
            }

            core::hint::spin_loop();
        }
    }
}
