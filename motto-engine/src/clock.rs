//! Clock contract
//!
//! All timing in the engine goes through this trait so tests can shrink
//! waits and hosts can substitute their own timebase. `sleep` is
//! cancellable: cancellation wins over the remaining duration.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Monotonic time source with cancellable sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Sleep for `duration` or until `cancel` fires, whichever is first.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Cancelled` when the token fired.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> EngineResult<()>;
}

/// System clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysClock;

#[async_trait]
impl Clock for SysClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> EngineResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let clock = SysClock;
        let token = CancellationToken::new();
        let started = clock.now();
        clock.sleep(Duration::from_millis(20), &token).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep_promptly() {
        let clock = SysClock;
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let started = Instant::now();
        let result = clock.sleep(Duration::from_secs(10), &token).await;
        assert_eq!(result, Err(EngineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
