//! Policy engine
//!
//! Wraps a single step attempt in retry/backoff/timeout/idempotency
//! semantics. The attempt budget is owned by the caller: guard-driven
//! retries and transport retries draw from the same `max_attempts`, so
//! the executor passes in how many attempts this run may spend.
//!
//! The idempotency table is one of the three shared mutable stores in
//! the engine; its critical sections are single map operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::model::{Backoff, Policy};

/// Successful output of one attempt (the device response payload).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttemptOutput {
    /// Response payload line, if the device sent one
    pub payload: Option<String>,
}

/// Outcome of a policy-wrapped run.
#[derive(Debug)]
pub struct PolicyRun {
    /// Attempts actually spent (0 on an idempotency cache hit)
    pub attempts: u32,
    /// Final result
    pub output: EngineResult<AttemptOutput>,
    /// Whether the result came from the idempotency table
    pub from_cache: bool,
}

struct CacheEntry {
    stored: Instant,
    output: AttemptOutput,
}

/// Retry/backoff/timeout/idempotency wrapper around step attempts.
pub struct PolicyEngine {
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl PolicyEngine {
    /// Create an engine whose idempotency entries live for `ttl`.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Run `attempt` under `policy`, spending at most `allowed_attempts`
    /// of its budget.
    ///
    /// Timeouts and transport failures retry with backoff while budget
    /// remains; expression and reference failures return immediately;
    /// cancellation between or during attempts ends the run with
    /// `Cancelled`.
    pub async fn run<F, Fut>(
        &self,
        policy: &Policy,
        allowed_attempts: u32,
        idempotency_key: Option<&str>,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> PolicyRun
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<AttemptOutput>>,
    {
        let key = idempotency_key.filter(|k| !k.is_empty());
        if let Some(key) = key {
            if let Some(output) = self.cached(key) {
                return PolicyRun {
                    attempts: 0,
                    output: Ok(output),
                    from_cache: true,
                };
            }
        }

        let timeout = Duration::from_millis(policy.timeout_ms.max(1));
        let allowed = allowed_attempts.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return PolicyRun {
                    attempts,
                    output: Err(EngineError::Cancelled),
                    from_cache: false,
                };
            }

            attempts += 1;
            let attempt_started = self.clock.now();
            // A timed-out attempt is dropped here, which cancels it.
            let result = tokio::select! {
                result = attempt(attempts) => result,
                sleep = self.clock.sleep(timeout, cancel) => match sleep {
                    Ok(()) => Err(EngineError::Timeout {
                        elapsed_ms: attempt_started.elapsed().as_millis() as u64,
                    }),
                    Err(_) => Err(EngineError::Cancelled),
                },
            };

            match result {
                Ok(output) => {
                    if let Some(key) = key {
                        self.store(key, output.clone());
                    }
                    return PolicyRun {
                        attempts,
                        output: Ok(output),
                        from_cache: false,
                    };
                }
                Err(EngineError::Cancelled) => {
                    return PolicyRun {
                        attempts,
                        output: Err(EngineError::Cancelled),
                        from_cache: false,
                    };
                }
                Err(error) => {
                    let budget_left = attempts < allowed;
                    if !budget_left || !error.is_retryable() {
                        return PolicyRun {
                            attempts,
                            output: Err(error),
                            from_cache: false,
                        };
                    }
                    tracing::debug!(
                        attempt = attempts,
                        allowed,
                        error = %error,
                        "attempt failed, backing off before retry"
                    );
                    let delay = backoff_delay(&policy.backoff, attempts);
                    if !delay.is_zero() {
                        if self.clock.sleep(delay, cancel).await.is_err() {
                            return PolicyRun {
                                attempts,
                                output: Err(EngineError::Cancelled),
                                from_cache: false,
                            };
                        }
                    }
                }
            }
        }
    }

    fn cached(&self, key: &str) -> Option<AttemptOutput> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.stored.elapsed() <= self.ttl => Some(entry.output.clone()),
            Some(_) => {
                // Expired on first access after the TTL.
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, output: AttemptOutput) {
        self.cache.lock().insert(
            key.to_string(),
            CacheEntry {
                stored: Instant::now(),
                output,
            },
        );
    }

    /// Number of live idempotency entries (expired entries may still be
    /// counted until first access).
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Delay before the next attempt, given how many attempts failed so far.
fn backoff_delay(backoff: &Backoff, failed_attempts: u32) -> Duration {
    match backoff {
        Backoff::None => Duration::ZERO,
        Backoff::Fixed { ms } => Duration::from_millis(*ms),
        Backoff::Exponential {
            initial_ms,
            factor,
            cap_ms,
            jitter,
        } => {
            let exponent = failed_attempts.saturating_sub(1).min(32);
            let grown = (*initial_ms as f64) * factor.powi(exponent as i32);
            let mut delay_ms = grown.min(*cap_ms as f64) as u64;
            if *jitter {
                // Uniform sample in [0, current_delay], added on top.
                delay_ms += fastrand::u64(0..=delay_ms.max(1));
            }
            Duration::from_millis(delay_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SysClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Duration::from_secs(60), Arc::new(SysClock))
    }

    fn policy(max_attempts: u32, backoff: Backoff, timeout_ms: u64) -> Policy {
        Policy {
            max_attempts,
            backoff,
            timeout_ms,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn succeeds_first_attempt_without_backoff() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(3, Backoff::Fixed { ms: 1000 }, 100);

        let started = Instant::now();
        let run = engine
            .run(&p, p.max_attempts, None, &cancel, |_| async {
                Ok(AttemptOutput::default())
            })
            .await;

        assert_eq!(run.attempts, 1);
        assert!(run.output.is_ok());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_until_success_with_backoff() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(3, Backoff::Fixed { ms: 50 }, 100);
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let calls_in = Arc::clone(&calls);
        let run = engine
            .run(&p, p.max_attempts, None, &cancel, move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::Transport("line noise".into()))
                    } else {
                        Ok(AttemptOutput::default())
                    }
                }
            })
            .await;

        assert_eq!(run.attempts, 3);
        assert!(run.output.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two fixed 50 ms backoffs between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn budget_is_never_exceeded() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(3, Backoff::None, 50);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let run = engine
            .run(&p, p.max_attempts, None, &cancel, move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<AttemptOutput, _>(EngineError::Transport("dead line".into()))
                }
            })
            .await;

        assert_eq!(run.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(run.output, Err(EngineError::Transport(_))));
    }

    #[tokio::test]
    async fn single_attempt_policy_never_sleeps() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(1, Backoff::Fixed { ms: 5000 }, 50);

        let started = Instant::now();
        let run = engine
            .run(&p, p.max_attempts, None, &cancel, |_| async {
                Err::<AttemptOutput, _>(EngineError::Transport("nope".into()))
            })
            .await;

        assert_eq!(run.attempts, 1);
        assert!(run.output.is_err());
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn attempt_timeout_is_enforced_per_attempt() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(2, Backoff::None, 30);

        let run = engine
            .run(&p, p.max_attempts, None, &cancel, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(AttemptOutput::default())
            })
            .await;

        assert_eq!(run.attempts, 2);
        assert!(matches!(run.output, Err(EngineError::Timeout { .. })));
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(5, Backoff::None, 50);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let run = engine
            .run(&p, p.max_attempts, None, &cancel, move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<AttemptOutput, _>(EngineError::GuardFail { guard: "g".into() })
                }
            })
            .await;

        assert_eq!(run.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_between_attempts_aborts() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(10, Backoff::Fixed { ms: 50 }, 50);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let run = engine
            .run(&p, p.max_attempts, None, &cancel, |_| async {
                Err::<AttemptOutput, _>(EngineError::Transport("flaky".into()))
            })
            .await;

        assert_eq!(run.output, Err(EngineError::Cancelled));
        assert!(run.attempts < 10);
    }

    #[tokio::test]
    async fn idempotency_cache_skips_the_attempt() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let p = policy(1, Backoff::None, 50);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let first = engine
            .run(&p, p.max_attempts, Some("cmd-42"), &cancel, move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(AttemptOutput {
                        payload: Some("TEMP=20".into()),
                    })
                }
            })
            .await;
        assert!(!first.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls_in = Arc::clone(&calls);
        let second = engine
            .run(&p, p.max_attempts, Some("cmd-42"), &cancel, move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(AttemptOutput::default())
                }
            })
            .await;
        assert!(second.from_cache);
        assert_eq!(second.attempts, 0);
        assert_eq!(
            second.output.unwrap().payload.as_deref(),
            Some("TEMP=20")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotency_entries_expire_after_ttl() {
        let engine = PolicyEngine::new(Duration::from_millis(30), Arc::new(SysClock));
        let cancel = CancellationToken::new();
        let p = policy(1, Backoff::None, 50);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls_in = Arc::clone(&calls);
            let run = engine
                .run(&p, p.max_attempts, Some("k"), &cancel, move |_| {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(AttemptOutput::default())
                    }
                })
                .await;
            assert!(run.output.is_ok());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Both runs invoked the attempt because the entry expired.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let shape = Backoff::Exponential {
            initial_ms: 10,
            factor: 2.0,
            cap_ms: 50,
            jitter: false,
        };
        assert_eq!(backoff_delay(&shape, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(&shape, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(&shape, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(&shape, 4), Duration::from_millis(50));
        assert_eq!(backoff_delay(&shape, 10), Duration::from_millis(50));
    }

    #[test]
    fn jitter_adds_at_most_the_current_delay() {
        let shape = Backoff::Exponential {
            initial_ms: 10,
            factor: 2.0,
            cap_ms: 40,
            jitter: true,
        };
        for attempt in 1..6 {
            let base = backoff_delay(
                &Backoff::Exponential {
                    initial_ms: 10,
                    factor: 2.0,
                    cap_ms: 40,
                    jitter: false,
                },
                attempt,
            )
            .as_millis() as u64;
            let jittered = backoff_delay(&shape, attempt).as_millis() as u64;
            assert!(jittered >= base);
            assert!(jittered <= base * 2 + 1);
        }
    }
}
