//! Transaction retry engine.
//!
//! Runs one unit of transactional work against the store, rolling back
//! and retrying with capped exponential backoff whenever the store
//! reports a transient conflict (serialization failure, deadlock loss,
//! stale CAS version). Fatal errors propagate immediately. The caller
//! gets back the work's value plus the wall-clock duration of every
//! attempt, so the scheduler can count retries and feed the latency
//! sample pool.

use std::time::{Duration, Instant};

use isoprobe_error::{ProbeError, Result};
use isoprobe_store::{AccountStore, AccountTx};
use isoprobe_types::{IsolationLevel, Settings};
use rand::Rng;
use tracing::{debug, warn};

/// Fixed additive pad on every backoff sleep.
const BACKOFF_PAD: Duration = Duration::from_millis(100);

/// Upper bound (exclusive) of the uniform jitter added when enabled.
const JITTER_SPREAD_MS: u64 = 1_000;

/// Retry discipline for one workload run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
    /// Run exactly once; transient conflicts surface as fatal.
    pub skip_retry: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_retries,
            base: Duration::from_millis(settings.backoff_base_ms),
            cap: Duration::from_millis(settings.backoff_cap_ms),
            jitter: settings.retry_jitter,
            skip_retry: settings.skip_retry,
        }
    }

    /// Millisecond-scale backoff for tests and in-process stores.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_attempts: 15,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(50),
            jitter: false,
            skip_retry: false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Backoff before retry number `attempt` (first retry is attempt 1):
/// `min(cap, 2^attempt * base + 100ms)`, saturating.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base
        .saturating_mul(1_u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .saturating_add(BACKOFF_PAD);
    exp.min(cap)
}

/// Executes closures transactionally with retry.
pub struct TransactionRunner<'a> {
    store: &'a dyn AccountStore,
    isolation: IsolationLevel,
    policy: RetryPolicy,
}

impl<'a> TransactionRunner<'a> {
    #[must_use]
    pub fn new(store: &'a dyn AccountStore, isolation: IsolationLevel, policy: RetryPolicy) -> Self {
        Self {
            store,
            isolation,
            policy,
        }
    }

    /// Run `work` inside a transaction, retrying transient conflicts.
    ///
    /// The closure may run several times; it must be safe to re-execute
    /// from scratch (any per-attempt observations reset at its start).
    /// On success returns the closure's value and one duration per
    /// attempt, the last being the successful one.
    pub fn execute<T>(
        &self,
        mut work: impl FnMut(&mut dyn AccountTx) -> Result<T>,
    ) -> Result<(T, Vec<Duration>)> {
        let mut attempts = Vec::new();
        let max_attempts = if self.policy.skip_retry {
            1
        } else {
            self.policy.max_attempts
        };

        for attempt in 0..max_attempts {
            let started = Instant::now();
            let outcome = self.attempt_once(&mut work);
            attempts.push(started.elapsed());

            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "transaction committed after retry");
                    }
                    return Ok((value, attempts));
                }
                Err(err) if err.is_transient() && !self.policy.skip_retry => {
                    // No backoff after the last attempt; the budget is
                    // spent and the caller gets RetriesExhausted now.
                    if attempt + 1 < max_attempts {
                        let delay = self.next_delay(attempt + 1);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient conflict, backing off"
                        );
                        std::thread::sleep(delay);
                    } else {
                        warn!(attempt, error = %err, "transient conflict, retry budget spent");
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(ProbeError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    fn attempt_once<T>(&self, work: &mut impl FnMut(&mut dyn AccountTx) -> Result<T>) -> Result<T> {
        let mut tx = self.store.begin(self.isolation)?;
        match work(tx.as_mut()) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut delay = backoff_delay(attempt, self.policy.base, self.policy.cap);
        if self.policy.jitter {
            let jitter = rand::thread_rng().gen_range(0..JITTER_SPREAD_MS);
            delay = (delay + Duration::from_millis(jitter)).min(self.policy.cap);
        }
        delay
    }
}
