//! Fixed-pool iteration scheduler.
//!
//! Workers claim iteration numbers off a shared atomic counter and push
//! per-iteration results into a channel; the calling thread harvests
//! them as they complete, tallying commits, retries and failures and
//! invoking the progress hook. A fatal iteration failure is logged and
//! counted but does not stop the run.
//!
//! Cancellation abandons in-flight work: the worker threads observe the
//! flag on their next claim and exit on their own; they are never
//! joined.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::workload::Workload;

/// Snapshot handed to the progress hook after every harvested result.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl Progress {
    /// Completed iterations per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time to completion at the current rate.
    #[must_use]
    pub fn eta(&self) -> Duration {
        let rate = self.rate();
        if rate > 0.0 {
            Duration::from_secs_f64((self.total - self.completed) as f64 / rate)
        } else {
            Duration::ZERO
        }
    }
}

/// Aggregate result of one scheduled run.
#[derive(Debug, Default)]
pub struct WorkloadOutcome {
    /// Iterations that eventually committed.
    pub commits: u64,
    /// Iterations that failed fatally (including retry exhaustion).
    pub fails: u64,
    /// Extra attempts beyond the first, across all commits.
    pub retries: u64,
    /// Wall-clock duration of every attempt, committed or retried.
    pub samples: Vec<Duration>,
    /// Wall-clock duration of the whole run.
    pub elapsed: Duration,
}

/// Drives a workload's `one_execution` across a fixed worker pool.
pub struct IterationScheduler {
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl IterationScheduler {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with signal handlers; setting it stops the harvest.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run `iterations` executions of the workload and harvest results.
    pub fn run(
        &self,
        workload: &Arc<dyn Workload>,
        iterations: usize,
        progress: &mut dyn FnMut(&Progress),
    ) -> WorkloadOutcome {
        let started = Instant::now();
        let counter = Arc::new(AtomicUsize::new(0));
        let (result_tx, result_rx) = crossbeam_channel::unbounded();

        info!(
            workload = %workload.kind(),
            iterations,
            workers = self.workers,
            "starting scheduled run"
        );

        for worker in 0..self.workers {
            let workload = Arc::clone(workload);
            let counter = Arc::clone(&counter);
            let cancel = Arc::clone(&self.cancel);
            let result_tx = result_tx.clone();
            std::thread::Builder::new()
                .name(format!("isoprobe-worker-{worker}"))
                .spawn(move || loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let claimed = counter.fetch_add(1, Ordering::Relaxed);
                    if claimed >= iterations {
                        break;
                    }
                    let result = workload.one_execution();
                    if result_tx.send(result).is_err() {
                        break;
                    }
                })
                .map(|_handle| ()) // detached
                .unwrap_or_else(|err| error!(worker, %err, "failed to spawn worker"));
        }
        drop(result_tx);

        let mut outcome = WorkloadOutcome::default();
        let mut completed = 0_usize;
        while completed < iterations {
            if self.cancel.load(Ordering::Relaxed) {
                info!(completed, iterations, "run cancelled, abandoning in-flight work");
                break;
            }
            let result = match result_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => result,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            };
            completed += 1;
            match result {
                Ok(attempts) => {
                    outcome.commits += 1;
                    outcome.retries += attempts.len().saturating_sub(1) as u64;
                    outcome.samples.extend(attempts);
                }
                Err(err) => {
                    outcome.fails += 1;
                    error!(iteration = completed, %err, "iteration failed");
                }
            }
            progress(&Progress {
                completed,
                total: iterations,
                elapsed: started.elapsed(),
            });
        }

        outcome.elapsed = started.elapsed();
        debug!(
            commits = outcome.commits,
            fails = outcome.fails,
            retries = outcome.retries,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "run finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU64;

    use isoprobe_error::{ProbeError, Result};
    use isoprobe_types::WorkloadKind;

    use crate::export::Exporter;
    use crate::workload::Verification;

    /// Commits every iteration except multiples of `fail_every`.
    struct StubWorkload {
        executions: AtomicU64,
        fail_every: u64,
    }

    impl Workload for StubWorkload {
        fn kind(&self) -> WorkloadKind {
            WorkloadKind::LostUpdate
        }

        fn validate_settings(&self) -> Result<()> {
            Ok(())
        }

        fn before_all(&mut self) -> Result<()> {
            Ok(())
        }

        fn one_execution(&self) -> Result<Vec<Duration>> {
            let n = self.executions.fetch_add(1, Ordering::Relaxed) + 1;
            if self.fail_every != 0 && n % self.fail_every == 0 {
                Err(ProbeError::integrity("stub failure"))
            } else {
                // Two attempts: one simulated retry.
                Ok(vec![Duration::from_micros(10), Duration::from_micros(20)])
            }
        }

        fn after_all(&self, _exporter: &mut dyn Exporter) -> Result<Verification> {
            Ok(Verification::default())
        }
    }

    #[test]
    fn harvests_every_iteration() {
        let workload: Arc<dyn Workload> = Arc::new(StubWorkload {
            executions: AtomicU64::new(0),
            fail_every: 0,
        });
        let scheduler = IterationScheduler::new(4);
        let mut hook_calls = 0_usize;
        let outcome = scheduler.run(&workload, 100, &mut |p| {
            hook_calls += 1;
            assert!(p.completed <= p.total);
        });
        assert_eq!(outcome.commits, 100);
        assert_eq!(outcome.fails, 0);
        assert_eq!(outcome.retries, 100);
        assert_eq!(outcome.samples.len(), 200);
        assert_eq!(hook_calls, 100);
    }

    #[test]
    fn fatal_failures_are_counted_not_fatal() {
        let workload: Arc<dyn Workload> = Arc::new(StubWorkload {
            executions: AtomicU64::new(0),
            fail_every: 5,
        });
        let scheduler = IterationScheduler::new(2);
        let outcome = scheduler.run(&workload, 50, &mut |_| {});
        assert_eq!(outcome.commits + outcome.fails, 50);
        assert_eq!(outcome.fails, 10);
    }

    #[test]
    fn cancellation_stops_the_harvest() {
        let workload: Arc<dyn Workload> = Arc::new(StubWorkload {
            executions: AtomicU64::new(0),
            fail_every: 0,
        });
        let scheduler = IterationScheduler::new(2);
        let cancel = scheduler.cancel_handle();
        cancel.store(true, Ordering::Relaxed);
        let outcome = scheduler.run(&workload, 1_000_000, &mut |_| {});
        assert!(outcome.commits < 1_000_000);
    }

    #[test]
    fn progress_rate_and_eta() {
        let progress = Progress {
            completed: 50,
            total: 100,
            elapsed: Duration::from_secs(5),
        };
        assert!((progress.rate() - 10.0).abs() < f64::EPSILON);
        assert_eq!(progress.eta(), Duration::from_secs(5));

        let empty = Progress {
            completed: 0,
            total: 100,
            elapsed: Duration::ZERO,
        };
        assert_eq!(empty.rate(), 0.0);
        assert_eq!(empty.eta(), Duration::ZERO);
    }
}
