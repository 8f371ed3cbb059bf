//! The five anomaly protocols.
//!
//! Each protocol follows the same lifecycle: `validate_settings` before
//! anything runs, `before_all` on one thread (sample selection, baseline
//! aggregate), `one_execution` concurrently from the scheduler's pool,
//! `after_all` on one thread again (verification plus report export).

mod lost_update;
mod non_repeatable_read;
mod phantom_read;
mod read_skew;
mod write_skew;

use std::sync::Arc;
use std::time::Duration;

use isoprobe_error::{ProbeError, Result};
use isoprobe_store::AccountStore;
use isoprobe_types::{Account, Amount, Settings, WorkloadKind};
use rand::Rng;
use tracing::{info, warn};

use crate::export::Exporter;
use crate::runner::{RetryPolicy, TransactionRunner};

pub use lost_update::LostUpdate;
pub use non_repeatable_read::NonRepeatableRead;
pub use phantom_read::PhantomRead;
pub use read_skew::ReadSkew;
pub use write_skew::WriteSkew;

/// Result of a protocol's post-run verification.
#[derive(Debug, Default)]
pub struct Verification {
    /// Distinct anomaly observations (meaning varies per protocol:
    /// divergent ids, negative aggregates, lost cents, pair drift).
    pub anomaly_count: u64,
    /// Human-readable findings, one line each.
    pub details: Vec<String>,
}

impl Verification {
    /// No anomaly observed.
    #[must_use]
    pub fn clean(&self) -> bool {
        self.anomaly_count == 0
    }

    pub(crate) fn note(&mut self, line: impl Into<String>) {
        self.details.push(line.into());
    }
}

/// One anomaly protocol, driven by the scheduler.
pub trait Workload: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    /// Reject settings combinations the protocol cannot run with.
    fn validate_settings(&self) -> Result<()>;

    /// Single-threaded setup: select the working sample and read the
    /// baseline aggregate.
    fn before_all(&mut self) -> Result<()>;

    /// One full iteration, including retries. Returns the wall-clock
    /// duration of every attempt.
    fn one_execution(&self) -> Result<Vec<Duration>>;

    /// Single-threaded verification and report export.
    fn after_all(&self, exporter: &mut dyn Exporter) -> Result<Verification>;
}

/// Cent-granular random amount in `[min_cents, max_cents]`. Balances
/// carry two decimals, so generated deltas exercise the full cent
/// range rather than whole dollars.
pub(crate) fn random_amount(rng: &mut impl Rng, min_cents: i64, max_cents: i64) -> Amount {
    Amount::from_cents(rng.gen_range(min_cents..=max_cents))
}

/// Build the protocol selected by `settings.workload`.
#[must_use]
pub fn instantiate(settings: Settings, store: Arc<dyn AccountStore>) -> Box<dyn Workload> {
    match settings.workload {
        WorkloadKind::LostUpdate => Box::new(LostUpdate::new(settings, store)),
        WorkloadKind::WriteSkew => Box::new(WriteSkew::new(settings, store)),
        WorkloadKind::ReadSkew => Box::new(ReadSkew::new(settings, store)),
        WorkloadKind::NonRepeatableRead => Box::new(NonRepeatableRead::new(settings, store)),
        WorkloadKind::PhantomRead => Box::new(PhantomRead::new(settings, store)),
    }
}

/// State and helpers shared by every protocol.
pub(crate) struct ProtocolBase {
    pub settings: Settings,
    pub store: Arc<dyn AccountStore>,
    pub policy: RetryPolicy,
    /// Fixed working sample, selected once in `before_all` and read-only
    /// afterwards.
    pub sample: Vec<Account>,
    /// Committed global balance sum at `before_all` time.
    pub baseline: Amount,
}

impl ProtocolBase {
    pub(crate) fn new(settings: Settings, store: Arc<dyn AccountStore>) -> Self {
        let policy = RetryPolicy::from_settings(&settings);
        Self {
            settings,
            store,
            policy,
            sample: Vec::new(),
            baseline: Amount::ZERO,
        }
    }

    /// Select the fixed sample and capture the baseline aggregate.
    pub(crate) fn select_sample(&mut self) -> Result<()> {
        self.sample = self
            .store
            .find_sample(self.settings.selection, self.settings.selection_mode)?;
        if self.sample.len() < self.settings.selection {
            warn!(
                requested = self.settings.selection,
                available = self.sample.len(),
                "store holds fewer rows than the requested selection"
            );
        }
        if self.sample.is_empty() {
            return Err(ProbeError::settings(
                "store holds no accounts; seed it first",
            ));
        }
        self.baseline = self.store.sum_total_balance()?;
        info!(
            sample = self.sample.len(),
            baseline = %self.baseline,
            "working sample selected"
        );
        Ok(())
    }

    pub(crate) fn runner(&self) -> TransactionRunner<'_> {
        TransactionRunner::new(self.store.as_ref(), self.settings.isolation, self.policy)
    }

    /// Export the safety configuration rows every report shares.
    pub(crate) fn export_safety(&self, exporter: &mut dyn Exporter) -> Result<()> {
        exporter.record("isolation", self.settings.isolation.alias(), "")?;
        exporter.record("locking", self.settings.lock.alias(), "")?;
        exporter.record("retries_enabled", &(!self.settings.skip_retry).to_string(), "")?;
        Ok(())
    }
}
