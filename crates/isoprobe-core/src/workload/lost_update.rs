//! Lost update (P4).
//!
//! Each iteration moves money between an even number of randomly chosen
//! sampled rows: half the legs gain a random amount, half lose it, so
//! every committed iteration conserves the global sum exactly. A lost
//! update shows up afterwards as a drift between the baseline aggregate
//! and the final one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use isoprobe_error::{ProbeError, Result};
use isoprobe_store::{AccountStore, RowLock};
use isoprobe_types::{Account, Amount, Settings, WorkloadKind};
use rand::seq::SliceRandom;

use crate::export::Exporter;
use crate::workload::{random_amount, ProtocolBase, Verification, Workload};

pub struct LostUpdate {
    base: ProtocolBase,
    writes: AtomicU64,
}

impl LostUpdate {
    #[must_use]
    pub fn new(settings: Settings, store: Arc<dyn AccountStore>) -> Self {
        Self {
            base: ProtocolBase::new(settings, store),
            writes: AtomicU64::new(0),
        }
    }

    /// Alternating +/- deltas across the chosen legs; must sum to zero.
    fn leg_deltas(amount: Amount, legs: usize) -> Vec<Amount> {
        (0..legs)
            .map(|i| if i % 2 == 0 { amount } else { -amount })
            .collect()
    }
}

impl Workload for LostUpdate {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::LostUpdate
    }

    fn validate_settings(&self) -> Result<()> {
        self.base.settings.validate()
    }

    fn before_all(&mut self) -> Result<()> {
        self.base.select_sample()
    }

    fn one_execution(&self) -> Result<Vec<Duration>> {
        let contention = self.base.settings.contention_level;
        let (picks, amount) = {
            let mut rng = rand::thread_rng();
            let picks: Vec<Account> = self
                .base
                .sample
                .choose_multiple(&mut rng, contention)
                .copied()
                .collect();
            (picks, random_amount(&mut rng, 100, 1_000))
        };
        if picks.len() < contention {
            return Err(ProbeError::settings(format!(
                "sample of {} rows cannot satisfy contention level {contention}",
                self.base.sample.len()
            )));
        }

        let deltas = Self::leg_deltas(amount, contention);
        let leg_sum: Amount = deltas.iter().copied().sum();
        if !leg_sum.is_zero() {
            return Err(ProbeError::integrity(format!(
                "leg deltas sum to {leg_sum}, expected zero"
            )));
        }

        let lock = RowLock::from(self.base.settings.lock);
        let optimistic = self.base.settings.lock.is_optimistic();
        let (_, attempts) = self.base.runner().execute(|tx| {
            for (account, delta) in picks.iter().zip(&deltas) {
                let row = tx.find_by_id(account.key, lock)?;
                let updated = row.add_balance(*delta);
                if optimistic {
                    tx.update_balance_cas(&updated)?;
                } else {
                    tx.update_balance(&updated)?;
                }
            }
            Ok(())
        })?;
        self.writes.fetch_add(contention as u64, Ordering::Relaxed);
        Ok(attempts)
    }

    fn after_all(&self, exporter: &mut dyn Exporter) -> Result<Verification> {
        let final_sum = self.base.store.sum_total_balance()?;
        let lost = self.base.baseline - final_sum;

        let mut verification = Verification::default();
        verification.note(format!("baseline total balance {}", self.base.baseline));
        verification.note(format!("final total balance    {final_sum}"));
        if !lost.is_zero() {
            verification.anomaly_count = lost.cents().unsigned_abs();
            verification.note(format!("lost {lost} to concurrent update overwrites"));
        }

        exporter.record("baseline_total", &self.base.baseline.to_string(), "USD")?;
        exporter.record("final_total", &final_sum.to_string(), "USD")?;
        exporter.record("lost_amount", &lost.to_string(), "USD")?;
        exporter.record(
            "leg_writes",
            &self.writes.load(Ordering::Relaxed).to_string(),
            "rows",
        )?;
        self.base.export_safety(exporter)?;
        Ok(verification)
    }
}
