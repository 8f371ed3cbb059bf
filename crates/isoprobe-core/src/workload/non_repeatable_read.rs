//! Non-repeatable read (P2).
//!
//! Read iterations re-read every sampled row several times inside one
//! transaction and record how many distinct balances they saw; write
//! iterations bump every sampled row by a dollar. Under statement-level
//! reads a concurrent write lands between two of the re-reads and the
//! reader observes more than one value for the same row in the same
//! transaction.
//!
//! Observations are collected per attempt and merged only on commit, so
//! a retried transaction never leaks values it saw before rolling back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use isoprobe_error::Result;
use isoprobe_store::{AccountStore, RowLock};
use isoprobe_types::{AccountId, Amount, Settings, WorkloadKind, REPEATED_READS};
use parking_lot::Mutex;
use rand::Rng;

use crate::export::Exporter;
use crate::workload::{ProtocolBase, Verification, Workload};

pub struct NonRepeatableRead {
    base: ProtocolBase,
    read_iterations: AtomicU64,
    write_iterations: AtomicU64,
    /// Ids that showed more than one balance within a single transaction.
    diverged: Mutex<BTreeSet<AccountId>>,
}

impl NonRepeatableRead {
    #[must_use]
    pub fn new(settings: Settings, store: Arc<dyn AccountStore>) -> Self {
        Self {
            base: ProtocolBase::new(settings, store),
            read_iterations: AtomicU64::new(0),
            write_iterations: AtomicU64::new(0),
            diverged: Mutex::new(BTreeSet::new()),
        }
    }

    fn read_iteration(&self) -> Result<Vec<Duration>> {
        let lock = RowLock::from(self.base.settings.lock);
        let (diverged, attempts) = self.base.runner().execute(|tx| {
            // Fresh observations per attempt.
            let mut diverged = Vec::new();
            for account in &self.base.sample {
                let mut seen: Vec<Amount> = Vec::with_capacity(2);
                for _ in 0..REPEATED_READS {
                    let row = tx.find_by_id(account.key, lock)?;
                    if !seen.contains(&row.balance) {
                        seen.push(row.balance);
                    }
                }
                if seen.len() > 1 {
                    diverged.push(account.key.id);
                }
            }
            Ok(diverged)
        })?;
        self.read_iterations.fetch_add(1, Ordering::Relaxed);
        if !diverged.is_empty() {
            self.diverged.lock().extend(diverged);
        }
        Ok(attempts)
    }

    fn write_iteration(&self) -> Result<Vec<Duration>> {
        let lock = RowLock::from(self.base.settings.lock);
        let optimistic = self.base.settings.lock.is_optimistic();
        let bump = Amount::from_dollars(1);
        let (_, attempts) = self.base.runner().execute(|tx| {
            for account in &self.base.sample {
                let row = tx.find_by_id(account.key, lock)?;
                let updated = row.add_balance(bump);
                if optimistic {
                    tx.update_balance_cas(&updated)?;
                } else {
                    tx.update_balance(&updated)?;
                }
            }
            Ok(())
        })?;
        self.write_iterations.fetch_add(1, Ordering::Relaxed);
        Ok(attempts)
    }
}

impl Workload for NonRepeatableRead {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::NonRepeatableRead
    }

    fn validate_settings(&self) -> Result<()> {
        self.base.settings.validate()
    }

    fn before_all(&mut self) -> Result<()> {
        self.base.select_sample()
    }

    fn one_execution(&self) -> Result<Vec<Duration>> {
        let read = rand::thread_rng().gen_bool(self.base.settings.read_write_ratio);
        if read {
            self.read_iteration()
        } else {
            self.write_iteration()
        }
    }

    fn after_all(&self, exporter: &mut dyn Exporter) -> Result<Verification> {
        let diverged = self.diverged.lock();
        let mut verification = Verification {
            anomaly_count: diverged.len() as u64,
            details: Vec::new(),
        };
        for id in diverged.iter() {
            verification.note(format!(
                "account {id} returned multiple balances within one transaction"
            ));
        }

        exporter.record(
            "read_iterations",
            &self.read_iterations.load(Ordering::Relaxed).to_string(),
            "txns",
        )?;
        exporter.record(
            "write_iterations",
            &self.write_iterations.load(Ordering::Relaxed).to_string(),
            "txns",
        )?;
        exporter.record(
            "diverged_accounts",
            &verification.anomaly_count.to_string(),
            "accounts",
        )?;
        self.base.export_safety(exporter)?;
        Ok(verification)
    }
}
