//! Read skew (A5A).
//!
//! Transfers move a random amount from the credit leg to the checking
//! leg of a tuple, so the combined tuple balance is constant by
//! construction. After each committed transfer the tuple id goes onto a
//! bounded pending queue.
//!
//! Each iteration is **one** transaction: it first re-reads every
//! pending pair and compares the combined balance to the tuple
//! constant, then performs its own transfer. Seeing a combined balance
//! other than the constant means the reader caught one leg before a
//! transfer and the other after it. Discrepancy observations are
//! collected per attempt and merged only on commit, so a retried
//! transaction never leaks sums it saw before rolling back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use isoprobe_error::{ProbeError, Result};
use isoprobe_store::{AccountStore, AccountTx, RowLock};
use isoprobe_types::{AccountId, AccountKey, Amount, Settings, WorkloadKind, TUPLE_SUM};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::export::Exporter;
use crate::workload::{random_amount, ProtocolBase, Verification, Workload};

/// Pending-pair queue capacity. Every iteration drains the whole queue
/// before it transfers, so the queue depth stays near the worker count
/// and a blocking send never waits long.
const PENDING_CAP: usize = 100;

pub struct ReadSkew {
    base: ProtocolBase,
    pending_tx: Sender<AccountId>,
    pending_rx: Receiver<AccountId>,
    transfers: AtomicU64,
    checks: AtomicU64,
    discrepancies: AtomicU64,
    findings: Mutex<Vec<String>>,
}

impl ReadSkew {
    #[must_use]
    pub fn new(settings: Settings, store: Arc<dyn AccountStore>) -> Self {
        let (pending_tx, pending_rx) = bounded(PENDING_CAP);
        Self {
            base: ProtocolBase::new(settings, store),
            pending_tx,
            pending_rx,
            transfers: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            discrepancies: AtomicU64::new(0),
            findings: Mutex::new(Vec::new()),
        }
    }

    fn pair_sum(tx: &mut dyn AccountTx, id: AccountId) -> Result<Amount> {
        let checking = tx.find_by_id(AccountKey::checking(id), RowLock::None)?;
        let credit = tx.find_by_id(AccountKey::credit(id), RowLock::None)?;
        Ok(checking.balance + credit.balance)
    }

    /// Post-run verification of one leftover pending pair.
    fn check_pair(&self, id: AccountId) -> Result<()> {
        let (sum, _) = self
            .base
            .runner()
            .execute(|tx| Self::pair_sum(tx, id))?;
        self.record_check(id, sum);
        Ok(())
    }

    fn record_check(&self, id: AccountId, sum: Amount) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if sum != TUPLE_SUM {
            self.discrepancies.fetch_add(1, Ordering::Relaxed);
            self.findings
                .lock()
                .push(format!("account {id} pair sum {sum}, expected {TUPLE_SUM}"));
        }
    }

    /// Move `amount` from the credit leg to the checking leg, provided
    /// the tuple aggregate covers it.
    fn transfer_between_legs(
        &self,
        tx: &mut dyn AccountTx,
        id: AccountId,
        amount: Amount,
        optimistic: bool,
    ) -> Result<bool> {
        let credit = tx.find_by_id(AccountKey::credit(id), RowLock::None)?;
        let checking = tx.find_by_id(AccountKey::checking(id), RowLock::None)?;
        if (credit.balance + checking.balance - amount).is_negative() {
            return Ok(false);
        }
        if optimistic {
            tx.update_balance_cas(&credit.add_balance(-amount))?;
            tx.update_balance_cas(&checking.add_balance(amount))?;
        } else {
            tx.update_balance(&credit.add_balance(-amount))?;
            tx.update_balance(&checking.add_balance(amount))?;
        }
        Ok(true)
    }
}

impl Workload for ReadSkew {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::ReadSkew
    }

    fn validate_settings(&self) -> Result<()> {
        self.base.settings.validate()
    }

    fn before_all(&mut self) -> Result<()> {
        self.base.select_sample()
    }

    fn one_execution(&self) -> Result<Vec<Duration>> {
        // Claim the pending pairs up front; a retried attempt re-checks
        // the same ids.
        let mut drained = Vec::new();
        while let Ok(id) = self.pending_rx.try_recv() {
            drained.push(id);
        }

        let (id, amount) = {
            let mut rng = rand::thread_rng();
            let row = self
                .base
                .sample
                .choose(&mut rng)
                .copied()
                .ok_or_else(|| ProbeError::settings("working sample is empty"))?;
            (row.key.id, random_amount(&mut rng, 1_000, 15_000))
        };
        let optimistic = self.base.settings.lock.is_optimistic();

        // Pair checks and the transfer share one transaction.
        let ((sums, transferred), attempts) = self.base.runner().execute(|tx| {
            let mut sums = Vec::with_capacity(drained.len());
            for &pending in &drained {
                sums.push((pending, Self::pair_sum(tx, pending)?));
            }
            let transferred = self.transfer_between_legs(tx, id, amount, optimistic)?;
            Ok((sums, transferred))
        })?;

        for (pending, sum) in sums {
            self.record_check(pending, sum);
        }
        if transferred {
            self.transfers.fetch_add(1, Ordering::Relaxed);
            let _ = self.pending_tx.send(id);
        }
        Ok(attempts)
    }

    fn after_all(&self, exporter: &mut dyn Exporter) -> Result<Verification> {
        // Leftover pairs are verified single-threaded.
        while let Ok(id) = self.pending_rx.try_recv() {
            self.check_pair(id)?;
        }

        let mut verification = Verification {
            anomaly_count: self.discrepancies.load(Ordering::Relaxed),
            details: std::mem::take(&mut *self.findings.lock()),
        };
        self.base.store.find_negative_balances(&mut |id, total| {
            verification.anomaly_count += 1;
            verification.note(format!("account {id} aggregate balance is {total}"));
        })?;

        exporter.record(
            "transfers",
            &self.transfers.load(Ordering::Relaxed).to_string(),
            "txns",
        )?;
        exporter.record(
            "pair_checks",
            &self.checks.load(Ordering::Relaxed).to_string(),
            "txns",
        )?;
        exporter.record(
            "discrepancies",
            &self.discrepancies.load(Ordering::Relaxed).to_string(),
            "pairs",
        )?;
        self.base.export_safety(exporter)?;
        Ok(verification)
    }
}
