//! Phantom read (P3).
//!
//! Select iterations repeatedly run the same predicate query (all rows
//! sharing an account id) inside one transaction and watch the row
//! count; write iterations insert a fresh synthetic leg under a sampled
//! id or delete a previously inserted one. A phantom is the same
//! predicate returning a different number of rows within one
//! transaction.
//!
//! Synthetic legs carry a zero balance, so phantom traffic never
//! disturbs the balance invariants the other protocols verify.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use isoprobe_error::{ProbeError, Result};
use isoprobe_store::{AccountStore, RowLock};
use isoprobe_types::{
    Account, AccountId, AccountKey, AccountType, Amount, Settings, WorkloadKind, REPEATED_READS,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::export::Exporter;
use crate::workload::{ProtocolBase, Verification, Workload};

pub struct PhantomRead {
    base: ProtocolBase,
    /// Distinct account ids in the sample, computed once in `before_all`.
    ids: Vec<AccountId>,
    selects: AtomicU64,
    inserts: AtomicU64,
    deletes: AtomicU64,
    /// Synthetic rows inserted so far; delete iterations consume them.
    synthetic: Mutex<Vec<AccountKey>>,
    diverged: Mutex<BTreeSet<AccountId>>,
}

impl PhantomRead {
    #[must_use]
    pub fn new(settings: Settings, store: Arc<dyn AccountStore>) -> Self {
        Self {
            base: ProtocolBase::new(settings, store),
            ids: Vec::new(),
            selects: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            synthetic: Mutex::new(Vec::new()),
            diverged: Mutex::new(BTreeSet::new()),
        }
    }

    fn select_iteration(&self) -> Result<Vec<Duration>> {
        let lock = RowLock::from(self.base.settings.lock);
        let (diverged, attempts) = self.base.runner().execute(|tx| {
            let mut diverged = Vec::new();
            for &id in &self.ids {
                let first = tx.find_rows_by_id(id, lock)?.len();
                for _ in 1..REPEATED_READS {
                    let count = tx.find_rows_by_id(id, lock)?.len();
                    if count != first {
                        diverged.push(id);
                        break;
                    }
                }
            }
            Ok(diverged)
        })?;
        self.selects.fetch_add(1, Ordering::Relaxed);
        if !diverged.is_empty() {
            self.diverged.lock().extend(diverged);
        }
        Ok(attempts)
    }

    fn insert_iteration(&self) -> Result<Vec<Duration>> {
        let (id, tag) = {
            let mut rng = rand::thread_rng();
            let id = self
                .ids
                .choose(&mut rng)
                .copied()
                .ok_or_else(|| ProbeError::settings("working sample is empty"))?;
            (id, rng.gen::<u64>())
        };
        let key = AccountKey::new(id, AccountType::Synthetic(tag));
        let row = Account::new(key, Amount::ZERO);
        let (_, attempts) = self
            .base
            .runner()
            .execute(|tx| tx.create_account(&row))?;
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.synthetic.lock().push(key);
        Ok(attempts)
    }

    fn delete_iteration(&self) -> Result<Vec<Duration>> {
        let popped = self.synthetic.lock().pop();
        let Some(key) = popped else {
            // Nothing to delete yet; insert instead so the iteration
            // still generates phantom traffic.
            return self.insert_iteration();
        };
        let (_, attempts) = self
            .base
            .runner()
            .execute(|tx| tx.delete_account(key))?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(attempts)
    }
}

impl Workload for PhantomRead {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::PhantomRead
    }

    fn validate_settings(&self) -> Result<()> {
        self.base.settings.validate()
    }

    fn before_all(&mut self) -> Result<()> {
        self.base.select_sample()?;
        let ids: BTreeSet<AccountId> = self.base.sample.iter().map(|row| row.key.id).collect();
        self.ids = ids.into_iter().collect();
        Ok(())
    }

    fn one_execution(&self) -> Result<Vec<Duration>> {
        let (select, insert) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_bool(self.base.settings.read_write_ratio),
                rng.gen_bool(0.5),
            )
        };
        if select {
            self.select_iteration()
        } else if insert {
            self.insert_iteration()
        } else {
            self.delete_iteration()
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
                "predicate on account {id} returned differing row counts within one transaction"
            ));
        }

        exporter.record(
            "select_iterations",
            &self.selects.load(Ordering::Relaxed).to_string(),
            "txns",
        )?;
        exporter.record(
            "inserts",
            &self.inserts.load(Ordering::Relaxed).to_string(),
            "rows",
        )?;
        exporter.record(
            "deletes",
            &self.deletes.load(Ordering::Relaxed).to_string(),
            "rows",
        )?;
        exporter.record(
            "diverged_predicates",
            &verification.anomaly_count.to_string(),
            "accounts",
        )?;
        self.base.export_safety(exporter)?;
        Ok(verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use isoprobe_store::MemStore;
    use isoprobe_types::{IsolationLevel, LockType, INITIAL_BALANCE};

    use crate::export::NullExporter;

    fn settings() -> Settings {
        Settings {
            workload: WorkloadKind::PhantomRead,
            isolation: IsolationLevel::ReadCommitted,
            lock: LockType::None,
            accounts: 4,
            selection: 8,
            contention_level: 2,
            read_write_ratio: 0.5,
            backoff_base_ms: 1,
            backoff_cap_ms: 50,
            ..Settings::default()
        }
    }

    fn seeded() -> Arc<dyn AccountStore> {
        let store = MemStore::new();
        store
            .create_accounts(4, INITIAL_BALANCE, &mut |_| {})
            .expect("seed");
        Arc::new(store)
    }

    #[test]
    fn dedupes_sample_ids() {
        let store = seeded();
        let mut workload = PhantomRead::new(settings(), store);
        workload.before_all().expect("setup");
        // 8 sampled rows collapse to 4 distinct ids.
        assert_eq!(workload.ids.len(), 4);
    }

    #[test]
    fn serial_predicates_never_diverge() {
        let store = seeded();
        let mut workload = PhantomRead::new(settings(), store);
        workload.before_all().expect("setup");
        for _ in 0..40 {
            workload.one_execution().expect("iteration");
        }
        let verification = workload.after_all(&mut NullExporter).expect("verify");
        assert!(verification.clean(), "{:?}", verification.details);
    }

    #[test]
    fn inserts_do_not_disturb_the_balance_sum() {
        let store = seeded();
        let mut workload = PhantomRead::new(settings(), Arc::clone(&store));
        workload.before_all().expect("setup");
        for _ in 0..10 {
            workload.insert_iteration().expect("insert");
        }
        assert_eq!(
            store.sum_total_balance().unwrap(),
            Amount::from_dollars(4_000)
        );
        assert_eq!(workload.inserts.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn delete_without_prior_insert_falls_back_to_insert() {
        let store = seeded();
        let mut workload = PhantomRead::new(settings(), store);
        workload.before_all().expect("setup");
        workload.delete_iteration().expect("iteration");
        assert_eq!(workload.deletes.load(Ordering::Relaxed), 0);
        assert_eq!(workload.inserts.load(Ordering::Relaxed), 1);

        workload.delete_iteration().expect("delete");
        assert_eq!(workload.deletes.load(Ordering::Relaxed), 1);
    }
}
