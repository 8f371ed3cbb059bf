//! Write skew (A5B).
//!
//! The classic two-legs-one-constraint shape: a withdrawal is allowed
//! while the *combined* balance of an account's legs stays positive.
//! Two concurrent transactions can each see enough cover, debit
//! different legs, and together drive the aggregate negative — snapshot
//! isolation admits this, serializable isolation and row locks do not.
//!
//! With CAS the constraint rows themselves must carry the conflict, so
//! the optimistic path version-guards *both* legs: the debited leg gets
//! the withdrawal, the other leg a zero-delta guarded touch. Either
//! guard failing forces a retry with fresh balances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use isoprobe_error::{ProbeError, Result};
use isoprobe_store::{AccountStore, RowLock};
use isoprobe_types::{
    AccountKey, AccountType, Amount, LockType, Settings, WorkloadKind,
};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::export::Exporter;
use crate::workload::{random_amount, ProtocolBase, Verification, Workload};

pub struct WriteSkew {
    base: ProtocolBase,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl WriteSkew {
    #[must_use]
    pub fn new(settings: Settings, store: Arc<dyn AccountStore>) -> Self {
        Self {
            base: ProtocolBase::new(settings, store),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

impl Workload for WriteSkew {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::WriteSkew
    }

    fn validate_settings(&self) -> Result<()> {
        self.base.settings.validate()
    }

    fn before_all(&mut self) -> Result<()> {
        self.base.select_sample()
    }

    fn one_execution(&self) -> Result<Vec<Duration>> {
        let (id, amount, debit_checking) = {
            let mut rng = rand::thread_rng();
            let row = self
                .base
                .sample
                .choose(&mut rng)
                .copied()
                .ok_or_else(|| ProbeError::settings("working sample is empty"))?;
            (
                row.key.id,
                random_amount(&mut rng, 100, 5_000),
                rng.gen_bool(0.5),
            )
        };
        let debit_leg = if debit_checking {
            AccountType::Checking
        } else {
            AccountType::Credit
        };
        let other_leg = if debit_checking {
            AccountType::Credit
        } else {
            AccountType::Checking
        };
        let lock_type = self.base.settings.lock;
        let lock = RowLock::from(lock_type);

        let (accepted, attempts) = self.base.runner().execute(|tx| {
            let (total, versions) = match lock_type {
                LockType::None => (tx.total_account_balance(id)?, None),
                LockType::ForUpdate | LockType::ForShare | LockType::CompareAndSet => {
                    let checking = tx.find_by_id(AccountKey::checking(id), lock)?;
                    let credit = tx.find_by_id(AccountKey::credit(id), lock)?;
                    (
                        checking.balance + credit.balance,
                        Some((checking.version, credit.version)),
                    )
                }
            };
            if (total - amount).is_negative() || (total - amount).is_zero() {
                return Ok(false);
            }
            if lock_type.is_optimistic() {
                let (checking_version, credit_version) =
                    versions.unwrap_or_default();
                let (debit_version, other_version) = if debit_checking {
                    (checking_version, credit_version)
                } else {
                    (credit_version, checking_version)
                };
                tx.add_balance_cas(id, debit_leg, -amount, debit_version)?;
                tx.add_balance_cas(id, other_leg, Amount::ZERO, other_version)?;
            } else {
                tx.add_balance(id, debit_leg, -amount)?;
            }
            Ok(true)
        })?;

        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        Ok(attempts)
    }

    fn after_all(&self, exporter: &mut dyn Exporter) -> Result<Verification> {
        let mut verification = Verification::default();
        self.base.store.find_negative_balances(&mut |id, total| {
            verification.anomaly_count += 1;
            verification.note(format!("account {id} aggregate balance is {total}"));
        })?;

        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        verification.note(format!(
            "{accepted} withdrawals accepted, {rejected} rejected"
        ));

        exporter.record("withdrawals_accepted", &accepted.to_string(), "txns")?;
        exporter.record("withdrawals_rejected", &rejected.to_string(), "txns")?;
        exporter.record(
            "negative_aggregates",
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
    use isoprobe_types::{IsolationLevel, INITIAL_BALANCE};

    use crate::export::VecExporter;

    fn settings(lock: LockType) -> Settings {
        Settings {
            workload: WorkloadKind::WriteSkew,
            isolation: IsolationLevel::ReadCommitted,
            lock,
            accounts: 5,
            selection: 10,
            contention_level: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 50,
            ..Settings::default()
        }
    }

    fn seeded() -> Arc<dyn AccountStore> {
        let store = MemStore::new();
        store
            .create_accounts(5, INITIAL_BALANCE, &mut |_| {})
            .expect("seed");
        Arc::new(store)
    }

    #[test]
    fn serial_withdrawals_never_go_negative() {
        for lock in [LockType::None, LockType::ForUpdate, LockType::CompareAndSet] {
            let store = seeded();
            let mut workload = WriteSkew::new(settings(lock), Arc::clone(&store));
            workload.before_all().expect("setup");
            for _ in 0..200 {
                workload.one_execution().expect("iteration");
            }
            let mut exporter = VecExporter::default();
            let verification = workload.after_all(&mut exporter).expect("verify");
            assert!(verification.clean(), "lock {lock:?}: {:?}", verification.details);
            assert!(!store.sum_total_balance().unwrap().is_negative());
        }
    }

    #[test]
    fn eventually_rejects_when_funds_run_out() {
        let store = seeded();
        let mut workload = WriteSkew::new(settings(LockType::None), store);
        workload.before_all().expect("setup");
        for _ in 0..500 {
            workload.one_execution().expect("iteration");
        }
        // 5 tuples x $1000 cannot absorb 500 withdrawals of up to $50.
        assert!(workload.rejected.load(Ordering::Relaxed) > 0);
        assert!(workload.accepted.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn report_rows_cover_tallies_and_safety() {
        let store = seeded();
        let mut workload = WriteSkew::new(settings(LockType::CompareAndSet), store);
        workload.before_all().expect("setup");
        workload.one_execution().expect("iteration");
        let mut exporter = VecExporter::default();
        workload.after_all(&mut exporter).expect("verify");
        let names: Vec<&str> = exporter.rows.iter().map(|(n, _, _)| n.as_str()).collect();
        assert!(names.contains(&"withdrawals_accepted"));
        assert!(names.contains(&"negative_aggregates"));
        assert!(names.contains(&"isolation"));
        assert!(names.contains(&"locking"));
    }
}
