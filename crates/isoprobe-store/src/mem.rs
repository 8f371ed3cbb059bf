//! In-memory versioned ledger.
//!
//! A single account table as a versioned map plus a row lock table.
//! Semantics per isolation level:
//!
//! - **Read committed**: every statement reads the latest committed
//!   version; commits apply buffered writes last-writer-wins (version
//!   guards still checked).
//! - **Repeatable read**: statements read from the begin-time snapshot;
//!   commit fails with a serialization conflict if any written row was
//!   committed past the snapshot (first-committer-wins).
//! - **Serializable**: repeatable read plus read-set validation — the
//!   commit also fails if any row *read* by the transaction changed
//!   after the snapshot. This is the coarse rw-antidependency check
//!   that stops write skew.
//!
//! Row locks (`FOR UPDATE` / `FOR SHARE`) are held until the transaction
//! finishes; a lock wait that exceeds the configured timeout surfaces as
//! a deadlock-loser transient error, mirroring a database's deadlock
//! detector picking a victim.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use isoprobe_error::{ProbeError, Result};
use isoprobe_types::{
    Account, AccountId, AccountKey, AccountType, Amount, IsolationLevel, SelectionMode,
};
use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use tracing::trace;

use crate::{AccountStore, AccountTx, RowLock};

type TxnId = u64;

/// Tuning knobs for the in-memory store.
#[derive(Debug, Clone, Copy)]
pub struct MemStoreConfig {
    /// Artificial delay injected before each statement read and before
    /// commit. Zero in normal operation; anomaly-reproduction tests use
    /// it to widen race windows the way a slow network round-trip would.
    pub latency: Duration,
    /// How long a row-lock acquisition may wait before it is treated as
    /// a deadlock loser.
    pub lock_wait_timeout: Duration,
}

impl Default for MemStoreConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            lock_wait_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Versioned {
    commit_seq: u64,
    balance: Amount,
    version: u64,
    live: bool,
}

#[derive(Debug, Default)]
struct RowHistory {
    versions: Vec<Versioned>,
}

impl RowHistory {
    fn latest(&self) -> Option<&Versioned> {
        self.versions.last()
    }

    fn latest_live(&self) -> Option<&Versioned> {
        self.latest().filter(|v| v.live)
    }

    fn visible_at(&self, seq: u64) -> Option<&Versioned> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.commit_seq <= seq)
            .filter(|v| v.live)
    }
}

#[derive(Debug, Default)]
struct Shared {
    rows: BTreeMap<AccountKey, RowHistory>,
    commit_seq: u64,
}

#[derive(Debug, Default)]
struct LockEntry {
    exclusive: Option<TxnId>,
    shared: Vec<TxnId>,
}

/// The in-memory ledger.
pub struct MemStore {
    cfg: MemStoreConfig,
    shared: Mutex<Shared>,
    locks: Mutex<HashMap<AccountKey, LockEntry>>,
    lock_cv: Condvar,
    next_txn: AtomicU64,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemStoreConfig::default())
    }

    #[must_use]
    pub fn with_config(cfg: MemStoreConfig) -> Self {
        Self {
            cfg,
            shared: Mutex::new(Shared::default()),
            locks: Mutex::new(HashMap::new()),
            lock_cv: Condvar::new(),
            next_txn: AtomicU64::new(1),
        }
    }

    /// Store with per-statement latency injection (anomaly tests).
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_config(MemStoreConfig {
            latency,
            ..MemStoreConfig::default()
        })
    }

    fn pause(&self) {
        if !self.cfg.latency.is_zero() {
            std::thread::sleep(self.cfg.latency);
        }
    }

    fn acquire(&self, txn: TxnId, key: AccountKey, mode: RowLock) -> Result<()> {
        if matches!(mode, RowLock::None) {
            return Ok(());
        }
        let deadline = Instant::now() + self.cfg.lock_wait_timeout;
        let mut table = self.locks.lock();
        loop {
            let entry = table.entry(key).or_default();
            let free = match mode {
                RowLock::Exclusive => {
                    (entry.exclusive.is_none() || entry.exclusive == Some(txn))
                        && entry.shared.iter().all(|&holder| holder == txn)
                }
                RowLock::Shared => entry.exclusive.is_none() || entry.exclusive == Some(txn),
                RowLock::None => true,
            };
            if free {
                match mode {
                    RowLock::Exclusive => entry.exclusive = Some(txn),
                    RowLock::Shared => {
                        if !entry.shared.contains(&txn) {
                            entry.shared.push(txn);
                        }
                    }
                    RowLock::None => {}
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                trace!(txn, row = %key, "lock wait timed out");
                return Err(ProbeError::deadlock(format!(
                    "lock wait timeout on row {key}"
                )));
            }
            let _ = self.lock_cv.wait_until(&mut table, deadline);
        }
    }

    fn release_all(&self, txn: TxnId, keys: &[AccountKey]) {
        if keys.is_empty() {
            return;
        }
        let mut table = self.locks.lock();
        for key in keys {
            if let Some(entry) = table.get_mut(key) {
                if entry.exclusive == Some(txn) {
                    entry.exclusive = None;
                }
                entry.shared.retain(|&holder| holder != txn);
                if entry.exclusive.is_none() && entry.shared.is_empty() {
                    table.remove(key);
                }
            }
        }
        drop(table);
        self.lock_cv.notify_all();
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for MemStore {
    fn begin<'a>(&'a self, isolation: IsolationLevel) -> Result<Box<dyn AccountTx + 'a>> {
        let snapshot_seq = self.shared.lock().commit_seq;
        Ok(Box::new(MemTx {
            store: self,
            txn: self.next_txn.fetch_add(1, Ordering::Relaxed),
            isolation,
            snapshot_seq,
            writes: Vec::new(),
            read_seqs: HashMap::new(),
            held: Vec::new(),
            finished: false,
        }))
    }

    fn find_sample(&self, limit: usize, mode: SelectionMode) -> Result<Vec<Account>> {
        let shared = self.shared.lock();
        let mut rows: Vec<Account> = shared
            .rows
            .iter()
            .filter_map(|(key, hist)| {
                hist.latest_live().map(|v| Account {
                    key: *key,
                    balance: v.balance,
                    version: v.version,
                })
            })
            .collect();
        drop(shared);
        if matches!(mode, SelectionMode::Random) {
            rows.shuffle(&mut rand::thread_rng());
        }
        rows.truncate(limit);
        Ok(rows)
    }

    fn sum_total_balance(&self) -> Result<Amount> {
        let shared = self.shared.lock();
        Ok(shared
            .rows
            .values()
            .filter_map(RowHistory::latest_live)
            .map(|v| v.balance)
            .sum())
    }

    fn find_negative_balances(&self, visit: &mut dyn FnMut(AccountId, Amount)) -> Result<()> {
        let totals: BTreeMap<AccountId, Amount> = {
            let shared = self.shared.lock();
            let mut totals = BTreeMap::new();
            for (key, hist) in &shared.rows {
                if let Some(v) = hist.latest_live() {
                    *totals.entry(key.id).or_insert(Amount::ZERO) += v.balance;
                }
            }
            totals
        };
        for (id, total) in totals {
            if total.is_negative() {
                visit(id, total);
            }
        }
        Ok(())
    }

    fn create_accounts(
        &self,
        count: usize,
        initial: Amount,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        const BATCH_SIZE: usize = 512;
        let mut id: AccountId = 0;
        while id < count as AccountId {
            let batch_end = (id + BATCH_SIZE as AccountId).min(count as AccountId);
            let mut shared = self.shared.lock();
            let seq = shared.commit_seq;
            for next in id..batch_end {
                for key in [AccountKey::checking(next + 1), AccountKey::credit(next + 1)] {
                    shared.rows.entry(key).or_default().versions.push(Versioned {
                        commit_seq: seq,
                        balance: initial,
                        version: 0,
                        live: true,
                    });
                }
            }
            drop(shared);
            progress((batch_end - id) as usize);
            id = batch_end;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RowView {
    balance: Amount,
    version: u64,
}

#[derive(Debug, Clone, Copy)]
enum WriteOp {
    SetBalance {
        key: AccountKey,
        balance: Amount,
        guard: Option<u64>,
    },
    AddBalance {
        key: AccountKey,
        delta: Amount,
        guard: Option<u64>,
    },
    Insert {
        key: AccountKey,
        balance: Amount,
    },
    Delete {
        key: AccountKey,
    },
}

impl WriteOp {
    const fn key(&self) -> AccountKey {
        match self {
            Self::SetBalance { key, .. }
            | Self::AddBalance { key, .. }
            | Self::Insert { key, .. }
            | Self::Delete { key } => *key,
        }
    }
}

struct MemTx<'a> {
    store: &'a MemStore,
    txn: TxnId,
    isolation: IsolationLevel,
    snapshot_seq: u64,
    writes: Vec<WriteOp>,
    /// Row -> commit_seq observed at first read (0 for absent rows).
    /// Only consulted by serializable commit validation.
    read_seqs: HashMap<AccountKey, u64>,
    held: Vec<AccountKey>,
    finished: bool,
}

impl MemTx<'_> {
    fn base_view(&self, shared: &Shared, key: AccountKey) -> Option<(RowView, u64)> {
        let hist = shared.rows.get(&key)?;
        let versioned = match self.isolation {
            IsolationLevel::ReadCommitted => hist.latest_live(),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                hist.visible_at(self.snapshot_seq)
            }
        }?;
        Some((
            RowView {
                balance: versioned.balance,
                version: versioned.version,
            },
            versioned.commit_seq,
        ))
    }

    /// Apply this transaction's own buffered writes on top of a base view.
    fn overlay(&self, key: AccountKey, base: Option<RowView>) -> Option<RowView> {
        let mut view = base;
        for op in &self.writes {
            if op.key() != key {
                continue;
            }
            match op {
                WriteOp::SetBalance { balance, guard, .. } => {
                    if let Some(v) = view.as_mut() {
                        v.balance = *balance;
                        if guard.is_some() {
                            v.version += 1;
                        }
                    }
                }
                WriteOp::AddBalance { delta, guard, .. } => {
                    if let Some(v) = view.as_mut() {
                        v.balance += *delta;
                        if guard.is_some() {
                            v.version += 1;
                        }
                    }
                }
                WriteOp::Insert { balance, .. } => {
                    view = Some(RowView {
                        balance: *balance,
                        version: 0,
                    });
                }
                WriteOp::Delete { .. } => view = None,
            }
        }
        view
    }

    /// Row view as this transaction sees it right now, recording the
    /// read for serializable validation.
    fn visible(&mut self, key: AccountKey) -> Option<RowView> {
        let base = {
            let shared = self.store.shared.lock();
            self.base_view(&shared, key)
        };
        if matches!(self.isolation, IsolationLevel::Serializable) {
            let seq = base.map_or(0, |(_, seq)| seq);
            self.read_seqs.entry(key).or_insert(seq);
        }
        self.overlay(key, base.map(|(view, _)| view))
    }

    /// All row keys sharing `id` visible to this transaction.
    fn visible_keys_for(&self, id: AccountId) -> Vec<AccountKey> {
        let mut keys: Vec<AccountKey> = {
            let shared = self.store.shared.lock();
            shared
                .rows
                .range(AccountKey::checking(id)..)
                .take_while(|(key, _)| key.id == id)
                .filter(|(_, hist)| match self.isolation {
                    IsolationLevel::ReadCommitted => hist.latest_live().is_some(),
                    _ => hist.visible_at(self.snapshot_seq).is_some(),
                })
                .map(|(key, _)| *key)
                .collect()
        };
        // Rows this transaction inserted or deleted but has not committed.
        for op in &self.writes {
            let key = op.key();
            if key.id == id && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys.retain(|key| self.overlay(*key, self.peek_base(*key)).is_some());
        keys.sort();
        keys
    }

    fn peek_base(&self, key: AccountKey) -> Option<RowView> {
        let shared = self.store.shared.lock();
        self.base_view(&shared, key).map(|(view, _)| view)
    }

    fn lock_row(&mut self, key: AccountKey, lock: RowLock) -> Result<()> {
        if matches!(lock, RowLock::None) {
            return Ok(());
        }
        self.store.acquire(self.txn, key, lock)?;
        if !self.held.contains(&key) {
            self.held.push(key);
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.store.release_all(self.txn, &self.held);
        }
    }
}

impl Drop for MemTx<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl AccountTx for MemTx<'_> {
    fn find_by_id(&mut self, key: AccountKey, lock: RowLock) -> Result<Account> {
        self.store.pause();
        self.lock_row(key, lock)?;
        match self.visible(key) {
            Some(view) => Ok(Account {
                key,
                balance: view.balance,
                version: view.version,
            }),
            None => Err(ProbeError::NotFound {
                id: key.id,
                kind: key.kind.to_string(),
            }),
        }
    }

    fn find_rows_by_id(&mut self, id: AccountId, lock: RowLock) -> Result<Vec<Account>> {
        self.store.pause();
        let keys = self.visible_keys_for(id);
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            self.lock_row(key, lock)?;
            if let Some(view) = self.visible(key) {
                rows.push(Account {
                    key,
                    balance: view.balance,
                    version: view.version,
                });
            }
        }
        Ok(rows)
    }

    fn update_balance(&mut self, account: &Account) -> Result<()> {
        if self.visible(account.key).is_none() {
            return Err(ProbeError::RowCountMismatch {
                expected: 1,
                actual: 0,
                detail: format!("update balance of {}", account.key),
            });
        }
        self.writes.push(WriteOp::SetBalance {
            key: account.key,
            balance: account.balance,
            guard: None,
        });
        Ok(())
    }

    fn update_balance_cas(&mut self, account: &Account) -> Result<()> {
        match self.visible(account.key) {
            None => Err(ProbeError::RowCountMismatch {
                expected: 1,
                actual: 0,
                detail: format!("CAS update of {}", account.key),
            }),
            Some(view) if view.version != account.version => Err(ProbeError::stale_version(
                format!(
                    "row {}: stored version {} != expected {}",
                    account.key, view.version, account.version
                ),
            )),
            Some(_) => {
                self.writes.push(WriteOp::SetBalance {
                    key: account.key,
                    balance: account.balance,
                    guard: Some(account.version),
                });
                Ok(())
            }
        }
    }

    fn add_balance(&mut self, id: AccountId, kind: AccountType, delta: Amount) -> Result<()> {
        let key = AccountKey::new(id, kind);
        if self.visible(key).is_none() {
            return Err(ProbeError::RowCountMismatch {
                expected: 1,
                actual: 0,
                detail: format!("add balance to {key}"),
            });
        }
        self.writes.push(WriteOp::AddBalance {
            key,
            delta,
            guard: None,
        });
        Ok(())
    }

    fn add_balance_cas(
        &mut self,
        id: AccountId,
        kind: AccountType,
        delta: Amount,
        expected_version: u64,
    ) -> Result<()> {
        let key = AccountKey::new(id, kind);
        match self.visible(key) {
            None => Err(ProbeError::RowCountMismatch {
                expected: 1,
                actual: 0,
                detail: format!("CAS add to {key}"),
            }),
            Some(view) if view.version != expected_version => {
                Err(ProbeError::stale_version(format!(
                    "row {key}: stored version {} != expected {expected_version}",
                    view.version
                )))
            }
            Some(_) => {
                self.writes.push(WriteOp::AddBalance {
                    key,
                    delta,
                    guard: Some(expected_version),
                });
                Ok(())
            }
        }
    }

    fn total_account_balance(&mut self, id: AccountId) -> Result<Amount> {
        self.store.pause();
        let keys = self.visible_keys_for(id);
        let mut total = Amount::ZERO;
        for key in keys {
            if let Some(view) = self.visible(key) {
                total += view.balance;
            }
        }
        Ok(total)
    }

    fn create_account(&mut self, account: &Account) -> Result<()> {
        if self.visible(account.key).is_some() {
            return Err(ProbeError::integrity(format!(
                "duplicate key {}",
                account.key
            )));
        }
        self.writes.push(WriteOp::Insert {
            key: account.key,
            balance: account.balance,
        });
        Ok(())
    }

    fn delete_account(&mut self, key: AccountKey) -> Result<()> {
        self.writes.push(WriteOp::Delete { key });
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.store.pause();
        let mut shared = self.store.shared.lock();

        // First-committer-wins for snapshot-based levels.
        if !matches!(self.isolation, IsolationLevel::ReadCommitted) {
            for op in &self.writes {
                let key = op.key();
                if let Some(latest) = shared.rows.get(&key).and_then(RowHistory::latest) {
                    if latest.commit_seq > self.snapshot_seq {
                        return Err(ProbeError::serialization(format!(
                            "row {key} was modified after snapshot"
                        )));
                    }
                }
            }
        }
        // Serializable also validates the read set (coarse
        // rw-antidependency detection).
        if matches!(self.isolation, IsolationLevel::Serializable) {
            for key in self.read_seqs.keys() {
                if let Some(latest) = shared.rows.get(key).and_then(RowHistory::latest) {
                    if latest.commit_seq > self.snapshot_seq {
                        return Err(ProbeError::serialization(format!(
                            "read of row {key} invalidated by a later commit"
                        )));
                    }
                }
            }
        }

        #[derive(Clone, Copy)]
        enum Pending {
            Live(Amount, u64),
            Dead,
        }

        let mut working: BTreeMap<AccountKey, Pending> = BTreeMap::new();
        let current = |working: &BTreeMap<AccountKey, Pending>,
                       shared: &Shared,
                       key: AccountKey|
         -> Option<(Amount, u64)> {
            match working.get(&key) {
                Some(Pending::Live(balance, version)) => Some((*balance, *version)),
                Some(Pending::Dead) => None,
                None => shared
                    .rows
                    .get(&key)
                    .and_then(RowHistory::latest_live)
                    .map(|v| (v.balance, v.version)),
            }
        };

        for op in &self.writes {
            match *op {
                WriteOp::SetBalance {
                    key,
                    balance,
                    guard,
                } => {
                    let Some((_, version)) = current(&working, &shared, key) else {
                        return Err(ProbeError::RowCountMismatch {
                            expected: 1,
                            actual: 0,
                            detail: format!("commit-time update of {key}"),
                        });
                    };
                    if let Some(expected) = guard {
                        if version != expected {
                            return Err(ProbeError::stale_version(format!(
                                "row {key}: version {version} != expected {expected} at commit"
                            )));
                        }
                    }
                    let bumped = if guard.is_some() { version + 1 } else { version };
                    working.insert(key, Pending::Live(balance, bumped));
                }
                WriteOp::AddBalance { key, delta, guard } => {
                    let Some((balance, version)) = current(&working, &shared, key) else {
                        return Err(ProbeError::RowCountMismatch {
                            expected: 1,
                            actual: 0,
                            detail: format!("commit-time add to {key}"),
                        });
                    };
                    if let Some(expected) = guard {
                        if version != expected {
                            return Err(ProbeError::stale_version(format!(
                                "row {key}: version {version} != expected {expected} at commit"
                            )));
                        }
                    }
                    let bumped = if guard.is_some() { version + 1 } else { version };
                    working.insert(key, Pending::Live(balance + delta, bumped));
                }
                WriteOp::Insert { key, balance } => {
                    if current(&working, &shared, key).is_some() {
                        return Err(ProbeError::integrity(format!(
                            "duplicate key {key} at commit"
                        )));
                    }
                    working.insert(key, Pending::Live(balance, 0));
                }
                WriteOp::Delete { key } => {
                    if current(&working, &shared, key).is_some() {
                        working.insert(key, Pending::Dead);
                    }
                }
            }
        }

        if !working.is_empty() {
            shared.commit_seq += 1;
            let seq = shared.commit_seq;
            for (key, pending) in working {
                let versioned = match pending {
                    Pending::Live(balance, version) => Versioned {
                        commit_seq: seq,
                        balance,
                        version,
                        live: true,
                    },
                    Pending::Dead => Versioned {
                        commit_seq: seq,
                        balance: Amount::ZERO,
                        version: 0,
                        live: false,
                    },
                };
                shared.rows.entry(key).or_default().versions.push(versioned);
            }
        }
        drop(shared);
        self.finish();
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        // Drop releases locks and discards buffered writes.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(count: usize) -> MemStore {
        let store = MemStore::new();
        store
            .create_accounts(count, Amount::from_dollars(500), &mut |_| {})
            .expect("seed");
        store
    }

    #[test]
    fn seeding_creates_two_legs_per_tuple() {
        let store = seeded(10);
        assert_eq!(
            store.sum_total_balance().unwrap(),
            Amount::from_dollars(10_000)
        );
        let rows = store
            .find_sample(100, SelectionMode::Sequential)
            .expect("sample");
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0].key, AccountKey::checking(1));
        assert_eq!(rows[1].key, AccountKey::credit(1));
    }

    #[test]
    fn read_committed_sees_latest_commit_mid_transaction() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut reader = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let before = reader.find_by_id(key, RowLock::None).unwrap();

        let mut writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let row = writer.find_by_id(key, RowLock::None).unwrap();
        writer
            .update_balance(&row.add_balance(Amount::from_dollars(1)))
            .unwrap();
        writer.commit().unwrap();

        let after = reader.find_by_id(key, RowLock::None).unwrap();
        assert_ne!(before.balance, after.balance, "non-repeatable read expected");
        reader.rollback();
    }

    #[test]
    fn snapshot_isolation_repeats_reads() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut reader = store.begin(IsolationLevel::RepeatableRead).unwrap();
        let before = reader.find_by_id(key, RowLock::None).unwrap();

        let mut writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let row = writer.find_by_id(key, RowLock::None).unwrap();
        writer
            .update_balance(&row.add_balance(Amount::from_dollars(1)))
            .unwrap();
        writer.commit().unwrap();

        let after = reader.find_by_id(key, RowLock::None).unwrap();
        assert_eq!(before.balance, after.balance, "snapshot read must repeat");
        reader.rollback();
    }

    #[test]
    fn lost_update_occurs_under_read_committed_plain_writes() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut t1 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let mut t2 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let r1 = t1.find_by_id(key, RowLock::None).unwrap();
        let r2 = t2.find_by_id(key, RowLock::None).unwrap();
        t1.update_balance(&r1.add_balance(Amount::from_dollars(5)))
            .unwrap();
        t2.update_balance(&r2.add_balance(Amount::from_dollars(5)))
            .unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();

        // Both added $5 but one write clobbered the other.
        assert_eq!(
            store.sum_total_balance().unwrap(),
            Amount::from_dollars(1_005)
        );
    }

    #[test]
    fn cas_turns_lost_update_into_transient_conflict() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut t1 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let mut t2 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let r1 = t1.find_by_id(key, RowLock::None).unwrap();
        let r2 = t2.find_by_id(key, RowLock::None).unwrap();
        t1.update_balance_cas(&r1.add_balance(Amount::from_dollars(5)))
            .unwrap();
        t2.update_balance_cas(&r2.add_balance(Amount::from_dollars(5)))
            .unwrap();
        t1.commit().unwrap();
        let err = t2.commit().expect_err("stale version must conflict");
        assert!(err.is_transient());
    }

    #[test]
    fn first_committer_wins_under_repeatable_read() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut t1 = store.begin(IsolationLevel::RepeatableRead).unwrap();
        let mut t2 = store.begin(IsolationLevel::RepeatableRead).unwrap();
        let r1 = t1.find_by_id(key, RowLock::None).unwrap();
        let r2 = t2.find_by_id(key, RowLock::None).unwrap();
        t1.update_balance(&r1.add_balance(Amount::from_dollars(5)))
            .unwrap();
        t2.update_balance(&r2.add_balance(Amount::from_dollars(5)))
            .unwrap();
        t1.commit().unwrap();
        let err = t2.commit().expect_err("second committer must lose");
        assert!(matches!(err, ProbeError::SerializationConflict { .. }));
    }

    #[test]
    fn write_skew_allowed_under_repeatable_read_blocked_under_serializable() {
        // Both transactions read both legs, then debit different legs.
        for (isolation, expect_conflict) in [
            (IsolationLevel::RepeatableRead, false),
            (IsolationLevel::Serializable, true),
        ] {
            let store = seeded(1);
            let debit = Amount::from_dollars(600);

            let mut t1 = store.begin(isolation).unwrap();
            let mut t2 = store.begin(isolation).unwrap();
            assert_eq!(
                t1.total_account_balance(1).unwrap(),
                Amount::from_dollars(1_000)
            );
            assert_eq!(
                t2.total_account_balance(1).unwrap(),
                Amount::from_dollars(1_000)
            );
            t1.add_balance(1, AccountType::Checking, -debit).unwrap();
            t2.add_balance(1, AccountType::Credit, -debit).unwrap();
            t1.commit().unwrap();
            let second = t2.commit();

            if expect_conflict {
                let err = second.expect_err("serializable must detect the skew");
                assert!(err.is_transient());
                assert_eq!(
                    store.sum_total_balance().unwrap(),
                    Amount::from_dollars(400)
                );
            } else {
                second.expect("snapshot isolation admits write skew");
                assert_eq!(
                    store.sum_total_balance().unwrap(),
                    -Amount::from_dollars(200)
                );
            }
        }
    }

    #[test]
    fn exclusive_row_lock_blocks_second_locker() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut t1 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        t1.find_by_id(key, RowLock::Exclusive).unwrap();

        let mut t2 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = t2
            .find_by_id(key, RowLock::Exclusive)
            .expect_err("lock is held");
        assert!(matches!(err, ProbeError::DeadlockLoser { .. }));
        drop(t2);

        // Lock released on drop; a new transaction can take it.
        drop(t1);
        let mut t3 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        t3.find_by_id(key, RowLock::Exclusive).unwrap();
    }

    #[test]
    fn shared_locks_coexist_but_exclude_writers() {
        let store = seeded(1);
        let key = AccountKey::checking(1);

        let mut t1 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let mut t2 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        t1.find_by_id(key, RowLock::Shared).unwrap();
        t2.find_by_id(key, RowLock::Shared).unwrap();

        let mut t3 = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = t3
            .find_by_id(key, RowLock::Exclusive)
            .expect_err("shared holders exclude exclusive");
        assert!(err.is_transient());
    }

    #[test]
    fn insert_and_delete_change_row_counts() {
        let store = seeded(1);
        let synthetic = AccountKey::new(1, AccountType::Synthetic(7));

        let mut tx = store.begin(IsolationLevel::ReadCommitted).unwrap();
        tx.create_account(&Account::new(synthetic, Amount::from_dollars(10)))
            .unwrap();
        // Uncommitted insert visible to own reads.
        assert_eq!(tx.find_rows_by_id(1, RowLock::None).unwrap().len(), 3);
        tx.commit().unwrap();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(tx.find_rows_by_id(1, RowLock::None).unwrap().len(), 3);
        tx.delete_account(synthetic).unwrap();
        tx.delete_account(AccountKey::new(1, AccountType::Synthetic(999)))
            .unwrap(); // absent: zero rows affected, not an error
        tx.commit().unwrap();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(tx.find_rows_by_id(1, RowLock::None).unwrap().len(), 2);
        tx.rollback();
    }

    #[test]
    fn snapshot_hides_concurrent_insert() {
        let store = seeded(1);

        let mut reader = store.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(reader.find_rows_by_id(1, RowLock::None).unwrap().len(), 2);

        let mut writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
        writer
            .create_account(&Account::new(
                AccountKey::new(1, AccountType::Synthetic(1)),
                Amount::from_dollars(10),
            ))
            .unwrap();
        writer.commit().unwrap();

        // Snapshot reader still sees two rows; a fresh RC reader sees three.
        assert_eq!(reader.find_rows_by_id(1, RowLock::None).unwrap().len(), 2);
        reader.rollback();
        let mut rc = store.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(rc.find_rows_by_id(1, RowLock::None).unwrap().len(), 3);
        rc.rollback();
    }

    #[test]
    fn rollback_discards_writes() {
        let store = seeded(1);
        let key = AccountKey::checking(1);
        let mut tx = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let row = tx.find_by_id(key, RowLock::None).unwrap();
        tx.update_balance(&row.add_balance(Amount::from_dollars(100)))
            .unwrap();
        tx.rollback();
        assert_eq!(
            store.sum_total_balance().unwrap(),
            Amount::from_dollars(1_000)
        );
    }

    #[test]
    fn negative_balance_scan() {
        let store = seeded(2);
        let mut tx = store.begin(IsolationLevel::ReadCommitted).unwrap();
        tx.add_balance(1, AccountType::Checking, -Amount::from_dollars(1_200))
            .unwrap();
        tx.commit().unwrap();

        let mut seen = Vec::new();
        store
            .find_negative_balances(&mut |id, total| seen.push((id, total)))
            .unwrap();
        assert_eq!(seen, vec![(1, -Amount::from_dollars(200))]);
    }

    #[test]
    fn update_of_missing_row_is_row_count_mismatch() {
        let store = seeded(1);
        let ghost = Account::new(AccountKey::checking(99), Amount::ZERO);
        let mut tx = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = tx.update_balance(&ghost).expect_err("no such row");
        assert!(matches!(err, ProbeError::RowCountMismatch { .. }));
        assert!(!err.is_transient());
        tx.rollback();
    }
}
