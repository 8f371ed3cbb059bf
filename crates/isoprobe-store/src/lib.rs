//! Typed data-access surface over the account ledger.
//!
//! The workload protocols only ever talk to [`AccountStore`] and
//! [`AccountTx`]; the bundled [`MemStore`] implements honest
//! per-isolation-level semantics (statement-level reads under read
//! committed, snapshot reads plus first-committer-wins under repeatable
//! read, read-set validation under serializable) so anomaly runs are
//! hermetic and repeatable.

use isoprobe_error::Result;
use isoprobe_types::{
    Account, AccountId, AccountKey, AccountType, Amount, IsolationLevel, LockType, SelectionMode,
};

mod mem;

pub use mem::{MemStore, MemStoreConfig};

/// Row-level lock requested alongside a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    None,
    /// `FOR SHARE`: concurrent shared holders allowed, excludes writers.
    Shared,
    /// `FOR UPDATE`: single holder until commit or rollback.
    Exclusive,
}

impl From<LockType> for RowLock {
    fn from(lock: LockType) -> Self {
        match lock {
            LockType::ForUpdate => Self::Exclusive,
            LockType::ForShare => Self::Shared,
            // CAS is a statement-level version guard, not a row lock.
            LockType::None | LockType::CompareAndSet => Self::None,
        }
    }
}

/// One open transaction against the ledger.
///
/// All statements observe the transaction's isolation level; writes are
/// not visible to other transactions until `commit`. Dropping a
/// transaction without committing releases its row locks and discards
/// its writes.
pub trait AccountTx {
    /// Read one row by key, optionally taking a row lock.
    fn find_by_id(&mut self, key: AccountKey, lock: RowLock) -> Result<Account>;

    /// Read every row sharing `id` (predicate read used by the
    /// phantom-read protocol).
    fn find_rows_by_id(&mut self, id: AccountId, lock: RowLock) -> Result<Vec<Account>>;

    /// Absolute balance write; fails with `RowCountMismatch` unless
    /// exactly one row is affected.
    fn update_balance(&mut self, account: &Account) -> Result<()>;

    /// Version-guarded absolute balance write; fails with
    /// `OptimisticLockConflict` if the stored version differs.
    fn update_balance_cas(&mut self, account: &Account) -> Result<()>;

    /// Relative balance update (`balance = balance + delta`).
    fn add_balance(&mut self, id: AccountId, kind: AccountType, delta: Amount) -> Result<()>;

    /// Version-guarded relative balance update.
    fn add_balance_cas(
        &mut self,
        id: AccountId,
        kind: AccountType,
        delta: Amount,
        expected_version: u64,
    ) -> Result<()>;

    /// Aggregate balance across all legs of `id` (a SUM query).
    fn total_account_balance(&mut self, id: AccountId) -> Result<Amount>;

    /// Insert a new row; duplicate keys are an integrity violation.
    fn create_account(&mut self, account: &Account) -> Result<()>;

    /// Delete a row; deleting an absent row affects zero rows and is
    /// not an error.
    fn delete_account(&mut self, key: AccountKey) -> Result<()>;

    /// Commit buffered writes. Conflicts surface here as transient
    /// errors; the transaction is finished either way.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard buffered writes and release row locks.
    fn rollback(self: Box<Self>);
}

/// The ledger itself, shared across worker threads.
pub trait AccountStore: Send + Sync {
    /// Open a transaction at the given isolation level.
    fn begin<'a>(&'a self, isolation: IsolationLevel) -> Result<Box<dyn AccountTx + 'a>>;

    /// Fixed sample of rows used as a protocol's working set.
    fn find_sample(&self, limit: usize, mode: SelectionMode) -> Result<Vec<Account>>;

    /// Global committed balance sum.
    fn sum_total_balance(&self) -> Result<Amount>;

    /// Visit every account id whose aggregate committed balance is
    /// negative.
    fn find_negative_balances(&self, visit: &mut dyn FnMut(AccountId, Amount)) -> Result<()>;

    /// Bulk-seed `count` tuples (two legs each at `initial`). The
    /// progress callback receives the number of accounts added per batch.
    fn create_accounts(
        &self,
        count: usize,
        initial: Amount,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()>;
}
