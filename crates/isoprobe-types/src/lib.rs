//! Shared domain types for the isoprobe anomaly prober.
//!
//! Everything here is plain data: money, ledger rows, and the immutable
//! run configuration. No I/O, no concurrency.

mod account;
mod amount;
mod settings;

pub use account::{Account, AccountId, AccountKey, AccountType};
pub use amount::Amount;
pub use settings::{
    IsolationLevel, LockType, SelectionMode, Settings, WorkloadKind, DEFAULT_READ_WRITE_RATIO,
    INITIAL_BALANCE, REPEATED_READS, TUPLE_SUM,
};
