//! The account ledger row model.
//!
//! An account *tuple* is the pair of rows sharing one numeric id: a
//! checking leg and a credit leg. Transfer workloads must keep the
//! combined tuple balance constant; that invariant is what the read-skew
//! and write-skew protocols probe.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Amount;

/// Numeric account identifier shared by all legs of one tuple.
pub type AccountId = i64;

/// Discriminator for the rows sharing an account id.
///
/// `Synthetic` rows are extra legs inserted by the phantom-read protocol
/// under a fresh random tag; they never exist after seeding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AccountType {
    Checking,
    Credit,
    Synthetic(u64),
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checking => f.write_str("checking"),
            Self::Credit => f.write_str("credit"),
            Self::Synthetic(tag) => write!(f, "synthetic-{tag}"),
        }
    }
}

/// Composite row key: (id, type).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AccountKey {
    pub id: AccountId,
    pub kind: AccountType,
}

impl AccountKey {
    #[must_use]
    pub const fn new(id: AccountId, kind: AccountType) -> Self {
        Self { id, kind }
    }

    /// Key of the checking leg for `id`.
    #[must_use]
    pub const fn checking(id: AccountId) -> Self {
        Self::new(id, AccountType::Checking)
    }

    /// Key of the credit leg for `id`.
    #[must_use]
    pub const fn credit(id: AccountId) -> Self {
        Self::new(id, AccountType::Credit)
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.kind)
    }
}

/// One ledger row.
///
/// `version` is the optimistic-concurrency counter: every CAS update is
/// guarded on it and bumps it by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub key: AccountKey,
    pub balance: Amount,
    pub version: u64,
}

impl Account {
    #[must_use]
    pub const fn new(key: AccountKey, balance: Amount) -> Self {
        Self {
            key,
            balance,
            version: 0,
        }
    }

    /// Copy of this row with `delta` applied to the balance.
    #[must_use]
    pub fn add_balance(mut self, delta: Amount) -> Self {
        self.balance += delta;
        self
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Account{{{} balance={} version={}}}",
            self.key, self.balance, self.version
        )
    }
}
