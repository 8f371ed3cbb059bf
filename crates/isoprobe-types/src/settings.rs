//! Run configuration.
//!
//! A `Settings` value is built once (CLI or test), validated, and then
//! passed by shared reference into every component. Nothing mutates it
//! after the run starts.

use std::fmt;
use std::str::FromStr;

use isoprobe_error::{ProbeError, Result};
use serde::{Deserialize, Serialize};

use crate::Amount;

/// Repeated-read loop count used by the P2/P3 read iterations.
///
/// Inherited heuristic; kept as a named constant rather than tuned.
pub const REPEATED_READS: usize = 10;

/// Default fraction of read iterations in the P2/P3 protocols.
pub const DEFAULT_READ_WRITE_RATIO: f64 = 0.9;

/// Expected combined balance of one account tuple after seeding
/// (two legs at the initial balance each).
pub const TUPLE_SUM: Amount = Amount::from_dollars(1_000);

/// Initial balance of every seeded leg.
pub const INITIAL_BALANCE: Amount = Amount::from_dollars(500);

/// Transaction isolation level requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Short alias used in reports (`RC`, `RR`, `1SR`).
    #[must_use]
    pub const fn alias(self) -> &'static str {
        match self {
            Self::ReadCommitted => "RC",
            Self::RepeatableRead => "RR",
            Self::Serializable => "1SR",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadCommitted => f.write_str("read_committed"),
            Self::RepeatableRead => f.write_str("repeatable_read"),
            Self::Serializable => f.write_str("serializable"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read_committed" | "rc" => Ok(Self::ReadCommitted),
            "repeatable_read" | "rr" => Ok(Self::RepeatableRead),
            "serializable" | "1sr" => Ok(Self::Serializable),
            other => Err(ProbeError::settings(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

/// Client-side concurrency-control strategy layered on top of isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    None,
    ForUpdate,
    ForShare,
    CompareAndSet,
}

impl LockType {
    /// Short alias used in reports (`NA`, `FU`, `FS`, `CAS`).
    #[must_use]
    pub const fn alias(self) -> &'static str {
        match self {
            Self::None => "NA",
            Self::ForUpdate => "FU",
            Self::ForShare => "FS",
            Self::CompareAndSet => "CAS",
        }
    }

    /// Whether updates go through version-guarded CAS statements.
    #[must_use]
    pub const fn is_optimistic(self) -> bool {
        matches!(self, Self::CompareAndSet)
    }
}

impl FromStr for LockType {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "na" => Ok(Self::None),
            "for_update" | "fu" | "sfu" => Ok(Self::ForUpdate),
            "for_share" | "fs" => Ok(Self::ForShare),
            "compare_and_set" | "cas" => Ok(Self::CompareAndSet),
            other => Err(ProbeError::settings(format!("unknown lock type '{other}'"))),
        }
    }
}

/// How the fixed account sample is picked at protocol setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    Random,
    Sequential,
}

/// The five workload protocols, tagged with their standard anomaly codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    NonRepeatableRead,
    PhantomRead,
    LostUpdate,
    ReadSkew,
    WriteSkew,
}

impl WorkloadKind {
    pub const ALL: &'static [Self] = &[
        Self::NonRepeatableRead,
        Self::PhantomRead,
        Self::LostUpdate,
        Self::ReadSkew,
        Self::WriteSkew,
    ];

    /// Standard SQL anomaly code (P2, P3, P4, A5A, A5B).
    #[must_use]
    pub const fn alias(self) -> &'static str {
        match self {
            Self::NonRepeatableRead => "P2",
            Self::PhantomRead => "P3",
            Self::LostUpdate => "P4",
            Self::ReadSkew => "A5A",
            Self::WriteSkew => "A5B",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NonRepeatableRead => "non_repeatable_read",
            Self::PhantomRead => "phantom_read",
            Self::LostUpdate => "lost_update",
            Self::ReadSkew => "read_skew",
            Self::WriteSkew => "write_skew",
        }
    }

    /// One-line description for usage output.
    #[must_use]
    pub const fn note(self) -> &'static str {
        match self {
            Self::NonRepeatableRead => "P2 non-repeatable (fuzzy) read anomaly",
            Self::PhantomRead => "P3 phantom read anomaly",
            Self::LostUpdate => "P4 lost update anomaly",
            Self::ReadSkew => "A5A read skew anomaly",
            Self::WriteSkew => "A5B write skew anomaly",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkloadKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| {
                kind.name() == needle || kind.alias().eq_ignore_ascii_case(&needle)
            })
            .ok_or_else(|| ProbeError::settings(format!("unknown workload '{s}'")))
    }
}

/// Immutable run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub workload: WorkloadKind,
    pub isolation: IsolationLevel,
    pub lock: LockType,
    /// Distinct accounts touched per lost-update iteration. Even, >= 2.
    pub contention_level: usize,
    /// Total tuples seeded (each tuple is two rows).
    pub accounts: usize,
    /// Size of the fixed sample protocols operate on.
    pub selection: usize,
    pub selection_mode: SelectionMode,
    pub iterations: usize,
    /// Worker pool size; 0 means 2x the host's logical CPUs.
    pub workers: usize,
    pub retry_jitter: bool,
    pub skip_retry: bool,
    pub max_retries: u32,
    /// Base backoff unit: attempt `n` sleeps
    /// `min(cap, 2^n * base + 100ms [+ jitter])`.
    pub backoff_base_ms: u64,
    /// Upper bound on any single backoff sleep.
    pub backoff_cap_ms: u64,
    /// Fraction of read iterations in the P2/P3 protocols, in (0, 1].
    pub read_write_ratio: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workload: WorkloadKind::LostUpdate,
            isolation: IsolationLevel::Serializable,
            lock: LockType::None,
            contention_level: 8,
            accounts: 50_000,
            selection: 500,
            selection_mode: SelectionMode::Random,
            iterations: 1_000,
            workers: 0,
            retry_jitter: false,
            skip_retry: false,
            max_retries: 15,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 15_000,
            read_write_ratio: DEFAULT_READ_WRITE_RATIO,
        }
    }
}

impl Settings {
    /// Pre-flight validation. Fails deterministically on nonsense
    /// combinations before any worker starts.
    pub fn validate(&self) -> Result<()> {
        if self.contention_level < 2 || self.contention_level % 2 != 0 {
            return Err(ProbeError::settings(format!(
                "contention level must be an even number >= 2, got {}",
                self.contention_level
            )));
        }
        if self.selection <= self.contention_level {
            return Err(ProbeError::settings(format!(
                "selection ({}) must exceed contention level ({})",
                self.selection, self.contention_level
            )));
        }
        if self.accounts == 0 {
            return Err(ProbeError::settings("account count must be > 0"));
        }
        if self.iterations == 0 {
            return Err(ProbeError::settings("iteration count must be > 0"));
        }
        if !(self.read_write_ratio > 0.0 && self.read_write_ratio <= 1.0) {
            return Err(ProbeError::settings(format!(
                "read/write ratio must be in (0, 1], got {}",
                self.read_write_ratio
            )));
        }
        if self.max_retries == 0 || self.max_retries > 30 {
            return Err(ProbeError::settings(format!(
                "max retries must be in 1..=30, got {}",
                self.max_retries
            )));
        }
        if self.backoff_base_ms == 0 {
            return Err(ProbeError::settings("backoff base must be > 0 ms"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ProbeError::settings(format!(
                "backoff cap ({} ms) must be >= backoff base ({} ms)",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }

    /// Clamp the selection to the seeded account count. Returns true if
    /// the selection was reduced (callers log a warning).
    pub fn clamp_selection(&mut self) -> bool {
        if self.selection > self.accounts {
            self.selection = self.accounts;
            true
        } else {
            false
        }
    }

    /// Resolved worker pool size (0 means 2x logical CPUs).
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2);
        cpus * 2
    }
}
