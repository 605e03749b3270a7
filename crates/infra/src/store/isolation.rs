//! Transaction isolation levels and their translation to concrete backends.
//!
//! The level names mix ANSI levels with one engine-specific level (`Snapshot`), so
//! every backend documents exactly what it does with each of them:
//!
//! | Level | Postgres statement | Postgres effective behaviour | In-memory emulation |
//! |---|---|---|---|
//! | `ReadUncommitted` | `READ UNCOMMITTED` | same as READ COMMITTED, Postgres never exposes dirty reads | newest in-flight write of any transaction, else latest committed; writes are checked against the latest committed stamp |
//! | `ReadCommitted` | `READ COMMITTED` | per-statement snapshot | latest committed row |
//! | `RepeatableRead` | `REPEATABLE READ` | transaction snapshot, `40001` on concurrent update | first read cached; commit fails if a written row moved since it was read |
//! | `Serializable` | `SERIALIZABLE` | SSI, `40001` at statement or commit | transaction snapshot; commit fails if anything it read or wrote changed after the snapshot |
//! | `Snapshot` | `REPEATABLE READ` | Postgres REPEATABLE READ is snapshot isolation | transaction snapshot; write-write conflict on rows changed after the snapshot |

use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Isolation level requested for a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

/// What a level promises about reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IsolationGuarantees {
    /// Never observes writes of transactions that have not committed.
    pub read_committed: bool,
    /// Reading the same row twice returns the same state.
    pub repeatable_read: bool,
}

/// How one level is expressed on a concrete backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BackendMapping {
    pub level: IsolationLevel,
    /// Level name used in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub statement: &'static str,
    pub effective: &'static str,
}

pub const POSTGRES_TRANSLATION: [BackendMapping; 5] = [
    BackendMapping {
        level: IsolationLevel::ReadUncommitted,
        statement: "READ UNCOMMITTED",
        effective: "read committed (dirty reads are never exposed)",
    },
    BackendMapping {
        level: IsolationLevel::ReadCommitted,
        statement: "READ COMMITTED",
        effective: "read committed",
    },
    BackendMapping {
        level: IsolationLevel::RepeatableRead,
        statement: "REPEATABLE READ",
        effective: "snapshot isolation",
    },
    BackendMapping {
        level: IsolationLevel::Serializable,
        statement: "SERIALIZABLE",
        effective: "serializable snapshot isolation",
    },
    BackendMapping {
        level: IsolationLevel::Snapshot,
        statement: "REPEATABLE READ",
        effective: "snapshot isolation",
    },
];

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 5] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
        IsolationLevel::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
            IsolationLevel::Snapshot => "snapshot",
        }
    }

    pub fn guarantees(self) -> IsolationGuarantees {
        match self {
            IsolationLevel::ReadUncommitted => IsolationGuarantees {
                read_committed: false,
                repeatable_read: false,
            },
            IsolationLevel::ReadCommitted => IsolationGuarantees {
                read_committed: true,
                repeatable_read: false,
            },
            IsolationLevel::RepeatableRead
            | IsolationLevel::Serializable
            | IsolationLevel::Snapshot => IsolationGuarantees {
                read_committed: true,
                repeatable_read: true,
            },
        }
    }

    /// Whether reads come from a snapshot fixed when the transaction began.
    pub fn uses_transaction_snapshot(self) -> bool {
        matches!(self, IsolationLevel::Serializable | IsolationLevel::Snapshot)
    }

    pub fn postgres(self) -> BackendMapping {
        // POSTGRES_TRANSLATION is declared in `ALL` order.
        POSTGRES_TRANSLATION[self as usize]
    }
}

impl core::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known isolation level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown isolation level '{0}'")]
pub struct ParseIsolationLevelError(pub String);

impl FromStr for IsolationLevel {
    type Err = ParseIsolationLevelError;

    /// Accepts `read_committed`, `read-committed`, `ReadCommitted`, `READ COMMITTED`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "readuncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "readcommitted" => Ok(IsolationLevel::ReadCommitted),
            "repeatableread" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            "snapshot" => Ok(IsolationLevel::Snapshot),
            _ => Err(ParseIsolationLevelError(s.to_string())),
        }
    }
}
