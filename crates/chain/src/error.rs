use chainset_storage::error::StorageError;
use serde::Serialize;
use thiserror::Error;

use crate::descriptor::LoadOutcome;
use crate::offset_index::CountOverflow;

/// Failure to resolve a global entry number.
///
/// Every variant has a stable negative [code](ResolveError::code) so that
/// callers scanning large datasets can decide whether to retry, skip a
/// partition, or abort.
#[derive(Clone, Error, Debug, PartialEq, Eq, Serialize)]
pub enum ResolveError {
    /// The chain has no partitions.
    #[error("The chain has no partitions.")]
    EmptyChain,

    /// The entry is past the end of the chain.
    #[error("Entry {entry} is out of range ({total} entries known).")]
    OutOfRange { entry: u64, total: u64 },

    /// The partition could not be opened.
    #[error("Cannot open partition {partition} at {location:?}: {reason}")]
    OpenFailed {
        partition: usize,
        location: String,
        reason: StorageError,
    },

    /// The partition opened but does not contain the chain's table.
    #[error("Partition {partition} at {location:?} has no table {table:?}.")]
    TableMissing {
        partition: usize,
        location: String,
        table: String,
    },

    /// The offset bookkeeping is inconsistent.  Never expected in correct
    /// usage.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A friend could not be aligned, or the switch callback refused the
    /// new partition.
    #[error("Notification failed: {0}")]
    NotifyFailed(String),
}

impl ResolveError {
    pub const EMPTY_CHAIN: i32 = -1;
    pub const OUT_OF_RANGE: i32 = -2;
    pub const OPEN_FAILED: i32 = -3;
    pub const TABLE_MISSING: i32 = -4;
    pub const INTERNAL: i32 = -5;
    pub const NOTIFY_FAILED: i32 = -6;

    pub fn code(&self) -> i32 {
        match self {
            ResolveError::EmptyChain => Self::EMPTY_CHAIN,
            ResolveError::OutOfRange { .. } => Self::OUT_OF_RANGE,
            ResolveError::OpenFailed { .. } => Self::OPEN_FAILED,
            ResolveError::TableMissing { .. } => Self::TABLE_MISSING,
            ResolveError::Internal(_) => Self::INTERNAL,
            ResolveError::NotifyFailed(_) => Self::NOTIFY_FAILED,
        }
    }

    /// Outcome to record on the partition the error was raised for, if any.
    pub fn load_outcome(&self) -> Option<LoadOutcome> {
        match self {
            ResolveError::OpenFailed { .. } => Some(LoadOutcome::OpenFailed),
            ResolveError::TableMissing { .. } => Some(LoadOutcome::TableMissing),
            ResolveError::Internal(_) => Some(LoadOutcome::Other),
            ResolveError::EmptyChain
            | ResolveError::OutOfRange { .. }
            | ResolveError::NotifyFailed(_) => None,
        }
    }
}

/// An error returned by the chain's configuration operations.
///
/// Operations that fail with a `ChainError` leave the chain unchanged.
#[derive(Clone, Error, Debug, PartialEq, Eq, Serialize)]
pub enum ChainError {
    #[error("Partition location must not be empty.")]
    EmptyLocation,

    #[error("Column name must not be empty.")]
    EmptyColumnName,

    #[error("Friend alias must not be empty.")]
    EmptyAlias,

    #[error("No friend named {0:?}.")]
    UnknownFriend(String),

    #[error("Invalid chain configuration: {0}")]
    InvalidConfig(String),

    /// The friend is in the middle of a read, so it cannot take a binding.
    #[error("Friend {0:?} is busy.")]
    FriendBusy(String),

    #[error(transparent)]
    CountOverflow(#[from] CountOverflow),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[cfg(test)]
mod tests {
    use chainset_storage::error::StorageError;

    use super::ResolveError;
    use crate::descriptor::LoadOutcome;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            ResolveError::EmptyChain,
            ResolveError::OutOfRange { entry: 9, total: 3 },
            ResolveError::OpenFailed {
                partition: 0,
                location: "a".into(),
                reason: StorageError::NotFound("a".into()),
            },
            ResolveError::TableMissing {
                partition: 0,
                location: "a".into(),
                table: "t".into(),
            },
            ResolveError::Internal("x".into()),
            ResolveError::NotifyFailed("x".into()),
        ];
        let codes: Vec<i32> = errors.iter().map(ResolveError::code).collect();
        assert_eq!(codes, [-1, -2, -3, -4, -5, -6]);
        assert_eq!(errors[2].load_outcome(), Some(LoadOutcome::OpenFailed));
        assert_eq!(errors[1].load_outcome(), None);
    }
}
