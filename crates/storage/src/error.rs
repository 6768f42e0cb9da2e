use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io::ErrorKind;
use thiserror::Error;

/// An error that can occur when opening or reading a partition.
#[derive(Clone, Error, Debug, PartialEq, Eq, Serialize)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    #[serde(serialize_with = "serialize_io_error")]
    StdIo(ErrorKind),

    /// The partition does not exist at the given location.
    #[error("No partition found at {0:?}.")]
    NotFound(String),

    /// The partition exists but does not contain the requested table.
    #[error("Cannot find table {table:?} in partition {location:?}.")]
    TableNotFound { location: String, table: String },

    /// The partition does not contain the requested column.
    #[error("Unknown column {0:?}.")]
    ColumnNotFound(String),

    /// A record index past the end of a partition (or chain) was requested.
    #[error("Record {index} is out of range ({count:?} records available).")]
    PositionOutOfRange { index: u64, count: Option<u64> },

    /// The source has not been positioned on a record yet.
    #[error("No record is currently loaded.")]
    NotPositioned,

    /// Unable to parse a partition location.
    #[error("Unable to parse partition location {0:?}")]
    InvalidLocation(String),

    /// The partition content could not be decoded.
    #[error("Partition {location:?} is corrupt: {message}")]
    Corrupt { location: String, message: String },

    /// A source built on top of other sources failed.
    #[error("Record source failed: {0}")]
    SourceFailed(String),

    /// The requested partition backend is not available.
    #[error("The requested partition backend ({0:?}) is not available")]
    BackendNotSupported(String),
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::StdIo(value.kind())
    }
}

fn serialize_io_error<S>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("IOError", 1)?;
    ser.serialize_field("kind", &kind.to_string())?;
    ser.end()
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo(kind) => *kind,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::TableNotFound { .. } => ErrorKind::NotFound,
            StorageError::ColumnNotFound(_) => ErrorKind::NotFound,
            StorageError::PositionOutOfRange { .. } => ErrorKind::InvalidInput,
            StorageError::NotPositioned => ErrorKind::Other,
            StorageError::InvalidLocation(_) => ErrorKind::InvalidInput,
            StorageError::Corrupt { .. } => ErrorKind::InvalidData,
            StorageError::SourceFailed(_) => ErrorKind::Other,
            StorageError::BackendNotSupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Returns true if the partition itself was reachable but the table
    /// inside it was not.
    pub fn is_table_missing(&self) -> bool {
        matches!(self, StorageError::TableNotFound { .. })
    }
}
