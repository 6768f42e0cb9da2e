//! Partition access layer for chainset.
//!
//! A chained dataset never decodes partitions itself.  It sees each partition
//! through three narrow traits: a [`PartitionBackend`] opens a partition by
//! location and table name, the resulting [`PartitionHandle`] reports its
//! record count, positions itself on a record and delivers column values into
//! caller-owned [`ColumnSlot`]s.  The capability shared by a single partition
//! and by a whole chain is [`RecordSource`], which lets a chain be used
//! wherever a partition can.

use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cache::ReadAheadCache;
use crate::error::StorageError;
use crate::value::{BindOutcome, ColumnSlot, TypeInfo};

pub mod cache;
pub mod error;
pub mod json_impl;
pub mod location;
pub mod memory_impl;
pub mod registry;
pub mod value;


/// Column name pattern that matches every column.
pub const ALL_COLUMNS: &str = "*";

/// Returns true if column `name` is selected by `pattern`, which is either an
/// exact column name or [`ALL_COLUMNS`].
pub fn column_matches(pattern: &str, name: &str) -> bool {
    pattern == ALL_COLUMNS || pattern == name
}

/// Something that holds a sequence of records and can be positioned on one
/// of them.
pub trait RecordSource {
    /// Returns the number of records.
    fn record_count(&mut self) -> Result<u64, StorageError>;

    /// Makes record `index` the current record.  Returns the index of the
    /// record within the source's own storage unit.
    fn position_at(&mut self, index: u64) -> Result<u64, StorageError>;

    /// Attaches `slot` to column `name`, or detaches the column if `slot` is
    /// `None`.  `declared` is the type the caller expects.
    fn rebind_column(
        &mut self,
        name: &str,
        slot: Option<ColumnSlot>,
        declared: &TypeInfo,
    ) -> BindOutcome;

    /// Delivers the enabled, bound columns of the current record into their
    /// slots.  Returns the number of values delivered.
    fn read_current(&mut self) -> Result<usize, StorageError>;
}

impl<T: RecordSource + ?Sized> RecordSource for Box<T> {
    fn record_count(&mut self) -> Result<u64, StorageError> {
        (**self).record_count()
    }

    fn position_at(&mut self, index: u64) -> Result<u64, StorageError> {
        (**self).position_at(index)
    }

    fn rebind_column(
        &mut self,
        name: &str,
        slot: Option<ColumnSlot>,
        declared: &TypeInfo,
    ) -> BindOutcome {
        (**self).rebind_column(name, slot, declared)
    }

    fn read_current(&mut self) -> Result<usize, StorageError> {
        (**self).read_current()
    }
}

/// An open partition.
pub trait PartitionHandle: RecordSource {
    /// Location the partition was opened from.
    fn location(&self) -> &str;

    /// Name of the table read from the partition.
    fn table_name(&self) -> &str;

    /// Suggested number of records per unit of parallel work.
    fn packet_size(&self) -> u32 {
        0
    }

    /// Type stored for column `name`, or `None` if there is no such column.
    fn column_type(&self, name: &str) -> Option<TypeInfo>;

    /// Enables or disables delivery of the columns selected by `pattern`.
    /// Returns the number of columns selected.
    fn set_column_status(&mut self, pattern: &str, enabled: bool) -> usize;

    /// Gives the partition a read-ahead cache to use.
    fn attach_cache(&mut self, cache: ReadAheadCache);

    /// Takes back the read-ahead cache, if one is attached.
    fn detach_cache(&mut self) -> Option<ReadAheadCache>;

    /// Closes the partition.  Any attached cache must be detached first.
    fn close(self: Box<Self>) {}
}

/// Opens partitions.
pub trait PartitionBackend {
    /// Opens table `table` in the partition at `resource`.
    ///
    /// Fails with [`StorageError::TableNotFound`] if the partition opens but
    /// lacks the table, and with another error if it cannot be opened.
    fn open(&self, resource: &str, table: &str) -> Result<Box<dyn PartitionHandle>, StorageError>;

    /// Resolves `resource` to the location it should actually be opened
    /// from (staging, redirects, normalization).
    fn locate(&self, resource: &str) -> Result<String, StorageError> {
        Ok(resource.to_owned())
    }
}

/// Selects and configures a partition backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Partitions held in memory, see [`memory_impl`].
    #[default]
    Memory,

    /// One JSON file per partition, see [`json_impl`].
    Json {
        /// Directory that relative locations are resolved against.
        #[serde(default)]
        base: Option<PathBuf>,
    },
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Json { .. } => "json",
        }
    }
}

pub trait PartitionBackendFactory: Sync {
    fn backend(&self) -> &'static str;
    fn create(&self, config: &BackendConfig) -> Result<Rc<dyn PartitionBackend>, StorageError>;
}

inventory::collect!(&'static dyn PartitionBackendFactory);

impl dyn PartitionBackend {
    /// Creates and returns a new backend configured according to `config`.
    pub fn new(config: &BackendConfig) -> Result<Rc<Self>, StorageError> {
        for factory in inventory::iter::<&dyn PartitionBackendFactory> {
            if factory.backend() == config.name() {
                return factory.create(config);
            }
        }
        Err(StorageError::BackendNotSupported(config.name().to_string()))
    }
}
