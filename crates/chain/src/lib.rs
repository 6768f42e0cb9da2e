//! Chained datasets.
//!
//! A [`Chain`] presents an ordered list of partitions (typically files) as
//! one table whose entries are numbered globally.  Partitions are appended
//! with or without a record count; unknown counts are discovered lazily, when
//! a partition is first opened, and the global numbering is repaired as they
//! are.
//!
//! ```
//! use std::rc::Rc;
//!
//! use chainset::{Chain, DeclaredCount};
//! use chainset_storage::memory_impl::{MemoryBackend, MemoryTable};
//! use chainset_storage::value::{ColumnSlot, DataType, TypeInfo, Value};
//!
//! let backend = Rc::new(MemoryBackend::new());
//! for (location, n) in [("run1", 3), ("run2", 2)] {
//!     let table = MemoryTable::new([("id", TypeInfo::scalar(DataType::Int64))])
//!         .with_rows((0..n).map(|i| vec![Value::Int(i)]).collect());
//!     backend.insert(location, "events", table);
//! }
//!
//! let mut chain = Chain::new("events", backend);
//! chain.append_partition("run1", DeclaredCount::Unknown, None).unwrap();
//! chain.append_partition("run2", DeclaredCount::Exact(2), None).unwrap();
//!
//! let id = ColumnSlot::new();
//! chain.bind("id", id.clone(), TypeInfo::scalar(DataType::Int64)).unwrap();
//! assert_eq!(chain.resolve(4).unwrap(), 1);
//! chain.get_entry(4).unwrap();
//! assert_eq!(id.get(), Some(Value::Int(1)));
//! assert_eq!(chain.total_record_count(), 5);
//! ```

mod active;
mod bindings;
mod chain;
mod config;
mod descriptor;
mod error;
mod friends;
mod offset_index;


pub use bindings::{ColumnBinding, ColumnLink, ColumnStatus, LinkedColumn};
pub use chain::Chain;
pub use config::ChainConfig;
pub use descriptor::{DeclaredCount, LoadOutcome, PartitionDescriptor};
pub use error::{ChainError, ResolveError};
pub use friends::{EntryCorrespondence, FriendReport, SyncMode};
pub use offset_index::{CountOverflow, Locate, OffsetIndex};
