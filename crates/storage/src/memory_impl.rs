//! Implementation of the partition APIs ([`PartitionBackend`],
//! [`PartitionHandle`]) using memory.
//!
//! Partitions are registered programmatically as tables of [`Value`]s.  This
//! is useful for tests and for small derived datasets; the JSON backend
//! ([`crate::json_impl`]) decodes files into the same [`MemoryTable`] form
//! and reuses the handle defined here.

use std::{
    collections::HashMap,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tracing::trace;

use crate::{
    cache::ReadAheadCache,
    column_matches,
    error::StorageError,
    value::{BindOutcome, ColumnSlot, DataType, TypeInfo, Value},
    BackendConfig, PartitionBackend, PartitionBackendFactory, PartitionHandle, RecordSource,
};

/// Approximate size of one stored value, used for read-ahead budgeting.
const VALUE_BYTES: u64 = 8;

/// A table of records held in memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryTable {
    columns: Vec<(String, TypeInfo)>,
    rows: Vec<Vec<Value>>,
    packet_size: u32,
}

impl MemoryTable {
    /// Creates an empty table with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, TypeInfo)>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, type_info)| (name.into(), type_info))
                .collect(),
            rows: Vec::new(),
            packet_size: 0,
        }
    }

    pub fn with_rows(mut self, rows: Vec<Vec<Value>>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Appends a record.  Missing trailing values read as [`Value::Null`].
    pub fn push_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &TypeInfo)> {
        self.columns.iter().map(|(name, t)| (name.as_str(), t))
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(column, _)| column == name)
    }

    fn record_bytes(&self) -> u64 {
        self.columns.len() as u64 * VALUE_BYTES
    }
}

/// Open and close counters shared by a backend and its handles.
#[derive(Debug, Default)]
pub struct HandleCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl HandleCounters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }

    /// Handles opened and not yet closed.
    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }
}

/// State of the backend needed to satisfy the partition APIs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// Tables by partition location, then by table name.
    partitions: RwLock<HashMap<String, HashMap<String, Arc<MemoryTable>>>>,
    /// Locations that [`PartitionBackend::locate`] rewrites.
    redirects: RwLock<HashMap<String, String>>,
    counters: Arc<HandleCounters>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a thread-local default backend.
    pub fn default_for_thread() -> Rc<Self> {
        thread_local! {
            pub static DEFAULT_BACKEND: Rc<MemoryBackend> = Rc::new(MemoryBackend::new());
        }
        DEFAULT_BACKEND.with(|rc| rc.clone())
    }

    /// Stores `table` as table `table_name` of the partition at `location`,
    /// replacing any previous table of that name.
    pub fn insert(&self, location: &str, table_name: &str, table: MemoryTable) {
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location.to_owned())
            .or_default()
            .insert(table_name.to_owned(), Arc::new(table));
    }

    /// Removes the partition at `location`.  Returns true if it existed.
    pub fn remove(&self, location: &str) -> bool {
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location)
            .is_some()
    }

    /// Makes [`PartitionBackend::locate`] rewrite `from` into `to`.
    pub fn redirect(&self, from: &str, to: &str) {
        self.redirects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(from.to_owned(), to.to_owned());
    }

    pub fn counters(&self) -> &HandleCounters {
        &self.counters
    }
}

impl PartitionBackend for MemoryBackend {
    fn open(&self, resource: &str, table: &str) -> Result<Box<dyn PartitionHandle>, StorageError> {
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        let tables = partitions
            .get(resource)
            .ok_or_else(|| StorageError::NotFound(resource.to_owned()))?;
        let data = tables
            .get(table)
            .ok_or_else(|| StorageError::TableNotFound {
                location: resource.to_owned(),
                table: table.to_owned(),
            })?;
        Ok(Box::new(TableHandle::new(
            resource,
            table,
            data.clone(),
            Some(self.counters.clone()),
        )))
    }

    fn locate(&self, resource: &str) -> Result<String, StorageError> {
        if let Some(target) = self
            .redirects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
        {
            return Ok(target.clone());
        }
        if self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(resource)
        {
            Ok(resource.to_owned())
        } else {
            Err(StorageError::NotFound(resource.to_owned()))
        }
    }
}

struct MemoryBackendFactory;

impl PartitionBackendFactory for MemoryBackendFactory {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn create(&self, _config: &BackendConfig) -> Result<Rc<dyn PartitionBackend>, StorageError> {
        Ok(MemoryBackend::default_for_thread())
    }
}

inventory::submit! {
    &MemoryBackendFactory as &dyn PartitionBackendFactory
}

/// A slot attached to a column, with the conversion applied on delivery.
struct BoundSlot {
    slot: ColumnSlot,
    convert_to: Option<DataType>,
}

/// Handle on one table held in memory.
pub(crate) struct TableHandle {
    location: String,
    table_name: String,
    table: Arc<MemoryTable>,
    position: Option<u64>,
    enabled: Vec<bool>,
    bound: Vec<Option<BoundSlot>>,
    cache: Option<ReadAheadCache>,
    counters: Option<Arc<HandleCounters>>,
}

impl TableHandle {
    pub(crate) fn new(
        location: &str,
        table_name: &str,
        table: Arc<MemoryTable>,
        counters: Option<Arc<HandleCounters>>,
    ) -> Self {
        if let Some(counters) = &counters {
            counters.opened.fetch_add(1, Ordering::Relaxed);
        }
        let n_columns = table.columns.len();
        Self {
            location: location.to_owned(),
            table_name: table_name.to_owned(),
            table,
            position: None,
            enabled: vec![true; n_columns],
            bound: (0..n_columns).map(|_| None).collect(),
            cache: None,
            counters,
        }
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if let Some(counters) = &self.counters {
            counters.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl RecordSource for TableHandle {
    fn record_count(&mut self) -> Result<u64, StorageError> {
        Ok(self.table.len() as u64)
    }

    fn position_at(&mut self, index: u64) -> Result<u64, StorageError> {
        let count = self.table.len() as u64;
        if index >= count {
            self.position = None;
            return Err(StorageError::PositionOutOfRange {
                index,
                count: Some(count),
            });
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.request(index, count, self.table.record_bytes());
        }
        self.position = Some(index);
        Ok(index)
    }

    fn rebind_column(
        &mut self,
        name: &str,
        slot: Option<ColumnSlot>,
        declared: &TypeInfo,
    ) -> BindOutcome {
        let Some(index) = self.table.column_index(name) else {
            return BindOutcome::MissingColumn;
        };
        let Some(slot) = slot else {
            self.bound[index] = None;
            return BindOutcome::NoCheck;
        };
        let outcome = declared.compatibility(&self.table.columns[index].1);
        let convert_to = (outcome == BindOutcome::MatchConversion).then_some(declared.kind);
        self.bound[index] = Some(BoundSlot { slot, convert_to });
        outcome
    }

    fn read_current(&mut self) -> Result<usize, StorageError> {
        let position = self.position.ok_or(StorageError::NotPositioned)?;
        let row = &self.table.rows[position as usize];
        let mut delivered = 0;
        for (index, bound) in self.bound.iter().enumerate() {
            let Some(bound) = bound else { continue };
            if !self.enabled[index] {
                continue;
            }
            let value = row.get(index).cloned().unwrap_or(Value::Null);
            let value = match bound.convert_to {
                Some(kind) => value.convert_to(kind),
                None => value,
            };
            bound.slot.set(value);
            delivered += 1;
        }
        trace!(
            "{}#{}: delivered {delivered} value(s) of record {position}",
            self.location,
            self.table_name
        );
        Ok(delivered)
    }
}

impl PartitionHandle for TableHandle {
    fn location(&self) -> &str {
        &self.location
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn packet_size(&self) -> u32 {
        self.table.packet_size
    }

    fn column_type(&self, name: &str) -> Option<TypeInfo> {
        self.table
            .column_index(name)
            .map(|index| self.table.columns[index].1.clone())
    }

    fn set_column_status(&mut self, pattern: &str, enabled: bool) -> usize {
        let mut found = 0;
        for (index, (name, _)) in self.table.columns.iter().enumerate() {
            if column_matches(pattern, name) {
                self.enabled[index] = enabled;
                found += 1;
            }
        }
        found
    }

    fn attach_cache(&mut self, cache: ReadAheadCache) {
        self.cache = Some(cache);
    }

    fn detach_cache(&mut self) -> Option<ReadAheadCache> {
        self.cache.take()
    }
}
