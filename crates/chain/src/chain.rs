//! The chain: one logical sequence of records over many partitions.

use std::cell::RefCell;
use std::fmt::{self, Display};
use std::rc::Rc;
use std::sync::Arc;

use chainset_storage::{
    cache::CacheStats,
    error::StorageError,
    location::PartitionLocation,
    registry::{ResourceRegistry, SharedRegistry},
    value::{BindOutcome, ColumnSlot, TypeInfo},
    BackendConfig, PartitionBackend, PartitionHandle, RecordSource,
};
use tracing::{debug, error, info, warn};

use crate::{
    active::ActivePartitionCache,
    bindings::{ColumnBinding, ColumnBindingRegistry},
    config::ChainConfig,
    descriptor::{DeclaredCount, LoadOutcome, PartitionDescriptor},
    error::{ChainError, ResolveError},
    friends::{Friend, FriendReport, FriendSet, SyncMode},
    offset_index::{Locate, OffsetIndex},
};

#[cfg(test)]
mod tests;

/// Called after every partition switch with the index and descriptor of the
/// newly opened partition.  Returning false fails the resolution with
/// [`ResolveError::NotifyFailed`].
type NotifyFn = Box<dyn FnMut(usize, &PartitionDescriptor) -> bool>;

/// A logical table made of an ordered list of partitions.
///
/// Entries are numbered globally across partitions.  Partition sizes need
/// not be known up front: a partition appended without a record count is
/// opened when an entry is first requested at or past its start, and the
/// offsets of the partitions after it are repaired then.
///
/// A chain keeps at most one partition open.  Column bindings and friends
/// are carried over from one partition to the next.
///
/// A chain is not thread-safe.  Scan in parallel with one chain per worker.
pub struct Chain {
    name: String,
    config: ChainConfig,
    backend: Rc<dyn PartitionBackend>,
    descriptors: Vec<PartitionDescriptor>,
    index: OffsetIndex,
    active: ActivePartitionCache,
    bindings: ColumnBindingRegistry,
    friends: FriendSet,
    read_entry: Option<u64>,
    notify: Option<NotifyFn>,
}

fn internal(message: String) -> ResolveError {
    error!("{message}");
    ResolveError::Internal(message)
}

impl Chain {
    pub fn new(name: &str, backend: Rc<dyn PartitionBackend>) -> Self {
        Self::with_config(name, backend, ChainConfig::default())
    }

    pub fn with_config(
        name: &str,
        backend: Rc<dyn PartitionBackend>,
        mut config: ChainConfig,
    ) -> Self {
        if config.table_name.is_empty() {
            config.table_name = name.to_owned();
        }
        let active = ActivePartitionCache::new(
            SharedRegistry::global(),
            config.global_registration,
            config.cache_size,
        );
        Self {
            name: name.to_owned(),
            config,
            backend,
            descriptors: Vec::new(),
            index: OffsetIndex::new(),
            active,
            bindings: ColumnBindingRegistry::default(),
            friends: FriendSet::default(),
            read_entry: None,
            notify: None,
        }
    }

    /// Creates a chain reading through the backend selected by `backend`.
    pub fn from_config(
        name: &str,
        backend: &BackendConfig,
        config: ChainConfig,
    ) -> Result<Self, ChainError> {
        let backend = <dyn PartitionBackend>::new(backend)?;
        Ok(Self::with_config(name, backend, config))
    }

    /// Registers open partitions with `registry` instead of the process-wide
    /// one.
    pub fn with_registry(mut self, registry: Arc<dyn ResourceRegistry>) -> Self {
        self.active.set_registry(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        self.descriptors.iter()
    }

    pub fn partition(&self, index: usize) -> Option<&PartitionDescriptor> {
        self.descriptors.get(index)
    }

    /// Global entry number of the first record of every partition, followed
    /// by the total.  `None` where not yet known.
    pub fn offsets(&self) -> &[Option<u64>] {
        self.index.boundaries()
    }

    /// Index of the open partition.
    pub fn active_partition(&self) -> Option<usize> {
        self.active.index()
    }

    /// Entry last resolved successfully.
    pub fn read_entry(&self) -> Option<u64> {
        self.read_entry
    }

    pub fn column_binding(&self, name: &str) -> Option<&ColumnBinding> {
        self.bindings.get(name)
    }

    pub fn column_bindings(&self) -> impl Iterator<Item = &ColumnBinding> {
        self.bindings.iter()
    }

    /// Entry friend `alias` was last positioned on, if it has one.
    pub fn friend_entry(&self, alias: &str) -> Option<u64> {
        self.friends.cursor(alias)
    }

    pub fn friend_count(&self) -> usize {
        self.friends.len()
    }

    /// Statistics of the read-ahead cache, if one exists.
    pub fn cache_stats(&mut self) -> Option<CacheStats> {
        self.active.cache_stats()
    }

    /// Appends the partition at `location`, reading table `table_name` (or
    /// the chain's table if `None`).  Returns the new partition's index.
    ///
    /// With [`DeclaredCount::Exact`] the count is trusted: if it is wrong,
    /// entries are renumbered when the partition is eventually opened.
    pub fn append_partition(
        &mut self,
        location: &str,
        count: DeclaredCount,
        table_name: Option<&str>,
    ) -> Result<usize, ChainError> {
        if location.trim().is_empty() {
            return Err(ChainError::EmptyLocation);
        }
        let table_name = table_name
            .filter(|table_name| !table_name.is_empty())
            .unwrap_or(&self.config.table_name)
            .to_owned();
        let count = match count {
            DeclaredCount::Unknown if !self.config.probe_on_append => None,
            DeclaredCount::Exact(count) => Some(count),
            DeclaredCount::Unknown | DeclaredCount::Probe => {
                Some(self.probe(location, &table_name)?)
            }
        };

        let partition = self.index.append(count).inspect_err(|error| {
            warn!("chain {:?}: not adding {location}: {error}", self.name);
        })?;
        self.descriptors.push(PartitionDescriptor::new(
            location,
            table_name,
            count,
            self.config.packet_size,
        ));
        debug!(
            "chain {:?}: appended partition {partition} ({location}), {} records",
            self.name,
            count.map_or_else(|| "unknown".to_string(), |count| count.to_string())
        );
        Ok(partition)
    }

    fn probe(&self, location: &str, table_name: &str) -> Result<u64, ChainError> {
        let mut handle = self.backend.open(location, table_name).inspect_err(|error| {
            warn!("chain {:?}: not adding {location}: {error}", self.name);
        })?;
        let count = handle.record_count();
        handle.close();
        let count = count?;
        if count == 0 {
            warn!(
                "chain {:?}: partition {location} has no records in table {table_name:?}",
                self.name
            );
        }
        Ok(count)
    }

    /// Parses `name` as a partition location (see [`PartitionLocation`]) and
    /// appends it.
    pub fn add(&mut self, name: &str, count: DeclaredCount) -> Result<usize, ChainError> {
        if name.trim().is_empty() {
            return Err(ChainError::EmptyLocation);
        }
        let location = PartitionLocation::parse(name)?;
        self.append_partition(&location.resource(), count, location.table.as_deref())
    }

    /// Appends the partitions of `other`, after discovering all of its
    /// record counts.  Returns the number of partitions appended.
    ///
    /// A partition `other` failed to open is appended with no records.
    pub fn append_chain(&mut self, other: &mut Chain) -> Result<usize, ChainError> {
        other.total_record_count();
        let mut index = self.index.clone();
        let mut descriptors = Vec::with_capacity(other.descriptors.len());
        for (i, descriptor) in other.descriptors.iter().enumerate() {
            let count = other.index.count(i);
            index.append(count)?;
            descriptors.push(PartitionDescriptor {
                record_count: count,
                ..descriptor.clone()
            });
        }
        self.index = index;
        self.descriptors.extend(descriptors);
        debug!(
            "chain {:?}: appended {} partition(s) of chain {:?}",
            self.name,
            other.descriptors.len(),
            other.name
        );
        Ok(other.descriptors.len())
    }

    /// Positions the chain on global entry `entry` and returns the entry's
    /// index within its partition.
    ///
    /// Opens the partition holding `entry` if it is not the open one,
    /// discovering record counts on the way, then positions every friend.
    pub fn resolve(&mut self, entry: u64) -> Result<u64, ResolveError> {
        if self.active.check_registration() {
            self.bindings.detach_all();
            self.read_entry = None;
        }
        if self.descriptors.is_empty() {
            return Err(ResolveError::EmptyChain);
        }

        // Every pass that does not return opens a partition after the one
        // opened by the previous pass.
        for _ in 0..=self.descriptors.len() {
            let partition = match self.index.locate(entry, self.active.index()) {
                Locate::OutOfRange => {
                    self.read_entry = None;
                    return Err(ResolveError::OutOfRange {
                        entry,
                        total: self.index.known_total(),
                    });
                }
                Locate::Found(partition) if self.active.index() == Some(partition) => {
                    return self.position_active(partition, entry);
                }
                Locate::Found(partition) | Locate::Undiscovered(partition) => partition,
            };
            if self.active.index() == Some(partition) {
                return Err(internal(format!(
                    "chain {:?}: partition {partition} is open but its record count is unknown",
                    self.name
                )));
            }
            self.switch_to(partition)?;
        }
        Err(internal(format!(
            "chain {:?}: entry {entry} still unresolved after opening every partition",
            self.name
        )))
    }

    fn position_active(&mut self, partition: usize, entry: u64) -> Result<u64, ResolveError> {
        self.read_entry = None;
        let start = self.index.start(partition).ok_or_else(|| {
            internal(format!(
                "chain {:?}: partition {partition} has no start offset",
                self.name
            ))
        })?;
        let local = entry - start;
        let Some(handle) = self.active.handle_mut() else {
            return Err(internal(format!(
                "chain {:?}: partition {partition} has no handle",
                self.name
            )));
        };
        if let Err(error) = handle.position_at(local) {
            self.descriptors[partition].last_outcome = Some(LoadOutcome::Other);
            return Err(internal(format!(
                "chain {:?}: partition {partition} cannot position on record {local}: {error}",
                self.name
            )));
        }
        self.friends.align(entry)?;
        self.read_entry = Some(entry);
        Ok(local)
    }

    fn close_active(&mut self) {
        self.active.teardown();
        self.bindings.detach_all();
        self.read_entry = None;
    }

    /// Closes the open partition and opens `partition` instead.  Whatever
    /// the outcome, the record count of `partition` is known afterwards.
    fn switch_to(&mut self, partition: usize) -> Result<(), ResolveError> {
        self.close_active();
        let descriptor = &self.descriptors[partition];
        let location = descriptor.resource().to_owned();
        let table_name = descriptor.table_name.clone();
        debug!(
            "chain {:?}: switching to partition {partition} ({location})",
            self.name
        );

        let mut handle = match self.backend.open(&location, &table_name) {
            Ok(handle) => handle,
            Err(error) => return Err(self.open_failed(partition, location, table_name, error)),
        };
        let count = match handle.record_count() {
            Ok(count) => count,
            Err(error) => {
                handle.close();
                return Err(self.open_failed(partition, location, table_name, error));
            }
        };
        if let Err(error) = self.update_count(partition, count) {
            handle.close();
            self.descriptors[partition].last_outcome = error.load_outcome();
            return Err(error);
        }

        self.active.install(partition, handle);
        if let Some(handle) = self.active.handle_mut() {
            self.bindings.apply(handle, partition);
        }
        self.active.refresh_cache_columns(self.bindings.cache_columns());
        self.descriptors[partition].last_outcome = Some(LoadOutcome::Ok);
        self.notify(partition)
    }

    /// Records a failed open of `partition`.  A partition whose count was
    /// unknown counts as empty from now on, so that later partitions can be
    /// reached.
    fn open_failed(
        &mut self,
        partition: usize,
        location: String,
        table: String,
        reason: StorageError,
    ) -> ResolveError {
        let error = if reason.is_table_missing() {
            ResolveError::TableMissing {
                partition,
                location,
                table,
            }
        } else {
            ResolveError::OpenFailed {
                partition,
                location,
                reason,
            }
        };
        warn!("chain {:?}: {error}", self.name);
        self.descriptors[partition].last_outcome = error.load_outcome();
        if self.index.count(partition).is_none() {
            warn!(
                "chain {:?}: partition {partition} counts as empty until it can be opened",
                self.name
            );
            if let Err(overflow) = self.index.repair(partition, 0) {
                return internal(format!(
                    "chain {:?}: cannot skip partition {partition}: {overflow}",
                    self.name
                ));
            }
        }
        error
    }

    fn update_count(&mut self, partition: usize, count: u64) -> Result<(), ResolveError> {
        let repaired = self.index.repair(partition, count).map_err(|overflow| {
            internal(format!(
                "chain {:?}: partition {partition} holds {count} records: {overflow}",
                self.name
            ))
        })?;
        let descriptor = &mut self.descriptors[partition];
        match descriptor.record_count {
            Some(declared) if declared != count => warn!(
                "chain {:?}: partition {partition} ({}) holds {count} records, not {declared}",
                self.name,
                descriptor.location
            ),
            _ => (),
        }
        descriptor.record_count = Some(count);
        if repaired {
            debug!(
                "chain {:?}: partition {partition} holds {count} records, offsets repaired",
                self.name
            );
        }
        Ok(())
    }

    fn notify(&mut self, partition: usize) -> Result<(), ResolveError> {
        let Some(notify) = self.notify.as_mut() else {
            return Ok(());
        };
        if notify(partition, &self.descriptors[partition]) {
            Ok(())
        } else {
            Err(ResolveError::NotifyFailed(format!(
                "switch to partition {partition} was refused"
            )))
        }
    }

    /// Total number of entries.  Opens every partition whose count is not
    /// known yet; partitions that fail to open count as empty.
    pub fn total_record_count(&mut self) -> u64 {
        for _ in 0..self.descriptors.len() {
            let Some(partition) = self.index.first_unknown() else {
                break;
            };
            if let Err(error) = self.switch_to(partition) {
                debug!(
                    "chain {:?}: counting records past partition {partition}: {error}",
                    self.name
                );
            }
        }
        self.index
            .total()
            .unwrap_or_else(|| self.index.known_total())
    }

    /// Total number of entries if every record count is known, without
    /// opening anything.
    pub fn entries_fast(&self) -> Option<u64> {
        self.index.total()
    }

    /// Makes `slot` receive column `name` on every read, attaching it to the
    /// open partition right away and to every partition opened later.
    ///
    /// A name of the form `alias.column` binds `column` of friend `alias`.
    pub fn bind(
        &mut self,
        name: &str,
        slot: ColumnSlot,
        type_info: TypeInfo,
    ) -> Result<BindOutcome, ChainError> {
        if name.is_empty() {
            return Err(ChainError::EmptyColumnName);
        }
        if let Some(outcome) = self.friends.bind(name, slot.clone(), &type_info) {
            return outcome;
        }
        let partition = self.active.index();
        let active = self.active.handle_mut().zip(partition);
        let outcome = self.bindings.bind(name, slot, type_info, active);
        self.active.refresh_cache_columns(self.bindings.cache_columns());
        Ok(outcome)
    }

    /// Enables or disables delivery of the columns selected by `pattern`, a
    /// column name or `"*"`.  Later calls override earlier ones.
    pub fn set_enabled(&mut self, pattern: &str, enabled: bool) -> Result<(), ChainError> {
        if pattern.is_empty() {
            return Err(ChainError::EmptyColumnName);
        }
        self.bindings.set_status(pattern, enabled);
        if let Some(handle) = self.active.handle_mut() {
            if handle.set_column_status(pattern, enabled) == 0 {
                warn!(
                    "chain {:?}: no column matches {pattern:?} in {}",
                    self.name,
                    handle.location()
                );
            }
        }
        self.active.refresh_cache_columns(self.bindings.cache_columns());
        Ok(())
    }

    /// Clears the slot bound to `name` and stops delivering into it.
    /// Returns false if nothing was bound.
    pub fn reset_binding(&mut self, name: &str) -> bool {
        let reset =
            self.friends.reset(name) || self.bindings.reset(name, self.active.handle_mut());
        self.active.refresh_cache_columns(self.bindings.cache_columns());
        reset
    }

    pub fn reset_bindings(&mut self) {
        self.friends.reset_all();
        self.bindings.reset_all(self.active.handle_mut());
        self.active.refresh_cache_columns(Vec::new());
    }

    /// Keeps `source` positioned on the record matching the chain's current
    /// entry.
    ///
    /// In [`SyncMode::Lockstep`] a friend with fewer records than the chain
    /// is accepted (the trailing entries have no partner) and reported.
    pub fn add_friend(
        &mut self,
        alias: &str,
        source: Rc<RefCell<dyn RecordSource>>,
        mode: SyncMode,
    ) -> Result<FriendReport, ChainError> {
        if alias.is_empty() {
            return Err(ChainError::EmptyAlias);
        }
        let friend_records = FriendSet::record_count(&source)?;
        let primary_records = self.total_record_count();
        let shorter = matches!(mode, SyncMode::Lockstep) && friend_records < primary_records;
        if shorter {
            warn!(
                "chain {:?}: friend {alias:?} has {friend_records} records, \
                 fewer than {primary_records}",
                self.name
            );
        }
        self.friends.add(Friend::new(alias, source, mode));
        self.invalidate_active();
        Ok(FriendReport {
            alias: alias.to_owned(),
            friend_records,
            primary_records,
            shorter,
        })
    }

    pub fn remove_friend(&mut self, alias: &str) -> Result<(), ChainError> {
        if !self.friends.remove(alias) {
            return Err(ChainError::UnknownFriend(alias.to_owned()));
        }
        self.invalidate_active();
        Ok(())
    }

    /// Sets the callback invoked after every partition switch.
    pub fn set_notify<F>(&mut self, notify: F)
    where
        F: FnMut(usize, &PartitionDescriptor) -> bool + 'static,
    {
        self.notify = Some(Box::new(notify));
    }

    pub fn clear_notify(&mut self) {
        self.notify = None;
    }

    /// Closes the open partition, so that the next [`resolve`](Self::resolve)
    /// reopens it.
    pub fn invalidate_active(&mut self) {
        if let Some(partition) = self.active.index() {
            debug!(
                "chain {:?}: invalidating partition {partition}",
                self.name
            );
        }
        self.close_active();
    }

    /// Removes every partition and column binding.  Friends and the switch
    /// callback are kept.
    pub fn reset(&mut self) {
        self.close_active();
        self.descriptors.clear();
        self.index.clear();
        self.bindings.clear();
        debug!("chain {:?}: reset", self.name);
    }

    /// Resolves `entry` and reads it into the bound slots of the chain and
    /// of its friends.  Returns the number of values delivered.
    pub fn get_entry(&mut self, entry: u64) -> Result<usize, ChainError> {
        self.resolve(entry)?;
        Ok(self.read_active()?)
    }

    fn read_active(&mut self) -> Result<usize, StorageError> {
        if self.read_entry.is_none() {
            return Err(StorageError::NotPositioned);
        }
        let handle = self.active.handle_mut().ok_or(StorageError::NotPositioned)?;
        let delivered = handle.read_current()?;
        Ok(delivered + self.friends.read_current()?)
    }

    /// Global entry number of record `local` of the open partition.
    pub fn chain_entry_number(&self, local: u64) -> Option<u64> {
        let partition = self.active.index()?;
        if local >= self.index.count(partition)? {
            return None;
        }
        Some(self.index.start(partition)? + local)
    }

    /// Resolves partition locations through the backend.  Only partitions not
    /// looked up yet are considered, or all of them if `force` is set.
    /// Partitions that cannot be located are removed.  Returns the number of
    /// partitions removed.  Changes nothing if the record counts left would
    /// overflow.
    pub fn lookup(&mut self, force: bool) -> Result<usize, ChainError> {
        let mut kept = Vec::with_capacity(self.descriptors.len());
        let mut removed = 0;
        let mut moved = false;
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            let count = self.index.count(i);
            if descriptor.looked_up && !force {
                kept.push((descriptor.clone(), count));
                continue;
            }
            match self.backend.locate(&descriptor.location) {
                Ok(resolved) => {
                    let resolved = (resolved != descriptor.location).then_some(resolved);
                    moved |= resolved != descriptor.resolved_location;
                    let descriptor = PartitionDescriptor {
                        resolved_location: resolved,
                        looked_up: true,
                        ..descriptor.clone()
                    };
                    kept.push((descriptor, count));
                }
                Err(error) => {
                    warn!(
                        "chain {:?}: removing partition {}: {error}",
                        self.name, descriptor.location
                    );
                    removed += 1;
                }
            }
        }

        let index = if removed > 0 || moved {
            Some(OffsetIndex::from_counts(kept.iter().map(|(_, count)| *count))?)
        } else {
            None
        };
        self.descriptors = kept.into_iter().map(|(descriptor, _)| descriptor).collect();
        if let Some(index) = index {
            self.close_active();
            self.index = index;
        }
        if removed > 0 {
            info!(
                "chain {:?}: {removed} partition(s) removed by lookup, {} left",
                self.name,
                self.descriptors.len()
            );
        }
        Ok(removed)
    }

    /// Sets the size of the read-ahead cache in bytes; 0 disables it.
    pub fn set_cache_size(&mut self, bytes: u64) {
        let cache_size = (bytes > 0).then_some(bytes);
        self.config.cache_size = cache_size;
        self.active.set_cache_size(cache_size);
        self.active.refresh_cache_columns(self.bindings.cache_columns());
    }

    pub fn set_packet_size(&mut self, packet_size: u32) {
        self.config.packet_size = packet_size;
        for descriptor in &mut self.descriptors {
            descriptor.packet_size = packet_size;
        }
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain {:?}: {} partition(s), ",
            self.name,
            self.descriptors.len()
        )?;
        match self.index.total() {
            Some(total) => writeln!(f, "{total} entries")?,
            None => writeln!(f, "at least {} entries", self.index.known_total())?,
        }
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            let marker = if self.active.index() == Some(i) { '*' } else { ' ' };
            writeln!(f, "{marker}[{i}] {descriptor}")?;
        }
        for alias in self.friends.aliases() {
            writeln!(f, "  friend {alias:?}")?;
        }
        Ok(())
    }
}

impl RecordSource for Chain {
    fn record_count(&mut self) -> Result<u64, StorageError> {
        Ok(self.total_record_count())
    }

    fn position_at(&mut self, index: u64) -> Result<u64, StorageError> {
        self.resolve(index).map_err(|error| match error {
            ResolveError::OutOfRange { entry, total } => StorageError::PositionOutOfRange {
                index: entry,
                count: Some(total),
            },
            error => StorageError::SourceFailed(format!("chain {:?}: {error}", self.name)),
        })
    }

    fn rebind_column(
        &mut self,
        name: &str,
        slot: Option<ColumnSlot>,
        declared: &TypeInfo,
    ) -> BindOutcome {
        match slot {
            Some(slot) => match self.bind(name, slot, declared.clone()) {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!("chain {:?}: cannot bind {name:?}: {error}", self.name);
                    BindOutcome::MissingColumn
                }
            },
            None => {
                self.reset_binding(name);
                BindOutcome::NoCheck
            }
        }
    }

    fn read_current(&mut self) -> Result<usize, StorageError> {
        self.read_active()
    }
}
