//! The partition a chain currently has open.

use std::sync::Arc;

use chainset_storage::{
    cache::{CacheStats, ReadAheadCache},
    registry::{Registration, ResourceRegistry},
    PartitionHandle,
};
use tracing::debug;

struct ActivePartition {
    index: usize,
    handle: Box<dyn PartitionHandle>,
    registration: Option<Arc<Registration>>,
}

/// Holds at most one open partition, and the read-ahead cache that moves
/// from one partition to the next.
///
/// The cache is owned by the open handle while a partition is active and by
/// this struct in between.  [`teardown`](Self::teardown) always takes the
/// cache back before the handle is closed.
pub(crate) struct ActivePartitionCache {
    active: Option<ActivePartition>,
    spare_cache: Option<ReadAheadCache>,
    cache_size: Option<u64>,
    registry: Arc<dyn ResourceRegistry>,
    register: bool,
}

impl ActivePartitionCache {
    pub(crate) fn new(
        registry: Arc<dyn ResourceRegistry>,
        register: bool,
        cache_size: Option<u64>,
    ) -> Self {
        Self {
            active: None,
            spare_cache: None,
            cache_size,
            registry,
            register,
        }
    }

    pub(crate) fn set_registry(&mut self, registry: Arc<dyn ResourceRegistry>) {
        self.teardown();
        self.registry = registry;
    }

    /// Index of the open partition.
    pub(crate) fn index(&self) -> Option<usize> {
        self.active.as_ref().map(|active| active.index)
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut (dyn PartitionHandle + 'static)> {
        self.active.as_mut().map(|active| &mut *active.handle)
    }

    /// Closes the open partition, if any.
    pub(crate) fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if let Some(mut cache) = active.handle.detach_cache() {
            cache.reset();
            self.spare_cache = Some(cache);
        }
        debug!(
            "closing partition {} ({})",
            active.index,
            active.handle.location()
        );
        active.handle.close();
        if let Some(registration) = active.registration {
            self.registry.unregister(&registration);
        }
    }

    /// Makes `handle` the open partition.  The previous partition must have
    /// been torn down.
    pub(crate) fn install(&mut self, index: usize, mut handle: Box<dyn PartitionHandle>) {
        debug_assert!(self.active.is_none());
        let registration = self
            .register
            .then(|| self.registry.register(handle.location()));
        if let Some(cache) = self.take_cache() {
            handle.attach_cache(cache);
        }
        self.active = Some(ActivePartition {
            index,
            handle,
            registration,
        });
    }

    /// Returns a cache of the configured size: the spare one if its size
    /// still matches, a new one otherwise.
    fn take_cache(&mut self) -> Option<ReadAheadCache> {
        let size = self.cache_size?;
        match self.spare_cache.take() {
            Some(cache) if cache.size_bytes() == size => Some(cache),
            _ => Some(ReadAheadCache::new(size)),
        }
    }

    /// Tears down the open partition if its resource has been invalidated.
    /// Returns true if it did.
    pub(crate) fn check_registration(&mut self) -> bool {
        let invalidated = self.active.as_ref().is_some_and(|active| {
            active
                .registration
                .as_ref()
                .is_some_and(|registration| registration.is_invalidated())
        });
        if invalidated {
            debug!("open partition was invalidated");
            self.teardown();
        }
        invalidated
    }

    pub(crate) fn set_cache_size(&mut self, cache_size: Option<u64>) {
        self.cache_size = cache_size;
        self.spare_cache = None;
        if let Some(active) = self.active.as_mut() {
            let columns = active
                .handle
                .detach_cache()
                .map(|cache| cache.columns().to_vec());
            if let Some(mut cache) = self.cache_size.map(ReadAheadCache::new) {
                if let Some(columns) = columns {
                    cache.update_columns(columns);
                }
                active.handle.attach_cache(cache);
            }
        }
    }

    /// Tells the read-ahead cache of the open partition which columns to
    /// fetch.
    pub(crate) fn refresh_cache_columns(&mut self, columns: Vec<String>) {
        if let Some(active) = self.active.as_mut() {
            if let Some(mut cache) = active.handle.detach_cache() {
                cache.update_columns(columns);
                active.handle.attach_cache(cache);
            }
        }
    }

    /// Statistics of the read-ahead cache, wherever it currently is.
    pub(crate) fn cache_stats(&mut self) -> Option<CacheStats> {
        if let Some(active) = self.active.as_mut() {
            if let Some(cache) = active.handle.detach_cache() {
                let stats = cache.stats();
                active.handle.attach_cache(cache);
                return Some(stats);
            }
        }
        self.spare_cache.as_ref().map(ReadAheadCache::stats)
    }
}

impl Drop for ActivePartitionCache {
    fn drop(&mut self) {
        self.teardown();
    }
}
