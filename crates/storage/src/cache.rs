//! Read-ahead cache for an open partition.
//!
//! A [`ReadAheadCache`] remembers a window of records that has been fetched
//! ahead of the current position.  It is attached to one partition at a time;
//! when the chain moves to another partition the cache is detached, reset and
//! (if its size still matches what the caller asked for) attached to the next
//! partition, which keeps its statistics and column list across the switch.

use std::ops::Range;

use tracing::trace;

/// Fallback record size used to turn a byte budget into a record window.
const DEFAULT_RECORD_BYTES: u64 = 64;

/// Counters kept by a [`ReadAheadCache`] over its whole lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resets: u64,
}

#[derive(Debug)]
pub struct ReadAheadCache {
    size_bytes: u64,
    columns: Vec<String>,
    buffered: Option<Range<u64>>,
    stats: CacheStats,
}

impl ReadAheadCache {
    /// Creates a cache with a budget of `size_bytes`.
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            columns: Vec::new(),
            buffered: None,
            stats: CacheStats::default(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Range of records currently held, if any.
    pub fn buffered(&self) -> Option<Range<u64>> {
        self.buffered.clone()
    }

    /// Forgets the buffered window.  Called when the cache moves to another
    /// partition.
    pub fn reset(&mut self) {
        self.buffered = None;
        self.stats.resets += 1;
    }

    /// Replaces the set of columns that read-ahead covers.
    pub fn update_columns<I, S>(&mut self, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self.buffered = None;
    }

    /// Number of records that fit in the budget, given `record_bytes` per
    /// record.  Always at least one.
    pub fn window(&self, record_bytes: u64) -> u64 {
        let record_bytes = if record_bytes == 0 {
            DEFAULT_RECORD_BYTES
        } else {
            record_bytes
        };
        (self.size_bytes / record_bytes).max(1)
    }

    /// Records an access to `index` in a partition holding `count` records.
    ///
    /// Returns true on a hit.  On a miss the window starting at `index` is
    /// fetched.
    pub fn request(&mut self, index: u64, count: u64, record_bytes: u64) -> bool {
        if self.buffered.as_ref().is_some_and(|r| r.contains(&index)) {
            self.stats.hits += 1;
            return true;
        }
        let end = index.saturating_add(self.window(record_bytes)).min(count);
        trace!("read-ahead fetching records {index}..{end}");
        self.buffered = Some(index..end);
        self.stats.misses += 1;
        false
    }
}
