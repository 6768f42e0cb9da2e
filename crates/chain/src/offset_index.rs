//! Prefix sums over partition record counts.
//!
//! Boundary `i` is the global entry number of the first record of partition
//! `i`, and the last boundary is the total.  A partition whose count is not
//! known yet makes its end boundary, and every boundary after it, unknown.

use serde::Serialize;
use thiserror::Error;

/// Where a global entry number falls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locate {
    /// Inside partition `i`.
    Found(usize),

    /// At or past the start of partition `i`, whose count is unknown, so it
    /// cannot be placed until partition `i` is opened.
    Undiscovered(usize),

    /// Past the end of the last partition.
    OutOfRange,
}

/// The record counts add up to more entries than a `u64` can number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize)]
#[error("Record counts add up to more than {} entries.", u64::MAX)]
pub struct CountOverflow;

fn end_of(start: Option<u64>, count: Option<u64>) -> Result<Option<u64>, CountOverflow> {
    match (start, count) {
        (Some(start), Some(count)) => start.checked_add(count).map(Some).ok_or(CountOverflow),
        _ => Ok(None),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OffsetIndex {
    counts: Vec<Option<u64>>,
    boundaries: Vec<Option<u64>>,
}

impl Default for OffsetIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self {
            counts: Vec::new(),
            boundaries: vec![Some(0)],
        }
    }

    /// Builds an index over `counts`.
    pub fn from_counts(
        counts: impl IntoIterator<Item = Option<u64>>,
    ) -> Result<Self, CountOverflow> {
        let mut index = Self::new();
        for count in counts {
            index.append(count)?;
        }
        Ok(index)
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Appends a partition and returns its index.  Changes nothing on
    /// overflow.
    pub fn append(&mut self, count: Option<u64>) -> Result<usize, CountOverflow> {
        let end = end_of(self.total(), count)?;
        self.counts.push(count);
        self.boundaries.push(end);
        Ok(self.counts.len() - 1)
    }

    pub fn count(&self, partition: usize) -> Option<u64> {
        self.counts.get(partition).copied().flatten()
    }

    pub fn start(&self, partition: usize) -> Option<u64> {
        self.boundaries.get(partition).copied().flatten()
    }

    pub fn end(&self, partition: usize) -> Option<u64> {
        self.boundaries.get(partition + 1).copied().flatten()
    }

    /// Total record count, if every count is known.
    pub fn total(&self) -> Option<u64> {
        self.boundaries.last().copied().flatten()
    }

    /// Last known boundary: the number of records in the leading partitions
    /// whose counts are all known.
    pub fn known_total(&self) -> u64 {
        self.boundaries.iter().map_while(|b| *b).last().unwrap_or(0)
    }

    pub fn boundaries(&self) -> &[Option<u64>] {
        &self.boundaries
    }

    /// First partition whose count is unknown.
    pub fn first_unknown(&self) -> Option<usize> {
        self.counts.iter().position(Option::is_none)
    }

    /// Sets the count of `partition` to `count` and shifts the following
    /// boundaries.  Returns false, and changes nothing, if the count was
    /// already `count`.  Changes nothing on overflow either.
    pub fn repair(&mut self, partition: usize, count: u64) -> Result<bool, CountOverflow> {
        if self.counts[partition] == Some(count) {
            return Ok(false);
        }
        let mut boundaries = self.boundaries[..=partition].to_vec();
        for i in partition..self.counts.len() {
            let count = if i == partition {
                Some(count)
            } else {
                self.counts[i]
            };
            boundaries.push(end_of(boundaries[i], count)?);
        }
        self.counts[partition] = Some(count);
        self.boundaries = boundaries;
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.boundaries.truncate(1);
    }

    /// Finds the partition holding `entry`.
    ///
    /// The scan starts at `hint` (typically the partition read last) when
    /// that partition starts at or before `entry`, and at the first partition
    /// otherwise.  Empty partitions are stepped over.
    pub fn locate(&self, entry: u64, hint: Option<usize>) -> Locate {
        let first = hint
            .filter(|&h| self.start(h).is_some_and(|start| start <= entry))
            .unwrap_or(0);
        for i in first..self.counts.len() {
            match self.end(i) {
                Some(end) if entry < end => return Locate::Found(i),
                Some(_) => (),
                None => return Locate::Undiscovered(i),
            }
        }
        Locate::OutOfRange
    }
}
