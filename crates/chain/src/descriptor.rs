use std::fmt::{self, Display};

use serde::Serialize;

/// Result of the last attempt to open a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoadOutcome {
    Ok,
    OpenFailed,
    TableMissing,
    Other,
}

impl Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadOutcome::Ok => "ok",
            LoadOutcome::OpenFailed => "open failed",
            LoadOutcome::TableMissing => "table missing",
            LoadOutcome::Other => "failed",
        })
    }
}

/// Record count supplied when a partition is appended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeclaredCount {
    /// Not known; discovered when the partition is first opened.
    #[default]
    Unknown,

    /// Trusted without opening the partition.  A wrong count is only noticed
    /// when the partition is opened.
    Exact(u64),

    /// Open the partition now to read the count.  A partition that cannot
    /// be opened is not appended.
    Probe,
}

/// One partition of a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    pub(crate) table_name: String,
    pub(crate) location: String,
    pub(crate) resolved_location: Option<String>,
    pub(crate) record_count: Option<u64>,
    pub(crate) packet_size: u32,
    pub(crate) last_outcome: Option<LoadOutcome>,
    pub(crate) looked_up: bool,
}

impl PartitionDescriptor {
    pub(crate) fn new(
        location: impl Into<String>,
        table_name: impl Into<String>,
        record_count: Option<u64>,
        packet_size: u32,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            location: location.into(),
            resolved_location: None,
            record_count,
            packet_size,
            last_outcome: None,
            looked_up: false,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Location as appended.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Location found by [`Chain::lookup`](crate::Chain::lookup), if it ran.
    pub fn resolved_location(&self) -> Option<&str> {
        self.resolved_location.as_deref()
    }

    /// Location the partition is opened from.
    pub fn resource(&self) -> &str {
        self.resolved_location.as_deref().unwrap_or(&self.location)
    }

    /// Record count, or `None` if not yet discovered.
    pub fn record_count(&self) -> Option<u64> {
        self.record_count
    }

    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Outcome of the last open, or `None` if never opened.
    pub fn last_outcome(&self) -> Option<LoadOutcome> {
        self.last_outcome
    }

    pub fn looked_up(&self) -> bool {
        self.looked_up
    }
}

impl Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}: ", self.table_name, self.resource())?;
        match self.record_count {
            Some(count) => write!(f, "{count} record(s)")?,
            None => f.write_str("unknown")?,
        }
        match self.last_outcome {
            Some(outcome) => write!(f, ", {outcome}"),
            None => f.write_str(", not loaded"),
        }
    }
}
