use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// Default value of [`ChainConfig::global_registration`].
pub const fn default_global_registration() -> bool {
    true
}

/// Chain configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Table read from partitions that do not name one.
    ///
    /// Empty means the chain's own name.
    pub table_name: String,

    /// Size of the read-ahead cache, in bytes.
    ///
    /// When set, a cache is created with the first partition opened and
    /// carried over to the following partitions for as long as the size
    /// stays the same.
    pub cache_size: Option<u64>,

    /// Suggested number of records per unit of parallel work, copied into
    /// every partition descriptor.
    pub packet_size: u32,

    /// Whether open partitions are registered with the resource registry,
    /// so that they can be invalidated when the underlying resource goes
    /// away.
    #[serde(default = "default_global_registration")]
    pub global_registration: bool,

    /// Whether appending a partition without a record count opens it right
    /// away to read the count.
    pub probe_on_append: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            cache_size: None,
            packet_size: 0,
            global_registration: default_global_registration(),
            probe_on_append: false,
        }
    }
}

impl ChainConfig {
    pub fn from_json(s: &str) -> Result<Self, ChainError> {
        serde_json::from_str(s).map_err(|e| ChainError::InvalidConfig(e.to_string()))
    }

    pub fn with_table_name(self, table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..self
        }
    }

    pub fn with_cache_size(self, cache_size: Option<u64>) -> Self {
        Self { cache_size, ..self }
    }
}
