//! [PartitionBackend] implementation reading one JSON file per partition.
//!
//! A partition file looks like:
//!
//! ```json
//! {
//!   "tables": {
//!     "events": {
//!       "columns": [{ "name": "id", "type": "int64" }],
//!       "rows": [[0], [1], [2]]
//!     }
//!   }
//! }
//! ```
//!
//! The file is decoded in full when the partition is opened.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

use serde::Deserialize;
use tracing::debug;

use crate::{
    error::StorageError,
    memory_impl::{MemoryTable, TableHandle},
    value::{DataType, TypeInfo, Value},
    BackendConfig, PartitionBackend, PartitionBackendFactory, PartitionHandle,
};

/// Scheme prefix accepted (and stripped) in locations.
const FILE_SCHEME: &str = "file://";

#[derive(Deserialize)]
struct JsonPartition {
    tables: BTreeMap<String, JsonTable>,
}

#[derive(Deserialize)]
struct JsonTable {
    columns: Vec<JsonColumn>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    packet_size: u32,
}

#[derive(Deserialize)]
struct JsonColumn {
    name: String,
    #[serde(rename = "type")]
    kind: DataType,
    #[serde(default)]
    class_name: Option<String>,
}

/// Reads partitions from JSON files, resolving relative locations against
/// an optional base directory.
#[derive(Debug, Default)]
pub struct JsonBackend {
    base: Option<PathBuf>,
}

impl JsonBackend {
    pub fn new(base: Option<PathBuf>) -> Self {
        Self { base }
    }

    fn path(&self, resource: &str) -> PathBuf {
        // The query, if any, has no meaning for local files.
        let resource = resource.split('?').next().unwrap_or(resource);
        let resource = resource.strip_prefix(FILE_SCHEME).unwrap_or(resource);
        match &self.base {
            Some(base) if Path::new(resource).is_relative() => base.join(resource),
            _ => PathBuf::from(resource),
        }
    }

    fn decode(resource: &str, table: &str, bytes: &[u8]) -> Result<MemoryTable, StorageError> {
        let corrupt = |message: String| StorageError::Corrupt {
            location: resource.to_owned(),
            message,
        };
        let mut partition: JsonPartition =
            serde_json::from_slice(bytes).map_err(|error| corrupt(error.to_string()))?;
        let data = partition
            .tables
            .remove(table)
            .ok_or_else(|| StorageError::TableNotFound {
                location: resource.to_owned(),
                table: table.to_owned(),
            })?;

        let kinds: Vec<DataType> = data.columns.iter().map(|column| column.kind).collect();
        let mut decoded = MemoryTable::new(data.columns.into_iter().map(|column| {
            let type_info = TypeInfo {
                class_name: column.class_name,
                kind: column.kind,
                is_pointer: false,
            };
            (column.name, type_info)
        }))
        .with_packet_size(data.packet_size);
        for (n, row) in data.rows.iter().enumerate() {
            let row = row
                .iter()
                .zip(&kinds)
                .map(|(json, kind)| Value::from_json(json, *kind))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|message| corrupt(format!("row {n}: {message}")))?;
            decoded.push_row(row);
        }
        Ok(decoded)
    }
}

impl PartitionBackend for JsonBackend {
    fn open(&self, resource: &str, table: &str) -> Result<Box<dyn PartitionHandle>, StorageError> {
        let path = self.path(resource);
        let bytes = fs::read(&path).map_err(|error| match error.kind() {
            ErrorKind::NotFound => StorageError::NotFound(resource.to_owned()),
            _ => error.into(),
        })?;
        let data = Self::decode(resource, table, &bytes)?;
        debug!(
            "opened {}#{table}: {} record(s)",
            path.display(),
            data.len()
        );
        Ok(Box::new(TableHandle::new(
            resource,
            table,
            Arc::new(data),
            None,
        )))
    }

    fn locate(&self, resource: &str) -> Result<String, StorageError> {
        let path = self.path(resource);
        match fs::canonicalize(&path) {
            Ok(path) => Ok(path.display().to_string()),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(resource.to_owned()))
            }
            Err(error) => Err(error.into()),
        }
    }
}

struct JsonBackendFactory;

impl PartitionBackendFactory for JsonBackendFactory {
    fn backend(&self) -> &'static str {
        "json"
    }

    fn create(&self, config: &BackendConfig) -> Result<Rc<dyn PartitionBackend>, StorageError> {
        match config {
            BackendConfig::Json { base } => Ok(Rc::new(JsonBackend::new(base.clone()))),
            _ => Err(StorageError::BackendNotSupported(config.name().to_string())),
        }
    }
}

inventory::submit! {
    &JsonBackendFactory as &dyn PartitionBackendFactory
}
