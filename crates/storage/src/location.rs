//! Parsing of partition location strings.
//!
//! Accepted forms:
//!
//! - `scheme://host/path[?query][#table]`
//! - `path[?[query][#table]]`, e.g. `runs/a.json?#events`
//! - the legacy `path.ext/table` form, where `.ext` is one of
//!   [`LEGACY_EXTENSIONS`].
//!
//! A `#fragment` that is not preceded by a `?` stays part of the path, and a
//! fragment that contains `=` is treated as part of the query.

use url::Url;

use crate::error::StorageError;

/// File extensions after which a `/table` suffix names the table.
pub const LEGACY_EXTENSIONS: &[&str] = &[".json", ".part"];

/// A partition location split into its components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionLocation {
    /// Location of the partition, without query or table name.
    pub uri: String,
    /// Query string, without the leading `?`.
    pub query: Option<String>,
    /// Table named inside the location, if any.
    pub table: Option<String>,
}

impl PartitionLocation {
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidLocation(name.to_string());
        if name.trim().is_empty() {
            return Err(invalid());
        }

        let (mut uri, query, fragment) = if name.contains("://") {
            let mut url = Url::parse(name).map_err(|_| invalid())?;
            let query = url.query().map(str::to_owned);
            let fragment = url.fragment().map(str::to_owned);
            url.set_query(None);
            url.set_fragment(None);
            (url.to_string(), query, fragment)
        } else {
            match name.split_once('?') {
                Some((path, rest)) => {
                    let (query, fragment) = match rest.split_once('#') {
                        Some((query, fragment)) => (query, Some(fragment.to_owned())),
                        None => (rest, None),
                    };
                    (path.to_owned(), Some(query.to_owned()), fragment)
                }
                None => (name.to_owned(), None, None),
            }
        };
        if uri.is_empty() {
            return Err(invalid());
        }

        let mut query = query;
        let mut table = None;
        match (fragment, query.as_mut()) {
            (Some(fragment), Some(query)) if fragment.contains('=') => {
                query.push('#');
                query.push_str(&fragment);
            }
            (Some(fragment), Some(_)) => table = Some(fragment),
            (Some(fragment), None) => {
                uri.push('#');
                uri.push_str(&fragment);
            }
            (None, _) => (),
        }
        let query = query.filter(|q| !q.is_empty());
        let table = table.filter(|t| !t.is_empty());

        let (uri, table) = match table {
            Some(table) => (uri, Some(table)),
            None => split_legacy_table(uri),
        };

        Ok(Self { uri, query, table })
    }

    /// The string handed to a backend to open the partition: the URI plus
    /// the query, if any.
    pub fn resource(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.uri, query),
            None => self.uri.clone(),
        }
    }
}

fn split_legacy_table(uri: String) -> (String, Option<String>) {
    let split = LEGACY_EXTENSIONS
        .iter()
        .filter_map(|ext| uri.rfind(ext).map(|pos| pos + ext.len()))
        .max()
        .filter(|&end| uri[end..].starts_with('/') && uri.len() > end + 1);
    match split {
        Some(end) => {
            let table = uri[end + 1..].to_owned();
            let mut uri = uri;
            uri.truncate(end);
            (uri, Some(table))
        }
        None => (uri, None),
    }
}
