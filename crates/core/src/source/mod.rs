//! Backend sources: the adapter interface, the startup-time adapter
//! registry, and the per-connection lock discipline.
//!
//! A `Connection` owns one adapter instance plus one
//! multiple-readers/single-writer lock per source reached through it.
//! Searches take the read side, writes the write side, and acquisition is
//! bounded: a lock that cannot be obtained within the configured wait
//! fails the operation instead of blocking indefinitely.

pub mod ldap;
pub mod memory;
pub mod sql;

mod registry;

pub use registry::AdapterRegistry;

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::{Attributes, Modification};
use crate::errors::{ResultCode, SourceError};
use crate::filter::Filter;

/// Default bounded wait for source locks.
pub const LOCK_WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Primary-key value of one backend row: pk field → value, ordered by
/// field name so composite keys compare deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(BTreeMap<String, String>);

impl RowKey {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn single(field: impl Into<String>, value: impl Into<String>) -> Self {
        let mut key = Self::new();
        key.set(field, value);
        key
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(|s| s.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RowKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join("+"))
    }
}

/// One backend row: its primary key and its field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub values: Attributes,
}

impl Row {
    pub fn new(key: RowKey, values: Attributes) -> Self {
        Self { key, values }
    }

    /// Derive the key from the row's values and the source's pk fields.
    pub fn keyed(values: Attributes, config: &SourceConfig) -> Self {
        let mut key = RowKey::new();
        for field in config.primary_key_fields() {
            if let Some(value) = values.value(field) {
                key.set(field, value);
            }
        }
        Self { key, values }
    }
}

// ---------------------------------------------------------------------------
// Row streams
// ---------------------------------------------------------------------------

/// An ordered stream of rows from a backend search, sorted by primary key.
///
/// The consumer may stop early; dropping the stream releases any backend
/// cursor.
pub trait RowStream: Send {
    fn next_row(&mut self) -> Result<Option<Row>, SourceError>;
}

/// A fully buffered row stream.
pub struct VecRowStream {
    rows: std::vec::IntoIter<Row>,
}

impl VecRowStream {
    /// Build from rows, sorting them by key.
    pub fn sorted(mut rows: Vec<Row>) -> Self {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecRowStream {
    fn next_row(&mut self) -> Result<Option<Row>, SourceError> {
        Ok(self.rows.next())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One field of a source definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(default)]
    pub primary_key: bool,
}

/// A backend source definition within a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Name of the connection this source is reached through.
    pub connection: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    /// Adapter-specific parameters (table name, base DN, ...).
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn primary_key_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.as_str())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// A backend connection definition within a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    /// Registered adapter identifier (`memory`, `sql`, `ldap`, ...).
    pub adapter: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }
}

// ---------------------------------------------------------------------------
// Adapter interface
// ---------------------------------------------------------------------------

/// The interface every backend adapter satisfies.
///
/// Outcomes use the closed [`ResultCode`] set uniformly regardless of
/// backend kind; `Err` is reserved for transport-level failures.
pub trait SourceAdapter: Send + Sync {
    /// Validate and prepare a source definition. Called once per source at
    /// partition start.
    fn init(&self, source: &SourceConfig) -> Result<(), SourceError>;

    /// Search rows matching `filter`, ordered by primary key. A
    /// `size_limit` of 0 means unlimited.
    fn search(
        &self,
        source: &SourceConfig,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> Result<Box<dyn RowStream>, SourceError>;

    /// Fetch one row by primary key.
    fn get(&self, source: &SourceConfig, key: &RowKey) -> Result<Option<Row>, SourceError>;

    fn add(&self, source: &SourceConfig, row: &Row) -> Result<ResultCode, SourceError>;

    fn modify(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        changes: &[Modification],
    ) -> Result<ResultCode, SourceError>;

    fn delete(&self, source: &SourceConfig, key: &RowKey) -> Result<ResultCode, SourceError>;

    /// Authenticate against one row. The default refuses, for backends
    /// with no credential notion.
    fn bind(
        &self,
        _source: &SourceConfig,
        _key: &RowKey,
        _password: &str,
    ) -> Result<ResultCode, SourceError> {
        Ok(ResultCode::InvalidCredentials)
    }

    // -----------------------------------------------------------------------
    // DN-addressed proxy forwarding
    // -----------------------------------------------------------------------
    //
    // Proxy entry mappings bypass the join graph and forward operations
    // verbatim after a DN rewrite. Backends that cannot address entries by
    // DN keep the defaults and reject proxying.

    /// Search a remote subtree, returning `(dn, attributes)` pairs.
    fn proxy_search(
        &self,
        _base: &str,
        _scope: crate::entry::SearchScope,
        _filter: Option<&Filter>,
        _size_limit: usize,
    ) -> Result<Vec<(String, Attributes)>, SourceError> {
        Err(SourceError::ProxyUnsupported("search".into()))
    }

    fn proxy_add(&self, _dn: &str, _attributes: &Attributes) -> Result<ResultCode, SourceError> {
        Err(SourceError::ProxyUnsupported("add".into()))
    }

    fn proxy_modify(
        &self,
        _dn: &str,
        _changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        Err(SourceError::ProxyUnsupported("modify".into()))
    }

    fn proxy_delete(&self, _dn: &str) -> Result<ResultCode, SourceError> {
        Err(SourceError::ProxyUnsupported("delete".into()))
    }

    fn proxy_bind(&self, _dn: &str, _password: &str) -> Result<ResultCode, SourceError> {
        Err(SourceError::ProxyUnsupported("bind".into()))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One adapter instance plus the per-source lock table.
pub struct Connection {
    config: ConnectionConfig,
    adapter: Box<dyn SourceAdapter>,
    locks: parking_lot::Mutex<std::collections::HashMap<String, std::sync::Arc<RwLock<()>>>>,
    lock_wait: Duration,
}

impl Connection {
    pub fn new(config: ConnectionConfig, adapter: Box<dyn SourceAdapter>) -> Self {
        Self {
            config,
            adapter,
            locks: parking_lot::Mutex::new(std::collections::HashMap::new()),
            lock_wait: LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn adapter(&self) -> &dyn SourceAdapter {
        self.adapter.as_ref()
    }

    fn lock_for(&self, source: &str) -> std::sync::Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(source.to_string())
            .or_insert_with(|| std::sync::Arc::new(RwLock::new(())))
            .clone()
    }

    /// Run `f` under the source's read lock, failing after the bounded
    /// wait.
    pub fn with_read_lock<T>(
        &self,
        source: &SourceConfig,
        f: impl FnOnce(&dyn SourceAdapter) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let lock = self.lock_for(&source.name);
        let guard = lock
            .try_read_for(self.lock_wait)
            .ok_or_else(|| SourceError::LockTimeout {
                source_name: source.name.clone(),
                waited_ms: self.lock_wait.as_millis() as u64,
            })?;
        let result = f(self.adapter.as_ref());
        drop(guard);
        result
    }

    /// Run `f` under the source's write lock, failing after the bounded
    /// wait.
    pub fn with_write_lock<T>(
        &self,
        source: &SourceConfig,
        f: impl FnOnce(&dyn SourceAdapter) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let lock = self.lock_for(&source.name);
        let guard = lock
            .try_write_for(self.lock_wait)
            .ok_or_else(|| SourceError::LockTimeout {
                source_name: source.name.clone(),
                waited_ms: self.lock_wait.as_millis() as u64,
            })?;
        debug!(source = %source.name, connection = %self.config.name, "acquired write lock");
        let result = f(self.adapter.as_ref());
        drop(guard);
        result
    }
}
