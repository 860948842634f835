//! Partitions and their lifecycle.
//!
//! A [`Partition`] owns one namespace slice: its entry-mapping arena, the
//! analyzed join graphs, and the backend connections serving it. The
//! [`PartitionManager`] loads partition configs from a directory, starts
//! and stops them independently, routes DNs, and exposes the management
//! surface for entry mappings. A partition that fails to load or start is
//! fatal only for itself, never for the server.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::analyzer::{Analyzer, SourceGraph};
use crate::cache::CacheConfig;
use crate::config::PartitionConfig;
use crate::entry::Dn;
use crate::errors::{MappingError, PartitionError, SourceError};
use crate::mapping::{Directory, EntryDefinition, EntryId};
use crate::router::Router;
use crate::source::{AdapterRegistry, Connection, SourceConfig};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl std::fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// One independently startable namespace slice.
pub struct Partition {
    config: PartitionConfig,
    status: RwLock<PartitionStatus>,
    directory: RwLock<Directory>,
    analyzer: RwLock<Analyzer>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Partition {
    /// Build a partition from its config, composing the entry tree.
    pub fn from_config(config: PartitionConfig) -> Result<Self, PartitionError> {
        let mut directory = Directory::new();

        // Insert entries parents-first so children can attach by DN.
        let mut entries: Vec<(Dn, usize)> = Vec::new();
        for (index, entry) in config.entries.iter().enumerate() {
            entries.push((entry.parse_dn().map_err(PartitionError::Config)?, index));
        }
        entries.sort_by_key(|(dn, _)| dn.depth());

        for (dn, index) in entries {
            let entry_config = &config.entries[index];
            let parent = dn
                .parent()
                .filter(|p| !p.is_root())
                .map(|p| directory.find_by_dn(&p))
                .and_then(|ids| ids.first().copied());
            let definition = match parent {
                Some(_) => {
                    let mut definition =
                        EntryDefinition::new(dn.rdn().map(|r| r.to_string()).unwrap_or_default());
                    definition.object_classes = entry_config.object_classes.clone();
                    definition.attributes = entry_config.attributes.clone();
                    definition.sources = entry_config.sources.clone();
                    definition.relationships = entry_config.relationships.clone();
                    definition.proxy = entry_config.proxy.clone();
                    definition
                }
                None => entry_config.definition(&dn),
            };
            directory
                .add_entry(parent, definition)
                .map_err(PartitionError::Mapping)?;
        }

        Ok(Self {
            config,
            status: RwLock::new(PartitionStatus::Stopped),
            directory: RwLock::new(directory),
            analyzer: RwLock::new(Analyzer::new()),
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn status(&self) -> PartitionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: PartitionStatus) {
        *self.status.write() = status;
    }

    /// Read access to the entry arena. Structural mutation goes through
    /// the management operations, which take the write side.
    pub fn directory(&self) -> RwLockReadGuard<'_, Directory> {
        self.directory.read()
    }

    /// DNs of the partition's root entry mappings.
    pub fn root_dns(&self) -> Vec<String> {
        self.directory
            .read()
            .roots()
            .map(|e| e.dn.to_string())
            .collect()
    }

    pub fn source_config(&self, name: &str) -> Option<SourceConfig> {
        self.config.source(name).cloned()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(name).cloned()
    }

    /// The analyzed join graph for an entry. Mappings created after start
    /// are analyzed on first use; results stay memoized until reload.
    pub fn graph_for(&self, id: EntryId) -> Result<Arc<SourceGraph>, MappingError> {
        if let Some(graph) = self.analyzer.read().graph(id) {
            return Ok(graph);
        }
        let directory = self.directory.read();
        self.analyzer.write().analyze(&directory, id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn start(&self, registry: &AdapterRegistry, lock_wait: Duration) -> Result<(), PartitionError> {
        info!(partition = %self.name(), "starting partition");
        self.set_status(PartitionStatus::Starting);

        let result = self.start_inner(registry, lock_wait);
        match &result {
            Ok(()) => {
                self.set_status(PartitionStatus::Started);
                info!(partition = %self.name(), "partition started");
            }
            Err(e) => {
                self.set_status(PartitionStatus::Stopped);
                error!(partition = %self.name(), error = %e, "partition start failed");
            }
        }
        result
    }

    fn start_inner(
        &self,
        registry: &AdapterRegistry,
        lock_wait: Duration,
    ) -> Result<(), PartitionError> {
        // Analyze the whole tree up front; the graphs are read lock-free
        // as memoized Arcs afterwards.
        {
            let directory = self.directory.read();
            self.analyzer
                .write()
                .analyze_all(&directory)
                .map_err(PartitionError::Mapping)?;
        }

        // Bring up connections through the adapter registry.
        let mut connections = HashMap::new();
        for connection_config in &self.config.connections {
            let adapter = registry
                .create(connection_config)
                .map_err(PartitionError::Source)?;
            let connection =
                Connection::new(connection_config.clone(), adapter).with_lock_wait(lock_wait);
            connections.insert(connection_config.name.clone(), Arc::new(connection));
        }

        // Initialize every source against its connection.
        for source in &self.config.sources {
            let connection = connections.get(&source.connection).ok_or_else(|| {
                PartitionError::Source(SourceError::UndefinedConnection {
                    source_name: source.name.clone(),
                    connection: source.connection.clone(),
                })
            })?;
            connection
                .adapter()
                .init(source)
                .map_err(PartitionError::Source)?;
        }

        *self.connections.write() = connections;
        Ok(())
    }

    fn stop(&self) {
        info!(partition = %self.name(), "stopping partition");
        self.set_status(PartitionStatus::Stopping);
        self.connections.write().clear();
        self.analyzer.write().invalidate();
        self.set_status(PartitionStatus::Stopped);
        info!(partition = %self.name(), "partition stopped");
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every partition plus the router and the adapter registry.
pub struct PartitionManager {
    partitions: RwLock<BTreeMap<String, Arc<Partition>>>,
    registry: AdapterRegistry,
    router: Router,
    lock_wait: Duration,
}

impl PartitionManager {
    pub fn new(registry: AdapterRegistry, routing_cache: &CacheConfig) -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            registry,
            router: Router::new(routing_cache),
            lock_wait: Duration::from_secs(10),
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Load every `*.toml` partition file in a directory. A partition that
    /// fails to load is skipped with an error log; the rest proceed.
    pub fn load_partitions<P: AsRef<Path>>(&self, dir: P) -> Result<(), PartitionError> {
        let dir = dir.as_ref();
        info!(dir = %dir.display(), "loading partitions");
        let read = std::fs::read_dir(dir).map_err(|e| PartitionError::LoadFailed {
            name: dir.display().to_string(),
            detail: e.to_string(),
        })?;

        for dir_entry in read.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match PartitionConfig::load_and_resolve(&path) {
                Ok(config) => {
                    let name = config.name.clone();
                    if let Err(e) = self.add_partition(config) {
                        error!(partition = %name, error = %e, "failed to load partition");
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to read partition file");
                }
            }
        }
        Ok(())
    }

    /// Add a partition from its config, in `stopped` state.
    pub fn add_partition(&self, config: PartitionConfig) -> Result<Arc<Partition>, PartitionError> {
        config.validate().map_err(PartitionError::Config)?;
        let name = config.name.clone();
        let partition = Arc::new(Partition::from_config(config).map_err(|e| {
            PartitionError::LoadFailed {
                name: name.clone(),
                detail: e.to_string(),
            }
        })?);
        self.partitions
            .write()
            .insert(name, partition.clone());
        self.router.invalidate();
        Ok(partition)
    }

    pub fn remove_partition(&self, name: &str) -> Option<Arc<Partition>> {
        let removed = self.partitions.write().remove(name);
        if removed.is_some() {
            self.router.invalidate();
        }
        removed
    }

    pub fn partition(&self, name: &str) -> Option<Arc<Partition>> {
        self.partitions.read().get(name).cloned()
    }

    /// Snapshot of all partitions, name-ordered.
    pub fn partitions(&self) -> BTreeMap<String, Arc<Partition>> {
        self.partitions.read().clone()
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Lifecycle status of one partition.
    pub fn status(&self, name: &str) -> Result<PartitionStatus, PartitionError> {
        self.partition(name)
            .map(|p| p.status())
            .ok_or_else(|| PartitionError::NotFound(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start every enabled partition. Failures are isolated per partition.
    pub fn start_all(&self) {
        for (name, partition) in self.partitions() {
            if !partition.is_enabled() {
                info!(partition = %name, "skipping disabled partition");
                continue;
            }
            if let Err(e) = partition.start(&self.registry, self.lock_wait) {
                warn!(partition = %name, error = %e, "partition failed to start");
            }
        }
    }

    pub fn start(&self, name: &str) -> Result<(), PartitionError> {
        let partition = self
            .partition(name)
            .ok_or_else(|| PartitionError::NotFound(name.to_string()))?;
        partition.start(&self.registry, self.lock_wait)
    }

    pub fn stop(&self, name: &str) -> Result<(), PartitionError> {
        let partition = self
            .partition(name)
            .ok_or_else(|| PartitionError::NotFound(name.to_string()))?;
        partition.stop();
        self.router.invalidate();
        Ok(())
    }

    pub fn stop_all(&self) {
        for partition in self.partitions().values() {
            if partition.status() == PartitionStatus::Started {
                partition.stop();
            }
        }
        self.router.invalidate();
    }

    pub fn restart(&self, name: &str) -> Result<(), PartitionError> {
        self.stop(name)?;
        self.start(name)
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Resolve a DN to the closest started partition.
    pub fn partition_by_dn(&self, dn: &Dn) -> Option<Arc<Partition>> {
        let partitions = self.partitions();
        self.router.partition_by_dn(&partitions, dn)
    }

    /// Resolve a DN to its matching entry mappings within a partition.
    pub fn find_entry_mappings(&self, partition: &Partition, dn: &Dn) -> Vec<EntryId> {
        self.router.find_entry_mappings(partition, dn)
    }

    // -----------------------------------------------------------------------
    // Management surface
    // -----------------------------------------------------------------------

    /// Create an entry mapping under `parent` (or as a root).
    pub fn create_entry_mapping(
        &self,
        partition_name: &str,
        parent: Option<EntryId>,
        definition: EntryDefinition,
    ) -> Result<EntryId, PartitionError> {
        let partition = self
            .partition(partition_name)
            .ok_or_else(|| PartitionError::NotFound(partition_name.to_string()))?;
        let id = partition
            .directory
            .write()
            .add_entry(parent, definition)
            .map_err(PartitionError::Mapping)?;
        self.router.invalidate();
        Ok(id)
    }

    /// Replace an entry mapping's rules.
    pub fn update_entry_mapping(
        &self,
        partition_name: &str,
        id: EntryId,
        definition: EntryDefinition,
    ) -> Result<(), PartitionError> {
        let partition = self
            .partition(partition_name)
            .ok_or_else(|| PartitionError::NotFound(partition_name.to_string()))?;
        partition
            .directory
            .write()
            .update_entry(id, definition)
            .map_err(PartitionError::Mapping)?;
        // The memoized graph no longer reflects the mapping.
        partition.analyzer.write().invalidate();
        self.router.invalidate();
        Ok(())
    }

    /// Remove a leaf entry mapping.
    pub fn remove_entry_mapping(
        &self,
        partition_name: &str,
        id: EntryId,
    ) -> Result<(), PartitionError> {
        let partition = self
            .partition(partition_name)
            .ok_or_else(|| PartitionError::NotFound(partition_name.to_string()))?;
        partition
            .directory
            .write()
            .remove_entry(id)
            .map_err(PartitionError::Mapping)?;
        self.router.invalidate();
        Ok(())
    }

    /// All entry ids in a partition, sorted.
    pub fn list_entry_ids(&self, partition_name: &str) -> Result<Vec<EntryId>, PartitionError> {
        let partition = self
            .partition(partition_name)
            .ok_or_else(|| PartitionError::NotFound(partition_name.to_string()))?;
        let ids = partition.directory.read().ids();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::AttributeMapping;

    fn partition_config(name: &str, suffix: &str) -> PartitionConfig {
        let toml = format!(
            r#"
name = "{name}"

[[connections]]
name = "mem"
adapter = "memory"

[[entries]]
dn = "{suffix}"
object_classes = ["top"]
"#
        );
        toml::from_str(&toml).unwrap()
    }

    fn manager() -> PartitionManager {
        PartitionManager::new(AdapterRegistry::with_defaults(), &CacheConfig::default())
    }

    #[test]
    fn test_add_start_stop() {
        let manager = manager();
        manager
            .add_partition(partition_config("example", "dc=example,dc=com"))
            .unwrap();

        assert_eq!(
            manager.status("example").unwrap(),
            PartitionStatus::Stopped
        );
        manager.start("example").unwrap();
        assert_eq!(
            manager.status("example").unwrap(),
            PartitionStatus::Started
        );
        manager.stop("example").unwrap();
        assert_eq!(
            manager.status("example").unwrap(),
            PartitionStatus::Stopped
        );
    }

    #[test]
    fn test_unknown_partition_status() {
        let manager = manager();
        assert!(matches!(
            manager.status("nope"),
            Err(PartitionError::NotFound(_))
        ));
    }

    #[test]
    fn test_undefined_adapter_fails_only_that_partition() {
        let manager = manager();
        let mut bad = partition_config("bad", "dc=bad");
        bad.connections[0].adapter = "jdbc".into();
        manager.add_partition(bad).unwrap();
        manager
            .add_partition(partition_config("good", "dc=good"))
            .unwrap();

        manager.start_all();
        assert_eq!(manager.status("bad").unwrap(), PartitionStatus::Stopped);
        assert_eq!(manager.status("good").unwrap(), PartitionStatus::Started);
    }

    #[test]
    fn test_longest_suffix_routing() {
        let manager = manager();
        manager
            .add_partition(partition_config("wide", "dc=example,dc=com"))
            .unwrap();
        manager
            .add_partition(partition_config("people", "ou=people,dc=example,dc=com"))
            .unwrap();
        manager.start_all();

        let dn = Dn::parse("cn=x,ou=people,dc=example,dc=com").unwrap();
        let routed = manager.partition_by_dn(&dn).unwrap();
        assert_eq!(routed.name(), "people");

        let dn = Dn::parse("cn=x,ou=groups,dc=example,dc=com").unwrap();
        let routed = manager.partition_by_dn(&dn).unwrap();
        assert_eq!(routed.name(), "wide");

        let dn = Dn::parse("cn=x,dc=elsewhere,dc=org").unwrap();
        assert!(manager.partition_by_dn(&dn).is_none());
    }

    #[test]
    fn test_equal_suffix_tie_breaks_by_name() {
        let manager = manager();
        // Same root DN in two partitions; the lexicographically smaller
        // partition name must win deterministically.
        manager
            .add_partition(partition_config("beta", "dc=example,dc=com"))
            .unwrap();
        manager
            .add_partition(partition_config("alpha", "dc=example,dc=com"))
            .unwrap();
        manager.start_all();

        let dn = Dn::parse("cn=x,dc=example,dc=com").unwrap();
        let routed = manager.partition_by_dn(&dn).unwrap();
        assert_eq!(routed.name(), "alpha");
    }

    #[test]
    fn test_stopped_partition_not_routed() {
        let manager = manager();
        manager
            .add_partition(partition_config("example", "dc=example,dc=com"))
            .unwrap();
        // Never started.
        let dn = Dn::parse("cn=x,dc=example,dc=com").unwrap();
        assert!(manager.partition_by_dn(&dn).is_none());
    }

    #[test]
    fn test_management_roundtrip() {
        let manager = manager();
        manager
            .add_partition(partition_config("example", "dc=example,dc=com"))
            .unwrap();
        manager.start("example").unwrap();

        let partition = manager.partition("example").unwrap();
        let root = partition.directory().roots().next().unwrap().id;

        let def = EntryDefinition::new("ou=Test")
            .object_class("organizationalUnit")
            .attribute(AttributeMapping::constant("ou", "Test", true));
        let id = manager
            .create_entry_mapping("example", Some(root), def)
            .unwrap();

        let ids = manager.list_entry_ids("example").unwrap();
        assert!(ids.contains(&id));

        let dn = Dn::parse("ou=Test,dc=example,dc=com").unwrap();
        let found = manager.find_entry_mappings(&partition, &dn);
        assert_eq!(found, vec![id]);

        manager.remove_entry_mapping("example", id).unwrap();
        assert!(!manager.list_entry_ids("example").unwrap().contains(&id));
        // Removal refuses on the root while it had children, but now the
        // root is a leaf again and removable.
        manager.remove_entry_mapping("example", root).unwrap();
    }

    #[test]
    fn test_find_entry_mappings_dynamic_child() {
        let manager = manager();
        let mut config = partition_config("example", "dc=example,dc=com");
        config.entries.push(
            toml::from_str(
                r#"
dn = "cn=...,dc=example,dc=com"
[[attributes]]
name = "cn"
rdn = true
value = { variable = "g.name" }
[[sources]]
alias = "g"
source = "groups"
"#,
            )
            .unwrap(),
        );
        config.sources.push(
            toml::from_str(
                r#"
name = "groups"
connection = "mem"
fields = [{ name = "name", primary_key = true }]
"#,
            )
            .unwrap(),
        );
        manager.add_partition(config).unwrap();
        manager.start("example").unwrap();

        let partition = manager.partition("example").unwrap();
        let dn = Dn::parse("cn=anything,dc=example,dc=com").unwrap();
        let found = manager.find_entry_mappings(&partition, &dn);
        assert_eq!(found.len(), 1);

        let miss = Dn::parse("uid=anything,dc=example,dc=com").unwrap();
        assert!(manager.find_entry_mappings(&partition, &miss).is_empty());
    }
}
