//! TOML-based configuration for VirtDir.
//!
//! The server config carries daemon-level settings and the cache tuning;
//! each partition is its own TOML file inside `partitions_dir`. Sensitive
//! connection parameters are stored as `*_env` keys naming environment
//! variables and resolved at load time via
//! [`PartitionConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheConfig;
use crate::entry::Dn;
use crate::errors::ConfigError;
use crate::mapping::{
    AttributeMapping, EntryDefinition, ProxyTarget, Relationship, SourceMapping,
};
use crate::source::{ConnectionConfig, SourceConfig};

// ---------------------------------------------------------------------------
// Server config
// ---------------------------------------------------------------------------

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Cache tuning, one sub-table per cache instance.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Subtrees the built-in ACL marks read-only.
    #[serde(default)]
    pub read_only_subtrees: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            cache: CacheSettings::default(),
            read_only_subtrees: Vec::new(),
        }
    }
}

/// Daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding one TOML file per partition.
    #[serde(default = "default_partitions_dir")]
    pub partitions_dir: PathBuf,

    /// Concurrent backend work permits.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Bounded wait for per-source locks, in seconds.
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_partitions_dir() -> PathBuf {
    PathBuf::from("/etc/virtdir/partitions")
}
fn default_worker_threads() -> usize {
    crate::pool::DEFAULT_WORKERS
}
fn default_lock_wait_secs() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            partitions_dir: default_partitions_dir(),
            worker_threads: default_worker_threads(),
            lock_wait_secs: default_lock_wait_secs(),
        }
    }
}

/// The three cache instances' settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// DN → partition / entry-mapping routing cache.
    #[serde(default = "routing_default")]
    pub routing: CacheConfig,

    /// DN → resolved entry cache.
    #[serde(default)]
    pub entries: CacheConfig,

    /// Primary key → backend row cache.
    #[serde(default)]
    pub rows: CacheConfig,
}

fn routing_default() -> CacheConfig {
    // Routing decisions are tiny; a small cache captures the hot DNs.
    CacheConfig {
        capacity: 20,
        ttl_minutes: 10,
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            routing: routing_default(),
            entries: CacheConfig::default(),
            rows: CacheConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load a [`ServerConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading server configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        debug!("server configuration parsed");
        Ok(config)
    }

    /// Validate field sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.worker_threads".into(),
                detail: "worker pool must have at least one permit".into(),
            });
        }
        if self.daemon.lock_wait_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.lock_wait_secs".into(),
                detail: "lock wait must be > 0".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Partition config
// ---------------------------------------------------------------------------

/// One partition: its namespace slice, backend bindings, and mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,

    /// Disabled partitions are loaded but never started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

fn default_enabled() -> bool {
    true
}

/// One entry mapping as written in a partition file, addressed by full DN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub dn: String,

    #[serde(default)]
    pub object_classes: Vec<String>,

    #[serde(default)]
    pub attributes: Vec<AttributeMapping>,

    #[serde(default)]
    pub sources: Vec<SourceMapping>,

    #[serde(default)]
    pub relationships: Vec<Relationship>,

    #[serde(default)]
    pub proxy: Option<ProxyTarget>,
}

impl EntryConfig {
    /// Parse the configured DN.
    pub fn parse_dn(&self) -> Result<Dn, ConfigError> {
        Dn::parse(&self.dn).map_err(|e| ConfigError::InvalidValue {
            field: "entries.dn".into(),
            detail: e.to_string(),
        })
    }

    /// Convert into an arena definition rooted at `dn`.
    pub fn definition(&self, dn: &Dn) -> EntryDefinition {
        let mut definition = EntryDefinition::from_full_dn(dn);
        definition.object_classes = self.object_classes.clone();
        definition.attributes = self.attributes.clone();
        definition.sources = self.sources.clone();
        definition.relationships = self.relationships.clone();
        definition.proxy = self.proxy.clone();
        definition
    }
}

impl PartitionConfig {
    /// Load a [`PartitionConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading partition configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: PartitionConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config)
    }

    /// Resolve `*_env` connection parameters from the environment. A
    /// missing variable logs a warning; the unresolved key is kept so
    /// validation can decide whether it was required.
    pub fn resolve_env_vars(&mut self) {
        for connection in &mut self.connections {
            let env_keys: Vec<String> = connection
                .parameters
                .keys()
                .filter(|k| k.ends_with("_env"))
                .cloned()
                .collect();
            for key in env_keys {
                let var = connection.parameters[&key].clone();
                let target = key.trim_end_matches("_env").to_string();
                match std::env::var(&var) {
                    Ok(value) if !value.is_empty() => {
                        debug!(connection = %connection.name, key = %target, "resolved env var");
                        connection.parameters.insert(target, value);
                    }
                    _ => {
                        warn!(connection = %connection.name, var = %var, "env var not set");
                    }
                }
            }
        }
    }

    /// Validate cross-references: sources must name defined connections,
    /// entry source mappings must name defined sources, DNs must parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".into(),
                detail: "partition name must not be empty".into(),
            });
        }
        for source in &self.sources {
            if !self.connections.iter().any(|c| c.name == source.connection) {
                return Err(ConfigError::InvalidValue {
                    field: format!("sources.{}.connection", source.name),
                    detail: format!("undefined connection '{}'", source.connection),
                });
            }
        }
        for entry in &self.entries {
            entry.parse_dn()?;
            for mapping in &entry.sources {
                if !self.sources.iter().any(|s| s.name == mapping.source) {
                    return Err(ConfigError::InvalidValue {
                        field: format!("entries.{}.sources", entry.dn),
                        detail: format!("undefined source '{}'", mapping.source),
                    });
                }
            }
            if let Some(proxy) = &entry.proxy {
                if !self.connections.iter().any(|c| c.name == proxy.connection) {
                    return Err(ConfigError::InvalidValue {
                        field: format!("entries.{}.proxy", entry.dn),
                        detail: format!("undefined connection '{}'", proxy.connection),
                    });
                }
            }
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_partition_toml() -> &'static str {
        r#"
name = "example"
enabled = true

[[connections]]
name = "db"
adapter = "sql"
[connections.parameters]
path = ":memory:"

[[sources]]
name = "groups"
connection = "db"
fields = [
    { name = "name", primary_key = true },
    { name = "description" },
]
[sources.parameters]
table = "groups"

[[entries]]
dn = "dc=example,dc=com"
object_classes = ["dcObject"]
[[entries.attributes]]
name = "dc"
rdn = true
value = { constant = "example" }

[[entries]]
dn = "ou=Groups,dc=example,dc=com"
object_classes = ["organizationalUnit"]
[[entries.attributes]]
name = "ou"
rdn = true
value = { constant = "Groups" }

[[entries]]
dn = "cn=...,ou=Groups,dc=example,dc=com"
object_classes = ["groupOfNames"]
[[entries.attributes]]
name = "cn"
rdn = true
value = { variable = "g.name" }
[[entries.attributes]]
name = "description"
value = { variable = "g.description" }
[[entries.sources]]
alias = "g"
source = "groups"
[[entries.sources.fields]]
name = "name"
primary_key = true
value = { variable = "rdn.cn" }
"#
    }

    #[test]
    fn test_parse_partition() {
        let config: PartitionConfig = toml::from_str(sample_partition_toml()).unwrap();
        assert_eq!(config.name, "example");
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.entries.len(), 3);
        assert!(config.validate().is_ok());

        let dynamic = &config.entries[2];
        assert_eq!(dynamic.sources[0].alias, "g");
        assert!(dynamic.sources[0].fields[0].primary_key);
    }

    #[test]
    fn test_validate_rejects_undefined_connection() {
        let mut config: PartitionConfig = toml::from_str(sample_partition_toml()).unwrap();
        config.sources[0].connection = "missing".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_undefined_source() {
        let mut config: PartitionConfig = toml::from_str(sample_partition_toml()).unwrap();
        config.entries[2].sources[0].source = "missing".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("VIRTDIR_TEST_BIND_PW", "s3cret");
        let mut config: PartitionConfig = toml::from_str(
            r#"
name = "p"
[[connections]]
name = "dir"
adapter = "ldap"
[connections.parameters]
url = "ldap://localhost"
bind_password_env = "VIRTDIR_TEST_BIND_PW"
"#,
        )
        .unwrap();
        config.resolve_env_vars();
        assert_eq!(
            config.connections[0].parameter("bind_password"),
            Some("s3cret")
        );
        std::env::remove_var("VIRTDIR_TEST_BIND_PW");
    }

    #[test]
    fn test_server_config_defaults_and_load() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.worker_threads, 20);
        assert_eq!(config.cache.routing.capacity, 20);
        assert!(config.validate().is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"[daemon]\nlog_level = \"debug\"\n").unwrap();
        let loaded = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = PartitionConfig::load_from_file("/nonexistent/partition.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
