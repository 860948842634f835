//! Startup-time adapter registry.
//!
//! Configured adapter identifiers map to constructor functions taking the
//! connection config; there is no runtime code loading. An unregistered
//! identifier is a configuration fault, fatal only for the partition being
//! loaded.

use std::collections::HashMap;

use crate::errors::SourceError;

use super::{ConnectionConfig, SourceAdapter};

type Constructor = fn(&ConnectionConfig) -> Result<Box<dyn SourceAdapter>, SourceError>;

/// Identifier → constructor registry for backend adapters.
pub struct AdapterRegistry {
    constructors: HashMap<String, Constructor>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry with the built-in adapters registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_| Ok(Box::new(super::memory::MemoryAdapter::new())));
        registry.register("sql", |config| {
            Ok(Box::new(super::sql::SqlAdapter::open(config)?))
        });
        registry.register("ldap", |config| {
            Ok(Box::new(super::ldap::LdapAdapter::new(config)?))
        });
        registry
    }

    pub fn register(&mut self, identifier: &str, constructor: Constructor) {
        self.constructors.insert(identifier.to_string(), constructor);
    }

    /// Instantiate an adapter for a connection.
    pub fn create(&self, config: &ConnectionConfig) -> Result<Box<dyn SourceAdapter>, SourceError> {
        let ctor = self
            .constructors
            .get(&config.adapter)
            .ok_or_else(|| SourceError::UndefinedAdapter(config.adapter.clone()))?;
        ctor(config)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_unknown_adapter_is_config_fault() {
        let registry = AdapterRegistry::with_defaults();
        let config = ConnectionConfig {
            name: "c1".into(),
            adapter: "jdbc".into(),
            parameters: BTreeMap::new(),
        };
        let err = registry.create(&config).err().unwrap();
        assert!(matches!(err, SourceError::UndefinedAdapter(_)));
    }

    #[test]
    fn test_memory_adapter_registered() {
        let registry = AdapterRegistry::with_defaults();
        let config = ConnectionConfig {
            name: "c1".into(),
            adapter: "memory".into(),
            parameters: BTreeMap::new(),
        };
        assert!(registry.create(&config).is_ok());
    }
}
