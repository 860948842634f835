//! Submitted entry-mapping definitions.
//!
//! An [`EntryDefinition`] is what management operations and the partition
//! loader hand to the [`Directory`](super::Directory) arena: the relative
//! RDN plus the mapping rules. The arena assigns the id and composes the
//! full DN.

use serde::{Deserialize, Serialize};

use super::{AttributeMapping, ProxyTarget, Relationship, SourceMapping};
use crate::entry::{Dn, Rdn};
use crate::errors::MappingError;

/// A submitted entry-mapping definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryDefinition {
    /// Relative RDN template, e.g. `ou=Groups` or `cn=...` (dynamic).
    pub rdn: String,
    /// Suffix appended after the RDN for root entries only.
    #[serde(default)]
    pub suffix: Option<String>,
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

impl EntryDefinition {
    pub fn new(rdn: impl Into<String>) -> Self {
        Self {
            rdn: rdn.into(),
            ..Default::default()
        }
    }

    /// Split a full DN into an `(rdn, suffix)` definition, for root entries
    /// loaded from config.
    pub fn from_full_dn(dn: &Dn) -> Self {
        let rdn = dn.rdn().map(|r| r.to_string()).unwrap_or_default();
        let suffix = dn.parent().filter(|p| !p.is_root()).map(|p| p.to_string());
        Self {
            rdn,
            suffix,
            ..Default::default()
        }
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn object_class(mut self, oc: impl Into<String>) -> Self {
        self.object_classes.push(oc.into());
        self
    }

    pub fn attribute(mut self, mapping: AttributeMapping) -> Self {
        self.attributes.push(mapping);
        self
    }

    pub fn source(mut self, mapping: SourceMapping) -> Self {
        self.sources.push(mapping);
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn proxy(mut self, target: ProxyTarget) -> Self {
        self.proxy = Some(target);
        self
    }

    pub(super) fn parse_rdn(&self) -> Result<Rdn, MappingError> {
        let dn = Dn::parse(&self.rdn).map_err(|e| MappingError::BadDefinition(e.to_string()))?;
        dn.rdn()
            .cloned()
            .ok_or_else(|| MappingError::BadDefinition(format!("empty RDN '{}'", self.rdn)))
    }

    pub(super) fn parse_suffix(&self) -> Result<Dn, MappingError> {
        match &self.suffix {
            Some(s) => Dn::parse(s).map_err(|e| MappingError::BadDefinition(e.to_string())),
            None => Ok(Dn::root()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_full_dn() {
        let dn = Dn::parse("ou=Groups,dc=example,dc=com").unwrap();
        let def = EntryDefinition::from_full_dn(&dn);
        assert_eq!(def.rdn, "ou=Groups");
        assert_eq!(def.suffix.as_deref(), Some("dc=example,dc=com"));
    }

    #[test]
    fn test_from_single_rdn_dn() {
        let dn = Dn::parse("dc=com").unwrap();
        let def = EntryDefinition::from_full_dn(&dn);
        assert_eq!(def.rdn, "dc=com");
        assert!(def.suffix.is_none());
    }
}
