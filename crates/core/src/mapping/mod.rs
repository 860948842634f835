//! Entry-mapping model: the per-partition tree of virtual DIT nodes and the
//! rules that derive their attributes from backend sources.
//!
//! All `EntryMapping` records for one partition live in a single
//! [`Directory`] arena addressed by stable [`EntryId`]s, with
//! parent-id/child-id links and a DN index maintained only by the router
//! and the management operations.

mod definition;

pub use definition::EntryDefinition;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::{Dn, Rdn};
use crate::errors::MappingError;
use crate::schema::Schema;

// ---------------------------------------------------------------------------
// Expressions and mapping rules
// ---------------------------------------------------------------------------

/// A scripted value rule, optionally iterated over a multi-valued binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    /// Script text evaluated against the current bindings.
    pub script: String,
    /// Name of the collection binding to iterate, if any.
    #[serde(default)]
    pub foreach: Option<String>,
    /// Loop variable rebound per element while iterating.
    #[serde(default)]
    pub var: Option<String>,
}

impl Expression {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            foreach: None,
            var: None,
        }
    }

    pub fn foreach(
        script: impl Into<String>,
        foreach: impl Into<String>,
        var: impl Into<String>,
    ) -> Self {
        Self {
            script: script.into(),
            foreach: Some(foreach.into()),
            var: Some(var.into()),
        }
    }

    /// The leading variable token of the script: everything up to the first
    /// operator or whitespace. Used by primary-source selection.
    pub fn leading_token(&self) -> &str {
        self.script
            .split(|c: char| c.is_whitespace() || c == '+')
            .next()
            .unwrap_or("")
            .trim()
    }
}

/// The value side of an attribute or field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingValue {
    /// A literal value.
    Constant(String),
    /// A reference to a bound variable (`alias.field`, an attribute name,
    /// or an `rdn.`-scoped name).
    Variable(String),
    /// A scripted expression.
    Expression(Expression),
}

/// One output attribute rule of an entry mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub name: String,
    pub value: MappingValue,
    /// Whether this attribute is part of the RDN.
    #[serde(default)]
    pub rdn: bool,
}

impl AttributeMapping {
    pub fn constant(name: impl Into<String>, value: impl Into<String>, rdn: bool) -> Self {
        Self {
            name: name.into(),
            value: MappingValue::Constant(value.into()),
            rdn,
        }
    }

    pub fn variable(name: impl Into<String>, variable: impl Into<String>, rdn: bool) -> Self {
        Self {
            name: name.into(),
            value: MappingValue::Variable(variable.into()),
            rdn,
        }
    }

    pub fn expression(name: impl Into<String>, expression: Expression, rdn: bool) -> Self {
        Self {
            name: name.into(),
            value: MappingValue::Expression(expression),
            rdn,
        }
    }
}

/// One backend field rule of a source mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    pub value: MappingValue,
    /// Whether this field is part of the source's primary key.
    #[serde(default)]
    pub primary_key: bool,
}

impl FieldMapping {
    pub fn variable(name: impl Into<String>, variable: impl Into<String>, primary_key: bool) -> Self {
        Self {
            name: name.into(),
            value: MappingValue::Variable(variable.into()),
            primary_key,
        }
    }

    pub fn constant(name: impl Into<String>, value: impl Into<String>, primary_key: bool) -> Self {
        Self {
            name: name.into(),
            value: MappingValue::Constant(value.into()),
            primary_key,
        }
    }
}

/// Binding of an entry mapping to one backend source under an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapping {
    /// Alias the fields are bound under (`alias.field`).
    pub alias: String,
    /// Name of the source definition in the partition config.
    pub source: String,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    /// Whether an add cascades into this source.
    #[serde(default = "default_true")]
    pub include_on_add: bool,
    /// Whether a delete cascades into this source.
    #[serde(default = "default_true")]
    pub include_on_delete: bool,
}

fn default_true() -> bool {
    true
}

impl SourceMapping {
    pub fn new(alias: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            source: source.into(),
            fields: Vec::new(),
            include_on_add: true,
            include_on_delete: true,
        }
    }

    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    /// Names of this mapping's primary-key fields.
    pub fn primary_key_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.as_str())
    }
}

/// An equality join edge between two source fields (`alias.field` on each
/// side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub lhs: String,
    pub rhs: String,
}

impl Relationship {
    pub fn new(lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self {
            lhs: lhs.into(),
            rhs: rhs.into(),
        }
    }

    /// The alias part of the LHS reference.
    pub fn lhs_alias(&self) -> &str {
        self.lhs.split('.').next().unwrap_or("")
    }

    /// The alias part of the RHS reference.
    pub fn rhs_alias(&self) -> &str {
        self.rhs.split('.').next().unwrap_or("")
    }
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.lhs, self.rhs)
    }
}

// ---------------------------------------------------------------------------
// Entry mappings
// ---------------------------------------------------------------------------

/// Stable identifier of an entry mapping within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Classification driving engine dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// No sources: the mapping definition itself is the data.
    Static,
    /// Composed from backend sources through the join graph.
    Dynamic,
    /// Forwarded verbatim to one designated backend.
    Proxy,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Dynamic => write!(f, "dynamic"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

/// Proxy forwarding target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Connection name the operations are forwarded to.
    pub connection: String,
    /// Base DN on the remote server substituted for the local subtree root.
    /// Empty keeps the DN unchanged.
    #[serde(default)]
    pub remote_base_dn: String,
}

/// One virtual DIT node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMapping {
    pub id: EntryId,
    /// Full DN, composed from the relative RDN and the parent's DN.
    pub dn: Dn,
    pub object_classes: Vec<String>,
    pub attributes: Vec<AttributeMapping>,
    pub sources: Vec<SourceMapping>,
    pub relationships: Vec<Relationship>,
    pub proxy: Option<ProxyTarget>,
    pub parent: Option<EntryId>,
    pub children: Vec<EntryId>,
}

impl EntryMapping {
    /// Engine classification: proxy beats dynamic beats static.
    pub fn kind(&self) -> EntryKind {
        if self.proxy.is_some() {
            EntryKind::Proxy
        } else if !self.sources.is_empty() {
            EntryKind::Dynamic
        } else {
            EntryKind::Static
        }
    }

    /// The entry's own RDN template.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.dn.rdn()
    }

    /// RDN-flagged attribute mappings, in declaration order.
    pub fn rdn_attributes(&self) -> impl Iterator<Item = &AttributeMapping> {
        self.attributes.iter().filter(|a| a.rdn)
    }

    /// Attribute mappings by output name (an attribute may have several).
    pub fn attribute_mappings(&self, name: &str) -> impl Iterator<Item = &AttributeMapping> {
        let name = name.to_lowercase();
        self.attributes
            .iter()
            .filter(move |a| a.name.to_lowercase() == name)
    }

    pub fn source_mapping(&self, alias: &str) -> Option<&SourceMapping> {
        self.sources.iter().find(|s| s.alias == alias)
    }

    /// Whether `dn`'s leftmost RDN matches this entry's RDN template:
    /// attribute names must match; constant RDN values must match
    /// case-insensitively; non-constant (dynamic) values match any value.
    pub fn matches_rdn(&self, rdn: &Rdn, schema: &Schema) -> bool {
        let own = match self.rdn() {
            Some(r) => r,
            None => return false,
        };
        if own.components().len() != rdn.components().len() {
            return false;
        }
        for (name, _) in own.components() {
            let candidate = match rdn.get(name) {
                Some(v) => v,
                None => return false,
            };
            // A constant mapping for the RDN attribute pins the value.
            let constant = self.attribute_mappings(name).find_map(|m| match &m.value {
                MappingValue::Constant(c) if m.rdn => Some(c.as_str()),
                _ => None,
            });
            if let Some(expected) = constant {
                if !schema.matches(candidate, expected) {
                    return false;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Directory arena
// ---------------------------------------------------------------------------

/// Arena of entry mappings for one partition, with a DN index.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: HashMap<EntryId, EntryMapping>,
    roots: Vec<EntryId>,
    dn_index: HashMap<String, Vec<EntryId>>,
    next_id: u64,
    schema: Schema,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EntryId) -> Option<&EntryMapping> {
        self.entries.get(&id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &EntryMapping> {
        self.roots.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn children(&self, id: EntryId) -> Vec<&EntryMapping> {
        self.entries
            .get(&id)
            .map(|e| {
                e.children
                    .iter()
                    .filter_map(|c| self.entries.get(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parent(&self, id: EntryId) -> Option<&EntryMapping> {
        self.entries
            .get(&id)
            .and_then(|e| e.parent)
            .and_then(|p| self.entries.get(&p))
    }

    /// All ids, sorted for stable listings.
    pub fn ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryMapping> {
        self.entries.values()
    }

    /// Exact-DN lookup through the index.
    pub fn find_by_dn(&self, dn: &Dn) -> Vec<EntryId> {
        self.dn_index
            .get(&self.schema.normalize_dn(dn))
            .cloned()
            .unwrap_or_default()
    }

    /// Add an entry under `parent` (or as a root). The definition's RDN is
    /// composed with the parent DN; the resulting DN must be unique.
    pub fn add_entry(
        &mut self,
        parent: Option<EntryId>,
        definition: EntryDefinition,
    ) -> Result<EntryId, MappingError> {
        let rdn = definition.parse_rdn()?;
        let dn = match parent {
            Some(pid) => {
                let parent_entry = self
                    .entries
                    .get(&pid)
                    .ok_or_else(|| MappingError::EntryNotFound(pid.to_string()))?;
                parent_entry.dn.child(rdn)
            }
            None => Dn::from_rdns(vec![rdn]).append(&definition.parse_suffix()?),
        };

        let key = self.schema.normalize_dn(&dn);
        if self.dn_index.contains_key(&key) {
            return Err(MappingError::DuplicateDn(dn.to_string()));
        }

        let id = EntryId(self.next_id);
        self.next_id += 1;

        let entry = EntryMapping {
            id,
            dn,
            object_classes: definition.object_classes,
            attributes: definition.attributes,
            sources: definition.sources,
            relationships: definition.relationships,
            proxy: definition.proxy,
            parent,
            children: Vec::new(),
        };

        debug!(id = %id, dn = %entry.dn, kind = %entry.kind(), "adding entry mapping");

        self.dn_index.insert(key, vec![id]);
        match parent {
            Some(pid) => {
                if let Some(p) = self.entries.get_mut(&pid) {
                    p.children.push(id);
                }
            }
            None => self.roots.push(id),
        }
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Replace an entry's mapping rules in place. The DN (and therefore the
    /// tree position) is not changed by updates.
    pub fn update_entry(
        &mut self,
        id: EntryId,
        definition: EntryDefinition,
    ) -> Result<(), MappingError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| MappingError::EntryNotFound(id.to_string()))?;
        entry.object_classes = definition.object_classes;
        entry.attributes = definition.attributes;
        entry.sources = definition.sources;
        entry.relationships = definition.relationships;
        entry.proxy = definition.proxy;
        Ok(())
    }

    /// Remove a leaf entry. Refuses when children exist.
    pub fn remove_entry(&mut self, id: EntryId) -> Result<EntryMapping, MappingError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| MappingError::EntryNotFound(id.to_string()))?;
        if !entry.children.is_empty() {
            return Err(MappingError::NotLeaf {
                id: id.to_string(),
                children: entry.children.len(),
            });
        }
        let key = self.schema.normalize_dn(&entry.dn);
        let entry = self.entries.remove(&id).expect("checked above");
        self.dn_index.remove(&key);
        match entry.parent {
            Some(pid) => {
                if let Some(p) = self.entries.get_mut(&pid) {
                    p.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
        Ok(entry)
    }

    /// Source mappings visible to an entry: its own plus those inherited
    /// from ancestors, nearest first.
    pub fn effective_sources(&self, id: EntryId) -> Vec<&SourceMapping> {
        let mut out = Vec::new();
        let mut current = self.entries.get(&id);
        while let Some(entry) = current {
            for sm in &entry.sources {
                if !out.iter().any(|s: &&SourceMapping| s.alias == sm.alias) {
                    out.push(sm);
                }
            }
            current = entry.parent.and_then(|p| self.entries.get(&p));
        }
        out
    }

    /// Relationships visible to an entry: its own plus ancestors'.
    pub fn effective_relationships(&self, id: EntryId) -> Vec<&Relationship> {
        let mut out = Vec::new();
        let mut current = self.entries.get(&id);
        while let Some(entry) = current {
            out.extend(entry.relationships.iter());
            current = entry.parent.and_then(|p| self.entries.get(&p));
        }
        out
    }
}
