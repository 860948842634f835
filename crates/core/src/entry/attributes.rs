//! Multi-valued attribute sets and per-source row values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Rdn;

// ---------------------------------------------------------------------------
// Attribute
// ---------------------------------------------------------------------------

/// One named attribute holding an ordered set of distinct values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut attr = Self::new(name);
        attr.add_value(value);
        attr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// The first value, if any.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert a value, keeping insertion order and dropping duplicates.
    pub fn add_value(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !self.values.contains(&value) {
            self.values.push(value);
        }
    }

    pub fn remove_value(&mut self, value: &str) {
        self.values.retain(|v| v != value);
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// A set of attributes keyed case-insensitively by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    // Keyed by the lowercased name; the Attribute keeps the original case.
    attrs: BTreeMap<String, Attribute>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(&name.to_lowercase())
    }

    /// All values of an attribute, or an empty slice if absent.
    pub fn values(&self, name: &str) -> &[String] {
        self.get(name).map(|a| a.values()).unwrap_or(&[])
    }

    /// The first value of an attribute.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|a| a.value())
    }

    /// Add one value to an attribute, creating it if needed.
    pub fn add_value(&mut self, name: &str, value: impl Into<String>) {
        self.attrs
            .entry(name.to_lowercase())
            .or_insert_with(|| Attribute::new(name))
            .add_value(value);
    }

    /// Replace an attribute's values wholesale.
    pub fn set_values(&mut self, name: &str, values: Vec<String>) {
        let mut attr = Attribute::new(name);
        for v in values {
            attr.add_value(v);
        }
        self.attrs.insert(name.to_lowercase(), attr);
    }

    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        self.attrs.remove(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attrs.values().map(|a| a.name())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.values()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

impl FromIterator<(String, String)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut attrs = Attributes::new();
        for (name, value) in iter {
            attrs.add_value(&name, value);
        }
        attrs
    }
}

// ---------------------------------------------------------------------------
// SourceValues
// ---------------------------------------------------------------------------

/// Backend row values keyed by source alias: `alias` → field → values.
///
/// Flat access under `alias.field` names is what the interpreter binds and
/// what relationship edges reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceValues {
    sources: BTreeMap<String, Attributes>,
}

impl SourceValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alias: &str) -> Option<&Attributes> {
        self.sources.get(alias)
    }

    pub fn entry(&mut self, alias: &str) -> &mut Attributes {
        self.sources.entry(alias.to_string()).or_default()
    }

    pub fn set(&mut self, alias: &str, attributes: Attributes) {
        self.sources.insert(alias.to_string(), attributes);
    }

    pub fn remove(&mut self, alias: &str) -> Option<Attributes> {
        self.sources.remove(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attributes)> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Flat lookup under an `alias.field` name.
    pub fn values(&self, qualified: &str) -> &[String] {
        match qualified.split_once('.') {
            Some((alias, field)) => self
                .sources
                .get(alias)
                .map(|attrs| attrs.values(field))
                .unwrap_or(&[]),
            None => &[],
        }
    }

    /// Flat insert under an `alias.field` name.
    pub fn add_value(&mut self, qualified: &str, value: impl Into<String>) {
        if let Some((alias, field)) = qualified.split_once('.') {
            self.entry(alias).add_value(field, value);
        }
    }

    /// Merge another row set into this one, unioning values per field.
    pub fn merge(&mut self, other: &SourceValues) {
        for (alias, attrs) in other.iter() {
            let target = self.entry(alias);
            for attr in attrs.iter() {
                for value in attr.values() {
                    target.add_value(attr.name(), value.clone());
                }
            }
        }
    }

    /// Project the RDN's components into attributes, e.g. for `rdn.`-scoped
    /// interpreter bindings.
    pub fn from_rdn(rdn: &Rdn) -> Attributes {
        let mut attrs = Attributes::new();
        for (name, value) in rdn.components() {
            attrs.add_value(name, value.clone());
        }
        attrs
    }
}
