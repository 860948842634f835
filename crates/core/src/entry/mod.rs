//! Directory entry model: DNs, attributes, per-source row values, and the
//! virtual entries the engine returns.

pub mod attributes;
pub mod dn;

pub use attributes::{Attribute, Attributes, SourceValues};
pub use dn::{Dn, Rdn};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Search scope & modifications
// ---------------------------------------------------------------------------

/// Search scope relative to the base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    /// The base entry only.
    Base,
    /// Direct children of the base entry.
    One,
    /// The base entry and its whole subtree.
    Sub,
}

impl std::fmt::Display for SearchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::One => write!(f, "one"),
            Self::Sub => write!(f, "sub"),
        }
    }
}

/// Kind of a single modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyOp {
    Add,
    Replace,
    Delete,
}

/// One attribute modification within a modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub op: ModifyOp,
    pub attribute: String,
    pub values: Vec<String>,
}

impl Modification {
    pub fn add(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op: ModifyOp::Add,
            attribute: attribute.into(),
            values,
        }
    }

    pub fn replace(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op: ModifyOp::Replace,
            attribute: attribute.into(),
            values,
        }
    }

    pub fn delete(attribute: impl Into<String>) -> Self {
        Self {
            op: ModifyOp::Delete,
            attribute: attribute.into(),
            values: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Search result
// ---------------------------------------------------------------------------

/// One virtual entry produced by the engine: the composed DN, the merged
/// output attributes, and the per-source rows it was assembled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub dn: Dn,
    pub attributes: Attributes,
    pub source_values: SourceValues,
}

impl SearchResult {
    pub fn new(dn: Dn, attributes: Attributes, source_values: SourceValues) -> Self {
        Self {
            dn,
            attributes,
            source_values,
        }
    }
}
