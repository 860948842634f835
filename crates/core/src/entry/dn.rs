//! Distinguished-name parsing and composition.
//!
//! A [`Dn`] is a left-to-right list of [`Rdn`]s, the leftmost naming the
//! entry itself. Escaped separators (`\,`, `\+`, `\=`) are honored during
//! parsing and re-escaped on display.

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;

// ---------------------------------------------------------------------------
// RDN
// ---------------------------------------------------------------------------

/// A relative distinguished name: one or more `attr=value` components
/// joined with `+`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rdn {
    components: Vec<(String, String)>,
}

impl Rdn {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            components: vec![(name.into(), value.into())],
        }
    }

    pub fn from_components(components: Vec<(String, String)>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[(String, String)] {
        &self.components
    }

    /// The first component's attribute name.
    pub fn attribute(&self) -> &str {
        &self.components[0].0
    }

    /// The first component's value.
    pub fn value(&self) -> &str {
        &self.components[0].1
    }

    /// Look up a component value by attribute name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.components
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn parse(s: &str) -> Result<Self, SchemaError> {
        let mut components = Vec::new();
        for part in split_unescaped(s, '+') {
            let (name, value) = part.split_once('=').ok_or_else(|| SchemaError::MalformedDn {
                dn: s.to_string(),
                detail: "RDN component without '='".into(),
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(SchemaError::MalformedDn {
                    dn: s.to_string(),
                    detail: "empty attribute name".into(),
                });
            }
            components.push((name.to_string(), unescape(value.trim())));
        }
        if components.is_empty() {
            return Err(SchemaError::MalformedDn {
                dn: s.to_string(),
                detail: "empty RDN".into(),
            });
        }
        Ok(Self { components })
    }
}

impl std::fmt::Display for Rdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .components
            .iter()
            .map(|(n, v)| format!("{}={}", n, escape(v)))
            .collect();
        write!(f, "{}", parts.join("+"))
    }
}

// ---------------------------------------------------------------------------
// DN
// ---------------------------------------------------------------------------

/// A distinguished name. The empty DN (zero RDNs) names the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty (root) DN.
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Self { rdns }
    }

    /// Parse a DN string. An empty or whitespace-only string is the root DN.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut rdns = Vec::new();
        for part in split_unescaped(s, ',') {
            rdns.push(Rdn::parse(part.trim())?);
        }
        Ok(Self { rdns })
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The leftmost RDN, if any.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Everything but the leftmost RDN. The root DN has no parent.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// Compose `rdn,self`.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend_from_slice(&self.rdns);
        Dn { rdns }
    }

    /// Append a suffix DN: `self,suffix`.
    pub fn append(&self, suffix: &Dn) -> Dn {
        let mut rdns = self.rdns.clone();
        rdns.extend_from_slice(&suffix.rdns);
        Dn { rdns }
    }

    /// Number of RDNs.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Strip `suffix` from the end, returning the relative prefix.
    /// Comparison is case-insensitive on names and values.
    pub fn strip_suffix(&self, suffix: &Dn) -> Option<Dn> {
        if suffix.rdns.len() > self.rdns.len() {
            return None;
        }
        let split = self.rdns.len() - suffix.rdns.len();
        let tail = &self.rdns[split..];
        for (a, b) in tail.iter().zip(suffix.rdns.iter()) {
            if !rdn_eq_ignore_case(a, b) {
                return None;
            }
        }
        Some(Dn {
            rdns: self.rdns[..split].to_vec(),
        })
    }
}

fn rdn_eq_ignore_case(a: &Rdn, b: &Rdn) -> bool {
    a.components().len() == b.components().len()
        && a.components()
            .iter()
            .zip(b.components().iter())
            .all(|((an, av), (bn, bv))| {
                an.eq_ignore_ascii_case(bn) && av.eq_ignore_ascii_case(bv)
            })
}

impl std::fmt::Display for Dn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.rdns.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl std::str::FromStr for Dn {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Escaping helpers
// ---------------------------------------------------------------------------

/// Split on `sep`, honoring backslash escapes.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + sep.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '+' | '=' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
