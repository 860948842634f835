//! Schema-level normalization and matching rules.
//!
//! The router and the DN index compare DNs through [`Schema::normalize`],
//! and attribute comparison goes through the case-insensitive equality
//! rule. Keeping both here means every component agrees on what "equal"
//! means.

use crate::entry::Dn;

/// Case/whitespace normalization and equality matching.
///
/// Directory strings are compared case-insensitively with insignificant
/// whitespace removed around RDN separators and collapsed inside values.
#[derive(Debug, Clone, Default)]
pub struct Schema;

impl Schema {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a raw DN string: lowercase, trim each component, drop
    /// spaces around `=`, `,` and `+`.
    pub fn normalize(&self, dn: &str) -> String {
        match Dn::parse(dn) {
            Ok(parsed) => self.normalize_dn(&parsed),
            // Unparseable strings still get the case/whitespace rule so
            // lookups stay total.
            Err(_) => collapse_whitespace(&dn.to_lowercase()),
        }
    }

    /// Normalize a parsed DN.
    pub fn normalize_dn(&self, dn: &Dn) -> String {
        dn.rdns()
            .iter()
            .map(|rdn| {
                rdn.components()
                    .iter()
                    .map(|(name, value)| {
                        format!(
                            "{}={}",
                            name.trim().to_lowercase(),
                            collapse_whitespace(&value.trim().to_lowercase())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("+")
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Normalize a single attribute value.
    pub fn normalize_value(&self, value: &str) -> String {
        collapse_whitespace(&value.trim().to_lowercase())
    }

    /// Case-insensitive equality with insignificant whitespace removed.
    pub fn matches(&self, a: &str, b: &str) -> bool {
        self.normalize_value(a) == self.normalize_value(b)
    }

    /// True if `dn` (normalized) ends with `suffix` (normalized) on an RDN
    /// boundary. An empty suffix matches everything.
    pub fn is_suffix(&self, dn: &str, suffix: &str) -> bool {
        let ndn = self.normalize(dn);
        let nsuffix = self.normalize(suffix);
        if nsuffix.is_empty() {
            return true;
        }
        if ndn == nsuffix {
            return true;
        }
        ndn.ends_with(&format!(",{}", nsuffix))
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_case_and_whitespace() {
        let schema = Schema::new();
        assert_eq!(
            schema.normalize("CN=Test User , OU=People, DC=Example, DC=Com"),
            "cn=test user,ou=people,dc=example,dc=com"
        );
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let schema = Schema::new();
        assert!(schema.matches("Correct", "correct"));
        assert!(schema.matches("two  words", "Two Words"));
        assert!(!schema.matches("correct", "wrong"));
    }

    #[test]
    fn test_suffix_on_rdn_boundary() {
        let schema = Schema::new();
        assert!(schema.is_suffix("cn=x,ou=people,dc=example,dc=com", "dc=example,dc=com"));
        assert!(schema.is_suffix("dc=example,dc=com", "dc=example,dc=com"));
        // "c=com" is a substring of ",dc=com" but not an RDN suffix.
        assert!(!schema.is_suffix("dc=example,dc=com", "c=com"));
        assert!(schema.is_suffix("anything", ""));
    }
}
