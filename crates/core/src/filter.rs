//! Search filter AST, parser, and matcher.
//!
//! Filters use the standard parenthesized prefix notation:
//! `(&(objectClass=person)(|(cn=a*)(uid=jdoe)))`. The engine rewrites
//! attribute terms into per-source field terms before handing a filter to a
//! backend adapter, and adapters that cannot push a filter down evaluate it
//! with [`Filter::matches`].

use serde::{Deserialize, Serialize};

use crate::entry::Attributes;
use crate::errors::SchemaError;
use crate::schema::Schema;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A search filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// `(attr=value)`
    Equality { attribute: String, value: String },
    /// `(attr=*)`
    Presence { attribute: String },
    /// `(attr=ab*cd*ef)`; any component may be empty.
    Substring { attribute: String, pattern: String },
    /// `(&(..)(..))`
    And(Vec<Filter>),
    /// `(|(..)(..))`
    Or(Vec<Filter>),
    /// `(!(..))`
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Self::Presence {
            attribute: attribute.into(),
        }
    }

    /// Match-everything filter, the default for searches without one.
    pub fn match_all() -> Self {
        Self::present("objectClass")
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    /// Parse a filter string.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let mut parser = Parser {
            input,
            chars: input.char_indices().peekable(),
        };
        let filter = parser.parse_filter()?;
        if parser.chars.next().is_some() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate this filter against an attribute set using the schema's
    /// equality rule.
    pub fn matches(&self, attributes: &Attributes, schema: &Schema) -> bool {
        match self {
            Self::Equality { attribute, value } => attributes
                .values(attribute)
                .iter()
                .any(|v| schema.matches(v, value)),
            Self::Presence { attribute } => !attributes.values(attribute).is_empty(),
            Self::Substring { attribute, pattern } => {
                let regex = substring_regex(pattern);
                attributes
                    .values(attribute)
                    .iter()
                    .any(|v| regex.is_match(&v.to_lowercase()))
            }
            Self::And(subs) => subs.iter().all(|f| f.matches(attributes, schema)),
            Self::Or(subs) => subs.iter().any(|f| f.matches(attributes, schema)),
            Self::Not(sub) => !sub.matches(attributes, schema),
        }
    }

    /// Rewrite every attribute term through `rename`. Terms for which
    /// `rename` returns `None` are kept unchanged.
    pub fn map_attributes<F>(&self, rename: &F) -> Filter
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            Self::Equality { attribute, value } => Self::Equality {
                attribute: rename(attribute).unwrap_or_else(|| attribute.clone()),
                value: value.clone(),
            },
            Self::Presence { attribute } => Self::Presence {
                attribute: rename(attribute).unwrap_or_else(|| attribute.clone()),
            },
            Self::Substring { attribute, pattern } => Self::Substring {
                attribute: rename(attribute).unwrap_or_else(|| attribute.clone()),
                pattern: pattern.clone(),
            },
            Self::And(subs) => Self::And(subs.iter().map(|f| f.map_attributes(rename)).collect()),
            Self::Or(subs) => Self::Or(subs.iter().map(|f| f.map_attributes(rename)).collect()),
            Self::Not(sub) => Self::Not(Box::new(sub.map_attributes(rename))),
        }
    }

    /// Collect the attribute names referenced by this filter.
    pub fn attributes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Equality { attribute, .. }
            | Self::Presence { attribute }
            | Self::Substring { attribute, .. } => {
                if !out.contains(&attribute.as_str()) {
                    out.push(attribute);
                }
            }
            Self::And(subs) | Self::Or(subs) => {
                for f in subs {
                    f.collect_attributes(out);
                }
            }
            Self::Not(sub) => sub.collect_attributes(out),
        }
    }
}

fn substring_regex(pattern: &str) -> regex_lite::Regex {
    let mut re = String::from("^");
    let parts: Vec<&str> = pattern.split('*').collect();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            re.push_str(".*");
        }
        re.push_str(&regex_lite::escape(&part.to_lowercase()));
    }
    re.push('$');
    regex_lite::Regex::new(&re).unwrap_or_else(|_| regex_lite::Regex::new("^$").unwrap())
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equality { attribute, value } => write!(f, "({}={})", attribute, value),
            Self::Presence { attribute } => write!(f, "({}=*)", attribute),
            Self::Substring { attribute, pattern } => write!(f, "({}={})", attribute, pattern),
            Self::And(subs) => {
                write!(f, "(&")?;
                for s in subs {
                    write!(f, "{}", s)?;
                }
                write!(f, ")")
            }
            Self::Or(subs) => {
                write!(f, "(|")?;
                for s in subs {
                    write!(f, "{}", s)?;
                }
                write!(f, ")")
            }
            Self::Not(sub) => write!(f, "(!{})", sub),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn error(&self, detail: &str) -> SchemaError {
        SchemaError::MalformedFilter {
            filter: self.input.to_string(),
            detail: detail.to_string(),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), SchemaError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", expected))),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, SchemaError> {
        self.expect('(')?;
        let filter = match self.chars.peek().map(|(_, c)| *c) {
            Some('&') => {
                self.chars.next();
                Filter::And(self.parse_list()?)
            }
            Some('|') => {
                self.chars.next();
                Filter::Or(self.parse_list()?)
            }
            Some('!') => {
                self.chars.next();
                let inner = self.parse_filter()?;
                Filter::Not(Box::new(inner))
            }
            Some(_) => self.parse_simple()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, SchemaError> {
        let mut subs = Vec::new();
        while matches!(self.chars.peek(), Some((_, '('))) {
            subs.push(self.parse_filter()?);
        }
        if subs.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(subs)
    }

    fn parse_simple(&mut self) -> Result<Filter, SchemaError> {
        let mut attribute = String::new();
        loop {
            match self.chars.next() {
                Some((_, '=')) => break,
                Some((_, c)) if c != '(' && c != ')' => attribute.push(c),
                _ => return Err(self.error("expected '=' in filter term")),
            }
        }
        let attribute = attribute.trim().to_string();
        if attribute.is_empty() {
            return Err(self.error("empty attribute in filter term"));
        }

        let mut value = String::new();
        while let Some((_, c)) = self.chars.peek() {
            if *c == ')' {
                break;
            }
            value.push(*c);
            self.chars.next();
        }

        if value == "*" {
            Ok(Filter::Presence { attribute })
        } else if value.contains('*') {
            Ok(Filter::Substring {
                attribute,
                pattern: value,
            })
        } else {
            Ok(Filter::Equality { attribute, value })
        }
    }
}
