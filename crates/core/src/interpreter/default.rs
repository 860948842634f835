//! The default interpreter: a variable scope with concatenation scripts.
//!
//! Script syntax is deliberately small: terms joined with `+`, where a term
//! is a single- or double-quoted literal or a (possibly dotted) variable
//! name. A one-term script of a bare variable passes the bound value
//! through unchanged, sets included; in a multi-term concatenation each
//! variable contributes its first scalar, and an unbound variable makes the
//! whole script evaluate to empty.

use std::collections::HashMap;

use crate::errors::InterpreterError;

use super::{Interpreter, Value};

/// Concatenation-script interpreter.
#[derive(Debug, Default)]
pub struct DefaultInterpreter {
    bindings: HashMap<String, Value>,
}

impl DefaultInterpreter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interpreter for DefaultInterpreter {
    fn set(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }

    fn eval_script(&mut self, script: &str) -> Result<Option<Value>, InterpreterError> {
        let terms = parse_terms(script).map_err(|detail| InterpreterError::ScriptError {
            script: script.to_string(),
            detail,
        })?;

        // A bare variable passes its value through unchanged.
        if let [Term::Variable(name)] = terms.as_slice() {
            return Ok(self.get(name));
        }

        let mut out = String::new();
        for term in &terms {
            match term {
                Term::Literal(text) => out.push_str(text),
                Term::Variable(name) => match self.get(name) {
                    Some(value) => match value.as_scalar() {
                        Some(scalar) => out.push_str(scalar),
                        None => return Ok(None),
                    },
                    None => return Ok(None),
                },
            }
        }
        Ok(Some(Value::Text(out)))
    }

    fn clear(&mut self) {
        self.bindings.clear();
    }
}

// ---------------------------------------------------------------------------
// Script parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Term {
    Literal(String),
    Variable(String),
}

fn parse_terms(script: &str) -> Result<Vec<Term>, String> {
    let mut terms = Vec::new();
    let mut chars = script.chars().peekable();

    loop {
        // Skip whitespace between terms.
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some(quote @ ('"' | '\'')) => {
                let quote = *quote;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => return Err("unterminated escape".into()),
                        },
                        Some(c) => text.push(c),
                        None => return Err("unterminated string literal".into()),
                    }
                }
                terms.push(Term::Literal(text));
            }
            Some(_) => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(format!("unexpected character '{}'", chars.peek().expect("peeked")));
                }
                terms.push(Term::Variable(name));
            }
        }

        // Between terms only '+' (or end) is allowed.
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('+') => {
                chars.next();
            }
            Some(c) => return Err(format!("expected '+', found '{}'", c)),
        }
    }

    if terms.is_empty() {
        return Err("empty script".into());
    }
    Ok(terms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_variable_passthrough() {
        let mut i = DefaultInterpreter::new();
        i.set("u.mail", Value::Set(vec!["a".into(), "b".into()]));
        let v = i.eval_script("u.mail").unwrap();
        assert_eq!(v, Some(Value::Set(vec!["a".into(), "b".into()])));
    }

    #[test]
    fn test_concatenation() {
        let mut i = DefaultInterpreter::new();
        i.set("u.uid", "jdoe".into());
        let v = i.eval_script("\"uid=\" + u.uid + \",ou=People\"").unwrap();
        assert_eq!(v, Some(Value::Text("uid=jdoe,ou=People".into())));
    }

    #[test]
    fn test_single_quotes() {
        let mut i = DefaultInterpreter::new();
        i.set("name", "x".into());
        let v = i.eval_script("'<' + name + '>'").unwrap();
        assert_eq!(v, Some(Value::Text("<x>".into())));
    }

    #[test]
    fn test_unbound_variable_in_concat_is_empty() {
        let mut i = DefaultInterpreter::new();
        let v = i.eval_script("\"uid=\" + missing").unwrap();
        assert_eq!(v, None);
    }

    #[test]
    fn test_bare_unbound_variable_is_empty() {
        let mut i = DefaultInterpreter::new();
        assert_eq!(i.eval_script("missing").unwrap(), None);
    }

    #[test]
    fn test_malformed_script() {
        let mut i = DefaultInterpreter::new();
        assert!(i.eval_script("").is_err());
        assert!(i.eval_script("'unterminated").is_err());
        assert!(i.eval_script("a b").is_err());
    }

    #[test]
    fn test_clear() {
        let mut i = DefaultInterpreter::new();
        i.set("x", "1".into());
        i.clear();
        assert_eq!(i.get("x"), None);
    }
}
