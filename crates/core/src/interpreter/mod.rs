//! Expression interpretation.
//!
//! An [`Interpreter`] holds a variable scope and evaluates mapping rules
//! against it. The trait supplies the shared evaluation driver (constant /
//! variable / expression dispatch, `rdn.` fallback, foreach collapse);
//! implementations only provide variable storage and black-box script
//! evaluation. Implementations are resolved by identifier through an
//! [`InterpreterRegistry`] built at startup.

mod default;
mod registry;

pub use default::DefaultInterpreter;
pub use registry::InterpreterRegistry;

use crate::entry::{Attributes, Rdn, SourceValues};
use crate::errors::InterpreterError;
use crate::mapping::{AttributeMapping, Expression, FieldMapping, MappingValue};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A bound or computed value: a scalar or a distinct ordered set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Set(Vec<String>),
}

impl Value {
    /// Collapse a distinct value list the way expression evaluation does:
    /// empty → `None`, one element → the bare scalar, more → a set.
    pub fn collapse(values: Vec<String>) -> Option<Value> {
        match values.len() {
            0 => None,
            1 => Some(Value::Text(values.into_iter().next().expect("len checked"))),
            _ => Some(Value::Set(values)),
        }
    }

    /// View as a list of scalars.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Value::Text(s) => vec![s.clone()],
            Value::Set(values) => values.clone(),
        }
    }

    /// The scalar, or the first element of a set.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Set(values) => values.first().map(|s| s.as_str()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

// ---------------------------------------------------------------------------
// Interpreter trait
// ---------------------------------------------------------------------------

/// One evaluation scope.
///
/// Evaluation failures abort the enclosing operation with a described
/// fault; the interpreter never retries internally.
pub trait Interpreter: Send {
    /// Bind a single variable.
    fn set(&mut self, name: &str, value: Value);

    /// Look up a variable.
    fn get(&self, name: &str) -> Option<Value>;

    /// Evaluate raw script text against the current bindings.
    fn eval_script(&mut self, script: &str) -> Result<Option<Value>, InterpreterError>;

    /// Drop all bindings.
    fn clear(&mut self);

    // -----------------------------------------------------------------------
    // Shared drivers
    // -----------------------------------------------------------------------

    /// Bind an RDN's components under their attribute names.
    fn set_rdn(&mut self, rdn: &Rdn) {
        for (name, value) in rdn.components() {
            self.set(name, Value::Text(value.clone()));
        }
    }

    /// Bind a full row set under `<alias>.<field>` names. Single-valued
    /// fields bind as scalars, multi-valued ones as sets.
    fn set_source_values(&mut self, source_values: &SourceValues) {
        for (alias, attrs) in source_values.iter() {
            for attr in attrs.iter() {
                let name = format!("{}.{}", alias, attr.name());
                match attr.values() {
                    [single] => self.set(&name, Value::Text(single.clone())),
                    many => self.set(&name, Value::Set(many.to_vec())),
                }
            }
        }
    }

    /// Bind plain attributes under their names.
    fn set_attributes(&mut self, attributes: &Attributes) {
        for attr in attributes.iter() {
            match attr.values() {
                [single] => self.set(attr.name(), Value::Text(single.clone())),
                many => self.set(attr.name(), Value::Set(many.to_vec())),
            }
        }
    }

    /// Evaluate an attribute mapping.
    fn eval_attribute(
        &mut self,
        mapping: &AttributeMapping,
    ) -> Result<Option<Value>, InterpreterError> {
        self.eval_value(&mapping.value)
            .map_err(|e| InterpreterError::AttributeError {
                attribute: mapping.name.clone(),
                detail: e.to_string(),
            })
    }

    /// Evaluate a field mapping.
    fn eval_field(&mut self, mapping: &FieldMapping) -> Result<Option<Value>, InterpreterError> {
        self.eval_value(&mapping.value)
            .map_err(|e| InterpreterError::AttributeError {
                attribute: mapping.name.clone(),
                detail: e.to_string(),
            })
    }

    /// Evaluate a mapping value: the constant if set; else the variable,
    /// retrying with the `rdn.` prefix stripped when the first lookup is
    /// empty; else the expression.
    fn eval_value(&mut self, value: &MappingValue) -> Result<Option<Value>, InterpreterError> {
        match value {
            MappingValue::Constant(c) => Ok(Some(Value::Text(c.clone()))),
            MappingValue::Variable(name) => {
                let mut found = self.get(name);
                if found.is_none() {
                    if let Some(stripped) = name.strip_prefix("rdn.") {
                        found = self.get(stripped);
                    }
                }
                Ok(found)
            }
            MappingValue::Expression(expression) => self.eval_expression(expression),
        }
    }

    /// Evaluate an expression, iterating the `foreach` collection if one is
    /// named and collecting distinct non-null per-iteration results:
    /// none → empty, exactly one → the bare scalar, more → a set.
    fn eval_expression(
        &mut self,
        expression: &Expression,
    ) -> Result<Option<Value>, InterpreterError> {
        let foreach = match &expression.foreach {
            None => return self.eval_script(&expression.script),
            Some(name) => name,
        };
        let var = expression.var.as_deref().unwrap_or("it");

        let elements = match self.get(foreach) {
            Some(value) => value.as_list(),
            None => Vec::new(),
        };

        let mut collected: Vec<String> = Vec::new();
        for element in elements {
            self.set(var, Value::Text(element));
            let result = self.eval_script(&expression.script)?;
            let Some(result) = result else { continue };
            for scalar in result.as_list() {
                if !collected.contains(&scalar) {
                    collected.push(scalar);
                }
            }
        }

        Ok(Value::collapse(collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interp() -> DefaultInterpreter {
        DefaultInterpreter::new()
    }

    #[test]
    fn test_constant_wins() {
        let mut i = interp();
        i.set("cn", "bound".into());
        let v = i
            .eval_value(&MappingValue::Constant("fixed".into()))
            .unwrap();
        assert_eq!(v, Some(Value::Text("fixed".into())));
    }

    #[test]
    fn test_variable_rdn_prefix_fallback() {
        let mut i = interp();
        i.set("uid", "jdoe".into());
        // "rdn.uid" is unbound; the lookup retries with the prefix stripped.
        let v = i
            .eval_value(&MappingValue::Variable("rdn.uid".into()))
            .unwrap();
        assert_eq!(v, Some(Value::Text("jdoe".into())));
    }

    #[test]
    fn test_foreach_collapse_to_scalar() {
        let mut i = interp();
        i.set("g.member", Value::Set(vec!["bob".into()]));
        let expr = Expression::foreach("m", "g.member", "m");
        let v = i.eval_expression(&expr).unwrap();
        assert_eq!(v, Some(Value::Text("bob".into())));
    }

    #[test]
    fn test_foreach_keeps_set() {
        let mut i = interp();
        i.set("g.member", Value::Set(vec!["bob".into(), "carol".into()]));
        let expr = Expression::foreach("m", "g.member", "m");
        let v = i.eval_expression(&expr).unwrap();
        assert_eq!(v, Some(Value::Set(vec!["bob".into(), "carol".into()])));
    }

    #[test]
    fn test_foreach_empty_collection() {
        let mut i = interp();
        i.set("g.member", Value::Set(Vec::new()));
        let expr = Expression::foreach("m", "g.member", "m");
        assert_eq!(i.eval_expression(&expr).unwrap(), None);
        // Unbound collection behaves the same.
        let expr = Expression::foreach("m", "g.other", "m");
        assert_eq!(i.eval_expression(&expr).unwrap(), None);
    }

    #[test]
    fn test_foreach_distinct_results() {
        let mut i = interp();
        i.set(
            "g.member",
            Value::Set(vec!["bob".into(), "bob".into(), "carol".into()]),
        );
        let expr = Expression::foreach("m", "g.member", "m");
        let v = i.eval_expression(&expr).unwrap();
        assert_eq!(v, Some(Value::Set(vec!["bob".into(), "carol".into()])));
    }

    #[test]
    fn test_set_source_values_binding() {
        let mut i = interp();
        let mut sv = SourceValues::new();
        sv.add_value("u.uid", "jdoe");
        sv.add_value("u.mail", "a@x");
        sv.add_value("u.mail", "b@x");
        i.set_source_values(&sv);

        assert_eq!(i.get("u.uid"), Some(Value::Text("jdoe".into())));
        assert_eq!(
            i.get("u.mail"),
            Some(Value::Set(vec!["a@x".into(), "b@x".into()]))
        );
    }
}
