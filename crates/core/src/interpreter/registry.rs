//! Startup-time interpreter registry.
//!
//! Configured interpreter identifiers map to constructor functions; there
//! is no runtime code loading.

use std::collections::HashMap;

use crate::errors::InterpreterError;

use super::{DefaultInterpreter, Interpreter};

type Constructor = fn() -> Box<dyn Interpreter>;

/// Identifier → constructor registry for interpreter implementations.
pub struct InterpreterRegistry {
    constructors: HashMap<String, Constructor>,
}

impl InterpreterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry with the built-in `default` interpreter registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("default", || Box::new(DefaultInterpreter::new()));
        registry
    }

    pub fn register(&mut self, identifier: &str, constructor: Constructor) {
        self.constructors.insert(identifier.to_string(), constructor);
    }

    /// Instantiate a fresh scope for the given identifier.
    pub fn create(&self, identifier: &str) -> Result<Box<dyn Interpreter>, InterpreterError> {
        self.constructors
            .get(identifier)
            .map(|ctor| ctor())
            .ok_or_else(|| InterpreterError::UnknownInterpreter(identifier.to_string()))
    }
}

impl Default for InterpreterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registered() {
        let registry = InterpreterRegistry::with_defaults();
        assert!(registry.create("default").is_ok());
    }

    #[test]
    fn test_unknown_identifier() {
        let registry = InterpreterRegistry::with_defaults();
        let err = registry.create("beanshell").err().unwrap();
        assert!(matches!(err, InterpreterError::UnknownInterpreter(_)));
    }
}
