//! Error types for the VirtDir core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Expected directory outcomes (entry not found, access denied, size limit
//! hit) are *not* modeled as these subsystem errors. They travel as
//! [`OperationFault`] values carrying a [`ResultCode`], which every public
//! engine operation returns in its `Err` arm. Subsystem errors are reserved
//! for genuinely unexpected conditions: broken config, unreachable
//! backends, interpreter script failures.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Directory-protocol result codes shared by every backend kind.
///
/// The numeric values follow the standard directory-protocol assignments so
/// faults can be surfaced to protocol frontends without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    OperationsError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    NoSuchAttribute,
    NoSuchObject,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    NotAllowedOnNonLeaf,
    EntryAlreadyExists,
    Other,
}

impl ResultCode {
    /// The standard numeric code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Success => 0,
            Self::OperationsError => 1,
            Self::TimeLimitExceeded => 3,
            Self::SizeLimitExceeded => 4,
            Self::NoSuchAttribute => 16,
            Self::NoSuchObject => 32,
            Self::InvalidCredentials => 49,
            Self::InsufficientAccessRights => 50,
            Self::Busy => 51,
            Self::NotAllowedOnNonLeaf => 66,
            Self::EntryAlreadyExists => 68,
            Self::Other => 80,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::OperationsError => "operations_error",
            Self::TimeLimitExceeded => "time_limit_exceeded",
            Self::SizeLimitExceeded => "size_limit_exceeded",
            Self::NoSuchAttribute => "no_such_attribute",
            Self::NoSuchObject => "no_such_object",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InsufficientAccessRights => "insufficient_access_rights",
            Self::Busy => "busy",
            Self::NotAllowedOnNonLeaf => "not_allowed_on_non_leaf",
            Self::EntryAlreadyExists => "entry_already_exists",
            Self::Other => "other",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Operation fault
// ---------------------------------------------------------------------------

/// A typed fault returned by public engine operations.
///
/// Expected conditions (not-found, denied, size limit) are first-class
/// values of this type, never panics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code} ({}): {message}", code.code())]
pub struct OperationFault {
    pub code: ResultCode,
    pub message: String,
}

impl OperationFault {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn no_such_object(dn: impl std::fmt::Display) -> Self {
        Self::new(ResultCode::NoSuchObject, format!("no such object: {}", dn))
    }

    pub fn insufficient_access(dn: impl std::fmt::Display) -> Self {
        Self::new(
            ResultCode::InsufficientAccessRights,
            format!("insufficient access rights on {}", dn),
        )
    }

    pub fn operations_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::OperationsError, message)
    }
}

/// Result alias used by every public engine operation.
pub type OpResult<T> = Result<T, OperationFault>;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Operation(#[from] OperationFault),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading config files.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

/// Errors from DN/filter parsing and schema normalization.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A DN string could not be parsed.
    #[error("malformed DN '{dn}': {detail}")]
    MalformedDn { dn: String, detail: String },

    /// A filter string could not be parsed.
    #[error("malformed filter '{filter}': {detail}")]
    MalformedFilter { filter: String, detail: String },
}

// ---------------------------------------------------------------------------
// Mapping errors
// ---------------------------------------------------------------------------

/// Errors from the entry-mapping arena and the graph analyzer.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The requested entry id is not in the arena.
    #[error("entry mapping not found: {0}")]
    EntryNotFound(String),

    /// Removal refused because the entry still has children.
    #[error("entry mapping {id} has {children} children")]
    NotLeaf { id: String, children: usize },

    /// A submitted definition is malformed.
    #[error("invalid entry definition: {0}")]
    BadDefinition(String),

    /// An entry with the same DN already exists in the partition.
    #[error("duplicate entry mapping DN: {0}")]
    DuplicateDn(String),

    /// A relationship side references an alias with no matching source.
    #[error("relationship references unknown source alias '{alias}' in entry {dn}")]
    UnknownAlias { alias: String, dn: String },

    /// A source mapping references an undefined source.
    #[error("entry {dn} references undefined source '{source_name}'")]
    UndefinedSource { dn: String, source_name: String },
}

// ---------------------------------------------------------------------------
// Interpreter errors
// ---------------------------------------------------------------------------

/// Errors from expression evaluation.
#[derive(Debug, Error)]
pub enum InterpreterError {
    /// The configured interpreter identifier is not registered.
    #[error("unknown interpreter '{0}'")]
    UnknownInterpreter(String),

    /// A script failed to evaluate.
    #[error("error evaluating '{script}': {detail}")]
    ScriptError { script: String, detail: String },

    /// An attribute mapping failed to evaluate.
    #[error("error evaluating attribute '{attribute}': {detail}")]
    AttributeError { attribute: String, detail: String },
}

// ---------------------------------------------------------------------------
// Source / backend errors
// ---------------------------------------------------------------------------

/// Errors from backend adapters and the connection layer.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The configured adapter identifier is not registered.
    #[error("undefined adapter '{0}'")]
    UndefinedAdapter(String),

    /// A source references an undefined connection.
    #[error("source '{source_name}' references undefined connection '{connection}'")]
    UndefinedConnection { source_name: String, connection: String },

    /// Could not acquire the per-source lock within the bounded wait.
    #[error("lock timeout on source '{source_name}' after {waited_ms}ms")]
    LockTimeout { source_name: String, waited_ms: u64 },

    /// Underlying SQLite error from the relational adapter.
    #[error("sql backend error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Underlying LDAP error from the directory adapter.
    #[error("ldap backend error: {0}")]
    Ldap(#[from] ldap3::LdapError),

    /// The adapter rejected its configuration.
    #[error("adapter configuration error for '{source_name}': {detail}")]
    BadConfig { source_name: String, detail: String },

    /// The adapter cannot forward DN-addressed proxy operations.
    #[error("adapter does not support proxy forwarding: {0}")]
    ProxyUnsupported(String),

    /// Generic I/O wrapper.
    #[error("source I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Partition errors
// ---------------------------------------------------------------------------

/// Errors from partition loading and lifecycle.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The named partition does not exist.
    #[error("partition not found: {0}")]
    NotFound(String),

    /// The partition is not in a state that allows the operation.
    #[error("partition '{name}' is {status}, expected {expected}")]
    WrongStatus {
        name: String,
        status: String,
        expected: String,
    },

    /// Loading one partition failed. Fatal only for that partition.
    #[error("failed to load partition '{name}': {detail}")]
    LoadFailed { name: String, detail: String },

    /// Configuration error during load.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Mapping error during load.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Source/connection error during start.
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_values() {
        assert_eq!(ResultCode::Success.code(), 0);
        assert_eq!(ResultCode::NoSuchObject.code(), 32);
        assert_eq!(ResultCode::InsufficientAccessRights.code(), 50);
        assert_eq!(ResultCode::NotAllowedOnNonLeaf.code(), 66);
    }

    #[test]
    fn test_fault_display() {
        let fault = OperationFault::no_such_object("ou=missing,dc=example,dc=com");
        assert_eq!(fault.code, ResultCode::NoSuchObject);
        assert!(fault.to_string().contains("(32)"));
        assert!(fault.to_string().contains("ou=missing"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let src_err = SourceError::UndefinedAdapter("jdbc".into());
        let core_err: CoreError = src_err.into();
        assert!(matches!(core_err, CoreError::Source(_)));

        let fault = OperationFault::operations_error("boom");
        let core_err: CoreError = fault.into();
        assert!(matches!(core_err, CoreError::Operation(_)));
    }
}
