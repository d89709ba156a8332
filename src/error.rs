use thiserror::Error;

use crate::config::ConfigError;

/// Caller-facing error type for every resolver operation
///
/// Only `SourceUnresolvable` and `BuildTimeout` are expected to reach a caller
/// of `SchemaResolver::resolve` during normal operation. `NodeNotFound` is
/// returned when a view names a path the tree does not contain. Parsing and
/// root failures are internal and get folded into `SourceUnresolvable`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaTreeError {
    #[error("Schema source unresolvable: {source_id} - {reason}")]
    SourceUnresolvable { source_id: String, reason: String },

    #[error("Build timeout: {key} after {timeout_ms}ms")]
    BuildTimeout { key: String, timeout_ms: u64 },

    #[error("Node not found: {path}")]
    NodeNotFound { path: String },

    #[error("Schema parsing error: {details}")]
    SchemaParsing { details: String },

    #[error("Root element not declared: {name}")]
    RootNotDeclared { name: String },

    #[error("Build cancelled")]
    BuildCancelled,

    #[error("Build failed: {details}")]
    BuildFailed { details: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchemaTreeError {
    /// A timed-out build leaves nothing behind, so the same call may be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchemaTreeError::BuildTimeout { .. })
    }

    /// Fold a load-time failure into the caller-visible taxonomy.
    pub fn into_unresolvable(self, source_id: &str) -> Self {
        match self {
            SchemaTreeError::SchemaParsing { details } => SchemaTreeError::SourceUnresolvable {
                source_id: source_id.to_string(),
                reason: details,
            },
            SchemaTreeError::RootNotDeclared { name } => SchemaTreeError::SourceUnresolvable {
                source_id: source_id.to_string(),
                reason: format!("root element '{}' is not declared", name),
            },
            other => other,
        }
    }
}

/// Distributed-tier error types, absorbed inside the tier and only logged
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Remote cache unavailable: {store} - {details}")]
    RemoteUnavailable { store: String, details: String },

    #[error("Cache serialization error: {key} - {details}")]
    Serialization { key: String, details: String },

    #[error("Cache corruption detected: {key} - {details}")]
    Corruption { key: String, details: String },
}

/// Problems recovered during a build and recorded on the affected node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildIssue {
    TypeReferenceUnresolved { path: String, name: String },
    ElementReferenceUnresolved { path: String, name: String },
    /// `cycle` lists the walk from the origin type to the repeated type
    CycleDetected { type_name: String, cycle: Vec<String> },
}

impl BuildIssue {
    /// Note tag carried by the node the issue was recorded on
    pub fn note(&self) -> String {
        match self {
            BuildIssue::TypeReferenceUnresolved { name, .. } => {
                format!("unresolved_type:{}", name)
            }
            BuildIssue::ElementReferenceUnresolved { name, .. } => {
                format!("unresolved_ref:{}", name)
            }
            BuildIssue::CycleDetected { cycle, .. } => {
                format!("extension_cycle:{}", cycle.join(" -> "))
            }
        }
    }
}

impl From<ConfigError> for SchemaTreeError {
    fn from(err: ConfigError) -> Self {
        SchemaTreeError::Config(err.to_string())
    }
}

impl From<CacheError> for SchemaTreeError {
    fn from(err: CacheError) -> Self {
        SchemaTreeError::Cache(err.to_string())
    }
}

impl From<quick_xml::Error> for SchemaTreeError {
    fn from(err: quick_xml::Error) -> Self {
        SchemaTreeError::SchemaParsing {
            details: err.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SchemaTreeError>;

/// Cache result type alias
pub type CacheResult<T> = std::result::Result<T, CacheError>;
