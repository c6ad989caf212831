use thiserror::Error;

/// Top-level error type for the model record store.
///
/// Engine-level failures are carried as strings with call-site context so
/// that `rusqlite` types never leak out of the storage crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MoError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The database file could not be created or opened. Not retried.
    #[error("Storage unavailable at {path}: {reason}")]
    StorageUnavailable { path: String, reason: String },

    /// A schema version has no registered upgrade step.
    #[error("Missing schema migration from version {from} (target {target})")]
    MigrationChainBroken { from: u32, target: u32 },

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Tag already exists: {0}")]
    DuplicateTag(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MoError {
    /// Shorthand for a [`MoError::NotFound`] keyed by anything displayable.
    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        MoError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        MoError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for MoError {
    fn from(err: toml::de::Error) -> Self {
        MoError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MoError {
    fn from(err: toml::ser::Error) -> Self {
        MoError::Config(err.to_string())
    }
}

/// A specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, MoError>;
