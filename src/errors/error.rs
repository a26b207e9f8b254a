use serde::Serialize;
use thiserror::Error;

/// Database errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DbError {
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DbError", 2)?;
        let kind = match self {
            DbError::ConnectionPool(_) => "ConnectionPool",
        };
        state.serialize_field("type", kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Failures of the export pipeline, from template lookup to upload.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
pub enum ExportError {
    #[error("Report template {0} not found")]
    TemplateNotFound(i64),

    #[error("Report template {id} could not be loaded: {message}")]
    TemplateLookupFailed { id: i64, message: String },

    #[error("Count query failed: {0}")]
    CountQueryFailed(String),

    #[error("Query for chunk {index} failed: {message}")]
    ChunkQueryFailed { index: usize, message: String },

    #[error("Column '{column}' holds a value of unsupported type {type_name}")]
    CoercionFailed { column: String, type_name: String },

    #[error("Invalid filter field '{0}'")]
    InvalidFilter(String),

    #[error("Block size must be greater than zero")]
    InvalidBlockSize,

    #[error("Workbook assembly failed: {0}")]
    WriteFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Local cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Export queue is closed")]
    QueueClosed,
}

impl ExportError {
    /// Attach the chunk index to an error raised while reading a chunk.
    pub fn for_chunk(self, index: usize) -> Self {
        match self {
            ExportError::ChunkQueryFailed { message, .. } => ExportError::ChunkQueryFailed { index, message },
            other => other,
        }
    }
}

/// Configuration errors raised while reading the environment
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Service-level errors returned to callers of the export API
#[derive(Debug, Error, Clone, Serialize)]
pub enum ServiceError {
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
