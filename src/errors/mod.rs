mod error;

pub use error::{ConfigError, DbError, ExportError, ServiceError};

/// Result type for export pipeline operations
pub type ExportResult<T> = Result<T, ExportError>;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
