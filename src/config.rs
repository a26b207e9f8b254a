use crate::domains::report::types::{ChunkOrdering, FailureNotification};
use crate::errors::ConfigError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://reports.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_CONNECTION_LIFETIME_SECS: u64 = 180;
pub const DEFAULT_BLOCK_SIZE: usize = 250_000;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;
pub const DEFAULT_LOCAL_DIR: &str = "reports";
pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";
pub const DEFAULT_STORAGE_BUCKET: &str = "reports";

/// Object storage target for finished workbooks.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// S3-compatible endpoint; `None` means AWS itself.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub public_base_url: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    /// Base URL under which uploaded objects are publicly reachable.
    pub fn derive_public_base_url(endpoint: Option<&str>, region: &str, bucket: &str) -> String {
        match endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), bucket),
            None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
        }
    }
}

/// Process configuration for the export pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_lifetime: Duration,
    pub block_size: usize,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub chunk_concurrency: usize,
    pub subscriber_queue_capacity: usize,
    pub local_dir: PathBuf,
    pub chunk_ordering: ChunkOrdering,
    pub failure_notification: FailureNotification,
    pub storage: StorageConfig,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_lifetime: Duration::from_secs(DEFAULT_CONNECTION_LIFETIME_SECS),
            block_size: DEFAULT_BLOCK_SIZE,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            chunk_concurrency: DEFAULT_MAX_CONNECTIONS as usize,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            chunk_ordering: ChunkOrdering::default(),
            failure_notification: FailureNotification::default(),
            storage: StorageConfig {
                endpoint: None,
                region: DEFAULT_STORAGE_REGION.to_string(),
                bucket: DEFAULT_STORAGE_BUCKET.to_string(),
                public_base_url: StorageConfig::derive_public_base_url(
                    None,
                    DEFAULT_STORAGE_REGION,
                    DEFAULT_STORAGE_BUCKET,
                ),
                access_key_id: None,
                secret_access_key: None,
            },
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, &raw, e.to_string())),
    }
}

fn non_zero(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(key, "0", "must be greater than zero"))
    } else {
        Ok(value)
    }
}

impl ExportConfig {
    /// Load from the process environment, reading a `.env` file first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenv::dotenv() {
            log::debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_connections: u32 = parse_var(&lookup, "REPORT_DB_MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError::invalid("REPORT_DB_MAX_CONNECTIONS", "0", "must be greater than zero"));
        }
        let lifetime_secs: u64 = parse_var(&lookup, "REPORT_DB_CONN_LIFETIME_SECS", DEFAULT_CONNECTION_LIFETIME_SECS)?;

        let endpoint = text("REPORT_STORAGE_ENDPOINT");
        let region = text("REPORT_STORAGE_REGION").unwrap_or(defaults.storage.region);
        let bucket = text("REPORT_STORAGE_BUCKET").unwrap_or(defaults.storage.bucket);
        let public_base_url = text("REPORT_STORAGE_PUBLIC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| StorageConfig::derive_public_base_url(endpoint.as_deref(), &region, &bucket));

        Ok(Self {
            database_url: text("REPORT_DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections,
            connection_lifetime: Duration::from_secs(lifetime_secs),
            block_size: non_zero(
                "REPORT_BLOCK_SIZE",
                parse_var(&lookup, "REPORT_BLOCK_SIZE", defaults.block_size)?,
            )?,
            max_concurrent_jobs: non_zero(
                "REPORT_MAX_CONCURRENT_JOBS",
                parse_var(&lookup, "REPORT_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            )?,
            queue_capacity: non_zero(
                "REPORT_QUEUE_CAPACITY",
                parse_var(&lookup, "REPORT_QUEUE_CAPACITY", defaults.queue_capacity)?,
            )?,
            chunk_concurrency: non_zero(
                "REPORT_CHUNK_CONCURRENCY",
                parse_var(&lookup, "REPORT_CHUNK_CONCURRENCY", max_connections as usize)?,
            )?,
            subscriber_queue_capacity: non_zero(
                "REPORT_SUBSCRIBER_QUEUE",
                parse_var(&lookup, "REPORT_SUBSCRIBER_QUEUE", defaults.subscriber_queue_capacity)?,
            )?,
            local_dir: text("REPORT_LOCAL_DIR").map(PathBuf::from).unwrap_or(defaults.local_dir),
            chunk_ordering: parse_var(&lookup, "REPORT_CHUNK_ORDERING", defaults.chunk_ordering)?,
            failure_notification: parse_var(&lookup, "REPORT_FAILURE_NOTIFICATION", defaults.failure_notification)?,
            storage: StorageConfig {
                endpoint,
                region,
                bucket,
                public_base_url,
                access_key_id: text("AWS_ACCESS_KEY_ID"),
                secret_access_key: text("AWS_SECRET_ACCESS_KEY"),
            },
        })
    }
}
