use crate::config::StorageConfig;
use crate::errors::{ExportError, ExportResult, ServiceError, ServiceResult};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Key prefix for every uploaded report.
pub const REPORTS_PREFIX: &str = "reports";

/// `report_<id>_<uuid>.xlsx`
pub fn report_filename(report_id: i64) -> String {
    format!("report_{}_{}.xlsx", report_id, Uuid::new_v4())
}

/// Build an S3 (or S3-compatible) store from the storage settings.
pub fn build_object_store(config: &StorageConfig) -> ServiceResult<Arc<dyn ObjectStore>> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(&config.bucket)
        .with_region(&config.region);

    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint).with_allow_http(endpoint.starts_with("http://"));
    }
    if let Some(key_id) = &config.access_key_id {
        builder = builder.with_access_key_id(key_id);
    }
    if let Some(secret) = &config.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }

    let store = builder
        .build()
        .map_err(|e| ServiceError::Storage(format!("Failed to create S3 store: {}", e)))?;
    Ok(Arc::new(store))
}

/// Moves finished workbooks from the local staging directory to object storage.
pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
    local_dir: PathBuf,
    public_base_url: String,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>, local_dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            store,
            local_dir: local_dir.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create the staging directory if needed and return the local path for `filename`.
    pub async fn staging_path(&self, filename: &str) -> ExportResult<PathBuf> {
        tokio::fs::create_dir_all(&self.local_dir)
            .await
            .map_err(|e| ExportError::WriteFailed(format!("cannot create {}: {}", self.local_dir.display(), e)))?;
        Ok(self.local_dir.join(filename))
    }

    pub fn object_key(filename: &str) -> String {
        format!("{}/{}", REPORTS_PREFIX, filename)
    }

    pub fn public_url(&self, filename: &str) -> String {
        format!("{}/{}", self.public_base_url, Self::object_key(filename))
    }

    /// Upload the file at `local_path` as `reports/<filename>` and return its URL.
    ///
    /// The local file is removed afterwards whether or not the upload worked;
    /// failing to remove it is only logged.
    pub async fn upload(&self, local_path: &Path, filename: &str) -> ExportResult<String> {
        let result = self.put(local_path, filename).await;
        self.cleanup(local_path).await;
        result
    }

    async fn put(&self, local_path: &Path, filename: &str) -> ExportResult<String> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| ExportError::UploadFailed(format!("cannot read {}: {}", local_path.display(), e)))?;
        let size = data.len();
        let key = ObjectPath::from(Self::object_key(filename));

        self.store
            .put(&key, PutPayload::from(data))
            .await
            .map_err(|e| {
                log::error!("Upload of {} failed: {}", key, e);
                ExportError::UploadFailed(e.to_string())
            })?;

        let url = self.public_url(filename);
        log::info!("Uploaded {} ({} bytes) to {}", filename, size, url);
        Ok(url)
    }

    async fn cleanup(&self, local_path: &Path) {
        if let Err(e) = tokio::fs::remove_file(local_path).await {
            let err = ExportError::CleanupFailed(format!("{}: {}", local_path.display(), e));
            log::warn!("{}", err);
        }
    }
}
