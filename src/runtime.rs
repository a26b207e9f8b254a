use crate::config::ExportConfig;
use crate::domains::notification::NotificationHub;
use crate::domains::report::uploader::build_object_store;
use crate::domains::report::{
    ArtifactUploader, ExportDependencies, ExportSettings, ReportExportService, SqliteReportRepository,
    SqliteTemplateResolver, XlsxBackendFactory,
};
use crate::errors::{DbError, ServiceResult};
use object_store::ObjectStore;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Install `env_logger`, defaulting to `info` when `RUST_LOG` is unset.
/// Safe to call more than once.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

pub async fn connect_pool(config: &ExportConfig) -> ServiceResult<SqlitePool> {
    log::debug!("Connecting to {}", config.database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .max_lifetime(config.connection_lifetime)
        .connect(&config.database_url)
        .await
        .map_err(|e| DbError::ConnectionPool(format!("{}: {}", config.database_url, e)))?;
    Ok(pool)
}

/// Everything a running export process owns.
pub struct ExportRuntime {
    pub config: ExportConfig,
    pub pool: SqlitePool,
    pub hub: Arc<NotificationHub>,
    pub service: Arc<ReportExportService>,
}

impl ExportRuntime {
    /// Connect the pool, start the hub and wire the export service against S3.
    pub async fn initialize(config: ExportConfig) -> ServiceResult<Self> {
        let store = build_object_store(&config.storage)?;
        Self::initialize_with_store(config, store).await
    }

    /// Same as [`initialize`](Self::initialize) with a caller-provided object store.
    pub async fn initialize_with_store(config: ExportConfig, store: Arc<dyn ObjectStore>) -> ServiceResult<Self> {
        let pool = connect_pool(&config).await?;
        let hub = Arc::new(NotificationHub::new(config.subscriber_queue_capacity));
        let uploader = Arc::new(ArtifactUploader::new(
            store,
            config.local_dir.clone(),
            config.storage.public_base_url.clone(),
        ));

        let service = ReportExportService::new(
            ExportDependencies {
                resolver: Arc::new(SqliteTemplateResolver::new(pool.clone())),
                repository: Arc::new(SqliteReportRepository::new(pool.clone())),
                hub: hub.clone(),
                uploader,
                backends: Arc::new(XlsxBackendFactory),
            },
            ExportSettings::from_config(&config),
        );

        log::info!(
            "Export runtime ready: {} workers, queue {}, block size {}",
            config.max_concurrent_jobs,
            config.queue_capacity,
            config.block_size
        );
        Ok(Self {
            config,
            pool,
            hub,
            service,
        })
    }

    /// Close subscriber queues and the connection pool.
    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
        self.pool.close().await;
        log::info!("Export runtime stopped");
    }
}
