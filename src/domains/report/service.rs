use crate::config::ExportConfig;
use crate::domains::notification::NotificationHub;
use crate::domains::report::planner::ChunkPlanner;
use crate::domains::report::queue_manager::{ExportQueueManager, JobHandle, JobProcessor, QueueStats};
use crate::domains::report::repository::{ReportQuery, ReportRepository};
use crate::domains::report::template::TemplateResolver;
use crate::domains::report::types::{
    Chunk, ChunkOrdering, ExportAccepted, ExportJob, ExportOutcome, ExportRequest, FailureNotification, PreviewPage,
    PreviewRequest, EXPORT_ACCEPTED_MESSAGE,
};
use crate::domains::report::uploader::{report_filename, ArtifactUploader};
use crate::domains::report::workbook::{
    format_progress, AggregationWriter, ChunkResult, SheetBackendFactory, WorkbookState, EXCEL_MAX_ROWS,
};
use crate::errors::{ExportError, ExportResult, ServiceError, ServiceResult};
use crate::validation::validate_column_identifier;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

pub const DEFAULT_PREVIEW_PAGE: usize = 1;
pub const DEFAULT_PREVIEW_PAGE_SIZE: usize = 10;

/// Row offset of a 1-based page. Both the page size and the offset must fit
/// the signed 64-bit LIMIT/OFFSET the database binds.
pub fn page_offset(page: usize, page_size: usize) -> ServiceResult<usize> {
    let offset = page
        .saturating_sub(1)
        .checked_mul(page_size)
        .filter(|offset| i64::try_from(*offset).is_ok())
        .ok_or_else(|| ServiceError::Validation(format!("page {} is out of range", page)))?;
    if i64::try_from(page_size).is_err() {
        return Err(ServiceError::Validation(format!("page size {} is out of range", page_size)));
    }
    Ok(offset)
}

/// Tunables of the export pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSettings {
    pub block_size: usize,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub chunk_concurrency: usize,
    pub chunk_ordering: ChunkOrdering,
    pub failure_notification: FailureNotification,
    /// Rows per sheet, header included.
    pub sheet_row_limit: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self::from_config(&ExportConfig::default())
    }
}

impl ExportSettings {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            block_size: config.block_size,
            max_concurrent_jobs: config.max_concurrent_jobs,
            queue_capacity: config.queue_capacity,
            chunk_concurrency: config.chunk_concurrency,
            chunk_ordering: config.chunk_ordering,
            failure_notification: config.failure_notification,
            sheet_row_limit: EXCEL_MAX_ROWS,
        }
    }
}

/// Everything the export service talks to.
pub struct ExportDependencies {
    pub resolver: Arc<dyn TemplateResolver>,
    pub repository: Arc<dyn ReportRepository>,
    pub hub: Arc<NotificationHub>,
    pub uploader: Arc<ArtifactUploader>,
    pub backends: Arc<dyn SheetBackendFactory>,
}

/// Entry point for report exports and previews.
///
/// Exports run on the queue manager's workers: plan, fan chunks out to the
/// repository, aggregate on a single writer task, upload, then notify.
pub struct ReportExportService {
    planner: ChunkPlanner,
    repository: Arc<dyn ReportRepository>,
    hub: Arc<NotificationHub>,
    uploader: Arc<ArtifactUploader>,
    backends: Arc<dyn SheetBackendFactory>,
    settings: ExportSettings,
    export_manager: ExportQueueManager,
}

impl std::fmt::Debug for ReportExportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportExportService")
            .field("settings", &self.settings)
            .field("export_manager", &self.export_manager.get_stats())
            .finish()
    }
}

impl ReportExportService {
    /// Must be called from within a tokio runtime.
    pub fn new(deps: ExportDependencies, settings: ExportSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| {
            let job_processor = weak_self.clone() as Weak<dyn JobProcessor>;
            let export_manager =
                ExportQueueManager::new(job_processor, settings.max_concurrent_jobs, settings.queue_capacity);
            Self {
                planner: ChunkPlanner::new(deps.resolver, deps.repository.clone()),
                repository: deps.repository,
                hub: deps.hub,
                uploader: deps.uploader,
                backends: deps.backends,
                settings,
                export_manager,
            }
        })
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.export_manager.get_stats()
    }

    /// Queue an export and return a handle to follow it. Waits while the
    /// pending queue is full.
    pub async fn submit_export(&self, request: ExportRequest) -> ServiceResult<JobHandle> {
        for field in request.filters.keys() {
            validate_column_identifier(field)?;
        }
        let job = ExportJob::new(
            request.report_id,
            request.client_id,
            request.filters,
            self.settings.block_size,
        );
        log::info!(
            "Export of report {} requested as job {} (client '{}')",
            job.report_id,
            job.id,
            job.client_id
        );
        Ok(self.export_manager.enqueue(job).await?)
    }

    /// Queue an export and acknowledge it without waiting for the result.
    pub async fn trigger_export(&self, request: ExportRequest) -> ServiceResult<ExportAccepted> {
        let handle = self.submit_export(request).await?;
        Ok(ExportAccepted {
            job_id: handle.id,
            message: EXPORT_ACCEPTED_MESSAGE.to_string(),
        })
    }

    /// Fetch one page of a report synchronously. Page and page size below 1
    /// fall back to 1 and 10.
    pub async fn preview(&self, request: PreviewRequest) -> ServiceResult<PreviewPage> {
        let page = if request.page < 1 { DEFAULT_PREVIEW_PAGE } else { request.page };
        let page_size = if request.page_size < 1 {
            DEFAULT_PREVIEW_PAGE_SIZE
        } else {
            request.page_size
        };
        let offset = page_offset(page, page_size)?;
        let query = self.planner.prepare(request.report_id, &request.filters).await?;
        let results = self.repository.fetch_page(&query, page_size, offset).await?;
        Ok(PreviewPage {
            page,
            page_size,
            results,
        })
    }

    /// Run one export to completion: plan, fetch, aggregate, upload, notify.
    pub async fn run_export(&self, job: ExportJob) -> ExportResult<ExportOutcome> {
        log::info!("Export job {} started for report {}", job.id, job.report_id);
        let result = self.execute(&job).await;
        match &result {
            Ok(outcome) => {
                if outcome.is_partial() {
                    self.notify_on_failure(
                        &job,
                        format!(
                            "Export completed with errors: {} of {} chunks failed",
                            outcome.failed_chunks.len(),
                            outcome.chunk_count
                        ),
                    );
                }
                if job.has_subscriber() {
                    self.hub.notify(&job.client_id, format!("File generated: {}", outcome.url));
                }
            }
            Err(e) => {
                log::error!("Export job {} failed: {}", job.id, e);
                self.notify_on_failure(&job, format!("Export failed: {}", e));
            }
        }
        result
    }

    fn notify_on_failure(&self, job: &ExportJob, message: String) {
        if self.settings.failure_notification == FailureNotification::Notify && job.has_subscriber() {
            self.hub.notify(&job.client_id, message);
        }
    }

    async fn execute(&self, job: &ExportJob) -> ExportResult<ExportOutcome> {
        let plan = self.planner.plan(job.report_id, &job.filters, job.block_size).await?;
        let chunk_count = plan.chunk_count;
        let query = Arc::new(plan.query.clone());

        let (tx, rx) = mpsc::channel(chunk_count.max(1));
        let state = WorkbookState::with_row_limit(self.backends.create(), self.settings.sheet_row_limit);
        let mut writer = AggregationWriter::new(state, self.settings.chunk_ordering, chunk_count);
        if job.has_subscriber() {
            let hub = self.hub.clone();
            let client_id = job.client_id.clone();
            writer = writer.with_progress(Box::new(move |done, total| {
                hub.notify(&client_id, format_progress(done, total));
            }));
        }
        let writer_task = tokio::spawn(writer.run(rx));

        self.fan_out(query, plan.chunks().collect(), tx).await?;

        let finished = writer_task
            .await
            .map_err(|e| ExportError::WriteFailed(format!("writer task aborted: {}", e)))??;

        let filename = report_filename(job.report_id);
        let path = self.uploader.staging_path(&filename).await?;
        let save_path = path.clone();
        let saved = tokio::task::spawn_blocking(move || finished.save(&save_path))
            .await
            .map_err(|e| ExportError::WriteFailed(format!("save task aborted: {}", e)))
            .and_then(|r| r);
        let report = match saved {
            Ok(report) => report,
            Err(e) => {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    if let Err(rm) = tokio::fs::remove_file(&path).await {
                        log::warn!("{}", ExportError::CleanupFailed(format!("{}: {}", path.display(), rm)));
                    }
                }
                return Err(e);
            }
        };

        let url = self.uploader.upload(&path, &filename).await?;

        Ok(ExportOutcome {
            job_id: job.id,
            report_id: job.report_id,
            filename,
            url,
            total_rows: plan.total_rows,
            rows_written: report.rows_written,
            sheets: report.sheets,
            chunk_count,
            failed_chunks: report.failed_chunks,
        })
    }

    /// Fetch every chunk with at most `chunk_concurrency` queries in flight,
    /// sending each result to the writer as it settles.
    async fn fan_out(
        &self,
        query: Arc<ReportQuery>,
        chunks: Vec<Chunk>,
        tx: mpsc::Sender<ChunkResult>,
    ) -> ExportResult<()> {
        let limiter = Arc::new(Semaphore::new(self.settings.chunk_concurrency.max(1)));
        let mut fetches = JoinSet::new();

        for chunk in chunks {
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ExportError::QueueClosed)?;
            let repository = self.repository.clone();
            let query = query.clone();
            let tx = tx.clone();
            fetches.spawn(async move {
                let rows = repository.fetch_chunk(&query, chunk).await;
                drop(permit);
                if tx.send(ChunkResult { index: chunk.index, rows }).await.is_err() {
                    log::debug!("Writer gone before chunk {} was delivered", chunk.index);
                }
            });
        }
        drop(tx);

        while let Some(joined) = fetches.join_next().await {
            if let Err(e) = joined {
                log::error!("Chunk fetch task failed: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for ReportExportService {
    async fn process(&self, job: ExportJob) -> ExportResult<ExportOutcome> {
        self.run_export(job).await
    }
}
