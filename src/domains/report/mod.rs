pub mod coercion;
pub mod planner;
pub mod queue_manager;
pub mod repository;
pub mod service;
pub mod template;
pub mod types;
pub mod uploader;
pub mod workbook;

pub use planner::{ChunkPlan, ChunkPlanner};
pub use queue_manager::{ExportQueueManager, JobHandle, JobProcessor, JobStatus, QueueStats};
pub use repository::{ReportQuery, ReportRepository, SqliteReportRepository};
pub use service::{ExportDependencies, ExportSettings, ReportExportService};
pub use template::{SqliteTemplateResolver, TemplateResolver};
pub use types::{
    CellValue, ChunkOrdering, ExportAccepted, ExportFilters, ExportJob, ExportOutcome, ExportRequest,
    FailureNotification, PreviewPage, PreviewRequest, ResultRow,
};
pub use uploader::ArtifactUploader;
pub use workbook::{AggregationWriter, SheetBackend, SheetBackendFactory, XlsxBackendFactory, EXCEL_MAX_ROWS};
