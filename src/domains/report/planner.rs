use crate::domains::report::repository::{ReportQuery, ReportRepository};
use crate::domains::report::template::TemplateResolver;
use crate::domains::report::types::{Chunk, ExportFilters};
use crate::errors::{ExportError, ExportResult};
use std::sync::Arc;

/// Number of chunks needed for `total_rows` at `block_size` rows each.
pub fn chunk_count(total_rows: usize, block_size: usize) -> usize {
    if block_size == 0 {
        return 0;
    }
    total_rows.div_ceil(block_size)
}

/// Partition of one export's result set.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub query: ReportQuery,
    pub total_rows: usize,
    pub block_size: usize,
    pub chunk_count: usize,
}

impl ChunkPlan {
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.chunk_count).map(move |index| Chunk::new(index, self.block_size))
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }
}

/// Resolves a template, counts its rows and splits them into chunks.
pub struct ChunkPlanner {
    resolver: Arc<dyn TemplateResolver>,
    repository: Arc<dyn ReportRepository>,
}

impl ChunkPlanner {
    pub fn new(resolver: Arc<dyn TemplateResolver>, repository: Arc<dyn ReportRepository>) -> Self {
        Self { resolver, repository }
    }

    /// Resolve the template and attach the post-filter, without counting.
    pub async fn prepare(&self, report_id: i64, filters: &ExportFilters) -> ExportResult<ReportQuery> {
        let template = self.resolver.resolve(report_id).await?;
        ReportQuery::new(template, filters)
    }

    pub async fn plan(&self, report_id: i64, filters: &ExportFilters, block_size: usize) -> ExportResult<ChunkPlan> {
        if block_size == 0 {
            return Err(ExportError::InvalidBlockSize);
        }
        let query = self.prepare(report_id, filters).await?;
        let total_rows = self.repository.count_rows(&query).await?;
        let chunk_count = chunk_count(total_rows, block_size);
        log::debug!(
            "Report {} planned: {} rows in {} chunks of {}",
            report_id,
            total_rows,
            chunk_count,
            block_size
        );
        Ok(ChunkPlan {
            query,
            total_rows,
            block_size,
            chunk_count,
        })
    }
}
