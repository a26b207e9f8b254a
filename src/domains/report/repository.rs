use crate::domains::report::coercion::{coerce_sqlite_row, column_names};
use crate::domains::report::types::{Chunk, ExportFilters, ReportTemplate, ResultRow};
use crate::errors::{ExportError, ExportResult};
use crate::validation::{quote_identifier, substring_pattern, validate_column_identifier};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

/// A resolved template plus the caller's post-filter, ready to be paged.
///
/// Filter values are always bound as parameters; only validated column
/// names are spliced into the SQL text.
#[derive(Debug, Clone)]
pub struct ReportQuery {
    template: ReportTemplate,
    post_filter: Vec<(String, String)>,
}

impl ReportQuery {
    pub fn new(template: ReportTemplate, filters: &ExportFilters) -> ExportResult<Self> {
        let mut post_filter = Vec::with_capacity(filters.len());
        for (field, value) in filters {
            validate_column_identifier(field)?;
            post_filter.push((field.clone(), value.clone()));
        }
        Ok(Self { template, post_filter })
    }

    pub fn template(&self) -> &ReportTemplate {
        &self.template
    }

    pub fn has_post_filter(&self) -> bool {
        !self.post_filter.is_empty()
    }

    /// The post-filter predicate with `?` placeholders, e.g.
    /// `"name" LIKE ? ESCAPE '\' AND "city" LIKE ? ESCAPE '\'`.
    pub fn post_filter_predicate(&self) -> Option<String> {
        if self.post_filter.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .post_filter
            .iter()
            .map(|(field, _)| format!("{} LIKE ? ESCAPE '\\'", quote_identifier(field)))
            .collect();
        Some(parts.join(" AND "))
    }

    fn base_sql(&self) -> String {
        let where_fragment = self.template.where_fragment.trim();
        if where_fragment.is_empty() {
            self.template.base_query.clone()
        } else {
            format!("{} WHERE {}", self.template.base_query, where_fragment)
        }
    }

    // The post-filter wraps the templated query so it can reference the
    // template's output columns, like a HAVING over the projection.
    fn push_source(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        if self.post_filter.is_empty() {
            qb.push(self.base_sql());
            return;
        }
        qb.push("SELECT * FROM (");
        qb.push(self.base_sql());
        qb.push(") AS report_rows WHERE ");
        for (i, (field, value)) in self.post_filter.iter().enumerate() {
            if i > 0 {
                qb.push(" AND ");
            }
            qb.push(quote_identifier(field));
            qb.push(" LIKE ");
            qb.push_bind(substring_pattern(value));
            qb.push(" ESCAPE '\\'");
        }
    }

    pub fn count_builder(&self) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM (");
        self.push_source(&mut qb);
        qb.push(") AS count_query");
        qb
    }

    pub fn page_builder(&self, limit: usize, offset: usize) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new("");
        self.push_source(&mut qb);
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
        qb
    }
}

/// Read access to report data, one page at a time.
#[async_trait]
pub trait ReportRepository: Send + Sync {
    /// Total number of rows the query produces.
    async fn count_rows(&self, query: &ReportQuery) -> ExportResult<usize>;

    /// Fetch one page of coerced rows.
    async fn fetch_page(&self, query: &ReportQuery, limit: usize, offset: usize) -> ExportResult<Vec<ResultRow>>;

    /// Fetch the rows belonging to `chunk`.
    async fn fetch_chunk(&self, query: &ReportQuery, chunk: Chunk) -> ExportResult<Vec<ResultRow>> {
        self.fetch_page(query, chunk.limit, chunk.offset)
            .await
            .map_err(|e| e.for_chunk(chunk.index))
    }
}

/// SQLite implementation over the shared connection pool.
pub struct SqliteReportRepository {
    pool: SqlitePool,
}

impl SqliteReportRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportRepository for SqliteReportRepository {
    async fn count_rows(&self, query: &ReportQuery) -> ExportResult<usize> {
        let mut qb = query.count_builder();
        let total = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ExportError::CountQueryFailed(e.to_string()))?;
        Ok(total.max(0) as usize)
    }

    async fn fetch_page(&self, query: &ReportQuery, limit: usize, offset: usize) -> ExportResult<Vec<ResultRow>> {
        let mut qb = query.page_builder(limit, offset);
        let mut rows = qb.build().fetch(&self.pool);

        let mut results = Vec::new();
        let mut columns: Option<Arc<Vec<String>>> = None;
        while let Some(row) = rows.try_next().await.map_err(|e| ExportError::ChunkQueryFailed {
            index: offset.checked_div(limit).unwrap_or(0),
            message: e.to_string(),
        })? {
            let cols = columns.get_or_insert_with(|| column_names(&row));
            results.push(coerce_sqlite_row(&row, cols)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domains::report::types::CellValue;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Single-connection in-memory database with `t(id, name)` and a template table.
    pub(crate) async fn fixture_pool(rows: &[(i64, &str)]) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE sys_meta_rpt (id INTEGER PRIMARY KEY, query TEXT NOT NULL, _where TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sys_meta_rpt (id, query, _where) VALUES (1, 'SELECT id,name FROM t', '1=1')")
            .execute(&pool)
            .await
            .unwrap();
        for (id, name) in rows {
            sqlx::query("INSERT INTO t (id, name) VALUES (?, ?)")
                .bind(id)
                .bind(*name)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    fn template() -> ReportTemplate {
        ReportTemplate {
            id: 1,
            base_query: "SELECT id,name FROM t".to_string(),
            where_fragment: "1=1".to_string(),
        }
    }

    fn filters(pairs: &[(&str, &str)]) -> ExportFilters {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_no_filters_means_no_post_filter() {
        let query = ReportQuery::new(template(), &ExportFilters::new()).unwrap();
        assert!(!query.has_post_filter());
        assert_eq!(query.post_filter_predicate(), None);
        assert_eq!(
            query.page_builder(2, 4).sql(),
            "SELECT id,name FROM t WHERE 1=1 LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn test_filters_become_bound_like_predicates() {
        let query = ReportQuery::new(template(), &filters(&[("name", "foo"), ("city", "x")])).unwrap();
        assert_eq!(
            query.post_filter_predicate().unwrap(),
            "\"city\" LIKE ? ESCAPE '\\' AND \"name\" LIKE ? ESCAPE '\\'"
        );
        let sql = query.count_builder().sql().to_string();
        assert!(sql.starts_with("SELECT COUNT(*) FROM (SELECT * FROM (SELECT id,name FROM t WHERE 1=1) AS report_rows WHERE"));
        assert!(!sql.contains("foo"));
    }

    #[test]
    fn test_invalid_filter_field_is_rejected() {
        let err = ReportQuery::new(template(), &filters(&[("name) OR (1=1", "x")])).unwrap_err();
        assert!(matches!(err, ExportError::InvalidFilter(_)));
    }

    #[test]
    fn test_empty_where_fragment_is_omitted() {
        let mut bare = template();
        bare.where_fragment = "  ".to_string();
        let query = ReportQuery::new(bare, &ExportFilters::new()).unwrap();
        assert_eq!(query.page_builder(1, 0).sql(), "SELECT id,name FROM t LIMIT ? OFFSET ?");
    }

    #[tokio::test]
    async fn test_count_and_fetch_pages() {
        let pool = fixture_pool(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]).await;
        let repo = SqliteReportRepository::new(pool);
        let query = ReportQuery::new(template(), &ExportFilters::new()).unwrap();

        assert_eq!(repo.count_rows(&query).await.unwrap(), 5);
        let last = repo.fetch_chunk(&query, Chunk::new(2, 2)).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].columns(), &["id", "name"]);

        let beyond = repo.fetch_page(&query, 2, 10).await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_page_bounds_never_go_negative() {
        let pool = fixture_pool(&[(1, "a"), (2, "b"), (3, "c")]).await;
        let repo = SqliteReportRepository::new(pool);
        let query = ReportQuery::new(template(), &ExportFilters::new()).unwrap();

        // A wrapped negative OFFSET would be read as zero and return rows.
        let past_end = repo.fetch_page(&query, 10, usize::MAX).await.unwrap();
        assert!(past_end.is_empty());
        let everything = repo.fetch_page(&query, usize::MAX, 1).await.unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_filter_applies_to_count_and_rows() {
        let pool = fixture_pool(&[(1, "foo"), (2, "bar"), (3, "seafood"), (4, "FOOD")]).await;
        let repo = SqliteReportRepository::new(pool);
        let query = ReportQuery::new(template(), &filters(&[("name", "foo")])).unwrap();

        // SQLite LIKE is case-insensitive for ASCII, as MySQL's default collation is.
        assert_eq!(repo.count_rows(&query).await.unwrap(), 3);
        let rows = repo.fetch_page(&query, 10, 0).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.get("name").cloned().unwrap()).collect();
        assert!(!names.contains(&CellValue::Text("bar".into())));
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_filter_value_is_not_interpreted_as_sql() {
        let pool = fixture_pool(&[(1, "a'b"), (2, "plain")]).await;
        let repo = SqliteReportRepository::new(pool);
        let query = ReportQuery::new(template(), &filters(&[("name", "' OR '1'='1")])).unwrap();
        assert_eq!(repo.count_rows(&query).await.unwrap(), 0);

        let quoted = ReportQuery::new(template(), &filters(&[("name", "a'b")])).unwrap();
        assert_eq!(repo.count_rows(&quoted).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_broken_template_fails_count() {
        let pool = fixture_pool(&[]).await;
        let repo = SqliteReportRepository::new(pool);
        let mut broken = template();
        broken.base_query = "SELECT nope FROM missing_table".to_string();
        let query = ReportQuery::new(broken, &ExportFilters::new()).unwrap();
        assert!(matches!(repo.count_rows(&query).await, Err(ExportError::CountQueryFailed(_))));
        assert!(matches!(
            repo.fetch_chunk(&query, Chunk::new(3, 10)).await,
            Err(ExportError::ChunkQueryFailed { index: 3, .. })
        ));
    }
}
