use crate::domains::report::types::ReportTemplate;
use crate::errors::{ExportError, ExportResult};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

/// Lookup of stored report definitions.
///
/// Template persistence lives outside this crate; the export pipeline only
/// ever reads through this trait.
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn resolve(&self, report_id: i64) -> ExportResult<ReportTemplate>;
}

/// Resolver backed by the `sys_meta_rpt` table (`id`, `query`, `_where`).
pub struct SqliteTemplateResolver {
    pool: SqlitePool,
}

impl SqliteTemplateResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateResolver for SqliteTemplateResolver {
    async fn resolve(&self, report_id: i64) -> ExportResult<ReportTemplate> {
        let row = sqlx::query("SELECT query, _where FROM sys_meta_rpt WHERE id = ?")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                log::error!("Error fetching report template {}: {}", report_id, e);
                ExportError::TemplateLookupFailed {
                    id: report_id,
                    message: e.to_string(),
                }
            })?;

        let row = row.ok_or(ExportError::TemplateNotFound(report_id))?;
        let lookup_err = |e: sqlx::Error| ExportError::TemplateLookupFailed {
            id: report_id,
            message: e.to_string(),
        };
        let base_query: String = row.try_get("query").map_err(lookup_err)?;
        let where_fragment: Option<String> = row.try_get("_where").map_err(lookup_err)?;

        Ok(ReportTemplate {
            id: report_id,
            base_query,
            where_fragment: where_fragment.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fixture_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE sys_meta_rpt (id INTEGER PRIMARY KEY, name TEXT, query TEXT NOT NULL, _where TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sys_meta_rpt (id, name, query, _where) VALUES (1, 'people', 'SELECT id, name FROM t', '1=1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sys_meta_rpt (id, name, query, _where) VALUES (2, 'bare', 'SELECT id FROM t', NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_resolve_existing_template() {
        let resolver = SqliteTemplateResolver::new(fixture_pool().await);
        let template = resolver.resolve(1).await.unwrap();
        assert_eq!(template.base_query, "SELECT id, name FROM t");
        assert_eq!(template.where_fragment, "1=1");
    }

    #[tokio::test]
    async fn test_null_where_becomes_empty() {
        let resolver = SqliteTemplateResolver::new(fixture_pool().await);
        assert_eq!(resolver.resolve(2).await.unwrap().where_fragment, "");
    }

    #[tokio::test]
    async fn test_missing_template() {
        let resolver = SqliteTemplateResolver::new(fixture_pool().await);
        assert_eq!(resolver.resolve(99).await.unwrap_err(), ExportError::TemplateNotFound(99));
    }
}
