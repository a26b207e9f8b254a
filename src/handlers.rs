//! Request handling for the export trigger and the paginated preview.
//!
//! These functions take already-split request parts (path id, query pairs)
//! and return a status code plus JSON body, so any HTTP layer can sit on top.

use crate::domains::report::service::{DEFAULT_PREVIEW_PAGE, DEFAULT_PREVIEW_PAGE_SIZE};
use crate::domains::report::types::{ExportFilters, ExportRequest, PreviewRequest};
use crate::domains::report::ReportExportService;
use crate::errors::{ExportError, ServiceError};
use crate::validation::parse_report_id;
use serde_json::{json, Value};

/// Query keys that never become filters.
pub const RESERVED_QUERY_KEYS: [&str; 4] = ["id", "page", "limit", "clientid"];

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: Value,
}

impl HandlerResponse {
    fn ok(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

impl From<ServiceError> for HandlerResponse {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Validation(_) => 400,
            ServiceError::Export(ExportError::InvalidFilter(_)) => 400,
            ServiceError::Export(ExportError::TemplateNotFound(_)) => 404,
            ServiceError::Export(ExportError::QueueClosed) => 503,
            _ => 500,
        };
        let message = match err {
            ServiceError::Validation(message) => message,
            other => other.to_string(),
        };
        HandlerResponse::error(status, message)
    }
}

/// Every non-reserved query parameter becomes a filter; the first value wins.
pub fn extract_filters(query: &[(String, String)]) -> ExportFilters {
    let mut filters = ExportFilters::new();
    for (key, value) in query {
        if RESERVED_QUERY_KEYS.contains(&key.as_str()) {
            continue;
        }
        filters.entry(key.clone()).or_insert_with(|| value.clone());
    }
    filters
}

fn first_value<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn positive_or(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(default)
}

/// `(page, limit)` from the query, defaulting to `(1, 10)`.
pub fn parse_page_params(query: &[(String, String)]) -> (usize, usize) {
    (
        positive_or(first_value(query, "page"), DEFAULT_PREVIEW_PAGE),
        positive_or(first_value(query, "limit"), DEFAULT_PREVIEW_PAGE_SIZE),
    )
}

/// Queue an export; answers 202 with the job id once the job is queued.
pub async fn handle_export_trigger(
    service: &ReportExportService,
    id_param: &str,
    client_id: &str,
    query: &[(String, String)],
) -> HandlerResponse {
    let report_id = match parse_report_id(id_param) {
        Ok(id) => id,
        Err(e) => return e.into(),
    };
    if client_id.trim().is_empty() {
        return HandlerResponse::error(400, "missing clientID");
    }

    let request = ExportRequest {
        report_id,
        client_id: client_id.to_string(),
        filters: extract_filters(query),
    };
    match service.trigger_export(request).await {
        Ok(accepted) => HandlerResponse::ok(
            202,
            json!({
                "jobId": accepted.job_id.to_string(),
                "message": accepted.message,
            }),
        ),
        Err(e) => {
            log::error!("Export trigger for report {} rejected: {}", report_id, e);
            e.into()
        }
    }
}

/// Return one page of report rows as `{page, pageSize, results}`.
pub async fn handle_preview(
    service: &ReportExportService,
    id_param: &str,
    query: &[(String, String)],
) -> HandlerResponse {
    let report_id = match parse_report_id(id_param) {
        Ok(id) => id,
        Err(e) => return e.into(),
    };
    let (page, page_size) = parse_page_params(query);
    let request = PreviewRequest {
        report_id,
        page,
        page_size,
        filters: extract_filters(query),
    };

    match service.preview(request).await {
        Ok(preview) => match serde_json::to_value(&preview) {
            Ok(body) => HandlerResponse::ok(200, body),
            Err(e) => HandlerResponse::error(500, format!("JSON serialization failed: {}", e)),
        },
        Err(e) => e.into(),
    }
}
