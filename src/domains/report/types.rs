use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Acknowledgement text returned when an export is queued.
pub const EXPORT_ACCEPTED_MESSAGE: &str = "Excel report generation in progress";

/// Caller supplied substring filters, keyed by column name.
///
/// A `BTreeMap` keeps the generated predicate stable for a given set of filters.
pub type ExportFilters = BTreeMap<String, String>;

/// Stored report definition as handed out by the template resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTemplate {
    pub id: i64,
    /// SQL fragment without a WHERE clause.
    pub base_query: String,
    /// Raw predicate text appended after `WHERE`.
    pub where_fragment: String,
}

/// One accepted export, alive for as long as its job task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub report_id: i64,
    /// Subscriber key for progress; empty means nobody is listening.
    pub client_id: String,
    pub filters: ExportFilters,
    pub block_size: usize,
    pub requested_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(report_id: i64, client_id: impl Into<String>, filters: ExportFilters, block_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            report_id,
            client_id: client_id.into(),
            filters,
            block_size,
            requested_at: Utc::now(),
        }
    }

    pub fn has_subscriber(&self) -> bool {
        !self.client_id.is_empty()
    }
}

/// One page of a template's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: usize,
    pub limit: usize,
}

impl Chunk {
    pub fn new(index: usize, block_size: usize) -> Self {
        Self {
            index,
            offset: index * block_size,
            limit: block_size,
        }
    }
}

/// Transport-safe scalar produced by the coercion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// Ordered column → value record.
///
/// All rows of a chunk share the same column list.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    columns: Arc<Vec<String>>,
    values: Vec<CellValue>,
}

impl ResultRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<CellValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl Serialize for ResultRow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Order in which the aggregation writer appends chunk results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkOrdering {
    /// Append each chunk as soon as it arrives.
    #[default]
    Arrival,
    /// Hold early chunks back and append strictly by chunk index.
    Index,
}

impl FromStr for ChunkOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" => Ok(Self::Arrival),
            "index" | "ordered" => Ok(Self::Index),
            other => Err(format!("unknown chunk ordering '{}'", other)),
        }
    }
}

/// Whether subscribers hear about failed or partial exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureNotification {
    /// Failures only reach the logs and the job handle.
    #[default]
    Silent,
    /// Failures are also pushed to the subscriber.
    Notify,
}

impl FromStr for FailureNotification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "notify" => Ok(Self::Notify),
            other => Err(format!("unknown failure notification policy '{}'", other)),
        }
    }
}

/// A chunk whose rows never reached the workbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub index: usize,
    pub message: String,
}

/// Final state of an export job that produced an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub job_id: Uuid,
    pub report_id: i64,
    pub filename: String,
    pub url: String,
    pub total_rows: usize,
    pub rows_written: usize,
    pub sheets: usize,
    pub chunk_count: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl ExportOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_chunks.is_empty()
    }
}

/// Export trigger input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub report_id: i64,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub filters: ExportFilters,
}

/// Immediate acknowledgement of an export trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAccepted {
    pub job_id: Uuid,
    pub message: String,
}

/// Paginated preview input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub report_id: i64,
    pub page: usize,
    pub page_size: usize,
    #[serde(default)]
    pub filters: ExportFilters,
}

/// One synchronously fetched page of a report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewPage {
    pub page: usize,
    pub page_size: usize,
    pub results: Vec<ResultRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_offsets() {
        let chunk = Chunk::new(3, 250);
        assert_eq!(chunk.offset, 750);
        assert_eq!(chunk.limit, 250);
    }

    #[test]
    fn test_result_row_serializes_in_column_order() {
        let columns = Arc::new(vec!["z".to_string(), "a".to_string(), "m".to_string()]);
        let row = ResultRow::new(
            columns,
            vec![CellValue::Int(1), CellValue::Null, CellValue::Text("x".into())],
        );
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"z":1,"a":null,"m":"x"}"#);
        assert_eq!(row.get("m"), Some(&CellValue::Text("x".into())));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Index".parse::<ChunkOrdering>(), Ok(ChunkOrdering::Index));
        assert_eq!("arrival".parse::<ChunkOrdering>(), Ok(ChunkOrdering::Arrival));
        assert!("random".parse::<ChunkOrdering>().is_err());
        assert_eq!("NOTIFY".parse::<FailureNotification>(), Ok(FailureNotification::Notify));
        assert!("loud".parse::<FailureNotification>().is_err());
    }

    #[test]
    fn test_job_without_client_has_no_subscriber() {
        let job = ExportJob::new(7, "", ExportFilters::new(), 10);
        assert!(!job.has_subscriber());
        assert!(ExportJob::new(7, "c-1", ExportFilters::new(), 10).has_subscriber());
    }
}
