//! Single-consumer aggregation of chunk results into one workbook.
//!
//! Fetch tasks never touch the workbook. They send [`ChunkResult`]s over a
//! channel and the [`AggregationWriter`] appends them on one task, rolling to
//! a fresh sheet whenever the current one is full.

use crate::domains::report::types::{CellValue, ChunkFailure, ChunkOrdering, ResultRow};
use crate::errors::{ExportError, ExportResult};
use rust_xlsxwriter::{Workbook, XlsxError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Rows per sheet in the xlsx format, header row included.
pub const EXCEL_MAX_ROWS: usize = 1_048_576;

// Integers beyond this no longer round-trip through an f64 cell.
const MAX_EXACT_FLOAT_INT: u64 = 1 << 53;

/// Name of the `n`th sheet, 1-based.
pub fn sheet_name(n: usize) -> String {
    format!("Sheet{}", n)
}

/// Target of the aggregation writer. Cells are written to the most recently
/// added sheet; row and column indices are 0-based.
pub trait SheetBackend: Send {
    fn add_sheet(&mut self, name: &str) -> ExportResult<()>;
    fn write_cell(&mut self, row: u32, col: u16, value: &CellValue) -> ExportResult<()>;
    fn save(&mut self, path: &Path) -> ExportResult<()>;
}

/// Creates one backend per export.
pub trait SheetBackendFactory: Send + Sync {
    fn create(&self) -> Box<dyn SheetBackend>;
}

fn xlsx_error(err: XlsxError) -> ExportError {
    ExportError::WriteFailed(format!("xlsx write error: {err}"))
}

/// [`SheetBackend`] producing a real `.xlsx` file.
pub struct XlsxSheetBackend {
    workbook: Workbook,
    current: Option<usize>,
}

impl XlsxSheetBackend {
    pub fn new() -> Self {
        Self {
            workbook: Workbook::new(),
            current: None,
        }
    }
}

impl Default for XlsxSheetBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SheetBackend for XlsxSheetBackend {
    fn add_sheet(&mut self, name: &str) -> ExportResult<()> {
        let worksheet = self.workbook.add_worksheet();
        worksheet.set_name(name).map_err(xlsx_error)?;
        self.current = Some(self.current.map_or(0, |idx| idx + 1));
        Ok(())
    }

    fn write_cell(&mut self, row: u32, col: u16, value: &CellValue) -> ExportResult<()> {
        let idx = self
            .current
            .ok_or_else(|| ExportError::WriteFailed("no sheet to write to".to_string()))?;
        let worksheet = self.workbook.worksheet_from_index(idx).map_err(xlsx_error)?;
        match value {
            CellValue::Null => {}
            CellValue::Bool(b) => {
                worksheet.write_boolean(row, col, *b).map_err(xlsx_error)?;
            }
            CellValue::Int(i) if i.unsigned_abs() <= MAX_EXACT_FLOAT_INT => {
                worksheet.write_number(row, col, *i as f64).map_err(xlsx_error)?;
            }
            CellValue::Float(f) if f.is_finite() => {
                worksheet.write_number(row, col, *f).map_err(xlsx_error)?;
            }
            other => {
                worksheet.write_string(row, col, other.to_string()).map_err(xlsx_error)?;
            }
        }
        Ok(())
    }

    fn save(&mut self, path: &Path) -> ExportResult<()> {
        self.workbook.save(path).map_err(xlsx_error)
    }
}

/// Factory for [`XlsxSheetBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XlsxBackendFactory;

impl SheetBackendFactory for XlsxBackendFactory {
    fn create(&self) -> Box<dyn SheetBackend> {
        Box::new(XlsxSheetBackend::new())
    }
}

/// Row cursor over the sheets of one workbook.
///
/// Each sheet holds a header row plus up to `max_rows - 1` data rows. The
/// next row after that goes to row 2 of a new sheet with the header repeated.
pub struct WorkbookState {
    backend: Box<dyn SheetBackend>,
    max_rows: usize,
    headers: Option<Arc<Vec<String>>>,
    sheets: usize,
    next_row: usize,
    rows_written: usize,
}

impl WorkbookState {
    pub fn new(backend: Box<dyn SheetBackend>) -> Self {
        Self::with_row_limit(backend, EXCEL_MAX_ROWS)
    }

    /// `max_rows` counts the header row and is at least 2.
    pub fn with_row_limit(backend: Box<dyn SheetBackend>, max_rows: usize) -> Self {
        Self {
            backend,
            max_rows: max_rows.max(2),
            headers: None,
            sheets: 0,
            next_row: 0,
            rows_written: 0,
        }
    }

    pub fn sheets(&self) -> usize {
        self.sheets
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    fn start_sheet(&mut self) -> ExportResult<()> {
        self.sheets += 1;
        self.backend.add_sheet(&sheet_name(self.sheets))?;
        self.next_row = 0;
        if let Some(headers) = self.headers.clone() {
            for (col, name) in headers.iter().enumerate() {
                self.backend
                    .write_cell(0, column_index(col)?, &CellValue::Text(name.clone()))?;
            }
            self.next_row = 1;
        }
        Ok(())
    }

    pub fn append_row(&mut self, row: &ResultRow) -> ExportResult<()> {
        if self.headers.is_none() {
            self.headers = Some(Arc::new(row.columns().to_vec()));
        }
        if self.sheets == 0 || self.next_row >= self.max_rows {
            self.start_sheet()?;
        }
        let row_idx = u32::try_from(self.next_row)
            .map_err(|_| ExportError::WriteFailed(format!("row {} out of range", self.next_row)))?;
        for (col, value) in row.values().iter().enumerate() {
            self.backend.write_cell(row_idx, column_index(col)?, value)?;
        }
        self.next_row += 1;
        self.rows_written += 1;
        Ok(())
    }

    pub fn append_rows(&mut self, rows: &[ResultRow]) -> ExportResult<()> {
        rows.iter().try_for_each(|row| self.append_row(row))
    }

    /// Write the workbook to `path`. A workbook that never saw a row gets a
    /// single empty `Sheet1`.
    pub fn save(&mut self, path: &Path) -> ExportResult<()> {
        if self.sheets == 0 {
            self.start_sheet()?;
        }
        self.backend.save(path)
    }
}

fn column_index(col: usize) -> ExportResult<u16> {
    u16::try_from(col).map_err(|_| ExportError::WriteFailed(format!("column {} out of range", col)))
}

/// Outcome of one chunk fetch, sent from a fetch task to the writer.
#[derive(Debug)]
pub struct ChunkResult {
    pub index: usize,
    pub rows: ExportResult<Vec<ResultRow>>,
}

/// Render progress the way subscribers receive it, e.g. `33.33%`.
pub fn format_progress(done: usize, total: usize) -> String {
    let percent = if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    };
    format!("{:.2}%", percent)
}

/// Called after every consumed chunk with `(chunks_done, chunk_count)`.
pub type ProgressCallback = Box<dyn FnMut(usize, usize) + Send>;

/// Counters gathered while aggregating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterReport {
    pub rows_written: usize,
    pub sheets: usize,
    pub chunks_consumed: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

/// Aggregation finished; the workbook still has to be saved.
pub struct FinishedWorkbook {
    pub state: WorkbookState,
    pub report: WriterReport,
}

impl FinishedWorkbook {
    pub fn save(mut self, path: &Path) -> ExportResult<WriterReport> {
        self.state.save(path)?;
        self.report.sheets = self.state.sheets();
        Ok(self.report)
    }
}

pub struct AggregationWriter {
    state: WorkbookState,
    ordering: ChunkOrdering,
    chunk_count: usize,
    on_progress: Option<ProgressCallback>,
    consumed: usize,
    failed: Vec<ChunkFailure>,
}

impl AggregationWriter {
    pub fn new(state: WorkbookState, ordering: ChunkOrdering, chunk_count: usize) -> Self {
        Self {
            state,
            ordering,
            chunk_count,
            on_progress: None,
            consumed: 0,
            failed: Vec::new(),
        }
    }

    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    fn consume(&mut self, result: ChunkResult) -> ExportResult<()> {
        match result.rows {
            Ok(rows) => self.state.append_rows(&rows)?,
            Err(e) => {
                log::warn!("Chunk {} failed: {}", result.index, e);
                self.failed.push(ChunkFailure {
                    index: result.index,
                    message: e.to_string(),
                });
            }
        }
        self.consumed += 1;
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(self.consumed, self.chunk_count);
        }
        Ok(())
    }

    /// Drain `rx` until every chunk has been consumed or all senders are gone.
    ///
    /// Chunks that never arrived are recorded as failures. A write error
    /// aborts aggregation.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ChunkResult>) -> ExportResult<FinishedWorkbook> {
        let mut pending: BTreeMap<usize, ChunkResult> = BTreeMap::new();
        let mut seen = vec![false; self.chunk_count];
        let mut next_index = 0;
        let mut received = 0;

        while received < self.chunk_count {
            let Some(result) = rx.recv().await else {
                break;
            };
            received += 1;
            if let Some(flag) = seen.get_mut(result.index) {
                *flag = true;
            }
            match self.ordering {
                ChunkOrdering::Arrival => self.consume(result)?,
                ChunkOrdering::Index => {
                    pending.insert(result.index, result);
                    while let Some(ready) = pending.remove(&next_index) {
                        self.consume(ready)?;
                        next_index += 1;
                    }
                }
            }
        }

        if received < self.chunk_count {
            log::error!(
                "Chunk channel closed after {} of {} chunks",
                received,
                self.chunk_count
            );
            for (index, _) in seen.iter().enumerate().filter(|(_, s)| !**s) {
                pending.insert(
                    index,
                    ChunkResult {
                        index,
                        rows: Err(ExportError::ChunkQueryFailed {
                            index,
                            message: "chunk result never arrived".to_string(),
                        }),
                    },
                );
            }
        }
        // Whatever is still buffered goes out in index order.
        for (_, result) in std::mem::take(&mut pending) {
            self.consume(result)?;
        }

        let report = WriterReport {
            rows_written: self.state.rows_written(),
            sheets: self.state.sheets(),
            chunks_consumed: self.consumed,
            failed_chunks: self.failed,
        };
        Ok(FinishedWorkbook {
            state: self.state,
            report,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn rows(ids: std::ops::Range<i64>) -> Vec<ResultRow> {
        let columns = Arc::new(vec!["id".to_string(), "name".to_string()]);
        ids.map(|id| {
            ResultRow::new(
                columns.clone(),
                vec![CellValue::Int(id), CellValue::Text(format!("n{}", id))],
            )
        })
        .collect()
    }

    fn recording_state(max_rows: usize) -> (WorkbookState, Arc<Mutex<Recording>>) {
        let backend = RecordingBackend::default();
        let recording = backend.recording.clone();
        (WorkbookState::with_row_limit(Box::new(backend), max_rows), recording)
    }

    #[test]
    fn test_progress_formatting() {
        assert_eq!(format_progress(1, 3), "33.33%");
        assert_eq!(format_progress(2, 3), "66.67%");
        assert_eq!(format_progress(3, 3), "100.00%");
        assert_eq!(format_progress(0, 0), "100.00%");
    }

    #[test]
    fn test_rollover_repeats_headers() {
        let (mut state, recording) = recording_state(3);
        state.append_rows(&rows(1..6)).unwrap();
        assert_eq!(state.sheets(), 3);
        assert_eq!(state.rows_written(), 5);

        let recording = recording.lock().unwrap();
        let names: Vec<_> = recording.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Sheet1", "Sheet2", "Sheet3"]);
        for sheet in &recording.sheets {
            assert_eq!(
                sheet.row(0),
                vec![CellValue::Text("id".into()), CellValue::Text("name".into())]
            );
        }
        assert_eq!(recording.sheets[0].row_count(), 3);
        assert_eq!(recording.sheets[1].row(1)[0], CellValue::Int(3));
        assert_eq!(recording.sheets[2].row_count(), 2);
        assert_eq!(recording.sheets[2].row(1)[0], CellValue::Int(5));
    }

    #[test]
    fn test_exactly_full_sheet_does_not_roll_over() {
        let (mut state, _) = recording_state(4);
        state.append_rows(&rows(0..3)).unwrap();
        assert_eq!(state.sheets(), 1);
        state.append_rows(&rows(3..4)).unwrap();
        assert_eq!(state.sheets(), 2);
    }

    #[test]
    fn test_empty_workbook_saves_one_blank_sheet() {
        let dir = tempdir().unwrap();
        let (mut state, recording) = recording_state(EXCEL_MAX_ROWS);
        state.save(&dir.path().join("empty.xlsx")).unwrap();

        let recording = recording.lock().unwrap();
        assert_eq!(recording.sheets.len(), 1);
        assert_eq!(recording.sheets[0].name, "Sheet1");
        assert!(recording.sheets[0].cells.is_empty());
    }

    #[tokio::test]
    async fn test_arrival_order_appends_as_received() {
        let (state, recording) = recording_state(EXCEL_MAX_ROWS);
        let (tx, rx) = mpsc::channel(4);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let writer = AggregationWriter::new(state, ChunkOrdering::Arrival, 3)
            .with_progress(Box::new(move |done, total| sink.lock().unwrap().push(format_progress(done, total))));
        let handle = tokio::spawn(writer.run(rx));

        tx.send(ChunkResult { index: 2, rows: Ok(rows(5..6)) }).await.unwrap();
        tx.send(ChunkResult { index: 0, rows: Ok(rows(1..3)) }).await.unwrap();
        tx.send(ChunkResult { index: 1, rows: Ok(rows(3..5)) }).await.unwrap();

        let finished = handle.await.unwrap().unwrap();
        assert_eq!(finished.report.rows_written, 5);
        assert!(finished.report.failed_chunks.is_empty());
        assert_eq!(*progress.lock().unwrap(), vec!["33.33%", "66.67%", "100.00%"]);

        let recording = recording.lock().unwrap();
        assert_eq!(recording.sheets[0].row(1)[0], CellValue::Int(5));
    }

    #[tokio::test]
    async fn test_index_order_buffers_early_chunks() {
        let (state, recording) = recording_state(EXCEL_MAX_ROWS);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(AggregationWriter::new(state, ChunkOrdering::Index, 3).run(rx));

        tx.send(ChunkResult { index: 2, rows: Ok(rows(5..6)) }).await.unwrap();
        tx.send(ChunkResult { index: 1, rows: Ok(rows(3..5)) }).await.unwrap();
        tx.send(ChunkResult { index: 0, rows: Ok(rows(1..3)) }).await.unwrap();
        handle.await.unwrap().unwrap();

        let recording = recording.lock().unwrap();
        let ids: Vec<_> = (1..=5).map(|r| recording.sheets[0].row(r)[0].clone()).collect();
        assert_eq!(ids, (1..=5).map(CellValue::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_chunk_is_recorded_and_counted() {
        let (state, _) = recording_state(EXCEL_MAX_ROWS);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(AggregationWriter::new(state, ChunkOrdering::Index, 2).run(rx));

        tx.send(ChunkResult {
            index: 0,
            rows: Err(ExportError::ChunkQueryFailed { index: 0, message: "boom".into() }),
        })
        .await
        .unwrap();
        tx.send(ChunkResult { index: 1, rows: Ok(rows(0..2)) }).await.unwrap();

        let report = handle.await.unwrap().unwrap().report;
        assert_eq!(report.chunks_consumed, 2);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.failed_chunks.len(), 1);
        assert_eq!(report.failed_chunks[0].index, 0);
    }

    #[tokio::test]
    async fn test_closed_channel_marks_missing_chunks_failed() {
        let (state, _) = recording_state(EXCEL_MAX_ROWS);
        let (tx, rx) = mpsc::channel(4);
        tx.send(ChunkResult { index: 0, rows: Ok(rows(0..1)) }).await.unwrap();
        drop(tx);

        let report = AggregationWriter::new(state, ChunkOrdering::Arrival, 3)
            .run(rx)
            .await
            .unwrap()
            .report;
        assert_eq!(report.chunks_consumed, 3);
        assert_eq!(report.failed_chunks.len(), 2);
    }

    #[test]
    fn test_xlsx_backend_writes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let mut state = WorkbookState::with_row_limit(Box::new(XlsxSheetBackend::new()), 3);
        let mut mixed = rows(1..4);
        mixed.push(ResultRow::new(
            Arc::new(vec!["id".to_string(), "name".to_string()]),
            vec![CellValue::Float(f64::NAN), CellValue::Null],
        ));
        state.append_rows(&mixed).unwrap();
        state.save(&path).unwrap();

        assert_eq!(state.sheets(), 2);
        let bytes = std::fs::read(&path).unwrap();
        // xlsx is a zip container.
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn test_xlsx_backend_accepts_last_row_only() {
        let last_row = (EXCEL_MAX_ROWS - 1) as u32;
        let mut backend = XlsxSheetBackend::new();
        backend.add_sheet("Sheet1").unwrap();
        backend.write_cell(last_row, 0, &CellValue::Int(1)).unwrap();
        assert!(matches!(
            backend.write_cell(last_row + 1, 0, &CellValue::Int(2)),
            Err(ExportError::WriteFailed(_))
        ));
    }

    // Writes a million rows; run with `--ignored` in release mode.
    #[test]
    #[ignore]
    fn test_xlsx_rollover_at_excel_row_limit() {
        let dir = tempdir().unwrap();
        let mut state = WorkbookState::new(Box::new(XlsxSheetBackend::new()));
        let columns = Arc::new(vec!["id".to_string()]);
        for id in 0..EXCEL_MAX_ROWS as i64 {
            state
                .append_row(&ResultRow::new(columns.clone(), vec![CellValue::Int(id)]))
                .unwrap();
        }
        // Header plus 1,048,575 rows fill Sheet1; the last row opens Sheet2.
        assert_eq!(state.sheets(), 2);
        assert_eq!(state.rows_written(), EXCEL_MAX_ROWS);
        state.save(&dir.path().join("full.xlsx")).unwrap();
    }
}
