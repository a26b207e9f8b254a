//! Chunked report exports: stored report templates are paged out of the
//! database in parallel, assembled into a multi-sheet xlsx workbook by a single
//! writer, uploaded to object storage, and announced to a subscribed client.

pub mod config;
pub mod domains;
pub mod errors;
pub mod handlers;
pub mod runtime;
pub mod validation;

pub use config::ExportConfig;
pub use runtime::{init_logging, ExportRuntime};
