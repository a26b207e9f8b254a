use report_export_core::domains::report::types::ExportRequest;
use report_export_core::domains::report::JobStatus;
use report_export_core::{init_logging, ExportConfig, ExportRuntime};

/// Export one report and wait for it: `report_exporter <report-id> [field=value ...]`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut args = std::env::args().skip(1);
    let report_id: i64 = args
        .next()
        .ok_or("usage: report_exporter <report-id> [field=value ...]")?
        .parse()
        .map_err(|_| "invalid ID format")?;
    let filters = args
        .filter_map(|arg| arg.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect();

    let config = ExportConfig::from_env()?;
    let runtime = ExportRuntime::initialize(config).await?;

    let mut handle = runtime
        .service
        .submit_export(ExportRequest {
            report_id,
            client_id: String::new(),
            filters,
        })
        .await?;
    log::info!("Job {} queued", handle.id);

    let status = handle.wait_for_completion().await?;
    runtime.shutdown().await;

    match status {
        JobStatus::Completed(outcome) => {
            println!("{}", outcome.url);
            Ok(())
        }
        JobStatus::CompletedWithErrors(outcome) => {
            log::warn!("{} of {} chunks failed", outcome.failed_chunks.len(), outcome.chunk_count);
            println!("{}", outcome.url);
            Ok(())
        }
        JobStatus::Failed(reason) => Err(reason.into()),
        other => Err(format!("unexpected job status {:?}", other).into()),
    }
}
