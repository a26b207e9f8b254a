use crate::domains::report::types::{ExportJob, ExportOutcome};
use crate::errors::{ExportError, ExportResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Trait for processing export jobs
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: ExportJob) -> ExportResult<ExportOutcome>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed(ExportOutcome),
    /// An artifact was produced but some chunks never reached it.
    CompletedWithErrors(ExportOutcome),
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    fn from_result(result: &ExportResult<ExportOutcome>) -> Self {
        match result {
            Ok(outcome) if outcome.is_partial() => JobStatus::CompletedWithErrors(outcome.clone()),
            Ok(outcome) => JobStatus::Completed(outcome.clone()),
            Err(e) => JobStatus::Failed(e.to_string()),
        }
    }
}

/// Handle for tracking export jobs
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: Uuid,
    status_receiver: watch::Receiver<JobStatus>,
}

impl JobHandle {
    /// Wait until the job reaches a terminal status and return it.
    pub async fn wait_for_completion(&mut self) -> ExportResult<JobStatus> {
        loop {
            {
                let status = self.status_receiver.borrow_and_update();
                if status.is_terminal() {
                    return Ok(status.clone());
                }
            }
            self.status_receiver
                .changed()
                .await
                .map_err(|_| ExportError::QueueClosed)?;
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status_receiver.borrow().clone()
    }
}

struct QueuedJob {
    job: ExportJob,
    status: watch::Sender<JobStatus>,
}

#[derive(Default)]
struct GateCounters {
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub peak_active: usize,
    pub total_capacity: usize,
    pub queue_capacity: usize,
}

/// Bounds how many exports run at once.
///
/// Pending jobs wait in a bounded queue; `enqueue` waits for room when it is
/// full. One dispatcher task takes a worker permit before pulling the next
/// job and hands the permit to the job's task until it finishes.
pub struct ExportQueueManager {
    sender: mpsc::Sender<QueuedJob>,
    counters: Arc<GateCounters>,
    max_concurrent: usize,
    queue_capacity: usize,
    dispatcher: JoinHandle<()>,
}

impl ExportQueueManager {
    /// Must be called from within a tokio runtime.
    pub fn new(job_processor: Weak<dyn JobProcessor>, max_concurrent: usize, queue_capacity: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let counters = Arc::new(GateCounters::default());
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        let dispatcher = tokio::spawn(Self::dispatch(receiver, semaphore, counters.clone(), job_processor));

        Self {
            sender,
            counters,
            max_concurrent,
            queue_capacity,
            dispatcher,
        }
    }

    /// Queue a job, waiting while the pending queue is full.
    pub async fn enqueue(&self, job: ExportJob) -> ExportResult<JobHandle> {
        let (tx, rx) = watch::channel(JobStatus::Queued);
        let job_id = job.id;

        let slot = self.sender.reserve().await.map_err(|_| ExportError::QueueClosed)?;
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        slot.send(QueuedJob { job, status: tx });
        log::debug!("Export job {} queued", job_id);

        Ok(JobHandle {
            id: job_id,
            status_receiver: rx,
        })
    }

    async fn dispatch(
        mut receiver: mpsc::Receiver<QueuedJob>,
        semaphore: Arc<Semaphore>,
        counters: Arc<GateCounters>,
        job_processor: Weak<dyn JobProcessor>,
    ) {
        loop {
            // Wait for available slot
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let Some(QueuedJob { job, status }) = receiver.recv().await else {
                break;
            };
            counters.queued.fetch_sub(1, Ordering::SeqCst);

            let Some(processor) = job_processor.upgrade() else {
                log::error!("Job processor was dropped, stopping queue processing");
                let _ = status.send(JobStatus::Failed("export service is shut down".to_string()));
                break;
            };

            let _ = status.send(JobStatus::Running);
            let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            counters.peak_active.fetch_max(active, Ordering::SeqCst);

            let counters = counters.clone();
            tokio::spawn(async move {
                let job_id = job.id;
                let result = match tokio::spawn(async move { processor.process(job).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(ExportError::WriteFailed(format!("export task aborted: {}", e))),
                };

                let final_status = JobStatus::from_result(&result);
                match &final_status {
                    JobStatus::Failed(reason) => log::error!("Export job {} failed: {}", job_id, reason),
                    JobStatus::CompletedWithErrors(outcome) => log::warn!(
                        "Export job {} completed with {} failed chunks",
                        job_id,
                        outcome.failed_chunks.len()
                    ),
                    _ => log::info!("Export job {} completed", job_id),
                }
                if status.send(final_status).is_err() {
                    log::debug!("Nobody is watching export job {}", job_id);
                }

                counters.active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
        log::debug!("Export queue dispatcher stopped");
    }

    /// Get current queue statistics
    pub fn get_stats(&self) -> QueueStats {
        QueueStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            peak_active: self.counters.peak_active.load(Ordering::SeqCst),
            total_capacity: self.max_concurrent,
            queue_capacity: self.queue_capacity,
        }
    }
}

impl Drop for ExportQueueManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::report::types::{ChunkFailure, ExportFilters};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    fn outcome(job: &ExportJob, failed: usize) -> ExportOutcome {
        ExportOutcome {
            job_id: job.id,
            report_id: job.report_id,
            filename: "f.xlsx".to_string(),
            url: "http://x/reports/f.xlsx".to_string(),
            total_rows: 0,
            rows_written: 0,
            sheets: 1,
            chunk_count: failed,
            failed_chunks: (0..failed)
                .map(|index| ChunkFailure { index, message: "boom".to_string() })
                .collect(),
        }
    }

    /// Sleeps per job and records how many jobs overlap.
    struct CountingProcessor {
        running: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, job: ExportJob) -> ExportResult<ExportOutcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            match job.report_id {
                -1 => Err(ExportError::TemplateNotFound(-1)),
                -2 => Ok(outcome(&job, 1)),
                _ => Ok(outcome(&job, 0)),
            }
        }
    }

    fn job(report_id: i64) -> ExportJob {
        ExportJob::new(report_id, "", ExportFilters::new(), 10)
    }

    #[tokio::test]
    async fn test_at_most_k_jobs_run_concurrently() {
        let processor: Arc<CountingProcessor> = Arc::new(CountingProcessor {
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&processor) as Weak<dyn JobProcessor>;
        let gate = ExportQueueManager::new(weak, 2, 10);

        let mut handles = Vec::new();
        for id in 0..6 {
            handles.push(gate.enqueue(job(id)).await.unwrap());
        }
        for handle in &mut handles {
            assert!(matches!(handle.wait_for_completion().await.unwrap(), JobStatus::Completed(_)));
        }

        assert!(processor.max_seen.load(Ordering::SeqCst) <= 2);
        let stats = gate.get_stats();
        assert_eq!(stats.peak_active, 2);
        assert_eq!(stats.total_capacity, 2);
    }

    #[tokio::test]
    async fn test_terminal_statuses() {
        let processor: Arc<CountingProcessor> = Arc::new(CountingProcessor {
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let gate = ExportQueueManager::new(Arc::downgrade(&processor) as Weak<dyn JobProcessor>, 1, 4);

        let mut failed = gate.enqueue(job(-1)).await.unwrap();
        let mut partial = gate.enqueue(job(-2)).await.unwrap();
        assert!(matches!(failed.wait_for_completion().await.unwrap(), JobStatus::Failed(_)));
        match partial.wait_for_completion().await.unwrap() {
            JobStatus::CompletedWithErrors(outcome) => assert_eq!(outcome.failed_chunks.len(), 1),
            other => panic!("unexpected status {:?}", other),
        }
    }

    /// Holds every job until released.
    struct BlockingProcessor {
        release: Notify,
    }

    #[async_trait]
    impl JobProcessor for BlockingProcessor {
        async fn process(&self, job: ExportJob) -> ExportResult<ExportOutcome> {
            self.release.notified().await;
            Ok(outcome(&job, 0))
        }
    }

    #[tokio::test]
    async fn test_enqueue_blocks_when_queue_is_full() {
        let processor = Arc::new(BlockingProcessor { release: Notify::new() });
        let gate = ExportQueueManager::new(Arc::downgrade(&processor) as Weak<dyn JobProcessor>, 1, 1);

        let mut running = gate.enqueue(job(1)).await.unwrap();
        while running.status() != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _waiting = gate.enqueue(job(2)).await.unwrap();
        assert_eq!(gate.get_stats().queued, 1);

        // Queue holds one job and the only worker is busy.
        assert!(timeout(Duration::from_millis(100), gate.enqueue(job(3))).await.is_err());
        assert_eq!(gate.get_stats().queued, 1);

        processor.release.notify_one();
        assert!(matches!(running.wait_for_completion().await.unwrap(), JobStatus::Completed(_)));
        let third = timeout(Duration::from_secs(2), gate.enqueue(job(3))).await;
        assert!(third.is_ok());
        processor.release.notify_waiters();
    }

    #[tokio::test]
    async fn test_dropped_processor_fails_job() {
        let processor: Arc<dyn JobProcessor> = Arc::new(BlockingProcessor { release: Notify::new() });
        let weak = Arc::downgrade(&processor);
        drop(processor);
        let gate = ExportQueueManager::new(weak, 1, 1);

        let mut handle = gate.enqueue(job(1)).await.unwrap();
        assert!(matches!(handle.wait_for_completion().await.unwrap(), JobStatus::Failed(_)));
    }
}
