//! Worker pool that leases jobs and owns the retry policy.
//!
//! Each worker polls the queue, holds a lease for the job it runs (renewed by
//! a heartbeat), and settles the job once the run ends: finish it, fail the
//! video, reschedule with backoff, or hand it back on shutdown.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::models::job::{JobOutcome, ProcessingJob};
use crate::models::video::{ErrorKind, VideoStatus};
use crate::services::processor::{JobContext, JobError, VideoProcessor};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::backoff_delay;
use crate::services::store::{PipelineStore, StoreError};

#[derive(Clone)]
pub struct WorkerScheduler {
    processor: VideoProcessor,
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
    name: String,
}

impl WorkerScheduler {
    pub fn new(
        processor: VideoProcessor,
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            processor,
            store,
            queue,
            config,
            name: format!("worker-{}", Uuid::new_v4().simple()),
        }
    }

    /// Run `config.workers` workers until `shutdown` flips to `true`.
    /// In-flight jobs stop at their next frame boundary and are released.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let workers = self.config.workers.max(1);
        tracing::info!(scheduler = %self.name, workers, "Starting workers");

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|n| {
                let scheduler = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("{}-{}", self.name, n);
                tokio::spawn(async move { scheduler.worker_loop(worker_id, shutdown).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!(scheduler = %self.name, "All workers stopped");
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %worker_id, "Worker ready");

        while !*shutdown.borrow() {
            match self.run_once(&worker_id, &shutdown).await {
                Ok(true) => {
                    tracing::debug!(worker_id = %worker_id, "Job settled, checking for next job");
                    continue;
                }
                Ok(false) => tracing::trace!(worker_id = %worker_id, "No jobs available, sleeping"),
                Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Error processing job, will retry"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                Ok(()) = shutdown.changed() => {}
            }
        }

        tracing::info!(worker_id = %worker_id, "Worker stopped");
    }

    /// Lease and run at most one job. Returns `Ok(false)` when none was ready.
    pub async fn run_once(&self, worker_id: &str, shutdown: &watch::Receiver<bool>) -> Result<bool, SchedulerError> {
        let Some(job) = self.queue.acquire(worker_id, self.config.lease_ttl).await? else {
            return Ok(false);
        };

        if let Ok(depth) = self.queue.depth().await {
            metrics::gauge!("video_queue_depth").set(depth as f64);
        }

        tracing::info!(
            video_id = %job.video_id,
            worker_id = %worker_id,
            attempt = job.attempts,
            "Acquired video job"
        );

        if job.attempts > self.config.max_attempts {
            let message = format!(
                "Gave up after {} attempts: {}",
                self.config.max_attempts,
                job.last_error.as_deref().unwrap_or("lease expired")
            );
            self.fail_video(&job, worker_id, ErrorKind::RetriesExhausted, &message).await?;
            return Ok(true);
        }

        let lease_lost = Arc::new(AtomicBool::new(false));
        let ctx = JobContext {
            worker_id: worker_id.to_string(),
            lease_ttl: self.config.lease_ttl,
            lease_lost: lease_lost.clone(),
            shutdown: shutdown.clone(),
        };

        let heartbeat = spawn_heartbeat(
            self.queue.clone(),
            job.video_id,
            worker_id.to_string(),
            self.config.lease_ttl,
            lease_lost,
        );
        let start = Instant::now();
        let result = self.processor.run(&job, &ctx).await;
        heartbeat.abort();
        metrics::histogram!("video_processing_seconds").record(start.elapsed().as_secs_f64());

        self.settle(&job, worker_id, result).await?;
        Ok(true)
    }

    async fn settle(
        &self,
        job: &ProcessingJob,
        worker_id: &str,
        result: Result<JobOutcome, JobError>,
    ) -> Result<(), SchedulerError> {
        let video_id = job.video_id;

        let error = match result {
            Ok(outcome) => {
                if matches!(outcome, JobOutcome::Completed(_)) {
                    metrics::counter!("video_jobs_completed_total").increment(1);
                }
                self.queue.finish(video_id, worker_id).await?;
                return Ok(());
            }
            Err(e) => e,
        };

        match error {
            JobError::Shutdown => {
                self.queue.release(video_id, worker_id).await?;
                tracing::info!(video_id = %video_id, "Released job for shutdown");
            }
            JobError::LeaseLost => {
                tracing::warn!(video_id = %video_id, worker_id = %worker_id, "Lease lost, abandoning run");
            }
            e if e.is_fatal() || matches!(e, JobError::Cancelled) => {
                self.fail_video(job, worker_id, e.kind(), &e.to_string()).await?;
            }
            e if job.attempts >= self.config.max_attempts => {
                let message = format!("Processing failed after {} attempts: {}", job.attempts, e);
                self.fail_video(job, worker_id, ErrorKind::RetriesExhausted, &message).await?;
            }
            e => {
                let delay = backoff_delay(self.config.retry_base_delay, self.config.retry_max_delay, job.attempts);
                let eligible_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let message = e.to_string();
                if self.queue.reschedule(video_id, worker_id, eligible_at, &message).await? {
                    metrics::counter!("video_jobs_retried_total").increment(1);
                    tracing::warn!(
                        video_id = %video_id,
                        attempt = job.attempts,
                        delay_secs = delay.as_secs(),
                        error = %message,
                        "Video job re-queued for retry"
                    );
                } else {
                    tracing::warn!(video_id = %video_id, "Lease lost before rescheduling");
                }
            }
        }
        Ok(())
    }

    /// Move the video to `failed` and drop its job.
    async fn fail_video(
        &self,
        job: &ProcessingJob,
        worker_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<(), SchedulerError> {
        let video_id = job.video_id;
        // A run can fail before it ever reached `processing`.
        self.store.start_processing(video_id).await?;
        self.store.fail(video_id, kind, message).await?;
        self.queue.finish(video_id, worker_id).await?;

        metrics::counter!("video_jobs_failed_total", "kind" => kind.to_string()).increment(1);
        tracing::error!(
            video_id = %video_id,
            attempt = job.attempts,
            kind = %kind,
            error = %message,
            "Video processing failed"
        );
        Ok(())
    }
}

/// Renew the lease every third of its TTL until aborted or refused.
fn spawn_heartbeat(
    queue: Arc<dyn JobQueue>,
    video_id: Uuid,
    worker_id: String,
    lease_ttl: Duration,
    lease_lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let period = (lease_ttl / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            match queue.renew(video_id, &worker_id, lease_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    lease_lost.store(true, Ordering::SeqCst);
                    tracing::warn!(video_id = %video_id, worker_id = %worker_id, "Lease renewal refused");
                    return;
                }
                Err(e) => tracing::warn!(video_id = %video_id, error = %e, "Lease renewal failed"),
            }
        }
    })
}

/// Put a video in line for processing.
///
/// `uploaded` and `failed` videos move to `queued`. For `queued` and
/// `processing` videos the call only makes sure a job exists, so repeating
/// it is harmless.
pub async fn enqueue_video(
    store: &dyn PipelineStore,
    queue: &dyn JobQueue,
    video_id: Uuid,
) -> Result<VideoStatus, SchedulerError> {
    let video = store
        .get_video(video_id)
        .await?
        .ok_or(SchedulerError::VideoNotFound(video_id))?;

    match video.status {
        VideoStatus::Completed => {
            return Err(SchedulerError::InvalidState {
                video_id,
                status: video.status,
            })
        }
        VideoStatus::Uploaded | VideoStatus::Failed => {
            if !store.mark_queued(video_id).await? {
                let status = store
                    .get_video(video_id)
                    .await?
                    .map_or(video.status, |v| v.status);
                return Err(SchedulerError::InvalidState { video_id, status });
            }
        }
        VideoStatus::Queued | VideoStatus::Processing => {}
    }

    if queue.enqueue(video_id).await? {
        tracing::info!(video_id = %video_id, "Video queued for processing");
    }

    let status = match video.status {
        VideoStatus::Processing => VideoStatus::Processing,
        _ => VideoStatus::Queued,
    };
    Ok(status)
}

/// Ask the worker holding `video_id` to stop at its next frame boundary.
pub async fn request_cancel(
    store: &dyn PipelineStore,
    queue: &dyn JobQueue,
    video_id: Uuid,
) -> Result<VideoStatus, SchedulerError> {
    let video = store
        .get_video(video_id)
        .await?
        .ok_or(SchedulerError::VideoNotFound(video_id))?;

    if !matches!(video.status, VideoStatus::Queued | VideoStatus::Processing) {
        return Err(SchedulerError::InvalidState {
            video_id,
            status: video.status,
        });
    }

    queue.request_cancel(video_id).await?;
    tracing::info!(video_id = %video_id, "Cancellation requested");
    Ok(video.status)
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Video {0} not found")]
    VideoNotFound(Uuid),

    #[error("Video {video_id} is {status}")]
    InvalidState { video_id: Uuid, status: VideoStatus },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
