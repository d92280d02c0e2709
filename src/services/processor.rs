//! Per-video processing: sample, detect, resolve, debounce, persist.
//!
//! A run always starts from the video's committed checkpoint and commits
//! detections, gaps, events, the debouncer snapshot and the new checkpoint
//! together every `checkpoint_batch_size` sampled frames. Interrupt requests
//! (cancel, shutdown, lost lease) are honored only between frames.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::detection::{Detection, FrameGap, GapReason, ObjectDetection};
use crate::models::job::{JobOutcome, ProcessingJob, ProcessingReport};
use crate::models::lot::ParkingSlot;
use crate::models::occupancy::OccupancyEvent;
use crate::models::video::{ErrorKind, Video};
use crate::services::debouncer::{DebouncerSnapshot, OccupancyDebouncer};
use crate::services::detection::DetectionAdapter;
use crate::services::media::MediaOpener;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::resolver::SlotOccupancyResolver;
use crate::services::sampler::{Frame, FrameSampler, SamplerError};
use crate::services::store::{FrameBatch, PipelineStore, StoreError};

/// Worker-side handles a run needs besides the job itself.
#[derive(Clone)]
pub struct JobContext {
    pub worker_id: String,
    pub lease_ttl: Duration,
    /// Set by the lease heartbeat once a renewal is refused.
    pub lease_lost: Arc<AtomicBool>,
    pub shutdown: watch::Receiver<bool>,
}

/// Drives one video through `queued -> processing -> completed`.
#[derive(Clone)]
pub struct VideoProcessor {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    media: Arc<dyn MediaOpener>,
    detection: DetectionAdapter,
    resolver: SlotOccupancyResolver,
    config: PipelineConfig,
}

/// Timeline anchor for one video.
struct Clock {
    origin: DateTime<Utc>,
    fps: Option<f64>,
}

impl Clock {
    fn offset_seconds(&self, frame_index: u64) -> f64 {
        match self.fps {
            Some(fps) if fps > 0.0 => frame_index as f64 / fps,
            _ => 0.0,
        }
    }

    fn frame_time(&self, offset_seconds: f64) -> DateTime<Utc> {
        self.origin + chrono::Duration::microseconds((offset_seconds * 1_000_000.0).round() as i64)
    }
}

/// Mutable state of one run between commits.
struct RunState {
    video: Video,
    slots: Vec<ParkingSlot>,
    clock: Clock,
    debouncer: OccupancyDebouncer,
    batch: FrameBatch,
    pending: u64,
    report: ProcessingReport,
}

impl VideoProcessor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        media: Arc<dyn MediaOpener>,
        detection: DetectionAdapter,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            media,
            detection,
            resolver: SlotOccupancyResolver::new(&config),
            config,
        }
    }

    /// Process the video behind `job` from its checkpoint to end of stream.
    ///
    /// On `Ok` the video is terminal. On `Err` the video is left as it was
    /// and the caller decides between failing, retrying or releasing.
    pub async fn run(&self, job: &ProcessingJob, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let video_id = job.video_id;
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or(JobError::VideoNotFound(video_id))?;

        if video.status.is_terminal() {
            tracing::info!(video_id = %video_id, status = %video.status, "Video already terminal, skipping");
            return Ok(JobOutcome::Skipped);
        }

        if !self.store.start_processing(video_id).await? {
            tracing::warn!(video_id = %video_id, status = %video.status, "Video is not queued, skipping");
            return Ok(JobOutcome::Skipped);
        }

        let slots = self.store.list_slots(video.lot_id).await?;
        if slots.is_empty() {
            return Err(JobError::NoSlots(video.lot_id));
        }

        let resume_index = video.resume_index();
        let source = self.media.open(&video).await?;
        let mut sampler = FrameSampler::open(source, self.config.frame_stride, resume_index).await?;
        let info = sampler.info().clone();
        self.store.record_media_info(video_id, &info).await?;

        let debouncer = self.restore_debouncer(&video).await?;

        tracing::info!(
            video_id = %video_id,
            attempt = job.attempts,
            resume_index,
            slots = slots.len(),
            frame_count = ?info.frame_count,
            fps = ?info.fps,
            "Processing video"
        );

        let clock = Clock {
            origin: video.time_origin(),
            fps: info.fps.or(video.fps),
        };
        let mut run = RunState {
            video,
            slots,
            clock,
            debouncer,
            batch: FrameBatch::default(),
            pending: 0,
            report: ProcessingReport::default(),
        };

        loop {
            self.check_interrupts(&mut run, ctx).await?;

            let frame = match sampler.next().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(SamplerError::CorruptFrame { frame_index, reason }) => {
                    record_gap(&mut run, frame_index, GapReason::CorruptFrame, reason);
                    self.maybe_commit(&mut run, ctx).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.process_frame(&mut run, frame).await;
            self.maybe_commit(&mut run, ctx).await?;
        }

        if run.pending > 0 {
            self.commit(&mut run, ctx).await?;
        }

        let final_checkpoint = sampler.position();
        if !self.store.complete(video_id, final_checkpoint).await? {
            tracing::warn!(video_id = %video_id, "Video left processing before completion");
        }

        tracing::info!(
            video_id = %video_id,
            frames_sampled = run.report.frames_sampled,
            frames_skipped = run.report.frames_skipped,
            detections = run.report.detections,
            events = run.report.events,
            "Video processing complete"
        );

        Ok(JobOutcome::Completed(run.report))
    }

    /// Debouncer continuing from the committed snapshot. A fresh run starts
    /// all-free unless seeding from the lot's last events is enabled.
    async fn restore_debouncer(&self, video: &Video) -> Result<OccupancyDebouncer, JobError> {
        let confirm = self.config.confirm_frames;

        if video.last_processed_frame_index.is_some() {
            if let Some(state) = &video.debounce_state {
                match serde_json::from_value::<DebouncerSnapshot>(state.clone()) {
                    Ok(snapshot) => return Ok(OccupancyDebouncer::from_snapshot(confirm, snapshot)),
                    Err(e) => {
                        tracing::warn!(video_id = %video.id, error = %e, "Discarding unreadable debounce state");
                    }
                }
            }
        }

        let mut debouncer = OccupancyDebouncer::new(confirm);
        if self.config.seed_from_last_event {
            for (slot_id, status) in self.store.latest_slot_statuses(video.lot_id).await? {
                debouncer.seed(slot_id, status);
            }
        }
        Ok(debouncer)
    }

    async fn check_interrupts(&self, run: &mut RunState, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.lease_lost.load(Ordering::SeqCst) {
            return Err(JobError::LeaseLost);
        }

        let cancelled = self.queue.is_cancel_requested(run.video.id).await?;
        let shutting_down = *ctx.shutdown.borrow();
        if !cancelled && !shutting_down {
            return Ok(());
        }

        if run.pending > 0 {
            self.commit(run, ctx).await?;
        }
        if cancelled {
            tracing::info!(video_id = %run.video.id, "Cancellation requested, stopping");
            Err(JobError::Cancelled)
        } else {
            Err(JobError::Shutdown)
        }
    }

    /// Detect, resolve and debounce one frame into the pending batch.
    async fn process_frame(&self, run: &mut RunState, frame: Frame) {
        let frame_index = frame.index;

        let detections = match self.detection.detect(&frame.image).await {
            Ok(detections) => detections,
            Err(e) => {
                record_gap(run, frame_index, GapReason::DetectionUnavailable, e.to_string());
                return;
            }
        };

        run.report.frames_sampled += 1;
        metrics::counter!("frames_processed_total").increment(1);

        let offset_seconds = run.clock.offset_seconds(frame_index);
        let frame_time = run.clock.frame_time(offset_seconds);
        let (width, height) = frame.image.dimensions();

        let signals = self.resolver.resolve(frame_index, &detections, &run.slots);
        for (slot_id, signal) in &signals {
            let Some(transition) = run.debouncer.observe(*slot_id, frame_index, signal.status) else {
                continue;
            };
            tracing::debug!(
                video_id = %run.video.id,
                slot_id = %slot_id,
                frame_index,
                status = %transition.status,
                "Slot status confirmed"
            );
            metrics::counter!("occupancy_events_total", "status" => transition.status.to_string()).increment(1);
            run.batch.events.push(OccupancyEvent {
                id: Uuid::new_v4(),
                video_id: run.video.id,
                lot_id: run.video.lot_id,
                slot_id: *slot_id,
                status: transition.status,
                frame_index,
                frame_time,
                offset_seconds,
                overlap_ratio: signal.overlap_ratio,
                created_at: Utc::now(),
            });
            run.report.events += 1;
        }

        let video_id = run.video.id;
        run.report.detections += detections.len() as u64;
        run.batch.detections.extend(
            detections
                .into_iter()
                .map(|d| to_record(video_id, frame_index, frame_time, offset_seconds, width, height, d)),
        );
        run.batch.last_frame_index = frame_index;
        run.pending += 1;
    }

    async fn maybe_commit(&self, run: &mut RunState, ctx: &JobContext) -> Result<(), JobError> {
        if run.pending >= self.config.checkpoint_batch_size.max(1) {
            self.commit(run, ctx).await?;
        }
        Ok(())
    }

    /// Renew the lease, then persist the pending batch with the current
    /// debouncer snapshot. Nothing is written without a valid lease.
    async fn commit(&self, run: &mut RunState, ctx: &JobContext) -> Result<(), JobError> {
        let video_id = run.video.id;
        if ctx.lease_lost.load(Ordering::SeqCst)
            || !self.queue.renew(video_id, &ctx.worker_id, ctx.lease_ttl).await?
        {
            ctx.lease_lost.store(true, Ordering::SeqCst);
            return Err(JobError::LeaseLost);
        }

        let mut batch = std::mem::take(&mut run.batch);
        batch.debounce_state = run.debouncer.snapshot();
        self.store.commit_batch(video_id, &batch).await?;

        tracing::debug!(
            video_id = %video_id,
            checkpoint = batch.last_frame_index,
            detections = batch.detections.len(),
            events = batch.events.len(),
            gaps = batch.gaps.len(),
            "Checkpoint committed"
        );

        run.pending = 0;
        Ok(())
    }
}

fn record_gap(run: &mut RunState, frame_index: u64, reason: GapReason, message: String) {
    tracing::warn!(video_id = %run.video.id, frame_index, reason = %reason, message = %message, "Frame skipped");
    metrics::counter!("frame_gaps_total", "reason" => reason.to_string()).increment(1);

    run.batch.gaps.push(FrameGap {
        video_id: run.video.id,
        frame_index,
        reason,
        message,
    });
    run.batch.last_frame_index = frame_index;
    run.pending += 1;
    run.report.frames_skipped += 1;
}

fn to_record(
    video_id: Uuid,
    frame_index: u64,
    frame_time: DateTime<Utc>,
    offset_seconds: f64,
    width: u32,
    height: u32,
    detection: ObjectDetection,
) -> Detection {
    Detection {
        id: Uuid::new_v4(),
        video_id,
        frame_index,
        frame_time,
        offset_seconds,
        class_id: detection.class_id,
        label: detection.label,
        confidence: detection.confidence,
        bbox: detection.bbox,
        bbox_normalized: detection.bbox.relative_to(width, height),
        track_id: detection.track_id,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Video {0} not found")]
    VideoNotFound(Uuid),

    #[error("Parking lot {0} has no slots configured")]
    NoSlots(Uuid),

    #[error("Unreadable media: {0}")]
    UnreadableMedia(String),

    #[error("Processing cancelled by request")]
    Cancelled,

    #[error("Lease lost to another worker")]
    LeaseLost,

    #[error("Worker shutting down")]
    Shutdown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Media error: {0}")]
    Media(String),
}

impl From<SamplerError> for JobError {
    fn from(e: SamplerError) -> Self {
        match e {
            SamplerError::UnreadableMedia(message) => Self::UnreadableMedia(message),
            other => Self::Media(other.to_string()),
        }
    }
}

impl JobError {
    /// Error kind recorded on the video when this error ends a run.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VideoNotFound(_) => ErrorKind::VideoNotFound,
            Self::NoSlots(_) => ErrorKind::NoSlots,
            Self::UnreadableMedia(_) => ErrorKind::UnreadableMedia,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VideoNotFound(_) | Self::NoSlots(_) | Self::UnreadableMedia(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_times_follow_fps() {
        let origin = Utc::now();
        let clock = Clock { origin, fps: Some(25.0) };
        let offset = clock.offset_seconds(50);
        assert!((offset - 2.0).abs() < 1e-12);
        assert_eq!(clock.frame_time(offset), origin + chrono::Duration::seconds(2));

        let unknown = Clock { origin, fps: None };
        assert_eq!(unknown.offset_seconds(50), 0.0);
    }

    #[test]
    fn error_classification() {
        assert!(JobError::UnreadableMedia("x".into()).is_fatal());
        assert!(JobError::NoSlots(Uuid::nil()).is_fatal());
        assert!(!JobError::LeaseLost.is_fatal());
        assert!(!JobError::Media("pipe closed".into()).is_fatal());
        assert_eq!(JobError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(JobError::Shutdown.kind(), ErrorKind::Internal);
        assert_eq!(
            JobError::from(SamplerError::UnreadableMedia("gone".into())).kind(),
            ErrorKind::UnreadableMedia
        );
    }
}
