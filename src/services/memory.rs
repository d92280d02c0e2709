//! In-process implementations of [`PipelineStore`] and [`JobQueue`].
//!
//! Used by tests and single-node development runs. They follow the same
//! compare-and-set and lease rules as the Postgres and Redis backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::models::detection::{Detection, FrameGap};
use crate::models::job::ProcessingJob;
use crate::models::lot::ParkingSlot;
use crate::models::occupancy::{OccupancyEvent, SlotStatus};
use crate::models::video::{ErrorKind, Video, VideoStatus};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::sampler::MediaInfo;
use crate::services::store::{FrameBatch, PipelineStore, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StoreState {
    videos: HashMap<Uuid, Video>,
    slots: BTreeMap<Uuid, Vec<ParkingSlot>>,
    detections: Vec<Detection>,
    events: Vec<OccupancyEvent>,
    event_keys: HashSet<(Uuid, Uuid, u64)>,
    gaps: Vec<FrameGap>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_video(&self, video: Video) {
        lock(&self.state).videos.insert(video.id, video);
    }

    /// Replace the slot layout of a lot.
    pub fn insert_slots(&self, lot_id: Uuid, slots: Vec<ParkingSlot>) {
        lock(&self.state).slots.insert(lot_id, slots);
    }

    pub fn video(&self, video_id: Uuid) -> Option<Video> {
        lock(&self.state).videos.get(&video_id).cloned()
    }

    pub fn detections(&self, video_id: Uuid) -> Vec<Detection> {
        lock(&self.state)
            .detections
            .iter()
            .filter(|d| d.video_id == video_id)
            .cloned()
            .collect()
    }

    /// Apply `f` to a video if its status is one of `from`.
    fn transition(&self, video_id: Uuid, from: &[VideoStatus], f: impl FnOnce(&mut Video)) -> bool {
        let mut state = lock(&self.state);
        match state.videos.get_mut(&video_id) {
            Some(video) if from.contains(&video.status) => {
                f(video);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<Video>, StoreError> {
        Ok(self.video(video_id))
    }

    async fn mark_queued(&self, video_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.transition(video_id, &[VideoStatus::Uploaded, VideoStatus::Failed], |video| {
            video.status = VideoStatus::Queued;
            video.error_kind = None;
            video.error_message = None;
            video.processing_finished_at = None;
        }))
    }

    async fn start_processing(&self, video_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.transition(video_id, &[VideoStatus::Queued, VideoStatus::Processing], |video| {
            video.status = VideoStatus::Processing;
            video.processing_started_at.get_or_insert_with(Utc::now);
        }))
    }

    async fn record_media_info(&self, video_id: Uuid, info: &MediaInfo) -> Result<(), StoreError> {
        if let Some(video) = lock(&self.state).videos.get_mut(&video_id) {
            video.fps = info.fps.or(video.fps);
            video.frame_count = info.frame_count.or(video.frame_count);
        }
        Ok(())
    }

    async fn list_slots(&self, lot_id: Uuid) -> Result<Vec<ParkingSlot>, StoreError> {
        Ok(lock(&self.state).slots.get(&lot_id).cloned().unwrap_or_default())
    }

    async fn latest_slot_statuses(&self, lot_id: Uuid) -> Result<Vec<(Uuid, SlotStatus)>, StoreError> {
        let state = lock(&self.state);
        let mut latest: BTreeMap<Uuid, &OccupancyEvent> = BTreeMap::new();
        for event in state.events.iter().filter(|e| e.lot_id == lot_id) {
            let newer = latest
                .get(&event.slot_id)
                .is_none_or(|prev| (event.frame_time, event.created_at) >= (prev.frame_time, prev.created_at));
            if newer {
                latest.insert(event.slot_id, event);
            }
        }
        Ok(latest.into_iter().map(|(slot, e)| (slot, e.status)).collect())
    }

    async fn commit_batch(&self, video_id: Uuid, batch: &FrameBatch) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(&batch.debounce_state)?;
        let mut state = lock(&self.state);

        state.detections.extend(batch.detections.iter().cloned());
        for event in &batch.events {
            if state.event_keys.insert((event.video_id, event.slot_id, event.frame_index)) {
                state.events.push(event.clone());
            }
        }
        state.gaps.extend(batch.gaps.iter().cloned());

        if let Some(video) = state.videos.get_mut(&video_id) {
            let advanced = video
                .last_processed_frame_index
                .is_none_or(|current| batch.last_frame_index >= current);
            if advanced {
                video.last_processed_frame_index = Some(batch.last_frame_index);
                video.debounce_state = Some(snapshot);
            }
        }
        Ok(())
    }

    async fn complete(&self, video_id: Uuid, final_checkpoint: u64) -> Result<bool, StoreError> {
        Ok(self.transition(video_id, &[VideoStatus::Processing], |video| {
            video.status = VideoStatus::Completed;
            video.last_processed_frame_index = Some(
                video
                    .last_processed_frame_index
                    .map_or(final_checkpoint, |current| current.max(final_checkpoint)),
            );
            video.processing_finished_at = Some(Utc::now());
        }))
    }

    async fn fail(&self, video_id: Uuid, kind: ErrorKind, message: &str) -> Result<bool, StoreError> {
        Ok(self.transition(video_id, &[VideoStatus::Processing], |video| {
            video.status = VideoStatus::Failed;
            video.error_kind = Some(kind);
            video.error_message = Some(message.to_string());
            video.processing_finished_at = Some(Utc::now());
        }))
    }

    async fn list_events(&self, video_id: Uuid) -> Result<Vec<OccupancyEvent>, StoreError> {
        let mut events: Vec<OccupancyEvent> = lock(&self.state)
            .events
            .iter()
            .filter(|e| e.video_id == video_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.frame_index, e.slot_id));
        Ok(events)
    }

    async fn list_gaps(&self, video_id: Uuid) -> Result<Vec<FrameGap>, StoreError> {
        let mut gaps: Vec<FrameGap> = lock(&self.state)
            .gaps
            .iter()
            .filter(|g| g.video_id == video_id)
            .cloned()
            .collect();
        gaps.sort_by_key(|g| g.frame_index);
        gaps.dedup_by_key(|g| g.frame_index);
        Ok(gaps)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, ProcessingJob>,
    cancelled: HashSet<Uuid>,
}

/// Single-process job queue with the same lease semantics as Redis.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a worker's lease, as if it had expired.
    pub fn expire_lease(&self, video_id: Uuid) {
        if let Some(job) = lock(&self.state).jobs.get_mut(&video_id) {
            job.lease_owner = None;
            job.lease_expires_at = None;
        }
    }
}

fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn holds_lease(job: &ProcessingJob, worker_id: &str, now: DateTime<Utc>) -> bool {
    job.is_leased_at(now) && job.lease_owner.as_deref() == Some(worker_id)
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, video_id: Uuid) -> Result<bool, QueueError> {
        let mut state = lock(&self.state);
        if state.jobs.contains_key(&video_id) {
            return Ok(false);
        }
        state.jobs.insert(video_id, ProcessingJob::new(video_id));
        state.cancelled.remove(&video_id);
        Ok(true)
    }

    async fn acquire(&self, worker_id: &str, lease_ttl: Duration) -> Result<Option<ProcessingJob>, QueueError> {
        let now = Utc::now();
        let mut state = lock(&self.state);

        let next = state
            .jobs
            .values_mut()
            .filter(|job| job.next_eligible_at <= now && !job.is_leased_at(now))
            .min_by_key(|job| (job.next_eligible_at, job.enqueued_at));

        Ok(next.map(|job| {
            job.attempts += 1;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_expires_at = Some(lease_deadline(now, lease_ttl));
            job.clone()
        }))
    }

    async fn renew(&self, video_id: Uuid, worker_id: &str, lease_ttl: Duration) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        match state.jobs.get_mut(&video_id) {
            Some(job) if holds_lease(job, worker_id, now) => {
                job.lease_expires_at = Some(lease_deadline(now, lease_ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        video_id: Uuid,
        worker_id: &str,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        match state.jobs.get_mut(&video_id) {
            Some(job) if holds_lease(job, worker_id, now) => {
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.next_eligible_at = eligible_at;
                job.last_error = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, video_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        match state.jobs.get_mut(&video_id) {
            Some(job) if holds_lease(job, worker_id, now) => {
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.next_eligible_at = now;
                job.attempts = job.attempts.saturating_sub(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, video_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let removable = match state.jobs.get(&video_id) {
            Some(job) => holds_lease(job, worker_id, now) || !job.is_leased_at(now),
            None => false,
        };
        if removable {
            state.jobs.remove(&video_id);
            state.cancelled.remove(&video_id);
        }
        Ok(removable)
    }

    async fn request_cancel(&self, video_id: Uuid) -> Result<(), QueueError> {
        lock(&self.state).cancelled.insert(video_id);
        Ok(())
    }

    async fn is_cancel_requested(&self, video_id: Uuid) -> Result<bool, QueueError> {
        Ok(lock(&self.state).cancelled.contains(&video_id))
    }

    async fn get(&self, video_id: Uuid) -> Result<Option<ProcessingJob>, QueueError> {
        Ok(lock(&self.state).jobs.get(&video_id).cloned())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(lock(&self.state).jobs.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
