//! Persistence seam for the records the pipeline reads and writes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::detection::{Detection, FrameGap};
use crate::models::lot::ParkingSlot;
use crate::models::occupancy::{OccupancyEvent, SlotStatus};
use crate::models::video::{ErrorKind, Video};
use crate::services::debouncer::DebouncerSnapshot;
use crate::services::sampler::MediaInfo;

/// Everything produced for a run of frames, committed as one unit.
#[derive(Debug, Clone, Default)]
pub struct FrameBatch {
    /// Checkpoint to record: the last frame index covered by this batch.
    pub last_frame_index: u64,
    pub detections: Vec<Detection>,
    pub events: Vec<OccupancyEvent>,
    pub gaps: Vec<FrameGap>,
    pub debounce_state: DebouncerSnapshot,
}

/// Durable storage for videos, slot geometry, detections, events and
/// checkpoints.
///
/// Status changes are compare-and-set: each returns `false` when the video
/// was not in a state the transition may start from.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<Video>, StoreError>;

    /// `uploaded | failed -> queued`. Clears the previous error.
    async fn mark_queued(&self, video_id: Uuid) -> Result<bool, StoreError>;

    /// `queued | processing -> processing`.
    async fn start_processing(&self, video_id: Uuid) -> Result<bool, StoreError>;

    async fn record_media_info(&self, video_id: Uuid, info: &MediaInfo) -> Result<(), StoreError>;

    async fn list_slots(&self, lot_id: Uuid) -> Result<Vec<ParkingSlot>, StoreError>;

    /// Most recent confirmed status per slot of a lot, across all videos.
    async fn latest_slot_statuses(&self, lot_id: Uuid) -> Result<Vec<(Uuid, SlotStatus)>, StoreError>;

    /// Append a batch and advance the checkpoint. The checkpoint never moves
    /// backwards and events are idempotent on `(video, slot, frame)`.
    async fn commit_batch(&self, video_id: Uuid, batch: &FrameBatch) -> Result<(), StoreError>;

    /// `processing -> completed` with the final checkpoint.
    async fn complete(&self, video_id: Uuid, final_checkpoint: u64) -> Result<bool, StoreError>;

    /// `processing -> failed`.
    async fn fail(&self, video_id: Uuid, kind: ErrorKind, message: &str) -> Result<bool, StoreError>;

    async fn list_events(&self, video_id: Uuid) -> Result<Vec<OccupancyEvent>, StoreError>;

    async fn list_gaps(&self, video_id: Uuid) -> Result<Vec<FrameGap>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
