use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of an uploaded video inside the processing pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VideoStatus {
    Uploaded,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl VideoStatus {
    /// `completed` and `failed` never change once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a video ended up `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    UnreadableMedia,
    NoSlots,
    VideoNotFound,
    Cancelled,
    RetriesExhausted,
    Internal,
}

/// An uploaded video and its processing progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: Uuid,
    pub lot_id: Uuid,
    /// File reference relative to the video storage root.
    pub filename: String,
    pub status: VideoStatus,
    pub uploaded_at: DateTime<Utc>,
    /// Real-world start of the footage, when known.
    pub recorded_at: Option<DateTime<Utc>>,
    pub fps: Option<f64>,
    pub frame_count: Option<u64>,
    /// Last frame index whose results are durably committed.
    pub last_processed_frame_index: Option<u64>,
    /// Debouncer snapshot committed together with the checkpoint.
    pub debounce_state: Option<serde_json::Value>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl Video {
    /// A freshly uploaded video that has not entered the pipeline yet.
    pub fn new(lot_id: Uuid, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lot_id,
            filename: filename.into(),
            status: VideoStatus::Uploaded,
            uploaded_at: Utc::now(),
            recorded_at: None,
            fps: None,
            frame_count: None,
            last_processed_frame_index: None,
            debounce_state: None,
            processing_started_at: None,
            processing_finished_at: None,
            error_kind: None,
            error_message: None,
        }
    }

    /// First frame index a (re)started run must process.
    pub fn resume_index(&self) -> u64 {
        self.last_processed_frame_index.map_or(0, |index| index + 1)
    }

    /// Wall-clock anchor for frame timestamps.
    pub fn time_origin(&self) -> DateTime<Utc> {
        self.recorded_at.unwrap_or(self.uploaded_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(VideoStatus::Processing.to_string(), "processing");
        assert_eq!(VideoStatus::from_str("failed").unwrap(), VideoStatus::Failed);
        assert_eq!(ErrorKind::RetriesExhausted.to_string(), "retries_exhausted");
    }

    #[test]
    fn resume_starts_after_checkpoint() {
        let mut video = Video::new(Uuid::new_v4(), "lot.mp4");
        assert_eq!(video.resume_index(), 0);
        video.last_processed_frame_index = Some(41);
        assert_eq!(video.resume_index(), 42);
    }
}
