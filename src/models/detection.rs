use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Same box with corners ordered so that `x1 <= x2` and `y1 <= y2`.
    pub fn normalized_corners(self) -> Self {
        Self {
            x1: self.x1.min(self.x2),
            y1: self.y1.min(self.y2),
            x2: self.x1.max(self.x2),
            y2: self.y1.max(self.y2),
        }
    }

    pub fn area(self) -> f64 {
        let b = self.normalized_corners();
        (b.x2 - b.x1) * (b.y2 - b.y1)
    }

    /// Box scaled into the 0..1 range of a `width` x `height` frame.
    pub fn relative_to(self, width: u32, height: u32) -> Self {
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        Self::new(self.x1 / w, self.y1 / h, self.x2 / w, self.y2 / h)
    }
}

/// One labeled box returned by a detection backend for a single frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectDetection {
    pub bbox: BoundingBox,
    pub class_id: i32,
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub track_id: Option<i64>,
}

/// Persisted detection, kept for audit and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub id: Uuid,
    pub video_id: Uuid,
    pub frame_index: u64,
    pub frame_time: DateTime<Utc>,
    pub offset_seconds: f64,
    pub class_id: i32,
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub bbox_normalized: BoundingBox,
    pub track_id: Option<i64>,
}

/// Why a sampled frame contributed no occupancy signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GapReason {
    CorruptFrame,
    DetectionUnavailable,
}

/// A skipped frame, recorded so gaps in the timeline stay visible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameGap {
    pub video_id: Uuid,
    pub frame_index: u64,
    pub reason: GapReason,
    pub message: String,
}
