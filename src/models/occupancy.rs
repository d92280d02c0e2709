use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SlotStatus {
    Occupied,
    Free,
}

/// Per-frame raw reading for one slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SlotSignal {
    pub status: SlotStatus,
    /// Fraction of the slot area covered by vehicle boxes.
    pub overlap_ratio: f64,
}

/// A confirmed occupied/free transition of one slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OccupancyEvent {
    pub id: Uuid,
    pub video_id: Uuid,
    pub lot_id: Uuid,
    pub slot_id: Uuid,
    pub status: SlotStatus,
    pub frame_index: u64,
    pub frame_time: DateTime<Utc>,
    pub offset_seconds: f64,
    pub overlap_ratio: f64,
    pub created_at: DateTime<Utc>,
}
