use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A parking lot watched by one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkingLot {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One physical parking space, outlined in its camera's frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkingSlot {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub name: String,
    /// Ordered vertices; the closing edge is implicit.
    pub polygon: Vec<Point>,
}

impl ParkingSlot {
    pub fn new(lot_id: Uuid, name: impl Into<String>, polygon: Vec<Point>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lot_id,
            name: name.into(),
            polygon,
        }
    }

    /// Axis-aligned slot, handy for fixtures and rectangular layouts.
    pub fn rect(lot_id: Uuid, name: impl Into<String>, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::new(
            lot_id,
            name,
            vec![
                Point::new(x1, y1),
                Point::new(x2, y1),
                Point::new(x2, y2),
                Point::new(x1, y2),
            ],
        )
    }
}
