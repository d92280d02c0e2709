//! Maps detected vehicle boxes onto slot polygons.
//!
//! Occupancy is the fraction of a slot's area covered by the *union* of
//! qualifying vehicle boxes, so overlapping boxes are never double-counted.
//! The union is decomposed into disjoint rectangles by sweeping over box
//! x-coordinates; each rectangle is intersected with the slot polygon by
//! Sutherland-Hodgman clipping.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::detection::{BoundingBox, ObjectDetection};
use crate::models::lot::{ParkingSlot, Point};
use crate::models::occupancy::{SlotSignal, SlotStatus};

/// Slack for float noise when comparing against the overlap threshold.
const RATIO_EPSILON: f64 = 1e-9;

/// Stateless slot-occupancy classifier.
#[derive(Debug, Clone)]
pub struct SlotOccupancyResolver {
    overlap_threshold: f64,
    confidence_threshold: f64,
    vehicle_labels: Vec<String>,
}

impl SlotOccupancyResolver {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            overlap_threshold: config.overlap_threshold,
            confidence_threshold: config.confidence_threshold,
            vehicle_labels: config.vehicle_labels.clone(),
        }
    }

    fn is_vehicle(&self, detection: &ObjectDetection) -> bool {
        detection.confidence >= self.confidence_threshold
            && self
                .vehicle_labels
                .iter()
                .any(|label| label.eq_ignore_ascii_case(&detection.label))
    }

    /// Raw occupancy signal for every slot on one frame.
    ///
    /// Ties at exactly the threshold resolve to occupied.
    pub fn resolve(
        &self,
        frame_index: u64,
        detections: &[ObjectDetection],
        slots: &[ParkingSlot],
    ) -> BTreeMap<Uuid, SlotSignal> {
        let boxes: Vec<BoundingBox> = detections
            .iter()
            .filter(|d| self.is_vehicle(d))
            .map(|d| d.bbox.normalized_corners())
            .filter(|b| b.area() > 0.0)
            .collect();

        let signals: BTreeMap<Uuid, SlotSignal> = slots
            .iter()
            .map(|slot| {
                let overlap_ratio = covered_fraction(&slot.polygon, &boxes);
                let status = if !boxes.is_empty()
                    && overlap_ratio + RATIO_EPSILON >= self.overlap_threshold
                    && overlap_ratio > 0.0
                {
                    SlotStatus::Occupied
                } else {
                    SlotStatus::Free
                };
                (
                    slot.id,
                    SlotSignal {
                        status,
                        overlap_ratio,
                    },
                )
            })
            .collect();

        tracing::trace!(
            frame_index,
            vehicles = boxes.len(),
            occupied = signals
                .values()
                .filter(|s| s.status == SlotStatus::Occupied)
                .count(),
            "Resolved slot occupancy"
        );

        signals
    }
}

/// Fraction of `polygon`'s area covered by the union of `boxes`.
pub fn covered_fraction(polygon: &[Point], boxes: &[BoundingBox]) -> f64 {
    let slot_area = polygon_area(polygon);
    if slot_area <= 0.0 || boxes.is_empty() {
        return 0.0;
    }

    let covered: f64 = disjoint_union(boxes)
        .iter()
        .map(|rect| polygon_area(&clip_to_rect(polygon, rect)))
        .sum();

    (covered / slot_area).clamp(0.0, 1.0)
}

/// Absolute polygon area via the shoelace formula.
pub fn polygon_area(polygon: &[Point]) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let twice: f64 = polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();
    twice.abs() / 2.0
}

/// Split a union of boxes into non-overlapping rectangles.
fn disjoint_union(boxes: &[BoundingBox]) -> Vec<BoundingBox> {
    let mut xs: Vec<f64> = boxes.iter().flat_map(|b| [b.x1, b.x2]).collect();
    xs.sort_by(f64::total_cmp);
    xs.dedup();

    let mut rects = Vec::new();
    for strip in xs.windows(2) {
        let (left, right) = (strip[0], strip[1]);
        if right <= left {
            continue;
        }

        let mut spans: Vec<(f64, f64)> = boxes
            .iter()
            .filter(|b| b.x1 <= left && b.x2 >= right)
            .map(|b| (b.y1, b.y2))
            .collect();
        spans.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(spans.len());
        for (top, bottom) in spans {
            match merged.last_mut() {
                Some(last) if top <= last.1 => last.1 = last.1.max(bottom),
                _ => merged.push((top, bottom)),
            }
        }

        rects.extend(
            merged
                .into_iter()
                .map(|(top, bottom)| BoundingBox::new(left, top, right, bottom)),
        );
    }
    rects
}

/// Clip `polygon` against an axis-aligned rectangle.
fn clip_to_rect(polygon: &[Point], rect: &BoundingBox) -> Vec<Point> {
    let mut output = polygon.to_vec();
    for edge in [Edge::Left(rect.x1), Edge::Right(rect.x2), Edge::Top(rect.y1), Edge::Bottom(rect.y2)] {
        if output.is_empty() {
            break;
        }
        let input = std::mem::take(&mut output);
        let mut prev = input[input.len() - 1];
        for &current in &input {
            match (edge.inside(current), edge.inside(prev)) {
                (true, true) => output.push(current),
                (true, false) => {
                    output.push(edge.intersect(prev, current));
                    output.push(current);
                }
                (false, true) => output.push(edge.intersect(prev, current)),
                (false, false) => {}
            }
            prev = current;
        }
    }
    output
}

#[derive(Clone, Copy)]
enum Edge {
    Left(f64),
    Right(f64),
    Top(f64),
    Bottom(f64),
}

impl Edge {
    fn inside(self, p: Point) -> bool {
        match self {
            Self::Left(x) => p.x >= x,
            Self::Right(x) => p.x <= x,
            Self::Top(y) => p.y >= y,
            Self::Bottom(y) => p.y <= y,
        }
    }

    fn intersect(self, a: Point, b: Point) -> Point {
        match self {
            Self::Left(x) | Self::Right(x) => {
                let t = (x - a.x) / (b.x - a.x);
                Point::new(x, a.y + t * (b.y - a.y))
            }
            Self::Top(y) | Self::Bottom(y) => {
                let t = (y - a.y) / (b.y - a.y);
                Point::new(a.x + t * (b.x - a.x), y)
            }
        }
    }
}
