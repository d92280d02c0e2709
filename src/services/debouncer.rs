//! Temporal smoothing of raw per-slot occupancy signals.
//!
//! Each slot carries a tiny state machine: a confirmed status plus a
//! candidate status and how many consecutive samples have agreed with it.
//! A candidate becomes the confirmed status once its run reaches
//! `confirm_frames`, which is the only moment an event is emitted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::occupancy::SlotStatus;

/// Debounce state for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDebounceState {
    pub confirmed: SlotStatus,
    pub candidate: Option<SlotStatus>,
    pub run_length: u32,
}

impl SlotDebounceState {
    pub const fn new(confirmed: SlotStatus) -> Self {
        Self {
            confirmed,
            candidate: None,
            run_length: 0,
        }
    }

    fn reset_candidate(&mut self) {
        self.candidate = None;
        self.run_length = 0;
    }
}

impl Default for SlotDebounceState {
    fn default() -> Self {
        Self::new(SlotStatus::Free)
    }
}

/// A status change confirmed by the debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedTransition {
    pub slot_id: Uuid,
    pub status: SlotStatus,
    pub frame_index: u64,
}

/// Serializable snapshot, committed alongside each checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebouncerSnapshot {
    pub slots: BTreeMap<Uuid, SlotDebounceState>,
}

/// Per-video debouncer over every slot of a lot.
#[derive(Debug, Clone)]
pub struct OccupancyDebouncer {
    confirm_frames: u32,
    slots: BTreeMap<Uuid, SlotDebounceState>,
}

impl OccupancyDebouncer {
    /// Fresh debouncer; unseen slots start confirmed `free`.
    pub fn new(confirm_frames: u32) -> Self {
        Self {
            confirm_frames: confirm_frames.max(1),
            slots: BTreeMap::new(),
        }
    }

    /// Debouncer continuing from a committed snapshot.
    pub fn from_snapshot(confirm_frames: u32, snapshot: DebouncerSnapshot) -> Self {
        Self {
            confirm_frames: confirm_frames.max(1),
            slots: snapshot.slots,
        }
    }

    /// Seed a slot's confirmed status (e.g. from its last persisted event).
    pub fn seed(&mut self, slot_id: Uuid, confirmed: SlotStatus) {
        self.slots.insert(slot_id, SlotDebounceState::new(confirmed));
    }

    pub fn state(&self, slot_id: Uuid) -> SlotDebounceState {
        self.slots.get(&slot_id).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> DebouncerSnapshot {
        DebouncerSnapshot {
            slots: self.slots.clone(),
        }
    }

    /// Feed one raw sample. Samples for a slot must arrive in frame order.
    pub fn observe(&mut self, slot_id: Uuid, frame_index: u64, raw: SlotStatus) -> Option<ConfirmedTransition> {
        let state = self.slots.entry(slot_id).or_default();

        if raw == state.confirmed {
            state.reset_candidate();
            return None;
        }

        if state.candidate == Some(raw) {
            state.run_length += 1;
        } else {
            state.candidate = Some(raw);
            state.run_length = 1;
        }

        if state.run_length >= self.confirm_frames {
            state.confirmed = raw;
            state.reset_candidate();
            return Some(ConfirmedTransition {
                slot_id,
                status: raw,
                frame_index,
            });
        }

        None
    }
}
