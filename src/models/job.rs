use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue-level wrapper around a video waiting for or undergoing processing.
///
/// There is at most one job per video; the video id is the job key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingJob {
    pub video_id: Uuid,
    /// Lease acquisitions so far, including the current one.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProcessingJob {
    pub fn new(video_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            video_id,
            attempts: 0,
            enqueued_at: now,
            next_eligible_at: now,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
        }
    }

    /// Whether some worker holds an unexpired lease at `now`.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        matches!(
            (&self.lease_owner, self.lease_expires_at),
            (Some(_), Some(expires)) if expires > now
        )
    }
}

/// What happened to a job once a worker was done with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(ProcessingReport),
    /// The video was already terminal; nothing was done.
    Skipped,
}

/// Counters for one run over a video.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingReport {
    pub frames_sampled: u64,
    pub frames_skipped: u64,
    pub detections: u64,
    pub events: u64,
}
