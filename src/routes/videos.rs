use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::video::{ErrorKind, VideoStatus};
use crate::services::scheduler::{self, SchedulerError};

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub video_id: Uuid,
    pub status: VideoStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub attempts: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub leased: bool,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProcessingStatusResponse {
    pub video_id: Uuid,
    pub status: VideoStatus,
    pub last_processed_frame_index: Option<u64>,
    pub frame_count: Option<u64>,
    pub fps: Option<f64>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub events: usize,
    pub gaps: usize,
    pub job: Option<JobSummary>,
}

fn status_for(error: &SchedulerError) -> StatusCode {
    match error {
        SchedulerError::VideoNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::InvalidState { .. } => StatusCode::CONFLICT,
        SchedulerError::Store(_) | SchedulerError::Queue(_) => {
            tracing::error!(error = %error, "Video request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// POST /api/v1/videos/{video_id}/process: queue a video for processing.
pub async fn process_video(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ProcessResponse>), StatusCode> {
    let status = scheduler::enqueue_video(state.store.as_ref(), state.queue.as_ref(), video_id)
        .await
        .map_err(|e| status_for(&e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            video_id,
            status,
            message: "Video queued for processing".to_string(),
        }),
    ))
}

/// POST /api/v1/videos/{video_id}/cancel: stop at the next frame boundary.
pub async fn cancel_video(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ProcessResponse>), StatusCode> {
    let status = scheduler::request_cancel(state.store.as_ref(), state.queue.as_ref(), video_id)
        .await
        .map_err(|e| status_for(&e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            video_id,
            status,
            message: "Cancellation requested".to_string(),
        }),
    ))
}

/// GET /api/v1/videos/{video_id}/processing: status, checkpoint and job state.
pub async fn processing_status(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<ProcessingStatusResponse>, StatusCode> {
    let internal = |e: &dyn std::fmt::Display| {
        tracing::error!(video_id = %video_id, error = %e, "Failed to load processing status");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let video = state
        .store
        .get_video(video_id)
        .await
        .map_err(|e| internal(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    let events = state.store.list_events(video_id).await.map_err(|e| internal(&e))?;
    let gaps = state.store.list_gaps(video_id).await.map_err(|e| internal(&e))?;

    let job = match state.queue.get(video_id).await.map_err(|e| internal(&e))? {
        Some(job) => Some(JobSummary {
            attempts: job.attempts,
            next_eligible_at: job.next_eligible_at,
            leased: job.is_leased_at(Utc::now()),
            cancel_requested: state
                .queue
                .is_cancel_requested(video_id)
                .await
                .map_err(|e| internal(&e))?,
            last_error: job.last_error,
        }),
        None => None,
    };

    Ok(Json(ProcessingStatusResponse {
        video_id,
        status: video.status,
        last_processed_frame_index: video.last_processed_frame_index,
        frame_count: video.frame_count,
        fps: video.fps,
        processing_started_at: video.processing_started_at,
        processing_finished_at: video.processing_finished_at,
        error_kind: video.error_kind,
        error_message: video.error_message,
        events: events.len(),
        gaps: gaps.len(),
        job,
    }))
}
