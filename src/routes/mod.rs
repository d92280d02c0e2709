pub mod health;
pub mod metrics;
pub mod videos;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Health and video-processing routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/videos/{video_id}/process", post(videos::process_video))
        .route("/api/v1/videos/{video_id}/cancel", post(videos::cancel_video))
        .route("/api/v1/videos/{video_id}/processing", get(videos::processing_status))
        .with_state(state)
}
