use std::sync::Arc;

use crate::services::{queue::JobQueue, store::PipelineStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    pub queue: Arc<dyn JobQueue>,
}

impl AppState {
    pub fn new(store: Arc<dyn PipelineStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }
}
