//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use marathon_core::PipelineEngine;

use crate::config::Config;
use crate::work::WorkLibrary;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The orchestration engine handle; its registry is the read surface.
    pub engine: PipelineEngine,
    /// Registered work callbacks resolved at task creation.
    pub work: Arc<WorkLibrary>,
}
