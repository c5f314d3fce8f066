//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use std::sync::Arc;
use talk_diary_core::ports::BackendService;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn BackendService>,
    pub config: Arc<Config>,
}
