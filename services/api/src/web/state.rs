//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use circulation_core::CirculationEngine;
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: CirculationEngine,
    pub config: Arc<Config>,
}
