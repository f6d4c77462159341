//! Shared Application State

use pivots_core::token::TokenSource;
use std::sync::Arc;

/// Created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<dyn TokenSource>,
}
