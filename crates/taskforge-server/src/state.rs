//! Shared application state handed to every Axum handler.

use taskforge_core::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}
