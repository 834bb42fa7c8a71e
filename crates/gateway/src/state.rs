use std::sync::Arc;

use tg_domain::config::Config;

use crate::runtime::TurnEngine;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<TurnEngine>,
}
