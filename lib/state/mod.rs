use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::repair_service::StopSignal;

pub struct AppState {
    /// Shared with the repair loop; flipped by `/repair/stop` and by shutdown signals.
    pub stop: Arc<StopSignal>,
    /// Cancelled once the repair loop has unwound, to shut the HTTP server down.
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(stop: Arc<StopSignal>, shutdown_token: CancellationToken) -> Self {
        Self {
            stop,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
