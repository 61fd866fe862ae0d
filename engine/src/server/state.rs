//! Server state

use std::sync::Arc;
use std::time::Duration;

use crate::service::ReleaseService;

/// Silence tolerated from a progress subscriber
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Server state shared across handlers
pub struct ServerState {
    pub service: Arc<ReleaseService>,

    /// A subscriber sending nothing for this long is disconnected
    pub heartbeat_timeout: Duration,
}

impl ServerState {
    pub fn new(service: Arc<ReleaseService>) -> Self {
        Self {
            service,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}
