//! Shared application state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub start_time: Instant,
    pub registry: SessionRegistry,
    /// Cancelled at shutdown so long-lived WebSocket handlers wind down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let close_timeout = Duration::from_secs(config.server.close_timeout_secs);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry: SessionRegistry::new(close_timeout),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
