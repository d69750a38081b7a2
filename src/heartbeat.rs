use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::DispatchApi;

/// Periodic liveness ping. Failures are logged and otherwise ignored.
pub struct HeartbeatEmitter {
    dispatch: Arc<dyn DispatchApi>,
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(dispatch: Arc<dyn DispatchApi>, interval: Duration) -> Self {
        Self { dispatch, interval }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.dispatch.ping().await {
                        Ok(()) => debug!("Heartbeat sent"),
                        Err(e) => warn!("Heartbeat failed: {}", e),
                    }
                }
            }
        }
    }
}
