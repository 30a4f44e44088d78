//! Periodic keep-alive traffic.
//!
//! Servers and NAT boxes drop idle connections, so while a link is up we
//! issue a cheap call every few minutes.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::WeakClient;
use crate::error::StratumError;

/// Keep-alive settings.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Side-effect free method to call
    pub method: String,

    /// Parameters for `method`
    pub params: Vec<Value>,

    /// Pause between a response and the next call
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            method: "server.version".to_string(),
            params: Vec::new(),
            interval: Duration::from_secs(600),
        }
    }
}

/// Handle to a running keep-alive task. Dropping it stops the task.
pub(crate) struct KeepAlive {
    token: CancellationToken,
}

impl KeepAlive {
    /// Start pinging through `client` until cancelled.
    pub(crate) fn spawn(client: WeakClient, config: KeepAliveConfig) -> Self {
        let token = CancellationToken::new();
        tokio::spawn(run(client, config, token.clone()));
        Self { token }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(client: WeakClient, config: KeepAliveConfig, token: CancellationToken) {
    loop {
        // Hold the client only long enough to issue the call
        let pending = {
            let Some(client) = client.upgrade() else {
                return;
            };

            match client.call(&config.method, config.params.clone()) {
                Ok(pending) => pending,
                Err(StratumError::NotConnected) => {
                    debug!("Keep-alive stopping, not connected");
                    return;
                }
                Err(e) => {
                    warn!(method = %config.method, error = %e, "Keep-alive call failed");
                    return;
                }
            }
        };

        tokio::select! {
            result = pending => match result {
                Ok(response) => debug!(method = %config.method, response = %response, "Keep-alive"),
                Err(e) => {
                    warn!(method = %config.method, error = %e, "Keep-alive call failed");
                    return;
                }
            },
            _ = token.cancelled() => return,
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = token.cancelled() => return,
        }
    }
}
