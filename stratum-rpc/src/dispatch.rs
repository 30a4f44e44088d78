//! Inbound message routing.

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::StratumResult;
use crate::messages::Inbound;
use crate::requests::RequestRegistry;
use crate::subscriptions::SubscriptionRegistry;

/// Both registries, plus the routing between them.
pub(crate) struct Dispatcher {
    pub(crate) requests: RequestRegistry,
    pub(crate) subscriptions: SubscriptionRegistry,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            requests: RequestRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    /// Route one decoded inbound message.
    ///
    /// Responses resolve their pending call; notifications go to every
    /// listener for their method. Errors are malformed messages and
    /// responses for unknown IDs. Neither has any side effect, and the
    /// caller is expected to log and carry on.
    pub(crate) fn dispatch(&mut self, msg: Value) -> StratumResult<()> {
        match Inbound::classify(msg)? {
            Inbound::Response { id, outcome } => {
                if let Err(error) = &outcome {
                    debug!(id, error = %error, "Error response");
                }
                self.requests.resolve(id, outcome)
            }
            Inbound::Notification { method, params } => {
                let delivered = self.subscriptions.publish(&method, params);
                trace!(method = %method, delivered, "Traffic on subscription");
                Ok(())
            }
        }
    }
}
