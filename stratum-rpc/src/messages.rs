//! Stratum wire messages.
//!
//! Outbound traffic is always a [`Request`]. Inbound traffic arrives as raw
//! JSON and is sorted into an [`Inbound`] by [`Inbound::classify`] before the
//! dispatcher looks at it.
//!
//! ## Why not use a JSON-RPC library?
//!
//! Stratum predates JSON-RPC 2.0 and servers bend the rules in both
//! directions:
//! - Notifications may omit the `id` member or send `"id": null`
//! - Subscription payloads live under `params`, never `result`
//! - Any `error` member, even `null`, marks a response as failed
//! - No `jsonrpc` version member is required
//!
//! Classifying by hand keeps those quirks in one place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StratumError, StratumResult};

/// Suffix that marks a method as a subscription.
pub const SUBSCRIBE_SUFFIX: &str = "subscribe";

/// Request sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation ID echoed back in the response
    pub id: u64,

    /// Method name (e.g., "server.version", "blockchain.headers.subscribe")
    pub method: String,

    /// Positional parameters
    pub params: Vec<Value>,
}

impl Request {
    /// Create a new request message.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Whether this request opens a subscription.
    pub fn is_subscription(&self) -> bool {
        self.method.ends_with(SUBSCRIBE_SUFFIX)
    }
}

/// Inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to one of our requests
    Response {
        /// ID of the request being answered
        id: u64,
        /// `Ok(result)` or `Err(error)` exactly as sent by the server
        outcome: Result<Value, Value>,
    },

    /// Unsolicited traffic for a subscription
    Notification {
        /// Subscribed method name
        method: String,
        /// Payload, taken from `params`
        params: Value,
    },
}

impl Inbound {
    /// Sort a decoded inbound message into a response or a notification.
    ///
    /// Returns [`StratumError::InvalidMessage`] for anything that is neither:
    /// non-objects, messages with no `id` and no `method`, messages with both,
    /// and responses whose `id` is not an unsigned integer.
    pub fn classify(msg: Value) -> StratumResult<Self> {
        let mut obj = match msg {
            Value::Object(obj) => obj,
            other => {
                return Err(StratumError::InvalidMessage(format!(
                    "expected a JSON object, got {other}"
                )));
            }
        };

        match take_non_null(&mut obj, "id") {
            None => {
                let method = match obj.remove("method") {
                    Some(Value::String(method)) if !method.is_empty() => method,
                    _ => {
                        return Err(StratumError::InvalidMessage(format!(
                            "message has neither id nor method: {}",
                            Value::Object(obj)
                        )));
                    }
                };

                let params = obj.remove("params").unwrap_or(Value::Null);
                Ok(Inbound::Notification { method, params })
            }
            Some(id) => {
                if obj.contains_key("method") {
                    return Err(StratumError::InvalidMessage(format!(
                        "response {id} also carries a method"
                    )));
                }

                let id = id.as_u64().ok_or_else(|| {
                    StratumError::InvalidMessage(format!("response id {id} is not an integer"))
                })?;

                // Presence decides, so `"error": null` is still a failure
                let outcome = match obj.remove("error") {
                    Some(error) => Err(error),
                    None => Ok(obj.remove("result").unwrap_or(Value::Null)),
                };

                Ok(Inbound::Response { id, outcome })
            }
        }
    }
}

/// Remove `key`, treating an explicit `null` like an absent member.
fn take_non_null(obj: &mut Map<String, Value>, key: &str) -> Option<Value> {
    obj.remove(key).filter(|v| !v.is_null())
}
