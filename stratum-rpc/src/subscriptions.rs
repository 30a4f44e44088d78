//! Subscription listeners.
//!
//! Each `subscribe` call gets its own unbounded FIFO. Notifications are
//! broadcast: every listener registered for a method sees every payload for
//! that method, in arrival order.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Listeners keyed by method name.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    channels: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `method`.
    pub(crate) fn register(&mut self, method: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.entry(method.to_string()).or_default().push(tx);

        Subscription {
            method: method.to_string(),
            rx,
        }
    }

    /// Remove the most recently registered listener for `method`.
    ///
    /// Undoes a [`register`](Self::register) whose request never went out.
    pub(crate) fn unregister_latest(&mut self, method: &str) {
        if let Some(listeners) = self.channels.get_mut(method) {
            listeners.pop();
            if listeners.is_empty() {
                self.channels.remove(method);
            }
        }
    }

    /// Deliver `payload` to every listener for `method`.
    ///
    /// Listeners whose [`Subscription`] was dropped are pruned. Returns how
    /// many listeners received the payload; zero means it was dropped.
    pub(crate) fn publish(&mut self, method: &str, payload: Value) -> usize {
        let Some(listeners) = self.channels.get_mut(method) else {
            return 0;
        };

        listeners.retain(|tx| tx.send(payload.clone()).is_ok());
        let delivered = listeners.len();

        if listeners.is_empty() {
            self.channels.remove(method);
        }

        delivered
    }

    /// Close every listener. Their receivers drain what is queued, then end.
    pub(crate) fn close_all(&mut self) {
        self.channels.clear();
    }

    /// Number of live listeners for `method`.
    #[cfg(test)]
    pub(crate) fn listeners(&self, method: &str) -> usize {
        self.channels.get(method).map_or(0, Vec::len)
    }
}

/// Stream of notifications for one subscription.
#[derive(Debug)]
pub struct Subscription {
    method: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Method this subscription listens to.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the next notification payload.
    ///
    /// Returns `None` only if the client closed all subscriptions after a
    /// lost connection (see `DisconnectPolicy::FailPending`) or was dropped.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Take the next payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// Convert into a `Stream` of payloads.
    pub fn into_stream(self) -> UnboundedReceiverStream<Value> {
        UnboundedReceiverStream::new(self.rx)
    }
}
