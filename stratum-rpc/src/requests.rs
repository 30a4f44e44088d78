//! Outstanding request tracking.
//!
//! Every request gets a fresh ID and a one-shot result slot. The slot is
//! handed to the caller as a [`PendingResponse`] future; the registry keeps
//! the sending side until the matching response arrives.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{StratumError, StratumResult};
use crate::messages::Request;

/// Initial value of the ID counter. IDs are pre-incremented, so the first
/// request goes out with ID 2.
const INITIAL_ID: u64 = 1;

/// A request waiting for its response.
struct PendingCall {
    /// Original request, kept for error context
    request: Request,

    /// Where the outcome goes
    tx: oneshot::Sender<StratumResult<Value>>,
}

/// Outstanding requests keyed by correlation ID.
pub(crate) struct RequestRegistry {
    next_id: u64,
    inflight: HashMap<u64, PendingCall>,
}

impl RequestRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: INITIAL_ID,
            inflight: HashMap::new(),
        }
    }

    /// Allocate an ID and register a pending call for it.
    ///
    /// Returns the request to put on the wire and the caller's handle.
    pub(crate) fn register(
        &mut self,
        method: &str,
        params: Vec<Value>,
    ) -> (Request, PendingResponse) {
        self.next_id += 1;
        let id = self.next_id;

        let request = Request::new(id, method, params);
        let (tx, rx) = oneshot::channel();

        self.inflight.insert(
            id,
            PendingCall {
                request: request.clone(),
                tx,
            },
        );

        (request, PendingResponse { id, rx })
    }

    /// Resolve and forget the pending call for `id`.
    ///
    /// `Err` outcomes become [`StratumError::Server`] carrying the original
    /// request. Fails with [`StratumError::UnknownId`] if nothing is waiting
    /// on `id` (already answered, never sent, or cancelled).
    pub(crate) fn resolve(&mut self, id: u64, outcome: Result<Value, Value>) -> StratumResult<()> {
        let PendingCall { request, tx } =
            self.inflight.remove(&id).ok_or(StratumError::UnknownId(id))?;

        let result = outcome.map_err(|error| StratumError::Server {
            error,
            request: Box::new(request),
        });

        // The caller may have stopped waiting; that is not our problem
        let _ = tx.send(result);
        Ok(())
    }

    /// Forget a call that never made it onto the wire.
    pub(crate) fn cancel(&mut self, id: u64) {
        self.inflight.remove(&id);
    }

    /// Fail every outstanding call with [`StratumError::Disconnected`].
    ///
    /// Returns how many calls were failed.
    pub(crate) fn fail_all(&mut self) -> usize {
        let count = self.inflight.len();
        for (_, call) in self.inflight.drain() {
            let _ = call.tx.send(Err(StratumError::Disconnected));
        }
        count
    }

    /// Number of outstanding calls.
    pub(crate) fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Whether a call with this ID is outstanding.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: u64) -> bool {
        self.inflight.contains_key(&id)
    }
}

/// Eventual result of a call.
///
/// Resolves once the server answers. There is no built-in timeout; wrap it
/// in `tokio::time::timeout` if you need one.
#[derive(Debug)]
#[must_use = "the response is lost if this is dropped"]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<StratumResult<Value>>,
}

impl PendingResponse {
    /// Correlation ID of the request.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = StratumResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StratumError::Disconnected)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_start_at_two_and_increase() {
        let mut registry = RequestRegistry::new();

        let ids: Vec<u64> = (0..5)
            .map(|_| registry.register("server.ping", Vec::new()).0.id)
            .collect();

        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!(registry.len(), 5);
    }

    #[tokio::test]
    async fn test_resolve_is_take_and_remove() {
        let mut registry = RequestRegistry::new();
        let (request, pending) = registry.register("server.version", Vec::new());

        registry.resolve(request.id, Ok(json!(42))).unwrap();
        assert!(!registry.contains(request.id));
        assert_eq!(pending.await.unwrap(), json!(42));

        let again = registry.resolve(request.id, Ok(json!(43)));
        assert!(matches!(again, Err(StratumError::UnknownId(id)) if id == request.id));
    }

    #[tokio::test]
    async fn test_error_outcome_carries_request() {
        let mut registry = RequestRegistry::new();
        let (request, pending) =
            registry.register("blockchain.transaction.get", vec![json!("abcd")]);

        registry
            .resolve(request.id, Err(json!({"code": 1, "message": "bad"})))
            .unwrap();

        match pending.await {
            Err(StratumError::Server { error, request: req }) => {
                assert_eq!(error, json!({"code": 1, "message": "bad"}));
                assert_eq!(*req, request);
            }
            other => panic!("Expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_after_caller_dropped() {
        let mut registry = RequestRegistry::new();
        let (request, pending) = registry.register("server.version", Vec::new());
        drop(pending);

        assert!(registry.resolve(request.id, Ok(Value::Null)).is_ok());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut registry = RequestRegistry::new();
        let (_, first) = registry.register("server.version", Vec::new());
        let (_, second) = registry.register("server.banner", Vec::new());

        assert_eq!(registry.fail_all(), 2);
        assert_eq!(registry.len(), 0);
        assert!(matches!(first.await, Err(StratumError::Disconnected)));
        assert!(matches!(second.await, Err(StratumError::Disconnected)));
    }

    #[tokio::test]
    async fn test_dropped_registry_fails_pending() {
        let mut registry = RequestRegistry::new();
        let (_, pending) = registry.register("server.version", Vec::new());
        drop(registry);

        assert!(matches!(pending.await, Err(StratumError::Disconnected)));
    }
}
