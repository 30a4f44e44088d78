//! Stratum client implementation.
//!
//! [`StratumClient`] owns the connection state and both registries behind a
//! single mutex. Each installed transport ("link") gets its own connection
//! task that writes queued requests, reads inbound messages, and hands them
//! to the dispatcher. When the task sees the connection die it reports the
//! loss back with its [`LinkId`], so losses from replaced links are ignored.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::Transport;
use crate::connector::{self, ConnectOptions, ServerInfo};
use crate::dispatch::Dispatcher;
use crate::error::{StratumError, StratumResult};
use crate::keepalive::{KeepAlive, KeepAliveConfig};
use crate::messages::{Request, SUBSCRIBE_SUFFIX};
use crate::requests::PendingResponse;
use crate::subscriptions::Subscription;

/// What happens to outstanding work when the connection drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// Leave pending calls and subscriptions alone. Calls wait forever
    /// unless the caller applies a timeout; subscriptions simply go quiet.
    #[default]
    LeavePending,

    /// Fail every pending call with [`StratumError::Disconnected`] and close
    /// every subscription.
    FailPending,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Keep-alive settings; `None` disables keep-alive traffic
    pub keepalive: Option<KeepAliveConfig>,

    /// Treatment of outstanding work on connection loss
    pub on_disconnect: DisconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(KeepAliveConfig::default()),
            on_disconnect: DisconnectPolicy::default(),
        }
    }
}

/// Lifecycle phase of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or the last connection was lost
    Unconnected,
    /// A `connect` is in progress and no link is live
    Connecting,
    /// A transport is installed
    Connected,
    /// `close` was called
    Closed,
}

/// Identifies one installed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A live transport as seen from the client.
///
/// Dropping a link stops its connection task, which closes the transport,
/// and stops its keep-alive task.
struct Link {
    id: LinkId,

    /// Requests for the connection task to write
    outbound: mpsc::UnboundedSender<Request>,

    /// Stops the connection task
    shutdown: CancellationToken,

    /// Held only to be dropped with the link
    _keepalive: Option<KeepAlive>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct State {
    phase: ConnectionState,
    dispatcher: Dispatcher,
    link: Option<Link>,
    last_link: u64,
}

impl State {
    /// Register a pending call and queue its request.
    fn send(&mut self, method: &str, params: Vec<Value>) -> StratumResult<PendingResponse> {
        let link = self.link.as_ref().ok_or(StratumError::NotConnected)?;
        let (request, pending) = self.dispatcher.requests.register(method, params);

        trace!(id = request.id, method, "Queueing request");
        if link.outbound.send(request).is_err() {
            self.dispatcher.requests.cancel(pending.id());
            return Err(StratumError::Disconnected);
        }

        Ok(pending)
    }
}

struct Inner {
    config: ClientConfig,
    state: Mutex<State>,
}

/// Client for a single Stratum server.
///
/// Cheap to clone; clones share the connection. Requests may be issued from
/// any task. Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct StratumClient {
    inner: Arc<Inner>,
}

/// Non-owning reference held by background tasks.
#[derive(Clone)]
pub(crate) struct WeakClient(Weak<Inner>);

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<StratumClient> {
        self.0.upgrade().map(|inner| StratumClient { inner })
    }
}

impl StratumClient {
    /// Create a client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client with an explicit configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    phase: ConnectionState::Unconnected,
                    dispatcher: Dispatcher::new(),
                    link: None,
                    last_link: 0,
                }),
            }),
        }
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// Whether a transport is installed.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    /// Number of requests still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().dispatcher.requests.len()
    }

    /// Connect to `server` over protocol `code`.
    ///
    /// On success the new connection replaces any existing one. On failure
    /// an existing connection is left untouched.
    pub async fn connect(
        &self,
        server: &ServerInfo,
        code: char,
        options: &ConnectOptions,
    ) -> StratumResult<LinkId> {
        {
            let mut state = self.inner.state.lock();
            if state.link.is_none() {
                state.phase = ConnectionState::Connecting;
            }
        }

        match connector::connect(server, code, options).await {
            Ok(conn) => {
                let id = self.connect_transport(conn);
                debug!(server = %server, link = %id, "Connected");
                Ok(id)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.link.is_none() {
                    state.phase = ConnectionState::Unconnected;
                }
                Err(e)
            }
        }
    }

    /// Install an already-connected transport.
    ///
    /// Any previous transport is closed. Starts the connection task and, if
    /// configured, keep-alive. Must be called within a tokio runtime.
    pub fn connect_transport<T: Transport>(&self, transport: T) -> LinkId {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let mut state = self.inner.state.lock();
        state.last_link += 1;
        let id = LinkId(state.last_link);

        tokio::spawn(run_link(
            self.downgrade(),
            id,
            transport,
            outbound_rx,
            shutdown.clone(),
        ));

        let keepalive = self
            .inner
            .config
            .keepalive
            .clone()
            .map(|config| KeepAlive::spawn(self.downgrade(), config));

        let previous = state.link.replace(Link {
            id,
            outbound: outbound_tx,
            shutdown,
            _keepalive: keepalive,
        });
        if let Some(previous) = previous {
            debug!(old = %previous.id, new = %id, "Replacing connection");
        }

        state.phase = ConnectionState::Connected;
        id
    }

    /// Call `method` on the server.
    ///
    /// `method` must be namespaced, e.g. `server.version`. The request is
    /// queued immediately; the returned future resolves with the server's
    /// `result`, or [`StratumError::Server`] if it answered with an error.
    pub fn call(&self, method: &str, params: Vec<Value>) -> StratumResult<PendingResponse> {
        check_namespaced(method)?;
        self.inner.state.lock().send(method, params)
    }

    /// Subscribe to `method`, which must end in `subscribe`.
    ///
    /// Returns the future for the initial response and a stream of later
    /// notifications. The listener is registered before the request is
    /// sent, so a notification that overtakes the response is not lost.
    pub fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> StratumResult<(PendingResponse, Subscription)> {
        check_namespaced(method)?;
        if !method.ends_with(SUBSCRIBE_SUFFIX) {
            return Err(StratumError::InvalidMethod(format!(
                "{method} is not a subscription"
            )));
        }

        let mut state = self.inner.state.lock();
        if state.link.is_none() {
            return Err(StratumError::NotConnected);
        }

        let subscription = state.dispatcher.subscriptions.register(method);
        match state.send(method, params) {
            Ok(pending) => Ok((pending, subscription)),
            Err(e) => {
                state.dispatcher.subscriptions.unregister_latest(method);
                Err(e)
            }
        }
    }

    /// Close the connection and stop keep-alive.
    ///
    /// Pending calls are not failed; a response can no longer arrive, so
    /// they wait forever. Closing twice is harmless.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if let Some(link) = state.link.take() {
            debug!(link = %link.id, "Closing connection");
        }
        state.phase = ConnectionState::Closed;
    }

    /// Route one inbound message. Does not need a live transport.
    pub(crate) fn dispatch(&self, msg: Value) -> StratumResult<()> {
        self.inner.state.lock().dispatcher.dispatch(msg)
    }

    /// Handle loss of link `id`, unless it has already been replaced.
    pub(crate) fn connection_lost(&self, id: LinkId) {
        let mut state = self.inner.state.lock();

        if state.link.as_ref().map(|link| link.id) != Some(id) {
            debug!(link = %id, "Ignoring loss of superseded connection");
            return;
        }

        state.link = None;
        state.phase = ConnectionState::Unconnected;
        warn!(link = %id, "Server connection lost");

        if self.inner.config.on_disconnect == DisconnectPolicy::FailPending {
            let failed = state.dispatcher.requests.fail_all();
            state.dispatcher.subscriptions.close_all();
            debug!(failed, "Failed outstanding requests");
        }
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }
}

impl Default for StratumClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StratumClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StratumClient")
            .field("phase", &state.phase)
            .field("link", &state.link.as_ref().map(|link| link.id))
            .field("outstanding", &state.dispatcher.requests.len())
            .finish()
    }
}

fn check_namespaced(method: &str) -> StratumResult<()> {
    if method.contains('.') {
        Ok(())
    } else {
        Err(StratumError::InvalidMethod(format!(
            "{method} has no namespace"
        )))
    }
}

/// Why a connection task stopped.
enum LinkExit {
    /// Closed, replaced, or the client went away
    Closed,
    /// The connection failed underneath us
    Lost,
}

/// Connection task: pump requests out and messages in until the link ends.
async fn run_link<T: Transport>(
    client: WeakClient,
    id: LinkId,
    mut transport: T,
    mut outbound: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
) {
    let exit = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break LinkExit::Closed,

            request = outbound.recv() => match request {
                Some(request) => {
                    if let Err(e) = transport.write_message(&request).await {
                        warn!(link = %id, error = %e, "Failed to send request");
                        break LinkExit::Lost;
                    }
                }
                None => break LinkExit::Closed,
            },

            msg = transport.read_message() => match msg {
                Ok(Some(msg)) => {
                    let Some(client) = client.upgrade() else {
                        break LinkExit::Closed;
                    };
                    if let Err(e) = client.dispatch(msg) {
                        warn!(link = %id, error = %e, "Dropping inbound message");
                    }
                }
                Ok(None) => {
                    info!(link = %id, "Connection closed by server");
                    break LinkExit::Lost;
                }
                Err(StratumError::InvalidMessage(e)) => {
                    warn!(link = %id, error = %e, "Received malformed message, ignoring");
                }
                Err(e) => {
                    warn!(link = %id, error = %e, "Connection read failed");
                    break LinkExit::Lost;
                }
            },
        }
    };

    if let Err(e) = transport.shutdown().await {
        trace!(link = %id, error = %e, "Transport shutdown failed");
    }

    if let LinkExit::Lost = exit {
        if let Some(client) = client.upgrade() {
            client.connection_lost(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, MockTransport};
    use crate::connector::PROTO_TCP;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Client without keep-alive, so tests control every request ID.
    fn test_client() -> StratumClient {
        StratumClient::with_config(ClientConfig {
            keepalive: None,
            ..Default::default()
        })
    }

    async fn wait_disconnected(client: &StratumClient) {
        timeout(Duration::from_secs(5), async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("client never noticed the lost connection");
    }

    #[tokio::test]
    async fn test_ids_unique_and_increasing() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(client.call("server.version", Vec::new()).unwrap().id());
        }
        let (pending, _sub) = client
            .subscribe("blockchain.headers.subscribe", Vec::new())
            .unwrap();
        ids.push(pending.id());
        ids.push(client.call("server.banner", Vec::new()).unwrap().id());

        assert_eq!(ids, vec![2, 3, 4, 5, 6]);

        // Requests reach the wire in allocation order
        for expected in &ids {
            assert_eq!(handle.recv().await.unwrap().id, *expected);
        }
    }

    #[tokio::test]
    async fn test_call_resolves_once() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        let pending = client
            .call("blockchain.estimatefee", vec![json!(6)])
            .unwrap();

        let request = handle.recv().await.unwrap();
        assert_eq!(request.method, "blockchain.estimatefee");
        assert_eq!(request.params, vec![json!(6)]);

        handle.respond(&request, json!(42));
        assert_eq!(pending.await.unwrap(), json!(42));
        assert_eq!(client.outstanding(), 0);

        // Duplicate is dropped and the link carries on
        handle.respond(&request, json!(42));
        let next = client.call("server.version", Vec::new()).unwrap();
        let request = handle.recv().await.unwrap();
        handle.respond(&request, json!("ElectrumX 1.16.0"));
        assert_eq!(next.await.unwrap(), json!("ElectrumX 1.16.0"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_error_response_reaches_only_its_caller() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        let failing = client
            .call("blockchain.transaction.get", vec![json!("00")])
            .unwrap();
        let other = client.call("server.version", Vec::new()).unwrap();

        let failing_req = handle.recv().await.unwrap();
        let other_req = handle.recv().await.unwrap();

        handle.send(json!({
            "id": failing_req.id,
            "error": {"code": 1, "message": "bad"}
        }));
        handle.respond(&other_req, json!("ok"));

        match failing.await {
            Err(StratumError::Server { error, request }) => {
                assert_eq!(error, json!({"code": 1, "message": "bad"}));
                assert_eq!(*request, failing_req);
            }
            other => panic!("Expected server error, got {:?}", other),
        }
        assert_eq!(other.await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_subscription_fan_out() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        let (first_resp, mut first) = client
            .subscribe("server.peers.subscribe", Vec::new())
            .unwrap();
        let (second_resp, mut second) = client
            .subscribe("server.peers.subscribe", Vec::new())
            .unwrap();

        for _ in 0..2 {
            let request = handle.recv().await.unwrap();
            handle.respond(&request, json!([]));
        }
        assert_eq!(first_resp.await.unwrap(), json!([]));
        assert_eq!(second_resp.await.unwrap(), json!([]));

        let peers_a = json!([["10.0.0.1", "a.example", ["v1.4"]]]);
        let peers_b = json!([["10.0.0.2", "b.example", ["v1.4"]]]);
        handle.send(json!({"method": "server.peers.subscribe", "params": peers_a.clone()}));
        handle.send(json!({"method": "server.peers.subscribe", "params": peers_b.clone()}));

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await, Some(peers_a.clone()));
            assert_eq!(sub.recv().await, Some(peers_b.clone()));
        }
    }

    #[tokio::test]
    async fn test_malformed_traffic_is_absorbed() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        let pending = client.call("server.version", Vec::new()).unwrap();
        let request = handle.recv().await.unwrap();

        handle.send(json!({"foo": "bar"}));
        handle.send(json!({"id": request.id, "method": "server.version"}));
        handle.send(json!({"id": 999, "result": true}));
        handle.respond(&request, json!("ElectrumX 1.16.0"));

        assert_eq!(pending.await.unwrap(), json!("ElectrumX 1.16.0"));
        assert!(client.is_connected());
    }

    /// Transport that pushes a notification the moment it sees a
    /// subscribe request, ahead of the response.
    struct EagerNotifier {
        inbound_tx: mpsc::UnboundedSender<Value>,
        inbound_rx: mpsc::UnboundedReceiver<Value>,
    }

    #[async_trait]
    impl Transport for EagerNotifier {
        async fn read_message(&mut self) -> StratumResult<Option<Value>> {
            Ok(self.inbound_rx.recv().await)
        }

        async fn write_message(&mut self, msg: &Request) -> StratumResult<()> {
            if msg.is_subscription() {
                self.inbound_tx
                    .send(json!({"method": msg.method, "params": [{"height": 2}]}))
                    .unwrap();
            }
            self.inbound_tx
                .send(json!({"id": msg.id, "result": {"height": 1}}))
                .unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notification_before_response_is_not_missed() {
        let client = test_client();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        client.connect_transport(EagerNotifier {
            inbound_tx,
            inbound_rx,
        });

        let (pending, mut headers) = client
            .subscribe("blockchain.headers.subscribe", Vec::new())
            .unwrap();

        assert_eq!(pending.await.unwrap(), json!({"height": 1}));
        assert_eq!(headers.recv().await, Some(json!([{"height": 2}])));
    }

    #[tokio::test]
    async fn test_garbage_lines_keep_the_link() {
        let client = test_client();
        let (client_side, server_side) = tokio::io::duplex(4096);
        client.connect_transport(Connection::new(client_side));

        let pending = client.call("server.version", Vec::new()).unwrap();

        let (read_half, mut write_half) = tokio::io::split(server_side);
        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let req: Request = serde_json::from_str(&line).unwrap();

        write_half.write_all(b"\xff\xfe garbage\n").await.unwrap();
        let reply = format!("{}\n", json!({"id": req.id, "result": "ok"}));
        write_half.write_all(reply.as_bytes()).await.unwrap();

        let result = timeout(Duration::from_secs(5), pending).await.unwrap();
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_listener() {
        let client = test_client();

        // Link whose connection task is already gone
        let (outbound, gone) = mpsc::unbounded_channel();
        drop(gone);
        client.inner.state.lock().link = Some(Link {
            id: LinkId(99),
            outbound,
            shutdown: CancellationToken::new(),
            _keepalive: None,
        });

        let result = client.subscribe("blockchain.headers.subscribe", Vec::new());
        assert!(matches!(result, Err(StratumError::Disconnected)));

        let state = client.inner.state.lock();
        assert_eq!(
            state
                .dispatcher
                .subscriptions
                .listeners("blockchain.headers.subscribe"),
            0
        );
        assert_eq!(state.dispatcher.requests.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_method_names() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        assert!(matches!(
            client.call("version", Vec::new()),
            Err(StratumError::InvalidMethod(_))
        ));
        assert!(matches!(
            client.subscribe("server.version", Vec::new()),
            Err(StratumError::InvalidMethod(_))
        ));
        assert!(matches!(
            client.subscribe("subscribe", Vec::new()),
            Err(StratumError::InvalidMethod(_))
        ));

        tokio::task::yield_now().await;
        assert!(handle.try_recv().is_none());
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_requests_need_a_connection() {
        let client = test_client();
        assert_eq!(client.state(), ConnectionState::Unconnected);

        assert!(matches!(
            client.call("server.version", Vec::new()),
            Err(StratumError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe("server.peers.subscribe", Vec::new()),
            Err(StratumError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);
        assert_eq!(client.state(), ConnectionState::Connected);

        client.close();
        client.close();

        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.is_connected());
        assert!(matches!(
            client.call("server.version", Vec::new()),
            Err(StratumError::NotConnected)
        ));

        // Connection task let go of the transport
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pending_call_resolves_after_close() {
        let client = test_client();
        let (transport, _handle) = MockTransport::pair();
        client.connect_transport(transport);

        let pending = client.call("server.version", Vec::new()).unwrap();
        client.close();
        assert_eq!(client.outstanding(), 1);

        client
            .dispatch(json!({"id": pending.id(), "result": "late"}))
            .unwrap();
        assert_eq!(pending.await.unwrap(), json!("late"));
    }

    #[tokio::test]
    async fn test_loss_leaves_pending_calls() {
        let client = test_client();
        let (transport, mut handle) = MockTransport::pair();
        client.connect_transport(transport);

        let pending = client.call("server.version", Vec::new()).unwrap();
        let (_, mut sub) = client
            .subscribe("blockchain.headers.subscribe", Vec::new())
            .unwrap();
        handle.recv().await.unwrap();
        drop(handle);

        wait_disconnected(&client).await;
        assert_eq!(client.state(), ConnectionState::Unconnected);
        assert_eq!(client.outstanding(), 2);

        assert!(timeout(Duration::from_millis(20), pending).await.is_err());
        assert!(timeout(Duration::from_millis(20), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_pending_policy() {
        let client = StratumClient::with_config(ClientConfig {
            keepalive: None,
            on_disconnect: DisconnectPolicy::FailPending,
        });
        let (transport, handle) = MockTransport::pair();
        client.connect_transport(transport);

        let pending = client.call("server.version", Vec::new()).unwrap();
        let (_, mut sub) = client
            .subscribe("blockchain.headers.subscribe", Vec::new())
            .unwrap();
        drop(handle);

        assert!(matches!(pending.await, Err(StratumError::Disconnected)));
        assert_eq!(sub.recv().await, None);
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stale_loss_is_ignored() {
        let client = test_client();
        let (first, mut first_handle) = MockTransport::pair();
        let (second, mut second_handle) = MockTransport::pair();

        let old = client.connect_transport(first);
        let new = client.connect_transport(second);
        assert_ne!(old, new);

        // Replaced transport gets closed
        assert!(first_handle.recv().await.is_none());

        client.connection_lost(old);
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Connected);

        let pending = client.call("server.version", Vec::new()).unwrap();
        let request = second_handle.recv().await.unwrap();
        second_handle.respond(&request, json!("still here"));
        assert_eq!(pending.await.unwrap(), json!("still here"));

        client.connection_lost(new);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_client_unconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = test_client();
        let server = ServerInfo::new("127.0.0.1").with_port(PROTO_TCP, port, false);

        let result = client
            .connect(&server, PROTO_TCP, &ConnectOptions::default())
            .await;
        assert!(matches!(result, Err(StratumError::ConnectionFailed { .. })));
        assert_eq!(client.state(), ConnectionState::Unconnected);

        let result = client.connect(&server, 'g', &ConnectOptions::default()).await;
        assert!(matches!(result, Err(StratumError::UnsupportedTransport('g'))));
        assert_eq!(client.state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn test_end_to_end_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Minimal Electrum-ish server; hangs up after the subscription
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let req: Request = serde_json::from_str(&line).unwrap();
                let out = match req.method.as_str() {
                    "server.version" => {
                        format!("{}\n", json!({"id": req.id, "result": ["ElectrumX 1.16.0", "1.4"]}))
                    }
                    "blockchain.headers.subscribe" => format!(
                        "{}\n{}\n",
                        json!({"id": req.id, "result": {"height": 1}}),
                        json!({"method": req.method, "params": [{"height": 2}]}),
                    ),
                    _ => format!(
                        "{}\n",
                        json!({"id": req.id, "error": {"code": -32601, "message": "unknown method"}})
                    ),
                };
                write_half.write_all(out.as_bytes()).await.unwrap();

                if req.is_subscription() {
                    break;
                }
            }
        });

        let client = StratumClient::new();
        let server = ServerInfo::new("127.0.0.1").with_port(PROTO_TCP, port, false);
        client
            .connect(&server, PROTO_TCP, &ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let version = client.call("server.version", Vec::new()).unwrap();
        assert_eq!(version.await.unwrap(), json!(["ElectrumX 1.16.0", "1.4"]));

        let unknown = client.call("server.nonsense", Vec::new()).unwrap();
        assert!(matches!(unknown.await, Err(StratumError::Server { .. })));

        let (tip, mut headers) = client
            .subscribe("blockchain.headers.subscribe", Vec::new())
            .unwrap();
        assert_eq!(tip.await.unwrap(), json!({"height": 1}));
        assert_eq!(headers.recv().await, Some(json!([{"height": 2}])));

        wait_disconnected(&client).await;
        assert_eq!(client.state(), ConnectionState::Unconnected);
    }
}
