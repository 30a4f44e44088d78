//! Client for line-delimited JSON Stratum servers.
//!
//! Keeps one persistent connection to a server (plain TCP, TLS, optionally
//! through a SOCKS5 proxy or Tor) and multiplexes request/response calls and
//! notification subscriptions over it. This is the protocol Electrum servers
//! speak.
//!
//! # Protocol Overview
//!
//! Every message is one JSON object on one line.
//!
//! - **Requests**: `{"id": n, "method": "server.version", "params": [...]}`
//! - **Responses**: carry the request's `id` and either `result` or `error`
//! - **Notifications**: carry `method` and `params` but no `id`; they are
//!   published to everyone subscribed to that method
//!
//! # Architecture
//!
//! [`StratumClient`] is a cheap handle; a background task per connection
//! writes queued requests and routes inbound messages. Calls return a future
//! for their response, subscriptions return a stream of notification
//! payloads. A keep-alive task issues a periodic call while connected.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_rpc::{ConnectOptions, ServerInfo, StratumClient, PROTO_TLS};
//!
//! let client = StratumClient::new();
//! let server = ServerInfo::electrum("electrum.example.org");
//! client.connect(&server, PROTO_TLS, &ConnectOptions::default()).await?;
//!
//! let version = client.call("server.version", vec![])?.await?;
//!
//! let (tip, mut headers) = client.subscribe("blockchain.headers.subscribe", vec![])?;
//! println!("tip: {}", tip.await?);
//! while let Some(params) = headers.recv().await {
//!     println!("new header: {params}");
//! }
//! ```

pub mod client;
pub mod connection;
pub mod connector;
mod dispatch;
pub mod error;
pub mod keepalive;
pub mod messages;
pub mod requests;
pub mod subscriptions;
pub mod tracing;

pub use client::{ClientConfig, ConnectionState, DisconnectPolicy, LinkId, StratumClient};
pub use connection::{AsyncStream, BoxedStream, Connection, Transport};
pub use connector::{
    ConnectOptions, DEFAULT_TOR_PROXY, PROTO_TCP, PROTO_TLS, PortSpec, ProxyAddr, ServerInfo,
    TorRouting,
};
pub use error::{StratumError, StratumResult};
pub use keepalive::KeepAliveConfig;
pub use messages::Request;
pub use requests::PendingResponse;
pub use subscriptions::Subscription;
