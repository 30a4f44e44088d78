//! Establishing the transport: TCP, optional SOCKS5 tunnel, optional TLS.
//!
//! Connecting happens in two steps. [`plan`] turns a server description and
//! connect options into a [`Route`], validating the combination without
//! touching the network. [`establish`] then opens the sockets the route
//! describes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;

use crate::connection::{BoxedStream, Connection};
use crate::error::{StratumError, StratumResult};
use crate::tracing::prelude::*;

/// Protocol code for plain TCP.
pub const PROTO_TCP: char = 't';

/// Protocol code for TLS over TCP.
pub const PROTO_TLS: char = 's';

/// Protocol codes servers advertise that we cannot speak (HTTP, websocket).
const UNSUPPORTED_PROTOCOLS: &[char] = &['h', 'g'];

/// SOCKS port of a local Tor Browser, used when Tor routing is requested
/// without an explicit proxy.
pub const DEFAULT_TOR_PROXY: (&str, u16) = ("localhost", 9150);

/// Port and encryption for one protocol a server offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub tls: bool,
}

/// A server to connect to.
///
/// Maps single-character protocol codes to the port serving them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: String,
    ports: BTreeMap<char, PortSpec>,
}

impl ServerInfo {
    /// Server with no ports yet.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ports: BTreeMap::new(),
        }
    }

    /// Server on the conventional Electrum ports: `t` 50001, `s` 50002.
    pub fn electrum(hostname: impl Into<String>) -> Self {
        Self::new(hostname)
            .with_port(PROTO_TCP, 50001, false)
            .with_port(PROTO_TLS, 50002, true)
    }

    /// Add or replace the port for `code`.
    pub fn with_port(mut self, code: char, port: u16, tls: bool) -> Self {
        self.ports.insert(code, PortSpec { port, tls });
        self
    }

    /// Port and TLS flag for `code`, if the server offers it.
    pub fn port(&self, code: char) -> Option<PortSpec> {
        self.ports.get(&code).copied()
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hostname)?;
        for (code, spec) in &self.ports {
            write!(f, " {}{}", code, spec.port)?;
        }
        Ok(())
    }
}

/// `host:port` of a SOCKS5 proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl ProxyAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyAddr {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| StratumError::Configuration(format!("proxy '{s}' is not host:port")))?;

        let port = port
            .parse()
            .map_err(|_| StratumError::Configuration(format!("proxy port '{port}' is invalid")))?;

        if host.is_empty() {
            return Err(StratumError::Configuration(format!(
                "proxy '{s}' has no host"
            )));
        }

        Ok(Self::new(host, port))
    }
}

/// Whether to reach the server through Tor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TorRouting {
    /// Connect directly (or through [`ConnectOptions::proxy`])
    #[default]
    Off,
    /// Use the local Tor SOCKS port, [`DEFAULT_TOR_PROXY`]
    Default,
    /// Use Tor's SOCKS port at this address
    Via(ProxyAddr),
}

/// How to reach the server.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Route through Tor. Implies `disable_cert_verify`.
    pub tor: TorRouting,

    /// Accept any TLS certificate for any host name.
    ///
    /// Only sensible inside a tunnel that already authenticates the peer,
    /// such as a Tor onion service.
    pub disable_cert_verify: bool,

    /// Explicit SOCKS5 proxy. Cannot be combined with `tor`.
    pub proxy: Option<ProxyAddr>,
}

/// Certificate handling for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsMode {
    Off,
    Verified,
    Unverified,
}

/// Fully resolved connection plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: TlsMode,
    pub(crate) proxy: Option<ProxyAddr>,
}

/// Resolve `server`, `code` and `options` into a [`Route`].
pub(crate) fn plan(server: &ServerInfo, code: char, options: &ConnectOptions) -> StratumResult<Route> {
    if UNSUPPORTED_PROTOCOLS.contains(&code) {
        return Err(StratumError::UnsupportedTransport(code));
    }

    let spec = server.port(code).ok_or_else(|| {
        StratumError::Configuration(format!(
            "server {} does not offer protocol '{}'",
            server.hostname, code
        ))
    })?;

    let mut disable_cert_verify = options.disable_cert_verify;
    let proxy = match &options.tor {
        TorRouting::Off => options.proxy.clone(),
        tor => {
            if options.proxy.is_some() {
                return Err(StratumError::Configuration(
                    "cannot chain an explicit proxy in front of Tor".to_string(),
                ));
            }
            disable_cert_verify = true;

            match tor {
                TorRouting::Via(addr) => Some(addr.clone()),
                _ => Some(ProxyAddr::new(DEFAULT_TOR_PROXY.0, DEFAULT_TOR_PROXY.1)),
            }
        }
    };

    let tls = match (spec.tls, disable_cert_verify) {
        (false, _) => TlsMode::Off,
        (true, false) => TlsMode::Verified,
        (true, true) => TlsMode::Unverified,
    };

    Ok(Route {
        host: server.hostname.clone(),
        port: spec.port,
        tls,
        proxy,
    })
}

/// Open the sockets described by `route` and wrap them in a [`Connection`].
pub(crate) async fn establish(route: &Route) -> StratumResult<Connection> {
    let host = route.host.as_str();
    let port = route.port;

    let stream: BoxedStream = match &route.proxy {
        Some(proxy) => {
            debug!(proxy = %proxy, host, port, "Connecting through SOCKS5 proxy");
            // Hostname goes to the proxy unresolved so .onion targets work
            let tunnel = Socks5Stream::connect((proxy.host.as_str(), proxy.port), (host, port))
                .await
                .map_err(|e| StratumError::connect(host, port, std::io::Error::other(e)))?;
            Box::new(tunnel)
        }
        None => {
            debug!(host, port, "Connecting");
            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|e| StratumError::connect(host, port, e))?;
            Box::new(tcp)
        }
    };

    let stream: BoxedStream = match route.tls {
        TlsMode::Off => stream,
        mode => {
            let connector = tls_connector(mode == TlsMode::Verified)?;
            let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                StratumError::Configuration(format!("invalid TLS server name {host}: {e}"))
            })?;

            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| StratumError::connect(host, port, e))?;
            Box::new(tls)
        }
    };

    debug!(host, port, tls = ?route.tls, "Connected");
    Ok(Connection::new(stream))
}

/// Connect to `server` using protocol `code`.
pub async fn connect(
    server: &ServerInfo,
    code: char,
    options: &ConnectOptions,
) -> StratumResult<Connection> {
    let route = plan(server, code, options)?;
    establish(&route).await
}

/// Build a TLS connector, verifying against the webpki roots or not at all.
fn tls_connector(verify: bool) -> StratumResult<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| StratumError::Configuration(format!("TLS setup failed: {e}")))?;

    let config = if verify {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that accepts any certificate chain for any host name.
///
/// Handshake signatures are still checked, so the peer must hold the key for
/// the certificate it presents.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
