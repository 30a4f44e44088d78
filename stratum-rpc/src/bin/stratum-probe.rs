//! Command-line probe for Stratum servers.
//!
//! Connects, asks for the server version, then optionally issues one more
//! call. Subscription methods keep printing notifications until Ctrl-C.

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::filter::LevelFilter;

use stratum_rpc::{
    ClientConfig, ConnectOptions, DisconnectPolicy, PROTO_TCP, PROTO_TLS, ProxyAddr, ServerInfo,
    StratumClient, TorRouting, tracing,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host name or address
    host: String,

    /// Method to call after `server.version`
    method: Option<String>,

    /// Parameters for METHOD; each is parsed as JSON, falling back to a string
    params: Vec<String>,

    /// Protocol code: `t` for TCP, `s` for TLS
    #[arg(long, default_value_t = PROTO_TLS)]
    protocol: char,

    /// Port; defaults to 50001 for `t` and 50002 for `s`
    #[arg(long)]
    port: Option<u16>,

    /// Route through Tor at localhost:9150
    #[arg(long)]
    tor: bool,

    /// Route through Tor at this SOCKS5 address
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "tor")]
    tor_proxy: Option<ProxyAddr>,

    /// Route through this SOCKS5 proxy
    #[arg(long, value_name = "HOST:PORT")]
    proxy: Option<ProxyAddr>,

    /// Accept any TLS certificate
    #[arg(long)]
    insecure: bool,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server(&self) -> ServerInfo {
        let server = ServerInfo::electrum(&self.host);
        match self.port {
            Some(port) => server.with_port(self.protocol, port, self.protocol == PROTO_TLS),
            None => server,
        }
    }

    fn options(&self) -> ConnectOptions {
        let tor = match (&self.tor_proxy, self.tor) {
            (Some(addr), _) => TorRouting::Via(addr.clone()),
            (None, true) => TorRouting::Default,
            (None, false) => TorRouting::Off,
        };

        ConnectOptions {
            tor,
            disable_cert_verify: self.insecure,
            proxy: self.proxy.clone(),
        }
    }

    fn params(&self) -> Vec<Value> {
        self.params
            .iter()
            .map(|p| serde_json::from_str(p).unwrap_or_else(|_| Value::String(p.clone())))
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing::init_stdout(if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    });

    if args.protocol != PROTO_TCP && args.protocol != PROTO_TLS {
        bail!("Unknown protocol '{}', expected t or s", args.protocol);
    }

    // Short-lived, so no pings; end the subscription stream if the link dies
    let client = StratumClient::with_config(ClientConfig {
        keepalive: None,
        on_disconnect: DisconnectPolicy::FailPending,
    });

    let server = args.server();
    client
        .connect(&server, args.protocol, &args.options())
        .await
        .with_context(|| format!("Failed to connect to {server}"))?;

    let version = client
        .call("server.version", vec![Value::from("stratum-probe"), Value::from("1.4")])?
        .await
        .context("server.version failed")?;
    println!("server.version: {version}");

    let Some(method) = &args.method else {
        client.close();
        return Ok(());
    };

    if method.ends_with("subscribe") {
        let (initial, mut notifications) = client.subscribe(method, args.params())?;
        let initial = initial.await.with_context(|| format!("{method} failed"))?;
        println!("{method}: {}", serde_json::to_string_pretty(&initial)?);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                params = notifications.recv() => match params {
                    Some(params) => println!("{method} <- {params}"),
                    None => bail!("Connection to {server} lost"),
                },
            }
        }
    } else {
        let result = client
            .call(method, args.params())?
            .await
            .with_context(|| format!("{method} failed"))?;
        println!("{method}: {}", serde_json::to_string_pretty(&result)?);
    }

    client.close();
    Ok(())
}
