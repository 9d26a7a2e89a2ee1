// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Ferry Contributors

//! ferry-conntest - XMPP connection tester.
//!
//! Resolves the server for a JID, connects, negotiates the stream and prints
//! every signal and inbound stanza. Optionally sends one stanza before
//! closing.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ferry_xmpp::parser::element_to_string;
use ferry_xmpp::{
    Client, ClientEvent, LookupRegistry, PeerIdentity, ProxyKind, Signal, SocksVersion,
    TlsSettings,
};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;

use config::FerryConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProxyArg {
    None,
    HttpConnect,
    HttpPoll,
    Socks4,
    Socks5,
}

/// ferry-conntest - check that an XMPP account can connect and log in
#[derive(Debug, Parser)]
#[command(name = "ferry-conntest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Account JID (e.g., user@example.com/laptop); overrides the config file
    jid: Option<String>,

    /// Config file (default: ~/.config/ferry/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Password; prompted for when the server asks and none is set
    #[arg(short, long)]
    password: Option<String>,

    /// Resource to request when the JID has none
    #[arg(short, long)]
    resource: Option<String>,

    /// Connect to this host instead of discovering one
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port for --host
    #[arg(long, requires = "host")]
    port: Option<u16>,

    /// Skip SRV discovery
    #[arg(long)]
    no_probe: bool,

    /// Start TLS before the stream (old port 5223 style)
    #[arg(long)]
    force_ssl: bool,

    /// Try port 5223 with immediate TLS when SRV finds nothing
    #[arg(long)]
    legacy_ssl_probe: bool,

    #[arg(long, value_enum)]
    proxy: Option<ProxyArg>,

    #[arg(long)]
    proxy_host: Option<String>,

    #[arg(long)]
    proxy_port: Option<u16>,

    #[arg(long)]
    proxy_user: Option<String>,

    #[arg(long)]
    proxy_pass: Option<String>,

    /// HTTP polling endpoint
    #[arg(long)]
    poll_url: Option<String>,

    #[arg(long)]
    ssf_min: Option<u32>,

    #[arg(long)]
    ssf_max: Option<u32>,

    /// Permit plaintext passwords without TLS
    #[arg(long)]
    allow_plain: bool,

    #[arg(long)]
    require_mutual_auth: bool,

    /// Use jabber:iq:auth instead of SASL
    #[arg(long)]
    old_only: bool,

    /// Force one SASL mechanism (e.g., SCRAM-SHA-1)
    #[arg(long)]
    sasl_mechanism: Option<String>,

    /// Negotiate zlib stream compression
    #[arg(long)]
    compress: bool,

    /// Whitespace keepalive interval in milliseconds
    #[arg(long)]
    noop_ms: Option<u64>,

    /// Extra PEM trust anchors (repeatable)
    #[arg(long = "extra-root")]
    extra_roots: Vec<PathBuf>,

    /// Close unless the server certificate validates
    #[arg(long)]
    require_valid_cert: bool,

    /// Raw stanza to send once logged in
    #[arg(short, long)]
    send: Option<String>,

    /// Seconds to keep printing stanzas before closing
    #[arg(short, long, default_value_t = 0)]
    wait: u64,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Flags override whatever the file says.
    fn apply(&self, config: &mut FerryConfig) {
        if let Some(jid) = &self.jid {
            config.jid = Some(jid.clone());
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(resource) = &self.resource {
            config.resource = Some(resource.clone());
        }
        config.extra_roots.extend(self.extra_roots.iter().cloned());

        let connect = &mut config.connect;
        if let Some(host) = &self.host {
            connect.host = Some(host.clone());
            connect.port = self.port.or(connect.port);
        }
        connect.probe &= !self.no_probe;
        connect.force_ssl |= self.force_ssl;
        connect.legacy_ssl_probe |= self.legacy_ssl_probe;
        if let Some(min) = self.ssf_min {
            connect.ssf_min = min;
        }
        if let Some(max) = self.ssf_max {
            connect.ssf_max = max;
        }

        let proxy = &mut connect.proxy;
        match self.proxy {
            Some(ProxyArg::None) => proxy.kind = ProxyKind::None,
            Some(ProxyArg::HttpConnect) => proxy.kind = ProxyKind::HttpConnect,
            Some(ProxyArg::HttpPoll) => proxy.kind = ProxyKind::HttpPoll,
            Some(ProxyArg::Socks4) => {
                proxy.kind = ProxyKind::Socks;
                proxy.socks_version = SocksVersion::V4;
            }
            Some(ProxyArg::Socks5) => {
                proxy.kind = ProxyKind::Socks;
                proxy.socks_version = SocksVersion::V5;
            }
            None => {}
        }
        if let Some(host) = &self.proxy_host {
            proxy.host = host.clone();
        }
        if let Some(port) = self.proxy_port {
            proxy.port = port;
        }
        if let Some(user) = &self.proxy_user {
            proxy.user = Some(user.clone());
        }
        if let Some(pass) = &self.proxy_pass {
            proxy.pass = Some(pass.clone());
        }
        if let Some(url) = &self.poll_url {
            proxy.poll_url = Some(url.clone());
        }

        let stream = &mut config.stream;
        stream.allow_plain |= self.allow_plain;
        stream.require_mutual_auth |= self.require_mutual_auth;
        stream.old_protocol_only |= self.old_only;
        stream.compress |= self.compress;
        if let Some(mechanism) = &self.sasl_mechanism {
            stream.sasl_mechanism = Some(mechanism.clone());
        }
        if let Some(ms) = self.noop_ms {
            stream.noop_interval_ms = ms;
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{label}: ");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run(client: &mut Client, jid: &str, cli: &Cli) -> Result<()> {
    client
        .connect(jid)
        .await
        .with_context(|| format!("Cannot connect as {jid}"))?;

    let mut failure = None;
    let mut linger_until: Option<Instant> = None;
    loop {
        let event = match linger_until {
            Some(until) => match tokio::time::timeout_at(until, client.next_event()).await {
                Ok(event) => event,
                Err(_) => {
                    linger_until = None;
                    client.close().await;
                    continue;
                }
            },
            None => client.next_event().await,
        };
        let Some(event) = event else { break };

        match event {
            ClientEvent::Handshaken(identity) => {
                println!("tls: handshake complete, certificate {identity:?}");
                if cli.require_valid_cert && identity != PeerIdentity::Valid {
                    warn!(?identity, "refusing server certificate");
                    client.close().await;
                    failure = Some(anyhow::anyhow!("Server certificate is {identity:?}"));
                    continue;
                }
                client.continue_after_handshake().await?;
            }
            ClientEvent::Signal(Signal::Warning(warning)) => {
                println!("warning: {warning}");
                client.continue_after_warning().await?;
            }
            ClientEvent::Signal(Signal::NeedAuthParams {
                user,
                pass,
                realm,
                authzid,
            }) => {
                println!("auth: server needs user={user} pass={pass} realm={realm} authzid={authzid}");
                if user {
                    client.engine_mut().set_username(prompt("Username")?);
                }
                if pass {
                    client.set_password(prompt("Password")?);
                }
                client.continue_after_params().await?;
            }
            ClientEvent::Signal(Signal::Authenticated) => {
                let engine = client.engine();
                println!(
                    "authenticated: jid={} mechanism={:?} ssf={} compressed={}",
                    engine.jid().map(ToString::to_string).unwrap_or_default(),
                    engine.mechanism(),
                    engine.ssf(),
                    engine.is_compressed()
                );
                if let Some(stanza) = &cli.send {
                    client.send_raw(stanza).await?;
                    info!("stanza sent");
                }
                if cli.wait == 0 {
                    client.close().await;
                } else {
                    linger_until = Some(Instant::now() + Duration::from_secs(cli.wait));
                }
            }
            ClientEvent::Signal(Signal::Error(error)) => {
                println!("error: {error}");
                failure = Some(anyhow::Error::new(error).context("Negotiation failed"));
            }
            ClientEvent::Signal(signal) => println!("signal: {signal:?}"),
            ClientEvent::Stanza(stanza) => match element_to_string(&stanza) {
                Ok(xml) => println!("<< {xml}"),
                Err(error) => warn!(%error, "cannot print stanza"),
            },
        }
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = FerryConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    let jid = config
        .full_jid()
        .context("No JID given on the command line or in the config file")?;
    jid::Jid::new(&jid).with_context(|| format!("Invalid JID: {jid}"))?;

    let tls = TlsSettings {
        extra_roots: config.load_roots()?,
    };
    let lookups = LookupRegistry::init();
    let mut client = Client::new(config.connect.clone(), config.stream.clone(), tls, lookups.clone());
    if let Some(password) = &config.password {
        client.set_password(password.clone());
    }

    info!(jid = %jid, version = env!("CARGO_PKG_VERSION"), "starting connection test");
    let outcome = run(&mut client, &jid, &cli).await;
    lookups.shutdown();
    outcome
}
