//! HTTP polling transport (XEP-0025).
//!
//! Every cycle is one POST whose body is `ident;key[;newkey],payload`. The
//! server answers with the session ident in an `ID=` cookie and any pending
//! stream bytes as the body. Keys come from a chain of 64 SHA-1 hashes that is
//! consumed backwards and replaced when its last key is spent.
//!
//! A background task owns the polling loop so that `recv` stays cancel-safe.

use std::time::Duration;

use base64::prelude::*;
use rand::RngCore;
use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::ConnectionError;

pub const POLL_KEYS: usize = 64;

/// Chain of one-time keys, handed out last to first.
#[derive(Debug, Clone)]
pub struct PollKeys {
    keys: Vec<String>,
    remaining: usize,
}

impl PollKeys {
    pub fn generate() -> Self {
        let mut seed = [0u8; 64];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        let mut keys = Vec::with_capacity(POLL_KEYS);
        let mut previous = seed.to_vec();
        for _ in 0..POLL_KEYS {
            let key = BASE64_STANDARD.encode(Sha1::digest(&previous));
            previous = key.clone().into_bytes();
            keys.push(key);
        }
        Self {
            keys,
            remaining: POLL_KEYS,
        }
    }

    /// Next key, and a replacement chain head when this was the last one.
    pub fn next_key(&mut self) -> (String, Option<String>) {
        self.remaining -= 1;
        let key = self.keys[self.remaining].clone();
        if self.remaining > 0 {
            return (key, None);
        }
        *self = Self::generate();
        let (new_key, _) = self.next_key();
        (key, Some(new_key))
    }
}

pub fn make_packet(ident: &str, key: &str, new_key: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut head = ident.to_string();
    if !key.is_empty() {
        head.push(';');
        head.push_str(key);
    }
    if let Some(new_key) = new_key {
        head.push(';');
        head.push_str(new_key);
    }
    head.push(',');
    let mut packet = head.into_bytes();
    packet.extend_from_slice(payload);
    packet
}

/// Outcome of one request/response cycle.
#[derive(Debug, PartialEq, Eq)]
enum CycleResult {
    Data(Vec<u8>),
    Closed,
}

struct Poller {
    client: reqwest::Client,
    url: Url,
    credentials: Option<(String, String)>,
    via_proxy: bool,
    ident: String,
    keys: PollKeys,
    connected: bool,
}

impl Poller {
    async fn cycle(&mut self, payload: &[u8]) -> Result<CycleResult, ConnectionError> {
        let (key, new_key) = self.keys.next_key();
        let packet = make_packet(&self.ident, &key, new_key.as_deref(), payload);
        trace!(bytes = payload.len(), ident = %self.ident, "HTTP poll request");

        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(packet);
        if let (Some((user, pass)), false) = (&self.credentials, self.via_proxy) {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| self.map_request_error(&e))?;
        let status = response.status();
        if status.as_u16() == 407 {
            return Err(ConnectionError::ProxyAuth(status.to_string()));
        }
        if !status.is_success() {
            return Err(ConnectionError::ProxyNegotiate(format!(
                "poll request failed: {status}"
            )));
        }

        let ident = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(cookie_ident)
            .ok_or_else(|| {
                ConnectionError::StreamError("poll response carried no ID cookie".to_string())
            })?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ConnectionError::StreamError(e.to_string()))?;

        if ident.ends_with(":0") {
            if ident == "0:0" && self.connected {
                return Ok(CycleResult::Closed);
            }
            return Err(ConnectionError::StreamError(format!(
                "poll server reported error ident {ident}"
            )));
        }

        self.ident = ident;
        self.connected = true;
        Ok(CycleResult::Data(body.to_vec()))
    }

    fn map_request_error(&self, error: &reqwest::Error) -> ConnectionError {
        if error.is_connect() {
            if self.via_proxy {
                ConnectionError::ProxyConnect(error.to_string())
            } else {
                ConnectionError::ConnectionRefused(error.to_string())
            }
        } else {
            ConnectionError::StreamError(error.to_string())
        }
    }
}

fn cookie_ident(cookie: &str) -> Option<String> {
    let start = cookie.find("ID=")? + 3;
    let rest = &cookie[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

enum PollCommand {
    Write(Vec<u8>),
    Close,
}

/// Stream bytes carried over repeated HTTP requests.
pub struct HttpPollStream {
    commands: mpsc::UnboundedSender<PollCommand>,
    inbound: mpsc::UnboundedReceiver<Result<Vec<u8>, ConnectionError>>,
    interval: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

impl HttpPollStream {
    /// Open the polling session with the initial `0;key,` request.
    #[instrument(skip(config), fields(url = %config.poll_url()), name = "http_poll.connect")]
    pub async fn connect(config: &ProxyConfig) -> Result<Self, ConnectionError> {
        let url = Url::parse(&config.poll_url())
            .map_err(|e| ConnectionError::ProxyConnect(format!("invalid poll URL: {e}")))?;

        let via_proxy = config.poll_url.is_some() && !config.host.is_empty();
        let mut builder = reqwest::Client::builder();
        if via_proxy {
            let mut proxy = reqwest::Proxy::http(format!("http://{}:{}", config.host, config.port))
                .map_err(|e| ConnectionError::ProxyConnect(e.to_string()))?;
            if let Some((user, pass)) = config.credentials() {
                proxy = proxy.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ConnectionError::ProxyConnect(e.to_string()))?;

        let mut poller = Poller {
            client,
            url,
            credentials: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            via_proxy,
            ident: "0".to_string(),
            keys: PollKeys::generate(),
            connected: false,
        };

        let initial = match poller.cycle(&[]).await? {
            CycleResult::Data(data) => data,
            CycleResult::Closed => Vec::new(),
        };
        debug!(ident = %poller.ident, "HTTP poll session established");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (interval_tx, interval_rx) = watch::channel(config.poll_interval());
        if !initial.is_empty() {
            let _ = inbound_tx.send(Ok(initial));
        }
        let task = tokio::spawn(poll_loop(poller, command_rx, inbound_tx, interval_rx));

        Ok(Self {
            commands: command_tx,
            inbound: inbound_rx,
            interval: interval_tx,
            task,
        })
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        debug!(?interval, "HTTP poll interval changed");
        let _ = self.interval.send(interval);
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.commands
            .send(PollCommand::Write(data.to_vec()))
            .map_err(|_| ConnectionError::StreamError("poll session has ended".to_string()))
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.inbound.recv().await.unwrap_or_else(|| Ok(Vec::new()))
    }

    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        let _ = self.commands.send(PollCommand::Close);
        Ok(())
    }
}

impl Drop for HttpPollStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    mut poller: Poller,
    mut commands: mpsc::UnboundedReceiver<PollCommand>,
    inbound: mpsc::UnboundedSender<Result<Vec<u8>, ConnectionError>>,
    mut interval: watch::Receiver<Duration>,
) {
    let mut outgoing = Vec::new();
    let mut closing = false;

    loop {
        let wait = *interval.borrow();
        tokio::select! {
            command = commands.recv() => match command {
                Some(PollCommand::Write(data)) => outgoing.extend_from_slice(&data),
                Some(PollCommand::Close) | None => closing = true,
            },
            changed = interval.changed() => {
                if changed.is_err() {
                    closing = true;
                }
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        // Flush whatever else was queued before this cycle.
        while let Ok(command) = commands.try_recv() {
            match command {
                PollCommand::Write(data) => outgoing.extend_from_slice(&data),
                PollCommand::Close => closing = true,
            }
        }

        if closing && outgoing.is_empty() {
            debug!("HTTP poll session closed locally");
            return;
        }

        let payload = std::mem::take(&mut outgoing);
        match poller.cycle(&payload).await {
            Ok(CycleResult::Data(data)) => {
                if !data.is_empty() && inbound.send(Ok(data)).is_err() {
                    return;
                }
                if closing {
                    return;
                }
            }
            Ok(CycleResult::Closed) => {
                debug!("HTTP poll session closed by server");
                return;
            }
            Err(error) => {
                warn!(error = %error, "HTTP poll cycle failed");
                let _ = inbound.send(Err(error));
                return;
            }
        }
    }
}
