//! The negotiation state machine.
//!
//! [`StreamEngine`] never touches a socket or a timer. A driver feeds it
//! [`Input`]s and carries out the [`Command`]s it queues, while the caller
//! watches [`Signal`]s and answers the checkpoints:
//!
//! ```text
//! Idle → Connecting → StreamOpening ─────────────────────────→ LegacyAuth ─┐
//!                                   → TlsNegotiating → SaslNegotiating ─┘     │
//!                                                    → ResourceBinding        │
//!                                                    → Compressing → Active ←─┘
//!                                                                  → Closing → Closed
//! ```
//!
//! A server that advertises no SASL mechanisms is authenticated with
//! jabber:iq:auth instead, which is why `LegacyAuth` ranks after
//! `SaslNegotiating`.
//!
//! Every non-terminal state can fall into `Error`. Nothing goes backwards;
//! the only way out of `Closed` or `Error` is a fresh
//! [`connect_to_server`](StreamEngine::connect_to_server).

mod layers;
pub(crate) mod legacy;

use std::collections::VecDeque;
use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, warn};

use crate::compress::ZLIB_METHOD;
use crate::config::{ConnectOptions, ProxyKind, StreamOptions, LOGIN_POLL_INTERVAL};
use crate::connector::ConnectRequest;
use crate::error::{
    BindCondition, Condition, ConnectionError, EngineError, NegotiationError, TlsCondition,
};
use crate::parser::{
    element_to_string, ns, Frame, StreamFeatures, StreamHeader, XmlFramer, STREAM_CLOSE,
};
use crate::sasl::{
    AuthParams, LayerState, NeedParams, PlainPolicy, SaslNegotiator, SaslPolicy, SaslStep,
    SelectedMechanism,
};
use crate::tls::{PeerIdentity, TlsCoordinator, TlsSettings};
use layers::Layers;

const BIND_ID: &str = "bind_1";
const SESSION_ID: &str = "sess_1";

/// Identifies one connection attempt. Inputs carrying an older id are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    Idle,
    Connecting,
    StreamOpening,
    LegacyAuth,
    TlsNegotiating,
    SaslNegotiating,
    ResourceBinding,
    Compressing,
    Active,
    Closing,
    Closed,
    Error,
}

impl State {
    /// Position along the negotiation.
    fn rank(self) -> u8 {
        match self {
            State::Idle => 0,
            State::Connecting => 1,
            State::StreamOpening => 2,
            State::TlsNegotiating => 3,
            State::SaslNegotiating => 4,
            State::LegacyAuth => 5,
            State::ResourceBinding => 6,
            State::Compressing => 7,
            State::Active => 8,
            State::Closing => 9,
            State::Closed => 10,
            State::Error => 11,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Closed | State::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Tls,
    Sasl,
}

/// Conditions the caller must acknowledge with
/// [`continue_after_warning`](StreamEngine::continue_after_warning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    /// The server speaks pre-1.0 XMPP, or the old protocol was forced.
    OldVersion,
    /// The stream will not be encrypted.
    NoTls,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::OldVersion => f.write_str("server uses a pre-1.0 protocol"),
            Warning::NoTls => f.write_str("TLS is not available"),
        }
    }
}

/// Everything the outside world can tell the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connected { session: SessionId, ssl: bool },
    ConnectFailed { session: SessionId, error: ConnectionError },
    Received(Vec<u8>),
    TransportClosed,
    NoopTick,
}

/// Work the driver performs on the engine's behalf, in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        session: SessionId,
        request: ConnectRequest,
    },
    CancelConnect {
        session: SessionId,
    },
    Write(Vec<u8>),
    Close,
    SetPollInterval(Duration),
    StartKeepalive(Duration),
    StopKeepalive,
}

/// Caller-visible progress. Each transition emits at most one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Connected,
    SecurityLayerActivated(Layer),
    NeedAuthParams {
        user: bool,
        authzid: bool,
        pass: bool,
        realm: bool,
    },
    Warning(Warning),
    CertificateRequested,
    Authenticated,
    Error(NegotiationError),
    ConnectionClosed,
}

impl From<NeedParams> for Signal {
    fn from(need: NeedParams) -> Self {
        Signal::NeedAuthParams {
            user: need.user,
            authzid: need.authzid,
            pass: need.pass,
            realm: need.realm,
        }
    }
}

/// What the engine is waiting for inside the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitConnect,
    SslHandshake,
    AwaitFeatures,
    StartTls,
    TlsHandshake,
    Sasl,
    LegacyFields,
    LegacyAuth,
    Bind,
    Session,
    Compress,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    Warning(Warning),
    Params,
    Handshake,
}

pub struct StreamEngine {
    connect_options: ConnectOptions,
    stream_options: StreamOptions,
    tls_settings: TlsSettings,
    params: AuthParams,

    state: State,
    phase: Phase,
    checkpoint: Option<Checkpoint>,
    session: Option<SessionId>,
    next_session: u64,

    jid: Option<Jid>,
    domain: String,
    header: Option<StreamHeader>,
    features: Option<StreamFeatures>,
    legacy: bool,
    authenticated: bool,
    polling: bool,

    framer: XmlFramer,
    layers: Layers,
    sasl: Option<SaslNegotiator>,
    mechanism: Option<SelectedMechanism>,
    sasl_ssf: u32,

    signals: VecDeque<Signal>,
    commands: VecDeque<Command>,
    inbound: VecDeque<Element>,
    pending_writes: VecDeque<Vec<u8>>,
}

impl StreamEngine {
    pub fn new(
        connect_options: ConnectOptions,
        stream_options: StreamOptions,
        tls_settings: TlsSettings,
    ) -> Self {
        Self {
            connect_options,
            stream_options,
            tls_settings,
            params: AuthParams::default(),
            state: State::Idle,
            phase: Phase::Idle,
            checkpoint: None,
            session: None,
            next_session: 1,
            jid: None,
            domain: String::new(),
            header: None,
            features: None,
            legacy: false,
            authenticated: false,
            polling: false,
            framer: XmlFramer::new(),
            layers: Layers::new(),
            sasl: None,
            mechanism: None,
            sasl_ssf: 0,
            signals: VecDeque::new(),
            commands: VecDeque::new(),
            inbound: VecDeque::new(),
            pending_writes: VecDeque::new(),
        }
    }

    // --- caller API -------------------------------------------------------

    /// Start a new session for `jid`. A session already in progress is torn
    /// down without a signal.
    pub fn connect_to_server(&mut self, jid: &str) -> Result<SessionId, EngineError> {
        let jid = Jid::new(jid)?;
        self.teardown();
        self.reset_session();

        let session = SessionId(self.next_session);
        self.next_session += 1;
        self.session = Some(session);
        self.domain = jid.domain().as_str().to_string();
        self.polling = self.connect_options.proxy.kind == ProxyKind::HttpPoll;
        info!(jid = %jid, session = %session, "connecting");
        self.jid = Some(jid);

        self.state = State::Connecting;
        self.phase = Phase::AwaitConnect;
        self.commands.push_back(Command::Connect {
            session,
            request: ConnectRequest::new(self.domain.clone(), self.connect_options.clone()),
        });
        Ok(session)
    }

    /// Close the session. Safe to call in any state; only the first call
    /// after a session started has an effect.
    pub fn close(&mut self) {
        match self.state {
            State::Idle | State::Closing | State::Closed | State::Error => return,
            _ if self.phase == Phase::AwaitConnect => {
                if let Some(session) = self.session {
                    self.commands.push_back(Command::CancelConnect { session });
                }
            }
            _ => {
                self.enter(State::Closing);
                match self.layers.encode(STREAM_CLOSE.as_bytes()) {
                    Ok(bytes) if !bytes.is_empty() => self.commands.push_back(Command::Write(bytes)),
                    Ok(_) => {}
                    Err(error) => debug!(error = %error, "could not encode stream close"),
                }
                self.layers.close();
                if let Ok(alert) = self.layers.flush() {
                    if !alert.is_empty() {
                        self.commands.push_back(Command::Write(alert));
                    }
                }
                self.commands.push_back(Command::StopKeepalive);
                self.commands.push_back(Command::Close);
            }
        }
        info!(state = ?self.state, "session closed");
        self.enter(State::Closed);
        self.finish_session();
        self.emit(Signal::ConnectionClosed);
    }

    /// Alias of [`close`](Self::close).
    pub fn stop(&mut self) {
        self.close();
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.params.username = Some(username.into());
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.params.password = Some(password.into());
    }

    pub fn set_realm(&mut self, realm: impl Into<String>) {
        self.params.realm = Some(realm.into());
    }

    pub fn set_authzid(&mut self, authzid: impl Into<String>) {
        self.params.authzid = Some(authzid.into());
    }

    pub fn set_ssf_range(&mut self, min: u32, max: u32) {
        self.connect_options.ssf_min = min;
        self.connect_options.ssf_max = max;
    }

    pub fn set_allow_plain(&mut self, allow: bool) {
        self.stream_options.allow_plain = allow;
    }

    pub fn set_compress(&mut self, compress: bool) {
        self.stream_options.compress = compress;
    }

    pub fn set_sasl_mechanism(&mut self, mechanism: Option<String>) {
        self.stream_options.sasl_mechanism = mechanism;
    }

    pub fn set_require_mutual_auth(&mut self, require: bool) {
        self.stream_options.require_mutual_auth = require;
    }

    pub fn set_old_only(&mut self, old_only: bool) {
        self.stream_options.old_protocol_only = old_only;
    }

    pub fn set_resource_binding(&mut self, enabled: bool) {
        self.stream_options.resource_binding = enabled;
    }

    pub fn set_connect_options(&mut self, options: ConnectOptions) {
        self.connect_options = options;
    }

    /// Whitespace keepalive interval; zero disables it. Takes effect at once
    /// on an active session.
    pub fn set_noop_interval(&mut self, interval: Duration) {
        self.stream_options.noop_interval_ms =
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if self.state == State::Active {
            let command = self.keepalive_command();
            self.commands.push_back(command);
        }
    }

    pub fn continue_after_warning(&mut self) -> Result<(), EngineError> {
        let Some(Checkpoint::Warning(warning)) = self.checkpoint else {
            return Err(EngineError::NothingPending("a warning"));
        };
        self.checkpoint = None;
        debug!(warning = ?warning, "warning acknowledged");

        match warning {
            Warning::OldVersion if !self.layers.tls_active() => {
                self.legacy = true;
                self.suspend(Checkpoint::Warning(Warning::NoTls));
            }
            Warning::OldVersion => self.begin_legacy(),
            Warning::NoTls if self.legacy => self.begin_legacy(),
            Warning::NoTls => self.begin_auth(),
        }
        self.process_frames();
        Ok(())
    }

    pub fn continue_after_params(&mut self) -> Result<(), EngineError> {
        if self.checkpoint != Some(Checkpoint::Params) {
            return Err(EngineError::NothingPending("credentials"));
        }
        self.checkpoint = None;

        match self.state {
            State::LegacyAuth => self.request_legacy_fields(),
            State::SaslNegotiating => {
                let params = self.auth_params();
                let Some(sasl) = self.sasl.as_mut() else {
                    return Err(EngineError::NothingPending("credentials"));
                };
                match sasl.continue_after_params(&params) {
                    Ok(step) => self.on_sasl_step(step),
                    Err(error) => self.fail(error),
                }
            }
            _ => {}
        }
        self.process_frames();
        Ok(())
    }

    /// Peer identity of a completed TLS handshake waiting for
    /// [`continue_after_handshake`](Self::continue_after_handshake).
    pub fn pending_handshake(&self) -> Option<PeerIdentity> {
        match self.checkpoint {
            Some(Checkpoint::Handshake) => self.layers.peer_identity(),
            _ => None,
        }
    }

    pub fn continue_after_handshake(&mut self) -> Result<(), EngineError> {
        if self.checkpoint != Some(Checkpoint::Handshake) {
            return Err(EngineError::NothingPending("a TLS handshake"));
        }
        self.checkpoint = None;
        self.emit(Signal::SecurityLayerActivated(Layer::Tls));

        self.open_stream();
        match self.phase {
            Phase::SslHandshake => self.enter(State::StreamOpening),
            _ => self.enter(State::SaslNegotiating),
        }
        self.phase = Phase::AwaitFeatures;
        self.process_frames();
        Ok(())
    }

    /// Next inbound stanza of an active session.
    pub fn read(&mut self) -> Option<Element> {
        self.inbound.pop_front()
    }

    /// Send a stanza. Before the session is active it is queued and flushed,
    /// in order, on activation.
    pub fn write(&mut self, stanza: &Element) -> Result<(), EngineError> {
        let xml = element_to_string(stanza).map_err(|e| EngineError::Serialize(e.to_string()))?;
        self.write_raw(&xml)
    }

    pub fn write_raw(&mut self, xml: &str) -> Result<(), EngineError> {
        match self.state {
            State::Active => {
                self.send_bytes(xml.as_bytes());
                Ok(())
            }
            State::Idle | State::Closing | State::Closed | State::Error => {
                Err(EngineError::NotConnected)
            }
            _ => {
                self.pending_writes.push_back(xml.as_bytes().to_vec());
                Ok(())
            }
        }
    }

    pub fn poll_signal(&mut self) -> Option<Signal> {
        self.signals.pop_front()
    }

    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The session's JID, as assigned by the server once bound.
    pub fn jid(&self) -> Option<&Jid> {
        self.jid.as_ref()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.id.as_deref())
    }

    /// Combined strength of the TLS and SASL layers.
    pub fn ssf(&self) -> u32 {
        self.layers.tls_ssf() + self.sasl_ssf
    }

    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.layers.peer_identity()
    }

    pub fn mechanism(&self) -> Option<SelectedMechanism> {
        self.mechanism
    }

    pub fn is_compressed(&self) -> bool {
        self.layers.is_compressed()
    }

    // --- transition function ---------------------------------------------

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Connected { session, ssl } => {
                if self.session != Some(session) || self.phase != Phase::AwaitConnect {
                    debug!(session = %session, "discarding stale connect result");
                    return;
                }
                self.on_connected(ssl);
            }
            Input::ConnectFailed { session, error } => {
                if self.session != Some(session) || self.phase != Phase::AwaitConnect {
                    debug!(session = %session, "discarding stale connect failure");
                    return;
                }
                self.fail(error.into());
            }
            Input::Received(bytes) => self.on_received(&bytes),
            Input::TransportClosed => self.on_transport_closed(),
            Input::NoopTick => {
                if self.state == State::Active {
                    self.send_bytes(b" ");
                }
            }
        }
    }

    fn on_connected(&mut self, ssl: bool) {
        self.emit(Signal::Connected);
        if self.polling {
            self.commands
                .push_back(Command::SetPollInterval(LOGIN_POLL_INTERVAL));
        }

        if ssl {
            match TlsCoordinator::start_client(&self.domain, &self.tls_settings) {
                Ok(tls) => self.layers.install_tls(tls),
                Err(error) => return self.fail(error),
            }
            self.phase = Phase::SslHandshake;
            self.flush_layers();
        } else {
            self.open_stream();
            self.enter(State::StreamOpening);
            self.phase = Phase::AwaitFeatures;
        }
    }

    fn on_received(&mut self, bytes: &[u8]) {
        if matches!(self.phase, Phase::Idle | Phase::AwaitConnect) || self.state.is_terminal() {
            debug!(len = bytes.len(), "ignoring bytes outside of a session");
            return;
        }
        if let Err(error) = self.ingest(bytes) {
            return self.fail(error);
        }
        self.process_frames();
    }

    /// Decode `bytes` and buffer the result. Framing happens separately so
    /// that checkpoints can hold it back.
    fn ingest(&mut self, bytes: &[u8]) -> Result<(), NegotiationError> {
        let decoded = self.layers.decode(bytes)?;
        let out = self.layers.flush()?;
        if !out.is_empty() {
            self.commands.push_back(Command::Write(out));
        }
        self.framer.feed(&decoded.plaintext);
        if decoded.closed {
            debug!("TLS close_notify received");
        }
        if decoded.handshaken {
            info!(
                identity = %self.layers.peer_identity().unwrap_or(PeerIdentity::NoCertificate),
                ssf = self.layers.tls_ssf(),
                "TLS handshake complete"
            );
            self.checkpoint = Some(Checkpoint::Handshake);
            if self.layers.certificate_requested() {
                self.emit(Signal::CertificateRequested);
            }
        }
        Ok(())
    }

    fn process_frames(&mut self) {
        while self.checkpoint.is_none() && !self.state.is_terminal() && self.state != State::Idle {
            let frame = match self.framer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => return self.fail(error),
            };
            match frame {
                Frame::Header(header) => self.on_header(header),
                Frame::Element(element) => self.on_element(element),
                Frame::StreamEnd => {
                    info!(state = ?self.state, "server closed the stream");
                    self.close();
                }
            }
        }
    }

    fn on_header(&mut self, header: StreamHeader) {
        debug!(id = ?header.id, version = ?header.version, "stream header received");
        let old = header.is_legacy() || self.stream_options.old_protocol_only;
        self.header = Some(header);
        if old && self.state == State::StreamOpening && self.phase == Phase::AwaitFeatures {
            self.suspend(Checkpoint::Warning(Warning::OldVersion));
        }
    }

    fn on_element(&mut self, element: Element) {
        if element.is("error", ns::STREAM) {
            return self.fail(NegotiationError::from_stream_error(&element));
        }
        match self.phase {
            Phase::AwaitFeatures if element.is("features", ns::STREAM) => {
                self.on_features(&element)
            }
            Phase::StartTls if element.ns() == ns::TLS => self.on_starttls_reply(&element),
            Phase::Sasl if element.ns() == ns::SASL => self.on_sasl_element(&element),
            Phase::LegacyFields | Phase::LegacyAuth | Phase::Bind | Phase::Session
                if element.name() == "iq" =>
            {
                self.on_negotiation_iq(&element)
            }
            Phase::Compress if element.ns() == ns::COMPRESS => self.on_compress_reply(&element),
            Phase::Ready => self.inbound.push_back(element),
            _ => debug!(
                name = element.name(),
                ns = %element.ns(),
                state = ?self.state,
                "ignoring element during negotiation"
            ),
        }
    }

    fn on_features(&mut self, element: &Element) {
        let features = match StreamFeatures::from_element(element) {
            Ok(features) => features,
            Err(error) => return self.fail(error),
        };
        debug!(?features, state = ?self.state, "stream features");

        match self.state {
            State::StreamOpening if self.layers.tls_active() => {
                self.features = Some(features);
                self.begin_auth();
            }
            State::StreamOpening if features.starttls => {
                self.enter(State::TlsNegotiating);
                self.phase = Phase::StartTls;
                self.send_element(&Element::builder("starttls", ns::TLS).build());
            }
            State::StreamOpening => {
                self.features = Some(features);
                self.suspend(Checkpoint::Warning(Warning::NoTls));
            }
            State::SaslNegotiating => {
                self.features = Some(features);
                self.begin_auth();
            }
            State::ResourceBinding => {
                self.features = Some(features);
                self.begin_bind();
            }
            State::Compressing => self.reach_active(),
            _ => {}
        }
    }

    fn on_starttls_reply(&mut self, element: &Element) {
        match element.name() {
            "proceed" => {
                let pending = self.framer.take_buffered();
                match TlsCoordinator::start_client(&self.domain, &self.tls_settings) {
                    Ok(tls) => self.layers.install_tls(tls),
                    Err(error) => return self.fail(error),
                }
                self.phase = Phase::TlsHandshake;
                self.flush_layers();
                if !pending.is_empty() {
                    if let Err(error) = self.ingest(&pending) {
                        self.fail(error);
                    }
                }
            }
            "failure" => self.fail(NegotiationError::new(
                Condition::Tls(TlsCondition::StartTlsRejected),
                None,
            )),
            other => debug!(name = other, "ignoring unexpected STARTTLS reply"),
        }
    }

    /// SASL when the server offers any mechanism, jabber:iq:auth otherwise.
    fn begin_auth(&mut self) {
        let Some(features) = self.features.as_ref() else {
            return self.begin_sasl();
        };
        if !features.mechanisms.is_empty() {
            return self.begin_sasl();
        }
        info!(
            iq_auth = features.iq_auth,
            "server offers no SASL mechanisms, falling back to legacy authentication"
        );
        self.legacy = true;
        self.begin_legacy();
    }

    fn begin_sasl(&mut self) {
        self.enter(State::SaslNegotiating);
        let offered = self
            .features
            .as_ref()
            .map(|f| f.mechanisms.clone())
            .unwrap_or_default();
        let layer = LayerState {
            tls_active: self.layers.tls_active(),
            ssf: self.layers.tls_ssf(),
        };
        match SaslNegotiator::start_client(&offered, &self.sasl_policy(), layer, &self.auth_params())
        {
            Ok((negotiator, step)) => {
                self.mechanism = Some(negotiator.selected());
                self.sasl = Some(negotiator);
                self.phase = Phase::Sasl;
                self.on_sasl_step(step);
            }
            Err(error) => self.fail(error),
        }
    }

    fn on_sasl_element(&mut self, element: &Element) {
        let Some(sasl) = self.sasl.as_mut() else {
            return;
        };
        match sasl.put_step(element) {
            Ok(step) => self.on_sasl_step(step),
            Err(error) => self.fail(error),
        }
    }

    fn on_sasl_step(&mut self, step: SaslStep) {
        match step {
            SaslStep::Send(element) => self.send_element(&element),
            SaslStep::NeedParams(need) => {
                self.checkpoint = Some(Checkpoint::Params);
                self.emit(need.into());
            }
            SaslStep::Success { ssf } => {
                info!(mechanism = ?self.mechanism, "SASL authentication succeeded");
                self.sasl = None;
                self.sasl_ssf = ssf;
                self.on_authenticated();
                if ssf > 0 {
                    self.emit(Signal::SecurityLayerActivated(Layer::Sasl));
                }
                self.open_stream();
                self.enter(State::ResourceBinding);
                self.phase = Phase::AwaitFeatures;
            }
        }
    }

    fn begin_legacy(&mut self) {
        self.enter(State::LegacyAuth);
        self.request_legacy_fields();
    }

    fn request_legacy_fields(&mut self) {
        let params = self.auth_params();
        let need = NeedParams {
            user: params.username.as_deref().map_or(true, str::is_empty),
            pass: params.password.as_deref().map_or(true, str::is_empty),
            ..NeedParams::default()
        };
        if need.any() {
            self.checkpoint = Some(Checkpoint::Params);
            self.emit(need.into());
            return;
        }
        let username = params.username.unwrap_or_default();
        self.phase = Phase::LegacyFields;
        self.send_element(&legacy::fields_request(&self.domain, &username));
    }

    fn on_negotiation_iq(&mut self, iq: &Element) {
        let id = iq.attr("id").unwrap_or_default();
        let ok = iq.attr("type") == Some("result");

        match (self.phase, id) {
            (Phase::LegacyFields, legacy::FIELDS_ID) if ok => self.send_legacy_auth(iq),
            (Phase::LegacyAuth, legacy::AUTH_ID) if ok => {
                info!("legacy authentication succeeded");
                let resource = self.resource();
                if let Some(jid) = self.jid.as_ref().map(|j| j.to_bare()) {
                    if let Ok(full) = Jid::new(&format!("{jid}/{resource}")) {
                        self.jid = Some(full);
                    }
                }
                self.on_authenticated();
                self.reach_active();
            }
            (Phase::LegacyFields, legacy::FIELDS_ID) | (Phase::LegacyAuth, legacy::AUTH_ID) => {
                self.fail(legacy::map_error(iq))
            }
            (Phase::Bind, BIND_ID) if ok => self.on_bound(iq),
            (Phase::Bind, BIND_ID) => self.fail(bind_error(iq)),
            (Phase::Session, SESSION_ID) if ok => self.after_session(),
            (Phase::Session, SESSION_ID) => self.fail(NegotiationError::new(
                Condition::Bind(BindCondition::Generic),
                Some("session establishment failed".to_string()),
            )),
            _ => debug!(id, "ignoring unrelated iq during negotiation"),
        }
    }

    fn send_legacy_auth(&mut self, fields: &Element) {
        let params = self.auth_params();
        let plain_allowed = PlainPolicy::from_allow_plain(self.stream_options.allow_plain)
            .permits(self.layers.tls_active());
        let stream_id = self.stream_id().unwrap_or_default().to_string();
        let proof = match legacy::choose_proof(
            fields,
            &stream_id,
            params.password.as_deref().unwrap_or_default(),
            plain_allowed,
        ) {
            Ok(proof) => proof,
            Err(error) => return self.fail(error),
        };
        let request = legacy::auth_request(
            &self.domain,
            params.username.as_deref().unwrap_or_default(),
            &self.resource(),
            &proof,
        );
        self.phase = Phase::LegacyAuth;
        self.send_element(&request);
    }

    fn begin_bind(&mut self) {
        let offered = self.features.as_ref().is_some_and(|f| f.bind);
        if !(offered && self.stream_options.resource_binding) {
            debug!(offered, "skipping resource binding");
            return self.after_bind();
        }

        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = self.jid.as_ref().and_then(|j| j.resource()) {
            bind = bind.append(Element::builder("resource", ns::BIND).append(resource.as_str()));
        }
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", BIND_ID)
            .append(bind)
            .build();
        self.phase = Phase::Bind;
        self.send_element(&iq);
    }

    fn on_bound(&mut self, iq: &Element) {
        let assigned = iq
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("jid", ns::BIND))
            .map(Element::text);
        match assigned.as_deref().map(str::trim) {
            Some(text) => match Jid::new(text) {
                Ok(jid) => {
                    info!(jid = %jid, "resource bound");
                    self.jid = Some(jid);
                }
                Err(error) => {
                    return self.fail(NegotiationError::new(
                        Condition::Bind(BindCondition::Generic),
                        Some(format!("server assigned an invalid JID: {error}")),
                    ));
                }
            },
            None => debug!("bind result carried no JID"),
        }
        self.after_bind();
    }

    fn after_bind(&mut self) {
        if self.features.as_ref().is_some_and(|f| f.session_required) {
            let iq = Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", "set")
                .attr("id", SESSION_ID)
                .append(Element::builder("session", ns::SESSION))
                .build();
            self.phase = Phase::Session;
            return self.send_element(&iq);
        }
        self.after_session();
    }

    fn after_session(&mut self) {
        let zlib_offered = self
            .features
            .as_ref()
            .is_some_and(|f| f.compression_methods.iter().any(|m| m == ZLIB_METHOD));
        if !(self.stream_options.compress && zlib_offered) {
            return self.reach_active();
        }

        self.enter(State::Compressing);
        self.phase = Phase::Compress;
        let request = Element::builder("compress", ns::COMPRESS)
            .append(Element::builder("method", ns::COMPRESS).append(ZLIB_METHOD))
            .build();
        self.send_element(&request);
    }

    fn on_compress_reply(&mut self, element: &Element) {
        match element.name() {
            "compressed" => {
                let pending = self.framer.take_buffered();
                match self.layers.install_zlib(&pending) {
                    Ok(plain) => self.framer.feed(&plain),
                    Err(error) => return self.fail(error),
                }
                info!(method = ZLIB_METHOD, "stream compression active");
                self.open_stream();
                self.phase = Phase::AwaitFeatures;
            }
            "failure" => {
                let reason = element.children().next().map(|c| c.name().to_string());
                warn!(reason = ?reason, "server refused compression, continuing without it");
                self.reach_active();
            }
            other => debug!(name = other, "ignoring unexpected compression reply"),
        }
    }

    fn on_authenticated(&mut self) {
        self.authenticated = true;
        if self.polling {
            self.commands.push_back(Command::SetPollInterval(
                self.connect_options.proxy.poll_interval(),
            ));
        }
    }

    fn reach_active(&mut self) {
        self.enter(State::Active);
        self.phase = Phase::Ready;
        info!(
            jid = ?self.jid.as_ref().map(ToString::to_string),
            ssf = self.ssf(),
            compressed = self.layers.is_compressed(),
            "stream active"
        );

        while let Some(bytes) = self.pending_writes.pop_front() {
            self.send_bytes(&bytes);
        }
        if self.state != State::Active {
            return;
        }
        if self.stream_options.noop_interval_ms > 0 {
            let command = self.keepalive_command();
            self.commands.push_back(command);
        }
        self.emit(Signal::Authenticated);
    }

    fn on_transport_closed(&mut self) {
        if matches!(self.state, State::Idle | State::Closed | State::Error) {
            return;
        }
        info!(state = ?self.state, "transport closed");
        if self.state == State::Active {
            self.commands.push_back(Command::StopKeepalive);
        }
        self.enter(State::Closed);
        self.finish_session();
        self.emit(Signal::ConnectionClosed);
    }

    fn fail(&mut self, error: NegotiationError) {
        if self.state.is_terminal() || self.state == State::Idle {
            return;
        }
        warn!(state = ?self.state, error = %error, "negotiation failed");
        match (self.phase, self.session) {
            (Phase::AwaitConnect, Some(session)) => {
                self.commands.push_back(Command::CancelConnect { session })
            }
            _ => {
                self.commands.push_back(Command::StopKeepalive);
                self.commands.push_back(Command::Close);
            }
        }
        self.enter(State::Error);
        self.finish_session();
        self.emit(Signal::Error(error));
    }

    // --- helpers ----------------------------------------------------------

    fn enter(&mut self, next: State) {
        if next == self.state {
            return;
        }
        debug_assert!(
            next.rank() > self.state.rank(),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn suspend(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = Some(checkpoint);
        if let Checkpoint::Warning(warning) = checkpoint {
            info!(%warning, "waiting for the caller to acknowledge");
            self.emit(Signal::Warning(warning));
        }
    }

    fn emit(&mut self, signal: Signal) {
        debug!(?signal, "signal");
        self.signals.push_back(signal);
    }

    fn open_stream(&mut self) {
        self.header = None;
        let open = StreamHeader::client_open(
            &self.domain,
            self.stream_options.lang.as_deref(),
            self.stream_options.old_protocol_only,
        );
        self.send_bytes(open.as_bytes());
    }

    fn send_element(&mut self, element: &Element) {
        match element_to_string(element) {
            Ok(xml) => self.send_bytes(xml.as_bytes()),
            Err(error) => self.fail(error),
        }
    }

    fn send_bytes(&mut self, plain: &[u8]) {
        match self.layers.encode(plain) {
            Ok(bytes) if !bytes.is_empty() => self.commands.push_back(Command::Write(bytes)),
            Ok(_) => {}
            Err(error) => self.fail(error),
        }
    }

    fn flush_layers(&mut self) {
        match self.layers.flush() {
            Ok(bytes) if !bytes.is_empty() => self.commands.push_back(Command::Write(bytes)),
            Ok(_) => {}
            Err(error) => self.fail(error),
        }
    }

    fn keepalive_command(&self) -> Command {
        match self.stream_options.noop_interval_ms {
            0 => Command::StopKeepalive,
            ms => Command::StartKeepalive(Duration::from_millis(ms)),
        }
    }

    fn sasl_policy(&self) -> SaslPolicy {
        SaslPolicy {
            plain: PlainPolicy::from_allow_plain(self.stream_options.allow_plain),
            require_mutual_auth: self.stream_options.require_mutual_auth,
            ssf_min: self.connect_options.ssf_min,
            ssf_max: self.connect_options.ssf_max,
            forced: self.stream_options.sasl_mechanism.clone(),
            allow_client_first: self.stream_options.allow_client_first,
        }
    }

    /// Caller-supplied credentials, with the username defaulting to the
    /// JID's node.
    fn auth_params(&self) -> AuthParams {
        let mut params = self.params.clone();
        if params.username.is_none() {
            params.username = self
                .jid
                .as_ref()
                .and_then(|j| j.node())
                .map(|node| node.as_str().to_string());
        }
        params
    }

    fn resource(&self) -> String {
        self.jid
            .as_ref()
            .and_then(|j| j.resource())
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| legacy::DEFAULT_RESOURCE.to_string())
    }

    /// Silently abandon whatever session is in progress.
    fn teardown(&mut self) {
        if matches!(self.state, State::Idle | State::Closed | State::Error) {
            return;
        }
        debug!(state = ?self.state, "abandoning session for a new connection");
        match (self.phase, self.session) {
            (Phase::AwaitConnect, Some(session)) => {
                self.commands.push_back(Command::CancelConnect { session })
            }
            _ => {
                self.commands.push_back(Command::StopKeepalive);
                self.commands.push_back(Command::Close);
            }
        }
    }

    fn reset_session(&mut self) {
        self.phase = Phase::Idle;
        self.checkpoint = None;
        self.header = None;
        self.features = None;
        self.legacy = false;
        self.authenticated = false;
        self.framer = XmlFramer::new();
        self.layers = Layers::new();
        self.sasl = None;
        self.mechanism = None;
        self.sasl_ssf = 0;
        self.inbound.clear();
        self.pending_writes.clear();
    }

    fn finish_session(&mut self) {
        self.phase = Phase::Idle;
        self.checkpoint = None;
        self.session = None;
        self.sasl = None;
        self.pending_writes.clear();
    }
}

fn bind_error(iq: &Element) -> NegotiationError {
    let error = iq.get_child("error", ns::JABBER_CLIENT);
    let has = |name: &str| error.is_some_and(|e| e.has_child(name, ns::STANZAS));
    let condition = if has("not-allowed") {
        BindCondition::NotAllowed
    } else if has("conflict") {
        BindCondition::Conflict
    } else {
        BindCondition::Generic
    };
    let text = error
        .and_then(|e| e.get_child("text", ns::STANZAS))
        .map(Element::text)
        .filter(|t| !t.is_empty());
    NegotiationError::new(Condition::Bind(condition), text)
}
