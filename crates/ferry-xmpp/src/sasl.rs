use std::collections::HashSet;
use std::str::FromStr;

use minidom::Element;
use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tracing::{debug, warn};
use xmpp_parsers::sasl::{
    Auth, Challenge, DefinedCondition, Failure, Mechanism as SaslMechanism, Response, Success,
};

use crate::error::{AuthCondition, NegotiationError};
use crate::parser::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
    /// Only used when explicitly forced.
    Anonymous,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
            SelectedMechanism::Anonymous => "ANONYMOUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            SelectedMechanism::ScramSha256,
            SelectedMechanism::ScramSha1,
            SelectedMechanism::Plain,
            SelectedMechanism::Anonymous,
        ]
        .into_iter()
        .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    /// Strength of the security layer the mechanism installs. None of the
    /// supported mechanisms negotiate one.
    pub fn ssf(&self) -> u32 {
        0
    }

    /// Whether the server proves its identity too.
    pub fn is_mutual(&self) -> bool {
        matches!(
            self,
            SelectedMechanism::ScramSha256 | SelectedMechanism::ScramSha1
        )
    }

    fn needs_credentials(&self) -> bool {
        !matches!(self, SelectedMechanism::Anonymous)
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

/// When PLAIN may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlainPolicy {
    Never,
    #[default]
    OverTls,
    Always,
}

impl PlainPolicy {
    pub fn from_allow_plain(allow: bool) -> Self {
        if allow {
            PlainPolicy::Always
        } else {
            PlainPolicy::OverTls
        }
    }

    pub fn permits(&self, tls_active: bool) -> bool {
        match self {
            PlainPolicy::Never => false,
            PlainPolicy::OverTls => tls_active,
            PlainPolicy::Always => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslPolicy {
    pub plain: PlainPolicy,
    pub require_mutual_auth: bool,
    pub ssf_min: u32,
    pub ssf_max: u32,
    pub forced: Option<String>,
    pub allow_client_first: bool,
}

impl Default for SaslPolicy {
    fn default() -> Self {
        Self {
            plain: PlainPolicy::OverTls,
            require_mutual_auth: false,
            ssf_min: 0,
            ssf_max: 256,
            forced: None,
            allow_client_first: true,
        }
    }
}

/// Security already provided below SASL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerState {
    pub tls_active: bool,
    pub ssf: u32,
}

/// Pick a mechanism from the server's list under `policy`.
///
/// When every offered mechanism was ruled out by the minimum SSF alone the
/// failure is `MechanismTooWeak`; any other empty outcome is `NoMechanism`.
pub fn choose_mechanism(
    offered: &[String],
    policy: &SaslPolicy,
    layer: LayerState,
) -> Result<SelectedMechanism, NegotiationError> {
    let offered: HashSet<String> = offered.iter().map(|m| m.to_ascii_uppercase()).collect();

    let candidates: Vec<SelectedMechanism> = match &policy.forced {
        Some(name) => SelectedMechanism::from_name(name)
            .filter(|m| offered.contains(m.name()))
            .into_iter()
            .collect(),
        None => MECHANISM_PREFERENCE
            .iter()
            .filter(|m| offered.contains(m.name()))
            .copied()
            .collect(),
    };

    let mut too_weak = 0;
    let mut excluded = 0;
    for mechanism in &candidates {
        if *mechanism == SelectedMechanism::Plain && !policy.plain.permits(layer.tls_active) {
            debug!(mechanism = %mechanism, "plaintext mechanism not permitted");
            excluded += 1;
            continue;
        }
        if policy.require_mutual_auth && !mechanism.is_mutual() {
            debug!(mechanism = %mechanism, "mechanism lacks mutual authentication");
            excluded += 1;
            continue;
        }
        if mechanism.ssf() > policy.ssf_max {
            excluded += 1;
            continue;
        }
        if layer.ssf + mechanism.ssf() < policy.ssf_min {
            too_weak += 1;
            continue;
        }
        return Ok(*mechanism);
    }

    let offered_list = {
        let mut names: Vec<_> = offered.into_iter().collect();
        names.sort();
        names.join(", ")
    };
    if too_weak > 0 && excluded == 0 {
        Err(NegotiationError::auth(
            AuthCondition::MechanismTooWeak,
            format!(
                "no mechanism reaches SSF {}; server offers: {offered_list}",
                policy.ssf_min
            ),
        ))
    } else {
        Err(NegotiationError::auth(
            AuthCondition::NoMechanism,
            format!("no usable SASL mechanism; server offers: {offered_list}"),
        ))
    }
}

/// Credentials as supplied by the caller so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthParams {
    pub username: Option<String>,
    pub password: Option<String>,
    pub authzid: Option<String>,
    pub realm: Option<String>,
}

impl AuthParams {
    /// Identity handed to the mechanism. A realm qualifies a bare username as
    /// `user@realm`; none of the supported mechanisms carry it separately.
    pub fn authcid(&self) -> String {
        let username = self.username.as_deref().unwrap_or_default();
        match self.realm.as_deref().filter(|r| !r.is_empty()) {
            Some(realm) if !username.contains('@') => format!("{username}@{realm}"),
            _ => username.to_string(),
        }
    }
}

/// Which credentials are still missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeedParams {
    pub user: bool,
    pub authzid: bool,
    pub pass: bool,
    pub realm: bool,
}

impl NeedParams {
    pub fn any(&self) -> bool {
        self.user || self.authzid || self.pass || self.realm
    }
}

/// What the negotiator wants next.
#[derive(Debug, Clone, PartialEq)]
pub enum SaslStep {
    /// Send this element to the server.
    Send(Element),
    /// Suspended until the caller supplies credentials.
    NeedParams(NeedParams),
    Success { ssf: u32 },
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, NegotiationError> {
    let init_err = |e: String| {
        NegotiationError::auth(
            AuthCondition::GenericAuthError,
            format!("failed to initialize {selected}: {e}"),
        )
    };
    match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| init_err(format!("{e:?}"))),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| init_err(format!("{e:?}"))),
        SelectedMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| init_err(format!("{e:?}"))),
        SelectedMechanism::Anonymous => Ok(Box::new(Anonymous::new())),
    }
}

pub(crate) fn map_failure(failure: &Failure) -> NegotiationError {
    let condition = match failure.defined_condition {
        DefinedCondition::Aborted => AuthCondition::Aborted,
        DefinedCondition::AccountDisabled => AuthCondition::AccountDisabled,
        DefinedCondition::CredentialsExpired => AuthCondition::CredentialsExpired,
        DefinedCondition::EncryptionRequired => AuthCondition::EncryptionRequired,
        DefinedCondition::InvalidAuthzid => AuthCondition::InvalidAuthzid,
        DefinedCondition::InvalidMechanism => AuthCondition::InvalidMechanism,
        DefinedCondition::MalformedRequest | DefinedCondition::IncorrectEncoding => {
            AuthCondition::BadProtocol
        }
        DefinedCondition::MechanismTooWeak => AuthCondition::MechanismTooWeak,
        DefinedCondition::NotAuthorized => AuthCondition::NotAuthorized,
        DefinedCondition::TemporaryAuthFailure => AuthCondition::TemporaryAuthFailure,
        #[allow(unreachable_patterns)]
        _ => AuthCondition::GenericAuthError,
    };
    let text = failure.texts.values().next().cloned().unwrap_or_default();
    if text.is_empty() {
        NegotiationError::new(crate::error::Condition::Auth(condition), None)
    } else {
        NegotiationError::auth(condition, text)
    }
}

/// Element-level SASL client: mechanism choice, credential checkpoint and the
/// challenge/response loop.
pub struct SaslNegotiator {
    selected: SelectedMechanism,
    mechanism: Option<Box<dyn Mechanism + Send>>,
    allow_client_first: bool,
    /// Initial response held back for the server's first (empty) challenge.
    deferred_initial: Option<Vec<u8>>,
    finished: bool,
}

impl SaslNegotiator {
    pub fn start_client(
        offered: &[String],
        policy: &SaslPolicy,
        layer: LayerState,
        params: &AuthParams,
    ) -> Result<(Self, SaslStep), NegotiationError> {
        let selected = choose_mechanism(offered, policy, layer)?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let mut negotiator = Self {
            selected,
            mechanism: None,
            allow_client_first: policy.allow_client_first,
            deferred_initial: None,
            finished: false,
        };
        let step = negotiator.continue_after_params(params)?;
        Ok((negotiator, step))
    }

    pub fn selected(&self) -> SelectedMechanism {
        self.selected
    }

    /// Resume after [`SaslStep::NeedParams`]. Asks again if still incomplete.
    pub fn continue_after_params(
        &mut self,
        params: &AuthParams,
    ) -> Result<SaslStep, NegotiationError> {
        if self.mechanism.is_some() {
            return Err(NegotiationError::protocol("SASL exchange already started"));
        }

        let missing = self.missing(params);
        if missing.any() {
            debug!(?missing, "SASL credentials incomplete");
            return Ok(SaslStep::NeedParams(missing));
        }

        let credentials = Credentials::default()
            .with_username(params.authcid())
            .with_password(params.password.clone().unwrap_or_default())
            .with_channel_binding(ChannelBinding::Unsupported);
        let mut mechanism = build_mechanism(self.selected, &credentials)?;

        let mut initial = mechanism.initial();
        if self.selected == SelectedMechanism::Plain {
            if let Some(authzid) = params.authzid.as_deref().filter(|a| !a.is_empty()) {
                let mut with_authzid = authzid.as_bytes().to_vec();
                with_authzid.extend_from_slice(&initial);
                initial = with_authzid;
            }
        }

        let name = SaslMechanism::from_str(self.selected.name()).map_err(|e| {
            NegotiationError::auth(
                AuthCondition::InvalidMechanism,
                format!("invalid SASL mechanism name: {e}"),
            )
        })?;
        self.mechanism = Some(mechanism);

        let data = if self.allow_client_first {
            initial
        } else {
            self.deferred_initial = Some(initial);
            Vec::new()
        };
        Ok(SaslStep::Send(Auth {
            mechanism: name,
            data,
        }
        .into()))
    }

    /// Process one element from the server.
    pub fn put_step(&mut self, element: &Element) -> Result<SaslStep, NegotiationError> {
        if self.finished {
            return Err(NegotiationError::protocol("SASL exchange already finished"));
        }
        if element.ns() != ns::SASL {
            return Err(NegotiationError::protocol(format!(
                "unexpected <{}/> during SASL negotiation",
                element.name()
            )));
        }
        let Some(mechanism) = self.mechanism.as_mut() else {
            return Err(NegotiationError::protocol("SASL step before authentication started"));
        };

        match element.name() {
            "challenge" => {
                let challenge = Challenge::try_from(element.clone())
                    .map_err(|e| NegotiationError::auth(AuthCondition::BadProtocol, e.to_string()))?;
                let data = match self.deferred_initial.take() {
                    Some(initial) => initial,
                    None => mechanism.response(&challenge.data).map_err(|e| {
                        NegotiationError::auth(
                            AuthCondition::BadServer,
                            format!("SASL challenge-response failed: {e:?}"),
                        )
                    })?,
                };
                Ok(SaslStep::Send(Response { data }.into()))
            }
            "success" => {
                let success = Success::try_from(element.clone())
                    .map_err(|e| NegotiationError::auth(AuthCondition::BadProtocol, e.to_string()))?;
                if let Err(e) = mechanism.success(&success.data) {
                    warn!(error = ?e, "server signature verification failed");
                    return Err(NegotiationError::auth(
                        AuthCondition::BadServer,
                        format!("server signature verification failed: {e:?}"),
                    ));
                }
                self.finished = true;
                debug!(mechanism = %self.selected, "SASL authentication succeeded");
                Ok(SaslStep::Success {
                    ssf: self.selected.ssf(),
                })
            }
            "failure" => {
                self.finished = true;
                let failure = Failure::try_from(element.clone())
                    .map_err(|e| NegotiationError::auth(AuthCondition::GenericAuthError, e.to_string()))?;
                debug!(condition = ?failure.defined_condition, "SASL authentication failed");
                Err(map_failure(&failure))
            }
            other => Err(NegotiationError::auth(
                AuthCondition::BadProtocol,
                format!("unexpected SASL element <{other}/>"),
            )),
        }
    }

    fn missing(&self, params: &AuthParams) -> NeedParams {
        if !self.selected.needs_credentials() {
            return NeedParams::default();
        }
        NeedParams {
            user: params.username.as_deref().map_or(true, str::is_empty),
            authzid: false,
            pass: params.password.is_none(),
            realm: false,
        }
    }
}
