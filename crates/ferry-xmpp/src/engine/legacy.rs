//! XEP-0078 `jabber:iq:auth` for servers that predate SASL.

use minidom::Element;
use sha1::{Digest, Sha1};

use crate::error::{AuthCondition, BindCondition, Condition, NegotiationError};
use crate::parser::ns;

pub(crate) const FIELDS_ID: &str = "auth_1";
pub(crate) const AUTH_ID: &str = "auth_2";

/// Resource used when the JID does not name one; the protocol requires it.
pub(crate) const DEFAULT_RESOURCE: &str = "ferry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Proof {
    Digest(String),
    Password(String),
}

/// `hex(sha1(stream_id + password))`.
pub(crate) fn digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Ask which fields the server wants.
pub(crate) fn fields_request(domain: &str, username: &str) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "get")
        .attr("to", domain)
        .attr("id", FIELDS_ID)
        .append(
            Element::builder("query", ns::IQ_AUTH)
                .append(Element::builder("username", ns::IQ_AUTH).append(username)),
        )
        .build()
}

/// Pick digest when the server lists it, plaintext only if policy allows.
pub(crate) fn choose_proof(
    fields: &Element,
    stream_id: &str,
    password: &str,
    plain_allowed: bool,
) -> Result<Proof, NegotiationError> {
    let query = fields.get_child("query", ns::IQ_AUTH);
    let offers = |name: &str| query.is_some_and(|q| q.has_child(name, ns::IQ_AUTH));

    if offers("digest") && !stream_id.is_empty() {
        return Ok(Proof::Digest(digest(stream_id, password)));
    }
    if offers("password") && plain_allowed {
        return Ok(Proof::Password(password.to_string()));
    }
    Err(NegotiationError::auth(
        AuthCondition::NoMechanism,
        if offers("password") {
            "server only accepts plaintext passwords"
        } else {
            "server offers no usable legacy authentication method"
        },
    ))
}

pub(crate) fn auth_request(domain: &str, username: &str, resource: &str, proof: &Proof) -> Element {
    let secret = match proof {
        Proof::Digest(hash) => Element::builder("digest", ns::IQ_AUTH).append(hash.as_str()),
        Proof::Password(pass) => Element::builder("password", ns::IQ_AUTH).append(pass.as_str()),
    };
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("to", domain)
        .attr("id", AUTH_ID)
        .append(
            Element::builder("query", ns::IQ_AUTH)
                .append(Element::builder("username", ns::IQ_AUTH).append(username))
                .append(secret)
                .append(Element::builder("resource", ns::IQ_AUTH).append(resource)),
        )
        .build()
}

/// Map an `<iq type='error'/>` answer to an auth request.
pub(crate) fn map_error(iq: &Element) -> NegotiationError {
    let Some(error) = iq.get_child("error", ns::JABBER_CLIENT) else {
        return NegotiationError::auth(AuthCondition::GenericAuthError, "legacy authentication failed");
    };
    let text = error
        .get_child("text", ns::STANZAS)
        .map(Element::text)
        .filter(|t| !t.is_empty());
    let has = |name: &str| error.has_child(name, ns::STANZAS);

    let condition = match error.attr("code") {
        Some("401") => Condition::Auth(AuthCondition::NotAuthorized),
        Some("409") => Condition::Bind(BindCondition::Conflict),
        _ if has("not-authorized") => Condition::Auth(AuthCondition::NotAuthorized),
        _ if has("conflict") => Condition::Bind(BindCondition::Conflict),
        _ => Condition::Auth(AuthCondition::GenericAuthError),
    };
    NegotiationError::new(condition, text)
}
