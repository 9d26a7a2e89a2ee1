//! Client-side TLS over caller-supplied buffers.
//!
//! [`TlsCoordinator`] never touches a socket. Ciphertext from the server goes
//! in through [`TlsCoordinator::write_incoming`]; ciphertext for the server
//! comes out of [`TlsCoordinator::take_outgoing`].
//!
//! Certificate validation is recorded rather than enforced: the handshake
//! completes against any certificate whose handshake signature checks out, and
//! the verdict is exposed as a [`PeerIdentity`] so the caller can decide.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use tracing::{debug, warn};

use crate::error::{NegotiationError, SecurityLayerCondition, TlsCondition};

/// Outcome of validating the server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerIdentity {
    NoCertificate,
    Valid,
    HostMismatch,
    Untrusted,
    Expired,
    Revoked,
    /// Malformed or otherwise unusable certificate.
    Invalid,
}

impl PeerIdentity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCertificate => "no-certificate",
            Self::Valid => "valid",
            Self::HostMismatch => "host-mismatch",
            Self::Untrusted => "untrusted",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Invalid => "invalid",
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn identity_from_error(error: &rustls::Error) -> PeerIdentity {
    let rustls::Error::InvalidCertificate(cert_error) = error else {
        return PeerIdentity::Invalid;
    };
    if *cert_error == CertificateError::Expired || *cert_error == CertificateError::NotValidYet {
        PeerIdentity::Expired
    } else if *cert_error == CertificateError::UnknownIssuer
        || *cert_error == CertificateError::BadSignature
    {
        PeerIdentity::Untrusted
    } else if *cert_error == CertificateError::NotValidForName {
        PeerIdentity::HostMismatch
    } else if *cert_error == CertificateError::Revoked {
        PeerIdentity::Revoked
    } else {
        PeerIdentity::Invalid
    }
}

/// Runs the standard WebPKI checks and remembers the verdict instead of
/// failing the handshake on it.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    verdict: Arc<Mutex<Option<PeerIdentity>>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let identity = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(_) => PeerIdentity::Valid,
            Err(error) => {
                debug!(error = %error, "server certificate failed validation");
                identity_from_error(&error)
            }
        };
        if let Ok(mut verdict) = self.verdict.lock() {
            *verdict = Some(identity);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Notes that the server asked for a client certificate. Never offers one.
#[derive(Debug, Default)]
struct RecordingCertResolver {
    requested: Arc<AtomicBool>,
}

impl ResolvesClientCert for RecordingCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.requested.store(true, Ordering::SeqCst);
        None
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Trust configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Anchors trusted in addition to the bundled web PKI roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
}

/// What one batch of incoming ciphertext produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TlsRead {
    pub plaintext: Vec<u8>,
    /// The handshake finished during this call.
    pub handshaken: bool,
    /// The server sent close_notify.
    pub closed: bool,
}

pub struct TlsCoordinator {
    conn: ClientConnection,
    verdict: Arc<Mutex<Option<PeerIdentity>>>,
    cert_requested: Arc<AtomicBool>,
    handshaken: bool,
}

impl TlsCoordinator {
    /// Begin a client handshake for `hostname`.
    pub fn start_client(hostname: &str, settings: &TlsSettings) -> Result<Self, NegotiationError> {
        let handshake_err = |e: String| NegotiationError::tls(TlsCondition::HandshakeFailed, e);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for cert in &settings.extra_roots {
            if let Err(error) = roots.add(cert.clone()) {
                warn!(error = %error, "ignoring unusable extra trust anchor");
            }
        }

        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::clone(&provider) as Arc<CryptoProvider>,
        )
        .build()
        .map_err(|e| handshake_err(e.to_string()))?;

        let verdict = Arc::new(Mutex::new(None));
        let cert_requested = Arc::new(AtomicBool::new(false));
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| handshake_err(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RecordingVerifier {
                inner,
                verdict: Arc::clone(&verdict),
            }))
            .with_client_cert_resolver(Arc::new(RecordingCertResolver {
                requested: Arc::clone(&cert_requested),
            }));

        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| handshake_err(format!("invalid server name {hostname}: {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| handshake_err(e.to_string()))?;

        debug!(hostname, "TLS client handshake started");
        Ok(Self {
            conn,
            verdict,
            cert_requested,
            handshaken: false,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        !self.handshaken
    }

    /// Queue application plaintext; it is encrypted once the handshake allows.
    pub fn write(&mut self, plain: &[u8]) -> Result<(), NegotiationError> {
        let written = self.conn.writer().write_all(plain);
        written.map_err(|e| self.fail(e.to_string()))
    }

    /// Feed ciphertext received from the server.
    pub fn write_incoming(&mut self, mut cipher: &[u8]) -> Result<TlsRead, NegotiationError> {
        let mut result = TlsRead::default();
        while !cipher.is_empty() {
            self.conn
                .read_tls(&mut cipher)
                .map_err(|e| self.fail(e.to_string()))?;
            self.conn
                .process_new_packets()
                .map_err(|e| self.fail(e.to_string()))?;
            result.closed |= self.drain_plaintext(&mut result.plaintext)?;
        }

        if !self.handshaken && !self.conn.is_handshaking() {
            self.handshaken = true;
            result.handshaken = true;
            debug!(
                identity = %self.peer_identity(),
                ssf = self.ssf(),
                "TLS handshake complete"
            );
        }
        Ok(result)
    }

    /// Ciphertext waiting to go to the server.
    pub fn take_outgoing(&mut self) -> Result<Vec<u8>, NegotiationError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| self.fail(e.to_string()))?;
        }
        Ok(out)
    }

    /// Send close_notify; the alert is collected by the next
    /// [`take_outgoing`](Self::take_outgoing).
    pub fn close(&mut self) {
        self.conn.send_close_notify();
    }

    pub fn peer_identity(&self) -> PeerIdentity {
        self.verdict
            .lock()
            .ok()
            .and_then(|verdict| *verdict)
            .unwrap_or(PeerIdentity::NoCertificate)
    }

    pub fn certificate_requested(&self) -> bool {
        self.cert_requested.load(Ordering::SeqCst)
    }

    /// Security strength of the negotiated cipher suite, 0 before the handshake.
    pub fn ssf(&self) -> u32 {
        self.conn
            .negotiated_cipher_suite()
            .map(|suite| ssf_for_suite(&format!("{:?}", suite.suite())))
            .unwrap_or(0)
    }

    fn drain_plaintext(&mut self, out: &mut Vec<u8>) -> Result<bool, NegotiationError> {
        let mut buf = [0u8; 4096];
        loop {
            let read = self.conn.reader().read(&mut buf);
            match read {
                Ok(0) => return Ok(true),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(self.fail(e.to_string())),
            }
        }
    }

    fn fail(&self, detail: String) -> NegotiationError {
        if self.handshaken {
            NegotiationError::security_layer(SecurityLayerCondition::Tls, detail)
        } else {
            NegotiationError::tls(TlsCondition::HandshakeFailed, detail)
        }
    }
}

fn ssf_for_suite(name: &str) -> u32 {
    if name.contains("AES_128") {
        128
    } else if name.contains("AES_256") || name.contains("CHACHA20") {
        256
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::PrivateKeyDer;
    use rustls::{ServerConfig, ServerConnection};

    use super::*;

    struct TestCert {
        der: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
    }

    fn test_cert(name: &str) -> TestCert {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![name.to_string()]).unwrap();
        TestCert {
            der: CertificateDer::from(cert.der().to_vec()),
            key: PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
        }
    }

    fn server(cert: &TestCert) -> ServerConnection {
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der.clone()], cert.key.clone_key())
        .unwrap();
        ServerConnection::new(Arc::new(config)).unwrap()
    }

    /// Shuttle records until neither side has anything left to say.
    fn pump(client: &mut TlsCoordinator, server: &mut ServerConnection) -> TlsRead {
        let mut total = TlsRead::default();
        for _ in 0..16 {
            let to_server = client.take_outgoing().unwrap();
            let mut slice = to_server.as_slice();
            while !slice.is_empty() {
                server.read_tls(&mut slice).unwrap();
                server.process_new_packets().unwrap();
            }

            let mut to_client = Vec::new();
            while server.wants_write() {
                server.write_tls(&mut to_client).unwrap();
            }
            if to_client.is_empty() && to_server.is_empty() {
                break;
            }
            let read = client.write_incoming(&to_client).unwrap();
            total.handshaken |= read.handshaken;
            total.closed |= read.closed;
            total.plaintext.extend(read.plaintext);
        }
        total
    }

    #[test]
    fn self_signed_certificate_is_untrusted_but_handshake_completes() {
        let cert = test_cert("xmpp.example.com");
        let mut client =
            TlsCoordinator::start_client("xmpp.example.com", &TlsSettings::default()).unwrap();
        let mut server = server(&cert);

        let read = pump(&mut client, &mut server);
        assert!(read.handshaken);
        assert!(!client.is_handshaking());
        assert_eq!(client.peer_identity(), PeerIdentity::Untrusted);
        assert!(client.ssf() >= 128);
        assert!(!client.certificate_requested());
    }

    #[test]
    fn extra_root_makes_the_certificate_valid() {
        let cert = test_cert("xmpp.example.com");
        let settings = TlsSettings {
            extra_roots: vec![cert.der.clone()],
        };
        let mut client = TlsCoordinator::start_client("xmpp.example.com", &settings).unwrap();
        let mut server = server(&cert);

        pump(&mut client, &mut server);
        assert_eq!(client.peer_identity(), PeerIdentity::Valid);
    }

    #[test]
    fn wrong_name_is_a_host_mismatch() {
        let cert = test_cert("xmpp.example.com");
        let settings = TlsSettings {
            extra_roots: vec![cert.der.clone()],
        };
        let mut client = TlsCoordinator::start_client("chat.example.org", &settings).unwrap();
        let mut server = server(&cert);

        pump(&mut client, &mut server);
        assert_eq!(client.peer_identity(), PeerIdentity::HostMismatch);
    }

    #[test]
    fn plaintext_flows_both_ways_after_handshake() {
        let cert = test_cert("xmpp.example.com");
        let mut client =
            TlsCoordinator::start_client("xmpp.example.com", &TlsSettings::default()).unwrap();
        let mut server = server(&cert);
        pump(&mut client, &mut server);

        client.write(b"<stream:stream>").unwrap();
        server.writer().write_all(b"<stream:features/>").unwrap();
        let read = pump(&mut client, &mut server);
        assert_eq!(read.plaintext, b"<stream:features/>");

        let mut received = Vec::new();
        server.reader().read_to_end(&mut received).ok();
        assert_eq!(received, b"<stream:stream>");
    }

    #[test]
    fn garbage_during_handshake_is_a_handshake_failure() {
        let mut client =
            TlsCoordinator::start_client("xmpp.example.com", &TlsSettings::default()).unwrap();
        client.take_outgoing().unwrap();
        let error = client.write_incoming(b"HTTP/1.1 400 Bad Request\r\n\r\n").unwrap_err();
        assert_eq!(
            error.condition,
            crate::error::Condition::Tls(TlsCondition::HandshakeFailed)
        );
    }

    #[test]
    fn certificate_errors_map_to_identities() {
        let cases = [
            (CertificateError::Expired, PeerIdentity::Expired),
            (CertificateError::NotValidYet, PeerIdentity::Expired),
            (CertificateError::UnknownIssuer, PeerIdentity::Untrusted),
            (CertificateError::BadSignature, PeerIdentity::Untrusted),
            (CertificateError::NotValidForName, PeerIdentity::HostMismatch),
            (CertificateError::Revoked, PeerIdentity::Revoked),
            (CertificateError::BadEncoding, PeerIdentity::Invalid),
        ];
        for (error, expected) in cases {
            assert_eq!(
                identity_from_error(&rustls::Error::InvalidCertificate(error)),
                expected
            );
        }
    }

    #[test]
    fn cipher_suite_strength() {
        assert_eq!(ssf_for_suite("TLS13_AES_128_GCM_SHA256"), 128);
        assert_eq!(ssf_for_suite("TLS13_AES_256_GCM_SHA384"), 256);
        assert_eq!(ssf_for_suite("TLS13_CHACHA20_POLY1305_SHA256"), 256);
    }

    #[test]
    fn resolver_records_certificate_request() {
        let resolver = RecordingCertResolver::default();
        assert!(resolver.has_certs());
        assert!(resolver.resolve(&[], &[]).is_none());
        assert!(resolver.requested.load(Ordering::SeqCst));
    }
}
