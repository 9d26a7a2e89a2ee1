//! End-to-end negotiation against an in-process server reached through SRV
//! discovery and a loopback dialer.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use ferry_xmpp::config::{ConnectOptions, ProxyConfig, StreamOptions};
use ferry_xmpp::error::{Condition, ConnectionError, NegotiationCondition};
use ferry_xmpp::resolver::ServiceResolver;
use ferry_xmpp::{
    Client, ClientEvent, Connector, Dial, Layer, LookupRegistry, PeerIdentity, ServiceCandidate,
    Signal, SrvRecord, SrvSource, State, StreamEngine, TlsSettings, Transport,
};
use futures::future::BoxFuture;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const DOMAIN: &str = "example.com";

fn header(id: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' id='{id}' from='{DOMAIN}' version='1.0'>"
    )
}

/// Hands out one prepared transport and records where it was asked to go.
struct Loopback {
    transport: Mutex<Option<Transport>>,
    dialed: Arc<Mutex<Vec<String>>>,
}

impl Dial for Loopback {
    fn dial(
        &self,
        candidate: &ServiceCandidate,
        _proxy: &ProxyConfig,
    ) -> BoxFuture<'static, Result<Transport, ConnectionError>> {
        self.dialed.lock().unwrap().push(candidate.to_string());
        let transport = self.transport.lock().unwrap().take();
        Box::pin(async move {
            transport.ok_or_else(|| ConnectionError::ConnectionRefused("already dialed".into()))
        })
    }
}

struct StaticSrv;

impl SrvSource for StaticSrv {
    fn lookup_srv(&self, name: &str) -> BoxFuture<'static, Result<Vec<SrvRecord>, String>> {
        let found = name == "_xmpp-client._tcp.example.com";
        Box::pin(async move {
            if !found {
                return Err("NXDOMAIN".to_string());
            }
            Ok(vec![SrvRecord {
                target: "xmpp.example.com".to_string(),
                port: 5222,
                priority: 0,
                weight: 0,
            }])
        })
    }
}

struct Harness {
    client: Client<Loopback, StaticSrv>,
    server: DuplexStream,
    dialed: Arc<Mutex<Vec<String>>>,
}

fn harness(stream: StreamOptions, tls: TlsSettings) -> Harness {
    let (transport, server) = Transport::in_memory(64 * 1024);
    let dialed = Arc::new(Mutex::new(Vec::new()));
    let dial = Loopback {
        transport: Mutex::new(Some(transport)),
        dialed: Arc::clone(&dialed),
    };
    let connector =
        Connector::with_parts(dial, ServiceResolver::new(StaticSrv, LookupRegistry::init()));
    let engine = StreamEngine::new(ConnectOptions::default(), stream, tls);
    Harness {
        client: Client::with_connector(engine, connector),
        server,
        dialed,
    }
}

async fn read_until(io: &mut DuplexStream, needle: &str) -> String {
    let mut seen = String::new();
    let mut buf = vec![0u8; 8192];
    while !seen.contains(needle) {
        let n = io.read(&mut buf).await.unwrap();
        assert!(n > 0, "client hung up while waiting for {needle}");
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    seen
}

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

/// Server half of a TLS session, driven by hand over the in-memory pipe.
struct TlsPeer {
    io: DuplexStream,
    tls: ServerConnection,
}

impl TlsPeer {
    fn new(io: DuplexStream, cert: &TestCert) -> Self {
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der.clone()], cert.key.clone_key())
        .unwrap();
        Self {
            io,
            tls: ServerConnection::new(Arc::new(config)).unwrap(),
        }
    }

    async fn flush(&mut self) {
        let mut out = Vec::new();
        while self.tls.wants_write() {
            self.tls.write_tls(&mut out).unwrap();
        }
        if !out.is_empty() {
            self.io.write_all(&out).await.unwrap();
        }
    }

    async fn read_until(&mut self, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let mut chunk = [0u8; 4096];
            loop {
                match self.tls.reader().read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => seen.push_str(&String::from_utf8_lossy(&chunk[..n])),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("tls read failed: {e}"),
                }
            }
            if seen.contains(needle) {
                return seen;
            }

            self.flush().await;
            let n = self.io.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up while waiting for {needle}");
            let mut records = &buf[..n];
            while !records.is_empty() {
                self.tls.read_tls(&mut records).unwrap();
                self.tls.process_new_packets().unwrap();
            }
        }
    }

    async fn send(&mut self, xml: &str) {
        self.tls.writer().write_all(xml.as_bytes()).unwrap();
        self.flush().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn starttls_then_sasl_then_bind() {
    let cert = test_cert(DOMAIN);
    let Harness {
        mut client,
        mut server,
        dialed,
    } = harness(
        StreamOptions::default(),
        TlsSettings {
            extra_roots: vec![cert.der.clone()],
        },
    );

    let peer = tokio::spawn(async move {
        read_until(&mut server, "<stream:stream").await;
        server
            .write_all(
                format!(
                    "{}<stream:features>\
                     <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
                     <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
                     </stream:features>",
                    header("s1")
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        read_until(&mut server, "starttls").await;
        server
            .write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();

        let mut tls = TlsPeer::new(server, &cert);
        tls.read_until("<stream:stream").await;
        tls.send(&format!(
            "{}<stream:features>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
             </stream:features>",
            header("s2")
        ))
        .await;
        let auth = tls.read_until("</auth>").await;
        tls.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;

        tls.read_until("<stream:stream").await;
        tls.send(&format!(
            "{}<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
            header("s3")
        ))
        .await;
        tls.read_until("</iq>").await;
        tls.send(
            "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>user@example.com/res</jid></bind></iq>",
        )
        .await;
        tls.read_until("</stream:stream>").await;
        auth
    });

    client.connect("user@example.com/res").await.unwrap();
    let mut signals = Vec::new();
    let mut identity = None;
    while let Some(event) = client.next_event().await {
        match event {
            ClientEvent::Handshaken(peer) => {
                identity = Some(peer);
                client.continue_after_handshake().await.unwrap();
            }
            ClientEvent::Signal(signal) => {
                match &signal {
                    Signal::NeedAuthParams { .. } => {
                        client.set_password("secret");
                        client.continue_after_params().await.unwrap();
                    }
                    Signal::Authenticated => {
                        assert_eq!(client.state(), State::Active);
                        client.close().await;
                    }
                    _ => {}
                }
                signals.push(signal);
            }
            ClientEvent::Stanza(stanza) => panic!("unexpected stanza {stanza:?}"),
        }
    }

    assert_eq!(identity, Some(PeerIdentity::Valid));
    assert_eq!(signals.len(), 5, "{signals:?}");
    assert_eq!(signals[0], Signal::Connected);
    assert_eq!(signals[1], Signal::SecurityLayerActivated(Layer::Tls));
    assert!(matches!(
        signals[2],
        Signal::NeedAuthParams {
            user: false,
            pass: true,
            ..
        }
    ));
    assert_eq!(signals[3], Signal::Authenticated);
    assert_eq!(signals[4], Signal::ConnectionClosed);

    assert_eq!(
        client.engine().jid().map(|j| j.to_string()).as_deref(),
        Some("user@example.com/res")
    );
    assert_eq!(*dialed.lock().unwrap(), vec!["xmpp.example.com:5222".to_string()]);
    // authzid empty, then username and password.
    assert!(peer.await.unwrap().contains("AHVzZXIAc2VjcmV0"));
}

#[tokio::test(flavor = "current_thread")]
async fn stream_error_during_negotiation_is_terminal() {
    let Harness {
        mut client,
        mut server,
        ..
    } = harness(StreamOptions::default(), TlsSettings::default());

    let peer = tokio::spawn(async move {
        read_until(&mut server, "<stream:stream").await;
        server
            .write_all(
                format!(
                    "{}<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                     </stream:error></stream:stream>",
                    header("e1")
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        server
    });

    client.connect("romeo@example.com").await.unwrap();
    let mut signals = Vec::new();
    while let Some(event) = client.next_event().await {
        if let ClientEvent::Signal(signal) = event {
            signals.push(signal);
        }
    }

    assert_eq!(signals.len(), 2, "{signals:?}");
    assert_eq!(signals[0], Signal::Connected);
    let Signal::Error(error) = &signals[1] else {
        panic!("expected an error, got {:?}", signals[1]);
    };
    assert_eq!(
        error.condition,
        Condition::Negotiation(NegotiationCondition::HostUnknown)
    );
    assert_eq!(client.state(), State::Error);
    drop(peer.await.unwrap());
}
