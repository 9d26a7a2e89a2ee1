//! The stack of byte transforms between the XML stream and the wire.
//!
//! Outbound data is compressed first and then encrypted. Inbound data is
//! decrypted first and then decompressed.

use crate::compress::ZlibLayer;
use crate::error::NegotiationError;
use crate::tls::{PeerIdentity, TlsCoordinator};

/// Result of pushing received bytes through the stack.
#[derive(Debug, Default)]
pub(crate) struct Decoded {
    pub plaintext: Vec<u8>,
    /// The TLS handshake finished while processing this chunk.
    pub handshaken: bool,
    /// TLS close_notify arrived.
    pub closed: bool,
}

#[derive(Default)]
pub(crate) struct Layers {
    tls: Option<TlsCoordinator>,
    zlib: Option<ZlibLayer>,
}

impl Layers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_tls(&mut self, tls: TlsCoordinator) {
        self.tls = Some(tls);
    }

    /// Install compression. `pending` holds bytes already received after
    /// `<compressed/>`; they are returned decompressed.
    pub fn install_zlib(&mut self, pending: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        let mut zlib = ZlibLayer::new();
        let plain = if pending.is_empty() {
            Vec::new()
        } else {
            zlib.decompress(pending)?
        };
        self.zlib = Some(zlib);
        Ok(plain)
    }

    /// TLS is installed and its handshake has completed.
    pub fn tls_active(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| !tls.is_handshaking())
    }

    pub fn is_compressed(&self) -> bool {
        self.zlib.is_some()
    }

    pub fn tls_ssf(&self) -> u32 {
        self.tls.as_ref().map(TlsCoordinator::ssf).unwrap_or(0)
    }

    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.tls.as_ref().map(TlsCoordinator::peer_identity)
    }

    pub fn certificate_requested(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(TlsCoordinator::certificate_requested)
    }

    /// Wire bytes for `plain`.
    pub fn encode(&mut self, plain: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        let data = match self.zlib.as_mut() {
            Some(zlib) => zlib.compress(plain)?,
            None => plain.to_vec(),
        };
        match self.tls.as_mut() {
            Some(tls) => {
                tls.write(&data)?;
                tls.take_outgoing()
            }
            None => Ok(data),
        }
    }

    /// Stream bytes for `raw` received from the wire.
    pub fn decode(&mut self, raw: &[u8]) -> Result<Decoded, NegotiationError> {
        let mut decoded = match self.tls.as_mut() {
            Some(tls) => {
                let read = tls.write_incoming(raw)?;
                Decoded {
                    plaintext: read.plaintext,
                    handshaken: read.handshaken,
                    closed: read.closed,
                }
            }
            None => Decoded {
                plaintext: raw.to_vec(),
                ..Decoded::default()
            },
        };
        if let Some(zlib) = self.zlib.as_mut() {
            if !decoded.plaintext.is_empty() {
                decoded.plaintext = zlib.decompress(&decoded.plaintext)?;
            }
        }
        Ok(decoded)
    }

    /// Handshake records or alerts TLS wants to send on its own.
    pub fn flush(&mut self) -> Result<Vec<u8>, NegotiationError> {
        match self.tls.as_mut() {
            Some(tls) => tls.take_outgoing(),
            None => Ok(Vec::new()),
        }
    }

    /// Queue close_notify; collect it with [`flush`](Self::flush).
    pub fn close(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_stack_is_transparent() {
        let mut layers = Layers::new();
        assert_eq!(layers.encode(b"<presence/>").unwrap(), b"<presence/>");
        let decoded = layers.decode(b"<message/>").unwrap();
        assert_eq!(decoded.plaintext, b"<message/>");
        assert!(!decoded.handshaken);
        assert!(layers.flush().unwrap().is_empty());
    }

    #[test]
    fn compressed_stack_round_trips_with_a_peer() {
        let mut client = Layers::new();
        let mut server = Layers::new();
        client.install_zlib(&[]).unwrap();
        server.install_zlib(&[]).unwrap();
        assert!(client.is_compressed());

        let wire = client.encode(b"<iq type='get' id='p'/>").unwrap();
        assert_ne!(wire, b"<iq type='get' id='p'/>");
        assert_eq!(
            server.decode(&wire).unwrap().plaintext,
            b"<iq type='get' id='p'/>"
        );
    }

    #[test]
    fn bytes_received_with_compressed_are_decompressed_on_install() {
        let mut peer = ZlibLayer::new();
        let early = peer.compress(b"<stream:stream>").unwrap();

        let mut layers = Layers::new();
        let plain = layers.install_zlib(&early).unwrap();
        assert_eq!(plain, b"<stream:stream>");
    }
}
