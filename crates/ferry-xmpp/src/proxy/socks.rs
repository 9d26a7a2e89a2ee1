//! SOCKS5 (RFC 1928, RFC 1929) and SOCKS4a client handshakes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ConnectionError;

const SOCKS5: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn negotiate_err(e: std::io::Error) -> ConnectionError {
    ConnectionError::ProxyNegotiate(e.to_string())
}

/// SOCKS5 CONNECT to `host:port` by domain name.
pub async fn negotiate_v5<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[SOCKS5, 1, METHOD_NONE]
    };
    stream.write_all(greeting).await.map_err(negotiate_err)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(negotiate_err)?;
    if choice[0] != SOCKS5 {
        return Err(ConnectionError::ProxyNegotiate(format!(
            "unexpected SOCKS version {}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (METHOD_NONE, _) => {}
        (METHOD_USERPASS, Some((user, pass))) => authenticate(stream, user, pass).await?,
        (METHOD_REJECTED, Some(_)) | (METHOD_USERPASS, None) => {
            return Err(ConnectionError::ProxyAuth(
                "proxy requires authentication".to_string(),
            ));
        }
        (method, _) => {
            return Err(ConnectionError::ProxyNegotiate(format!(
                "unsupported SOCKS method {method:#04x}"
            )));
        }
    }

    let host_bytes = host.as_bytes();
    let host_len = u8::try_from(host_bytes.len())
        .map_err(|_| ConnectionError::ProxyNegotiate("host name too long".to_string()))?;
    let mut request = vec![SOCKS5, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len];
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(negotiate_err)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(negotiate_err)?;
    match reply[1] {
        0x00 => {}
        0x04 => {
            return Err(ConnectionError::HostNotFound(format!(
                "SOCKS proxy cannot reach {host}"
            )));
        }
        0x05 => {
            return Err(ConnectionError::ConnectionRefused(format!(
                "{host}:{port} refused the proxied connection"
            )));
        }
        code => {
            return Err(ConnectionError::ProxyNegotiate(format!(
                "SOCKS request failed with code {code:#04x}"
            )));
        }
    }

    // Bound address, which nothing here needs.
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(negotiate_err)?;
            usize::from(len[0])
        }
        other => {
            return Err(ConnectionError::ProxyNegotiate(format!(
                "unknown SOCKS address type {other}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(negotiate_err)?;

    debug!(host, port, "SOCKS5 tunnel established");
    Ok(())
}

async fn authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_len = u8::try_from(user.len())
        .map_err(|_| ConnectionError::ProxyAuth("username too long".to_string()))?;
    let pass_len = u8::try_from(pass.len())
        .map_err(|_| ConnectionError::ProxyAuth("password too long".to_string()))?;

    let mut request = vec![0x01, user_len];
    request.extend_from_slice(user.as_bytes());
    request.push(pass_len);
    request.extend_from_slice(pass.as_bytes());
    stream.write_all(&request).await.map_err(negotiate_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(negotiate_err)?;
    if reply[1] != 0x00 {
        return Err(ConnectionError::ProxyAuth(
            "proxy rejected the credentials".to_string(),
        ));
    }
    Ok(())
}

/// SOCKS4a CONNECT, letting the proxy resolve `host`.
pub async fn negotiate_v4a<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user: &str,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![0x04, CMD_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]);
    request.extend_from_slice(user.as_bytes());
    request.push(0);
    request.extend_from_slice(host.as_bytes());
    request.push(0);
    stream.write_all(&request).await.map_err(negotiate_err)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(negotiate_err)?;
    match reply[1] {
        0x5a => {
            debug!(host, port, "SOCKS4a tunnel established");
            Ok(())
        }
        0x5b => Err(ConnectionError::ConnectionRefused(format!(
            "SOCKS4 request for {host}:{port} rejected"
        ))),
        0x5c | 0x5d => Err(ConnectionError::ProxyAuth(
            "SOCKS4 identd check failed".to_string(),
        )),
        code => Err(ConnectionError::ProxyNegotiate(format!(
            "SOCKS4 reply code {code:#04x}"
        ))),
    }
}
