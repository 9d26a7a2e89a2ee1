//! HTTP `CONNECT` tunnelling.

use base64::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ConnectionError;

/// Upper bound on the proxy's reply header block.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Ask the proxy for a tunnel to `host:port`.
///
/// Returns whatever the proxy sent after its header block; those bytes
/// already belong to the tunnelled stream.
pub async fn negotiate<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<Vec<u8>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_request(host, port, credentials);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ConnectionError::ProxyNegotiate(e.to_string()))?;

    let mut buffer = Vec::with_capacity(1024);
    let header_end = loop {
        if let Some(end) = find_header_end(&buffer) {
            break end;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(ConnectionError::ProxyNegotiate(
                "proxy reply header too large".to_string(),
            ));
        }
        let mut chunk = [0u8; 1024];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ConnectionError::ProxyNegotiate(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::ProxyNegotiate(
                "proxy closed the connection".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let header = String::from_utf8_lossy(&buffer[..header_end]);
    let status_line = header.lines().next().unwrap_or_default();
    let (code, reason) = parse_status_line(status_line)?;
    debug!(code, reason = %reason, "HTTP CONNECT reply");

    match code {
        200..=299 => Ok(buffer[header_end..].to_vec()),
        407 => Err(ConnectionError::ProxyAuth(format!("{code} {reason}"))),
        404 => Err(ConnectionError::HostNotFound(format!("{code} {reason}"))),
        503 => Err(ConnectionError::ConnectionRefused(format!("{code} {reason}"))),
        _ => Err(ConnectionError::ProxyNegotiate(format!("{code} {reason}"))),
    }
}

fn build_request(host: &str, port: u16, credentials: Option<(&str, &str)>) -> String {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = credentials {
        let token = BASE64_STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("Pragma: no-cache\r\n\r\n");
    request
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

fn parse_status_line(line: &str) -> Result<(u16, String), ConnectionError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ConnectionError::ProxyNegotiate(format!(
            "invalid status line: {line}"
        )));
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| ConnectionError::ProxyNegotiate(format!("invalid status line: {line}")))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    const REQUEST: &[u8] =
        b"CONNECT xmpp.example.com:5222 HTTP/1.1\r\nHost: xmpp.example.com:5222\r\nPragma: no-cache\r\n\r\n";

    #[tokio::test]
    async fn success_keeps_trailing_bytes() {
        let mut mock = Builder::new()
            .write(REQUEST)
            .read(b"HTTP/1.1 200 Connection established\r\nProxy-Agent: test\r\n\r\n<stream")
            .build();

        let rest = negotiate(&mut mock, "xmpp.example.com", 5222, None)
            .await
            .unwrap();
        assert_eq!(rest, b"<stream");
    }

    #[tokio::test]
    async fn reply_split_across_reads() {
        let mut mock = Builder::new()
            .write(REQUEST)
            .read(b"HTTP/1.0 200 OK\r")
            .read(b"\n\r\n")
            .build();

        let rest = negotiate(&mut mock, "xmpp.example.com", 5222, None)
            .await
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn credentials_are_sent_as_basic_auth() {
        let request = build_request("h", 1, Some(("bob", "secret")));
        assert!(request.contains("Proxy-Authorization: Basic Ym9iOnNlY3JldA==\r\n"));
    }

    #[tokio::test]
    async fn status_codes_map_to_conditions() {
        for (status, check) in [
            ("407 Proxy Authentication Required", "proxy-auth"),
            ("404 Not Found", "host-not-found"),
            ("503 Service Unavailable", "connection-refused"),
            ("403 Forbidden", "proxy-negotiate"),
            ("500 Internal Server Error", "proxy-negotiate"),
        ] {
            let reply = format!("HTTP/1.1 {status}\r\n\r\n");
            let mut mock = Builder::new().write(REQUEST).read(reply.as_bytes()).build();
            let error = negotiate(&mut mock, "xmpp.example.com", 5222, None)
                .await
                .unwrap_err();
            assert_eq!(error.condition().as_str(), check, "status {status}");
        }
    }

    #[tokio::test]
    async fn early_close_is_a_negotiation_failure() {
        let mut mock = Builder::new().write(REQUEST).build();
        let error = negotiate(&mut mock, "xmpp.example.com", 5222, None)
            .await
            .unwrap_err();
        assert!(matches!(error, ConnectionError::ProxyNegotiate(_)));
    }
}
