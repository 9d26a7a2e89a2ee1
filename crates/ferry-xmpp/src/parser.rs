//! Incremental framing of the XMPP client stream.
//!
//! A session is one long-lived XML document, so the framer cuts the byte
//! stream into the opening `<stream:stream>` tag, complete top-level
//! elements, and the closing tag. Each top-level element is handed to
//! minidom with the stream-level namespace declarations re-attached.

use minidom::Element;

use crate::error::NegotiationError;

/// Namespace URIs used during negotiation.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// XEP-0078 non-SASL authentication.
    pub const IQ_AUTH: &str = "jabber:iq:auth";
    pub const IQ_AUTH_FEATURE: &str = "http://jabber.org/features/iq-auth";
    /// XEP-0138 stream compression.
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
}

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Attributes of the server's `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse the unclosed opening tag.
    pub fn parse(tag: &str) -> Result<Self, NegotiationError> {
        let start = tag
            .find("<stream:stream")
            .ok_or_else(|| NegotiationError::parse("no stream:stream element found"))?;
        let end = tag[start..]
            .find('>')
            .map(|i| start + i)
            .ok_or_else(|| NegotiationError::parse("incomplete stream header"))?;
        let tag = &tag[start..=end];

        Ok(Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        })
    }

    /// Servers older than XMPP 1.0 omit the version or send `0.x`.
    pub fn is_legacy(&self) -> bool {
        let Some(version) = self.version.as_deref() else {
            return true;
        };
        let major = version.split('.').next().unwrap_or_default();
        major.trim().parse::<u32>().map(|m| m < 1).unwrap_or(true)
    }

    /// Client-side opening tag for a stream to `domain`.
    pub fn client_open(domain: &str, lang: Option<&str>, legacy: bool) -> String {
        let mut out = String::from("<?xml version='1.0'?><stream:stream");
        out.push_str(&format!(" to='{}'", escape(domain)));
        out.push_str(&format!(" xmlns='{}'", ns::JABBER_CLIENT));
        out.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
        if !legacy {
            out.push_str(" version='1.0'");
        }
        if let Some(lang) = lang {
            out.push_str(&format!(" xml:lang='{}'", escape(lang)));
        }
        out.push('>');
        out
    }
}

/// Extract an attribute value from a start tag.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{name}={quote}");
        let mut search_from = 0;
        while let Some(found) = tag[search_from..].find(&pattern) {
            let start = search_from + found;
            search_from = start + pattern.len();
            // Reject suffix matches such as `xml:lang=` when looking for `lang=`.
            let preceded_by_space = tag[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
            if !preceded_by_space {
                continue;
            }
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(unescape(&tag[value_start..value_start + value_end]));
            }
        }
    }
    None
}

/// Escape text for use in element content or a quoted attribute.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// One unit cut from the inbound stream.
#[derive(Debug, Clone)]
pub enum Frame {
    Header(StreamHeader),
    Element(Element),
    StreamEnd,
}

/// Splits the inbound byte stream into [`Frame`]s.
#[derive(Debug, Default)]
pub struct XmlFramer {
    buffer: Vec<u8>,
}

impl XmlFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Hand back bytes not yet framed. Used when a new layer takes over the
    /// stream and those bytes belong to it.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, NegotiationError> {
        loop {
            let Some(start) = self.buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buffer.clear();
                return Ok(None);
            };
            if self.buffer[start] != b'<' {
                return Err(NegotiationError::parse(
                    "character data outside of a stanza",
                ));
            }
            let rest = &self.buffer[start..];

            if rest.starts_with(b"<?") {
                let Some(end) = find(rest, b"?>") else {
                    return Ok(None);
                };
                self.buffer.drain(..start + end + 2);
                continue;
            }
            if rest.starts_with(b"<!--") {
                let Some(end) = find(rest, b"-->") else {
                    return Ok(None);
                };
                self.buffer.drain(..start + end + 3);
                continue;
            }
            if rest.starts_with(b"</stream:stream") {
                let Some(end) = rest.iter().position(|&b| b == b'>') else {
                    return Ok(None);
                };
                self.buffer.drain(..start + end + 1);
                return Ok(Some(Frame::StreamEnd));
            }
            if rest.starts_with(b"<stream:stream") {
                let Some(end) = scan_start_tag(rest) else {
                    return Ok(None);
                };
                let tag = utf8(&rest[..end])?;
                let header = StreamHeader::parse(tag)?;
                self.buffer.drain(..start + end);
                return Ok(Some(Frame::Header(header)));
            }

            let Some(end) = scan_element(rest)? else {
                return Ok(None);
            };
            let element = parse_fragment(utf8(&rest[..end])?)?;
            self.buffer.drain(..start + end);
            return Ok(Some(Frame::Element(element)));
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, NegotiationError> {
    std::str::from_utf8(bytes).map_err(|e| NegotiationError::parse(format!("invalid UTF-8: {e}")))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Index just past the `>` closing the start tag at `data[0]`, honouring quotes.
fn scan_start_tag(data: &[u8]) -> Option<usize> {
    let mut quote = None;
    for (i, &b) in data.iter().enumerate().skip(1) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'>') => return Some(i + 1),
            _ => {}
        }
    }
    None
}

/// Length of the complete element starting at `data[0]`, or `None` if more
/// bytes are needed.
fn scan_element(data: &[u8]) -> Result<Option<usize>, NegotiationError> {
    let mut depth = 0usize;
    let mut pos = 0usize;

    while pos < data.len() {
        let Some(offset) = data[pos..].iter().position(|&b| b == b'<') else {
            return Ok(None);
        };
        pos += offset;
        let rest = &data[pos..];

        if rest.starts_with(b"<!--") {
            let Some(end) = find(rest, b"-->") else {
                return Ok(None);
            };
            pos += end + 3;
        } else if rest.starts_with(b"<![CDATA[") {
            let Some(end) = find(rest, b"]]>") else {
                return Ok(None);
            };
            pos += end + 3;
        } else if rest.starts_with(b"<?") {
            let Some(end) = find(rest, b"?>") else {
                return Ok(None);
            };
            pos += end + 2;
        } else if rest.starts_with(b"</") {
            let Some(end) = rest.iter().position(|&b| b == b'>') else {
                return Ok(None);
            };
            pos += end + 1;
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| NegotiationError::parse("unbalanced closing tag"))?;
            if depth == 0 {
                return Ok(Some(pos));
            }
        } else {
            let Some(end) = scan_start_tag(rest) else {
                return Ok(None);
            };
            let self_closing = end >= 2 && rest[end - 2] == b'/';
            pos += end;
            if !self_closing {
                depth += 1;
            } else if depth == 0 {
                return Ok(Some(pos));
            }
        }

        if depth == 0 {
            return Err(NegotiationError::parse("unexpected content between stanzas"));
        }
    }

    Ok(None)
}

/// Parse a top-level element, re-attaching namespaces declared on the stream.
fn parse_fragment(xml: &str) -> Result<Element, NegotiationError> {
    let Some(tag_end) = scan_start_tag(xml.as_bytes()) else {
        return Err(NegotiationError::parse("incomplete start tag"));
    };
    let name_end = xml[1..]
        .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .map(|i| i + 1)
        .unwrap_or(tag_end);
    let start_tag = &xml[..tag_end];

    let mut declarations = String::new();
    if xml.contains("stream:") && !start_tag.contains("xmlns:stream=") {
        declarations.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }
    if extract_attribute(start_tag, "xmlns").is_none() && !xml[1..name_end].contains(':') {
        declarations.push_str(&format!(" xmlns='{}'", ns::JABBER_CLIENT));
    }

    let owned;
    let source = if declarations.is_empty() {
        xml
    } else {
        owned = format!("{}{}{}", &xml[..name_end], declarations, &xml[name_end..]);
        &owned
    };

    source
        .parse::<Element>()
        .map_err(|e| NegotiationError::parse(format!("failed to parse element: {e}")))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, NegotiationError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| NegotiationError::parse(format!("failed to serialize element: {e}")))?;
    String::from_utf8(output).map_err(|e| NegotiationError::parse(format!("invalid UTF-8: {e}")))
}

/// What the server offered in `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// RFC 3921 session establishment that is not marked optional.
    pub session_required: bool,
    pub compression_methods: Vec<String>,
    pub iq_auth: bool,
}

impl StreamFeatures {
    pub fn from_element(element: &Element) -> Result<Self, NegotiationError> {
        if !element.is("features", ns::STREAM) {
            return Err(NegotiationError::protocol(format!(
                "expected stream:features, got {}",
                element.name()
            )));
        }

        let mut features = Self::default();
        for child in element.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = true;
            } else if child.is("mechanisms", ns::SASL) {
                features.mechanisms = child
                    .children()
                    .filter(|m| m.is("mechanism", ns::SASL))
                    .map(|m| m.text().trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect();
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("session", ns::SESSION) {
                features.session_required = !child.has_child("optional", ns::SESSION);
            } else if child.is("compression", ns::COMPRESS_FEATURE) {
                features.compression_methods = child
                    .children()
                    .filter(|m| m.is("method", ns::COMPRESS_FEATURE))
                    .map(|m| m.text().trim().to_string())
                    .collect();
            } else if child.is("auth", ns::IQ_AUTH_FEATURE) {
                features.iq_auth = true;
            }
        }
        Ok(features)
    }
}
