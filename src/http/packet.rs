//! Raw packet helpers
//!
//! Callers hand the engine request packets exactly as they want them on the
//! wire, in HTTP/1.1 text form. This module splits such a packet into its
//! request line, header fields and body, and renders HTTP/2 responses back
//! into HTTP/1.1-style text so callers can treat both protocols alike.
//!
//! Splitting is deliberately lenient. Packets produced by a fuzzer or typed
//! by hand often mix `\r\n` and `\n`, carry header lines without a colon or
//! omit the protocol token, and none of that should stop the packet from
//! being sent.

use super::chunked;
use super::{Error, Headers, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// A request packet split into its parts
#[derive(Debug, Clone)]
pub struct RequestPacket {
    pub method: String,
    /// Request target as written (origin-form, absolute-form, `*`, authority)
    pub uri: String,
    /// Protocol token, `HTTP/1.1` when absent
    pub proto: String,
    pub headers: Headers,
    /// Body with any chunked framing removed
    pub body: Bytes,
}

/// Components of an absolute-form request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
}

impl RequestPacket {
    /// Split the request target into scheme, authority and path
    pub fn target(&self) -> Target {
        parse_target(&self.uri)
    }

    /// Authority for the request: `Host` header first, then the URI
    pub fn authority(&self) -> Option<String> {
        self.headers
            .get("host")
            .map(|h| h.to_string())
            .or_else(|| self.target().authority)
    }
}

/// Parse a request target
pub fn parse_target(uri: &str) -> Target {
    if let Some(idx) = uri.find("://") {
        let scheme = &uri[..idx];
        let rest = &uri[idx + 3..];
        let (authority, path) = match rest.find(|c| c == '/' || c == '?') {
            Some(p) if rest.as_bytes()[p] == b'?' => (&rest[..p], format!("/{}", &rest[p..])),
            Some(p) => (&rest[..p], rest[p..].to_string()),
            None => (rest, "/".to_string()),
        };
        return Target {
            scheme: Some(scheme.to_ascii_lowercase()),
            authority: if authority.is_empty() { None } else { Some(authority.to_string()) },
            path,
        };
    }

    let path = if uri.is_empty() { "/".to_string() } else { uri.to_string() };
    Target { scheme: None, authority: None, path }
}

/// Locate the end of the header section
///
/// Returns (head_end, body_start).
fn find_head_end(raw: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            if raw[i + 1..].starts_with(b"\r\n") {
                return Some((i, i + 3));
            }
            if raw[i + 1..].starts_with(b"\n") {
                return Some((i, i + 2));
            }
        }
        i += 1;
    }
    None
}

/// Split a raw HTTP/1.x request packet
pub fn split_request_packet(raw: &[u8]) -> Result<RequestPacket> {
    let (head, body) = match find_head_end(raw) {
        Some((head_end, body_start)) => (&raw[..head_end], &raw[body_start..]),
        None => (raw, &raw[raw.len()..]),
    };

    let head = String::from_utf8_lossy(head);
    let mut lines = head
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .skip_while(|l| l.trim().is_empty());

    let request_line = lines
        .next()
        .ok_or_else(|| Error::Parse("empty request packet".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("missing method: {:?}", request_line)))?
        .to_string();
    let uri = parts.next().unwrap_or("/").to_string();
    let proto = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        match Headers::parse_header_line(line) {
            Ok((name, value)) => headers.insert(name, value),
            Err(e) => tracing::debug!(error = %e, "skipping malformed header line"),
        }
    }

    let chunked = headers
        .get_all("transfer-encoding")
        .iter()
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    let body = if chunked && !body.is_empty() {
        let decoded = chunked::dechunk(body)?;
        if !decoded.complete {
            tracing::debug!("chunked body without terminating chunk");
        }
        decoded.body
    } else {
        Bytes::copy_from_slice(body)
    };

    Ok(RequestPacket { method, uri, proto, headers, body })
}

/// Whether a request with `method` and body length `len` should carry an
/// explicit content-length
///
/// Negative lengths mean "unknown" and never send one. An empty body only
/// gets `content-length: 0` for methods that normally carry a body.
pub fn should_send_req_content_length(method: &str, len: i64) -> bool {
    if len > 0 {
        return true;
    }
    if len < 0 {
        return false;
    }
    matches!(method, "POST" | "PUT" | "PATCH")
}

/// Standard reason phrase for a status code, empty when unknown
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        421 => "Misdirected Request",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Render a response as HTTP/1.1-style text
///
/// `status == 0` (no status received yet) renders as a bare `HTTP/2.0` line.
pub fn render_response(status: u16, headers: &[(String, String)], body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(64 + body.len());
    if status == 0 {
        out.put_slice(b"HTTP/2.0\r\n");
    } else {
        let reason = reason_phrase(status);
        if reason.is_empty() {
            out.put_slice(format!("HTTP/2.0 {}\r\n", status).as_bytes());
        } else {
            out.put_slice(format!("HTTP/2.0 {} {}\r\n", status, reason).as_bytes());
        }
    }
    for (name, value) in headers {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_crlf_packet() {
        let raw = b"POST /submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc";
        let packet = split_request_packet(raw).unwrap();
        assert_eq!(packet.method, "POST");
        assert_eq!(packet.uri, "/submit?x=1");
        assert_eq!(packet.proto, "HTTP/1.1");
        assert_eq!(packet.headers.get("host"), Some("example.com"));
        assert_eq!(&packet.body[..], b"abc");
    }

    #[test]
    fn test_split_lenient_packet() {
        let raw = b"GET /\nHost: a\ngarbage line\nX-A: 1\n\nbody";
        let packet = split_request_packet(raw).unwrap();
        assert_eq!(packet.proto, "HTTP/1.1");
        assert_eq!(packet.headers.len(), 2);
        assert_eq!(&packet.body[..], b"body");
    }

    #[test]
    fn test_split_without_blank_line() {
        let packet = split_request_packet(b"GET /only-head HTTP/1.1\r\nHost: a\r\n").unwrap();
        assert_eq!(packet.uri, "/only-head");
        assert!(packet.body.is_empty());
    }

    #[test]
    fn test_split_chunked_body() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let packet = split_request_packet(raw).unwrap();
        assert_eq!(&packet.body[..], b"abc");
    }

    #[test]
    fn test_split_empty_packet() {
        assert!(split_request_packet(b"").is_err());
        assert!(split_request_packet(b"\r\n\r\n").is_err());
    }

    #[test]
    fn test_absolute_target() {
        let t = parse_target("HTTPS://example.com:8443/a/b?c=d");
        assert_eq!(t.scheme.as_deref(), Some("https"));
        assert_eq!(t.authority.as_deref(), Some("example.com:8443"));
        assert_eq!(t.path, "/a/b?c=d");

        let t = parse_target("http://example.com?q");
        assert_eq!(t.path, "/?q");

        let t = parse_target("http://example.com");
        assert_eq!(t.path, "/");

        let t = parse_target("*");
        assert_eq!(t.path, "*");
        assert!(t.authority.is_none());
    }

    #[test]
    fn test_authority_prefers_host() {
        let packet =
            split_request_packet(b"GET http://uri.example/ HTTP/1.1\r\nHost: host.example\r\n\r\n").unwrap();
        assert_eq!(packet.authority().as_deref(), Some("host.example"));

        let packet = split_request_packet(b"GET http://uri.example/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(packet.authority().as_deref(), Some("uri.example"));
    }

    #[test]
    fn test_should_send_content_length() {
        assert!(should_send_req_content_length("GET", 10));
        assert!(!should_send_req_content_length("POST", -1));
        assert!(should_send_req_content_length("POST", 0));
        assert!(should_send_req_content_length("PUT", 0));
        assert!(should_send_req_content_length("PATCH", 0));
        assert!(!should_send_req_content_length("GET", 0));
        assert!(!should_send_req_content_length("DELETE", 0));
    }

    #[test]
    fn test_render_response() {
        let raw = render_response(
            200,
            &[("content-type".to_string(), "text/plain".to_string())],
            b"hi",
        );
        assert_eq!(&raw[..], b"HTTP/2.0 200 OK\r\ncontent-type: text/plain\r\n\r\nhi");
        assert_eq!(&render_response(599, &[], b"")[..], b"HTTP/2.0 599\r\n\r\n");
    }

    proptest! {
        #[test]
        fn prop_split_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = split_request_packet(&raw);
        }

        #[test]
        fn prop_split_keeps_line_and_body(
            method in "[A-Z]{3,7}",
            path in "/[a-z0-9/]{0,20}",
            body in proptest::collection::vec(any::<u8>(), 0..64),
            bare_lf in any::<bool>(),
        ) {
            let eol = if bare_lf { "\n" } else { "\r\n" };
            let mut raw = format!("{} {} HTTP/1.1{eol}Host: example.com{eol}{eol}", method, path, eol = eol).into_bytes();
            raw.extend_from_slice(&body);
            let packet = split_request_packet(&raw).unwrap();
            prop_assert_eq!(packet.method, method);
            prop_assert_eq!(packet.uri, path);
            prop_assert_eq!(packet.headers.get("host"), Some("example.com"));
            prop_assert_eq!(&packet.body[..], &body[..]);
        }
    }
}
