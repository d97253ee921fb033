//! First-line classification helpers and the canonical 502 response
//! (`spec.md` §4.2, §6).
//!
//! Grounded on the original Go `parseRequest`/`CustomListener.handle` in
//! `server/manager/listener.go`: split the first line, check the method,
//! and compare the path against the reserved set. HTTP-or-not detection
//! uses `httparse`, following the same "accept `Ok` or `TooManyHeaders`"
//! leniency `mirrord`'s agent uses when sniffing a raw buffer for HTTP/1.

use std::sync::OnceLock;

const RESERVED_PATHS: &[&str] = &["/", "/health", "/traffic"];

/// Where the agent-registration handshake lands (`spec.md` §6: `GET /`
/// with an `authorization` header — disambiguated from plain public
/// traffic to `/` by the presence of that header, checked by the
/// caller). This constant names the method the classifier accepts.
pub const REGISTRATION_METHOD: &str = "GET";

/// Result of classifying an accepted connection's first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// First line is HTTP and the path is `/` or a reserved
    /// administrative path, and the request does not carry an
    /// `authorization` header — ordinary public HTTP traffic.
    PublicHttp,
    /// First line is HTTP and the path is `/` or a reserved path *and*
    /// carries an `authorization` header — the agent-registration
    /// handshake.
    NotificationUpgrade,
    /// First line is HTTP and the path is `/<ticket>` with no further
    /// `/` — a data callback.
    DataCallback(String),
    /// First line is not recognizable as one of the above — raw public
    /// traffic, forwarded opaquely.
    PublicRaw,
}

/// Parse the first line of a raw buffer into `(method, path)`, without
/// requiring the rest of the request to be present yet.
fn first_line_method_path(buf: &[u8]) -> Option<(&str, &str)> {
    let line_end = buf.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&buf[..line_end]).ok()?.trim_end();
    let mut parts = line.split(' ');
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    Some((method, path))
}

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD",
];

/// Does `buf` look like the start of an HTTP/1.x request? Uses
/// `httparse` first (matches real header framing), falling back to
/// the plain method/path/version check for a buffer too short to
/// contain a full header block yet.
fn looks_like_http(buf: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(_) | Err(httparse::Error::TooManyHeaders) => true,
        Err(_) => first_line_method_path(buf).is_some(),
    }
}

fn path_without_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// Does the header block (if fully present in `buf`) carry a non-empty
/// `authorization` header?
fn has_authorization_header(buf: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(buf).is_err() {
        return false;
    }
    req.headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("authorization") && !h.value.is_empty())
}

/// Classify a connection's first peeked bytes per `spec.md` §4.2.
pub fn classify(buf: &[u8]) -> Classification {
    let Some((method, path)) = first_line_method_path(buf) else {
        return Classification::PublicRaw;
    };

    if !HTTP_METHODS.contains(&method) {
        return Classification::PublicRaw;
    }

    let path = path_without_query(path);

    if RESERVED_PATHS.contains(&path) {
        return if has_authorization_header(buf) {
            Classification::NotificationUpgrade
        } else {
            Classification::PublicHttp
        };
    }

    if path.starts_with('/') && path.len() > 1 && path.matches('/').count() == 1 {
        return Classification::DataCallback(path[1..].to_string());
    }

    if looks_like_http(buf) {
        Classification::PublicHttp
    } else {
        Classification::PublicRaw
    }
}

/// Extract a header's value from a buffer that contains a complete
/// HTTP/1.x header block (case-insensitive name match).
pub fn header_value<'a>(buf: &'a [u8], name: &str) -> Option<&'a str> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(buf).ok()?;
    req.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

/// Strip a trailing `:port` from a Host header value.
pub fn host_without_port(host: &str) -> &str {
    if let Some(idx) = host.rfind(':') {
        // Guard against IPv6 literals like `[::1]:443` being mis-split;
        // a bare port suffix never contains a `]`.
        if !host[idx..].contains(']') {
            return &host[..idx];
        }
    }
    host
}

const BAD_GATEWAY_BODY: &str = "<!DOCTYPE html>\n<html>\n<head>\n    <title>502 Bad Gateway</title>\n</head>\n<body>\n    <h1>Bad Gateway</h1>\n    <p>The server encountered a temporary error and could not complete your request.</p>\n</body>\n</html>";

static BAD_GATEWAY_RESPONSE: OnceLock<Vec<u8>> = OnceLock::new();

/// The canonical 502 response bytes (`spec.md` §6), built once.
pub fn bad_gateway_response() -> &'static [u8] {
    BAD_GATEWAY_RESPONSE
        .get_or_init(|| {
            format!(
                "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                BAD_GATEWAY_BODY.len(),
                BAD_GATEWAY_BODY
            )
            .into_bytes()
        })
        .as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_public_http_root() {
        let buf = b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n";
        assert_eq!(classify(buf), Classification::PublicHttp);
    }

    #[test]
    fn classifies_notification_upgrade() {
        let buf = b"GET / HTTP/1.1\r\nHost: a.example\r\nAuthorization: secret\r\n\r\n";
        assert_eq!(classify(buf), Classification::NotificationUpgrade);
    }

    #[test]
    fn classifies_data_callback() {
        let buf = b"GET /42 HTTP/1.1\r\nHost: a.example\r\n\r\n";
        assert_eq!(classify(buf), Classification::DataCallback("42".to_string()));
    }

    #[test]
    fn classifies_public_http_arbitrary_path() {
        let buf = b"GET /hello HTTP/1.1\r\nHost: a.example\r\n\r\n";
        assert_eq!(classify(buf), Classification::PublicHttp);
    }

    #[test]
    fn classifies_multi_segment_path_as_http_not_callback() {
        let buf = b"GET /a/b HTTP/1.1\r\nHost: a.example\r\n\r\n";
        assert_eq!(classify(buf), Classification::PublicHttp);
    }

    #[test]
    fn classifies_raw_bytes() {
        let buf = &[0x01, 0x02, 0x03, 0x04];
        assert_eq!(classify(buf), Classification::PublicRaw);
    }

    #[test]
    fn bad_gateway_response_has_matching_content_length() {
        let resp = bad_gateway_response();
        let text = std::str::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        let len: usize = text
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(len, BAD_GATEWAY_BODY.len());
    }
}
