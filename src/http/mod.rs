//! Minimal HTTP/1.1 message types for the bridge transport
//!
//! Only what an MCP endpoint needs: request line, headers, a
//! `Content-Length` or chunked body, and fixed-length responses. Streaming
//! responses (SSE) write their own head via [`sse::stream_head`].

pub mod codec;
pub mod sse;

use std::borrow::Cow;
use std::collections::HashMap;

use thiserror::Error;

pub use codec::read_request;
pub use sse::SseFrame;

/// Upper bound on the request line plus headers
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Errors produced while decoding or encoding HTTP messages
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("header block exceeds {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,

    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Status to answer with, `None` when the peer is gone
    pub fn status(&self) -> Option<u16> {
        match self {
            CodecError::MalformedRequest(_) | CodecError::MalformedResponse(_) => Some(400),
            CodecError::HeadersTooLarge => Some(431),
            CodecError::BodyTooLarge { .. } => Some(413),
            CodecError::Io(_) => None,
        }
    }
}

/// A parsed HTTP request. Header names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Whether the connection should stay open after the response
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").map(str::to_ascii_lowercase);
        match connection.as_deref() {
            Some(c) if c.contains("close") => false,
            Some(c) if c.contains("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }

    /// True when the Accept header lists `media_type`
    pub fn accepts(&self, media_type: &str) -> bool {
        self.header("accept").is_some_and(|accept| {
            accept
                .split(',')
                .any(|part| part.split(';').next().unwrap_or("").trim() == media_type)
        })
    }
}

/// A fixed-length HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self::new(status).with_body("application/json", body.into().into_bytes())
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status).with_body("text/plain; charset=utf-8", body.into().into_bytes())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case("content-type"));
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Serialize as HTTP/1.1. `Content-Length` is always derived from the
    /// body; a caller-supplied one is dropped.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a complete response, as produced by [`HttpResponse::to_bytes`]
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let split = find_subslice(bytes, b"\r\n\r\n")
            .ok_or_else(|| CodecError::MalformedResponse("no header terminator".to_string()))?;
        let head = std::str::from_utf8(&bytes[..split])
            .map_err(|_| CodecError::MalformedResponse("head is not utf-8".to_string()))?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(CodecError::MalformedResponse(format!(
                "bad status line: {status_line}"
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| CodecError::MalformedResponse(format!("bad status: {status_line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        let mut content_length = None;
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::MalformedResponse(format!("bad header: {line}")))?;
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().ok();
                continue;
            }
            headers.push((name.to_string(), value.to_string()));
        }

        let rest = &bytes[split + 4..];
        let body = match content_length {
            Some(len) if len > rest.len() => {
                return Err(CodecError::MalformedResponse(format!(
                    "body truncated: declared {len}, got {}",
                    rest.len()
                )))
            }
            Some(len) => rest[..len].to_vec(),
            None => rest.to_vec(),
        };

        Ok(Self {
            status,
            reason,
            headers,
            body,
        })
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Split a request target into its path and decoded query parameters
pub fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };

    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let k = urlencoding::decode(&k.replace('+', " ")).map(|s| s.into_owned());
        let v = urlencoding::decode(&v.replace('+', " ")).map(|s| s.into_owned());
        if let (Ok(k), Ok(v)) = (k, v) {
            params.insert(k, v);
        }
    }

    let path = if path.is_empty() { "/" } else { path };
    (path.to_string(), params)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_round_trip() {
        let response = HttpResponse::json(200, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .with_header("Mcp-Session-Id", "abc")
            .with_header("Connection", "keep-alive");

        let parsed = HttpResponse::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_content_length_always_matches_body() {
        let response = HttpResponse::text(200, "héllo").with_header("Content-Length", "999");
        let bytes = response.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nhéllo"));
    }

    #[test]
    fn test_empty_body_round_trip() {
        let response = HttpResponse::new(202);
        let parsed = HttpResponse::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed.status, 202);
        assert_eq!(parsed.reason, "Accepted");
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_parse_rejects_truncated_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            HttpResponse::parse(raw),
            Err(CodecError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_split_target() {
        let (path, query) = split_target("/mcp?sessionId=a%20b&flag");
        assert_eq!(path, "/mcp");
        assert_eq!(query.get("sessionId").map(String::as_str), Some("a b"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));

        let (path, query) = split_target("?x=1");
        assert_eq!(path, "/");
        assert_eq!(query.len(), 1);
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut req = HttpRequest {
            version: "HTTP/1.1".to_string(),
            ..Default::default()
        };
        assert!(req.keep_alive());
        req.headers
            .insert("connection".to_string(), "Close".to_string());
        assert!(!req.keep_alive());

        let req = HttpRequest {
            version: "HTTP/1.0".to_string(),
            ..Default::default()
        };
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_accepts() {
        let mut req = HttpRequest::default();
        req.headers.insert(
            "accept".to_string(),
            "application/json, text/event-stream;q=0.9".to_string(),
        );
        assert!(req.accepts("text/event-stream"));
        assert!(req.accepts("application/json"));
        assert!(!req.accepts("text/html"));
    }
}
