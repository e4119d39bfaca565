//! Server-Sent Events wire format

/// One SSE frame
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<i32>,
}

impl SseFrame {
    /// A JSON-RPC message frame carrying an event id
    pub fn message(id: i32, data: impl Into<String>) -> Self {
        Self {
            event: Some("message".to_string()),
            data: data.into(),
            id: Some(id),
        }
    }

    /// Legacy HTTP+SSE handshake frame telling the client where to POST
    pub fn endpoint(url: impl Into<String>) -> Self {
        Self {
            event: Some("endpoint".to_string()),
            data: url.into(),
            id: None,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        // Multi-line payloads need one data field per line.
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
        if let Some(id) = self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        out.push('\n');
        out
    }

    /// Parse a single encoded frame (without the trailing blank line handling
    /// of a full stream). Comment lines are ignored.
    pub fn decode(text: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        let mut id = None;
        for line in text.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                "id" => id = value.parse().ok(),
                _ => {}
            }
        }
        if event.is_none() && data.is_empty() && id.is_none() {
            return None;
        }
        Some(Self {
            event,
            data: data.join("\n"),
            id,
        })
    }
}

/// Keep-alive comment; also how dead peers are detected between events
pub const KEEPALIVE_COMMENT: &str = ": keepalive\n\n";

/// Response head for an event stream (no Content-Length, body is unbounded)
pub fn stream_head(extra_headers: &[(String, String)]) -> String {
    let mut head = String::from(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n",
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_frame_layout() {
        let frame = SseFrame::message(3, r#"{"id":1}"#);
        assert_eq!(frame.encode(), "event: message\ndata: {\"id\":1}\nid: 3\n\n");
    }

    #[test]
    fn test_multiline_data() {
        let frame = SseFrame::message(1, "a\nb");
        let encoded = frame.encode();
        assert_eq!(encoded, "event: message\ndata: a\ndata: b\nid: 1\n\n");
        assert_eq!(SseFrame::decode(&encoded), Some(frame));
    }

    #[test]
    fn test_decode_ignores_comments() {
        assert_eq!(SseFrame::decode(KEEPALIVE_COMMENT), None);
        let frame = SseFrame::decode(": hi\nevent: endpoint\ndata: /?sessionId=x\n\n").unwrap();
        assert_eq!(frame, SseFrame::endpoint("/?sessionId=x"));
    }

    #[test]
    fn test_stream_head() {
        let head = stream_head(&[("Mcp-Session-Id".to_string(), "s".to_string())]);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/event-stream\r\n"));
        assert!(head.contains("Mcp-Session-Id: s\r\n"));
        assert!(!head.to_ascii_lowercase().contains("content-length"));
        assert!(head.ends_with("\r\n\r\n"));
    }
}
