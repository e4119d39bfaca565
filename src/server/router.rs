//! Per-connection request handling
//!
//! Each accepted socket gets its own task running [`handle_connection`]. The
//! task reads requests, applies the validation pipeline, and then either
//! parks on its own reply channel while the executor works (POST) or turns
//! into an SSE writer (GET with `Accept: text/event-stream`). Nothing here
//! touches the tool registry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use super::queue::{DispatchOutcome, PendingRequest, ResponseRoute};
use super::{ServerEvent, Shared};
use crate::config::ServerConfig;
use crate::http::sse::{stream_head, KEEPALIVE_COMMENT};
use crate::http::{read_request, CodecError, HttpRequest, HttpResponse, SseFrame};
use crate::protocol::{JsonRpcError, JsonRpcReply, ProtocolVersion};
use crate::session::{ConnectionId, SseRegistration};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const LEGACY_SESSION_PARAM: &str = "sessionId";
const HEALTH_PATH: &str = "/health";

/// Why a request was refused before reaching the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnsupportedProtocolVersion(String),
    OriginNotAllowed(String),
    Unauthorized,
    SessionNotFound,
    MissingSession,
    NotFound,
    MethodNotAllowed,
}

impl Rejection {
    pub fn status(&self) -> u16 {
        match self {
            Rejection::UnsupportedProtocolVersion(_) | Rejection::MissingSession => 400,
            Rejection::Unauthorized => 401,
            Rejection::OriginNotAllowed(_) => 403,
            Rejection::SessionNotFound | Rejection::NotFound => 404,
            Rejection::MethodNotAllowed => 405,
        }
    }

    fn message(&self) -> String {
        match self {
            Rejection::UnsupportedProtocolVersion(v) => {
                format!("unsupported protocol version: {v}")
            }
            Rejection::OriginNotAllowed(o) => format!("origin not allowed: {o}"),
            Rejection::Unauthorized => "missing or invalid API key".to_string(),
            Rejection::SessionNotFound => "session not found".to_string(),
            Rejection::MissingSession => format!("{SESSION_HEADER} header required"),
            Rejection::NotFound => "not found".to_string(),
            Rejection::MethodNotAllowed => "method not allowed".to_string(),
        }
    }

    fn into_response(self) -> HttpResponse {
        let mut response =
            HttpResponse::json(self.status(), json!({ "error": self.message() }).to_string());
        match self {
            Rejection::Unauthorized => {
                response = response
                    .with_header("WWW-Authenticate", "Bearer")
                    .with_header("Connection", "close");
            }
            Rejection::MethodNotAllowed => {
                response = response.with_header("Allow", "GET, POST, DELETE, OPTIONS");
            }
            _ => {}
        }
        response
    }

    /// Auth failures end the connection
    fn closes_connection(&self) -> bool {
        matches!(self, Rejection::Unauthorized)
    }
}

/// Validation steps 1–3: protocol version, origin, API key
pub fn validate(config: &ServerConfig, req: &HttpRequest) -> Result<(), Rejection> {
    if let Some(version) = req.header(PROTOCOL_VERSION_HEADER) {
        if ProtocolVersion::parse(version).is_none() {
            return Err(Rejection::UnsupportedProtocolVersion(version.to_string()));
        }
    }

    if let Some(origin) = req.header("origin") {
        if !origin_allowed(config, origin) {
            return Err(Rejection::OriginNotAllowed(origin.to_string()));
        }
    }

    if let Some(expected) = config.effective_api_key() {
        if !api_key_matches(req, expected) {
            return Err(Rejection::Unauthorized);
        }
    }

    Ok(())
}

fn origin_allowed(config: &ServerConfig, origin: &str) -> bool {
    if config.allowed_origins.is_empty() {
        return true;
    }
    let origin = origin.trim_end_matches('/');
    config
        .allowed_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

fn api_key_matches(req: &HttpRequest, expected: &str) -> bool {
    let from_auth = req.header("authorization").map(|v| {
        let v = v.trim();
        match v.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => v,
        }
    });
    let from_key = req.header("x-api-key").map(str::trim);
    [from_auth, from_key]
        .into_iter()
        .flatten()
        .any(|candidate| candidate.as_bytes().ct_eq(expected.as_bytes()).into())
}

/// What to do after routing one request
enum Routed {
    Respond {
        response: HttpResponse,
        close: bool,
    },
    Stream {
        session_id: String,
        registration: SseRegistration,
        endpoint: Option<SseFrame>,
        cors: Vec<(String, String)>,
    },
}

/// Serve one accepted connection until it closes or the server stops
pub(crate) async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    connection_id: ConnectionId,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let config = shared.config.read().clone();

        let read = tokio::select! {
            r = timeout(config.request_timeout(), read_request(&mut reader, config.max_body_bytes)) => r,
            _ = shutdown.changed() => break,
        };

        let request = match read {
            Err(_) => {
                debug!(connection_id, "idle connection timed out");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(req))) => req,
            Ok(Err(e)) => {
                respond_codec_error(&mut writer, connection_id, e).await;
                break;
            }
        };

        debug!(connection_id, method = %request.method, path = %request.path, "request");
        let keep_alive = request.keep_alive();

        match route(&shared, &config, request, connection_id, &mut shutdown).await {
            Routed::Respond { response, close } => {
                let close = close || !keep_alive;
                let response = if close {
                    response.with_header("Connection", "close")
                } else {
                    response
                };
                if let Err(e) = writer.write_all(&response.to_bytes()).await {
                    debug!(connection_id, error = %e, "write failed");
                    break;
                }
                if close {
                    break;
                }
            }
            Routed::Stream {
                session_id,
                registration,
                endpoint,
                cors,
            } => {
                run_stream(
                    &shared,
                    &config,
                    connection_id,
                    session_id,
                    registration,
                    endpoint,
                    cors,
                    reader,
                    writer,
                    shutdown,
                )
                .await;
                return;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn respond_codec_error(writer: &mut OwnedWriteHalf, connection_id: ConnectionId, e: CodecError) {
    let Some(status) = e.status() else {
        debug!(connection_id, error = %e, "connection dropped");
        return;
    };
    warn!(connection_id, error = %e, "rejecting malformed request");
    let response = HttpResponse::json(status, json!({ "error": e.to_string() }).to_string())
        .with_header("Connection", "close");
    let _ = writer.write_all(&response.to_bytes()).await;
}

async fn route(
    shared: &Arc<Shared>,
    config: &ServerConfig,
    req: HttpRequest,
    connection_id: ConnectionId,
    shutdown: &mut watch::Receiver<bool>,
) -> Routed {
    let cors = cors_headers(config, &req);
    let respond = |response: HttpResponse| Routed::Respond {
        response: with_headers(response, &cors),
        close: false,
    };

    if req.method == "OPTIONS" {
        if let Some(origin) = req.header("origin") {
            if !origin_allowed(config, origin) {
                return reject(Rejection::OriginNotAllowed(origin.to_string()));
            }
        }
        return respond(
            HttpResponse::new(204)
                .with_header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
                .with_header(
                    "Access-Control-Allow-Headers",
                    "Content-Type, Authorization, X-API-Key, Mcp-Session-Id, MCP-Protocol-Version, Last-Event-ID",
                ),
        );
    }

    if let Err(rejection) = validate(config, &req) {
        warn!(connection_id, status = rejection.status(), reason = %rejection.message(), "request rejected");
        return reject(rejection);
    }

    if req.path == HEALTH_PATH && req.method == "GET" {
        return respond(HttpResponse::json(200, shared.health().to_string()));
    }
    if req.path != config.path {
        return reject(Rejection::NotFound);
    }

    match req.method.as_str() {
        "POST" => match handle_post(shared, config, req, connection_id, shutdown).await {
            Ok(response) => respond(response),
            Err(rejection) => reject(rejection),
        },
        "GET" if req.accepts("text/event-stream") => {
            match open_stream(shared, config, &req, connection_id) {
                Ok((session_id, registration, endpoint)) => Routed::Stream {
                    session_id,
                    registration,
                    endpoint,
                    cors: cors.clone(),
                },
                Err(rejection) => reject(rejection),
            }
        }
        "DELETE" => match close_session(shared, &req) {
            Ok(response) => respond(response),
            Err(rejection) => reject(rejection),
        },
        _ => reject(Rejection::MethodNotAllowed),
    }
}

fn reject(rejection: Rejection) -> Routed {
    let close = rejection.closes_connection();
    Routed::Respond {
        response: rejection.into_response(),
        close,
    }
}

async fn handle_post(
    shared: &Arc<Shared>,
    config: &ServerConfig,
    req: HttpRequest,
    connection_id: ConnectionId,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<HttpResponse, Rejection> {
    // Legacy clients POST to the URL announced in the `endpoint` event and
    // read their responses from the stream.
    if let Some(session_id) = req.query.get(LEGACY_SESSION_PARAM).cloned() {
        if !shared.sessions.touch(&session_id) {
            return Err(Rejection::SessionNotFound);
        }
        let pending = pending_request(&req, connection_id, Some(session_id), ResponseRoute::Stream);
        return Ok(match shared.queue.push(pending) {
            Ok(()) => HttpResponse::new(202),
            Err(_) => shutting_down_response(),
        });
    }

    // An unknown session may only re-initialize; everything else is 404.
    let session_id = req.header(SESSION_HEADER).map(str::to_string);
    if let Some(id) = &session_id {
        if !shared.sessions.touch(id) && !is_initialize(&req) {
            return Err(Rejection::SessionNotFound);
        }
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let pending = pending_request(&req, connection_id, session_id, ResponseRoute::Direct(reply_tx));
    if shared.queue.push(pending).is_err() {
        return Ok(shutting_down_response());
    }

    // Replies sent during shutdown win over the shutdown signal itself.
    let outcome = tokio::select! {
        biased;
        r = timeout(config.request_timeout(), reply_rx) => r,
        _ = shutdown.changed() => return Ok(shutting_down_response()),
    };

    let outcome: DispatchOutcome = match outcome {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => return Ok(shutting_down_response()),
        Err(_) => {
            warn!(connection_id, "timed out waiting for the executor");
            return Ok(HttpResponse::json(
                503,
                json!({ "error": "executor did not respond in time" }).to_string(),
            ));
        }
    };

    let mut response = match &outcome.reply {
        Some(reply) => HttpResponse::json(200, reply.to_json()),
        None => HttpResponse::new(202),
    };
    if let Some(id) = outcome.session_id {
        response = response.with_header(SESSION_HEADER, id);
    }
    Ok(response)
}

fn is_initialize(req: &HttpRequest) -> bool {
    serde_json::from_slice::<Value>(&req.body)
        .ok()
        .and_then(|v| v.get("method").and_then(Value::as_str).map(|m| m == "initialize"))
        .unwrap_or(false)
}

fn pending_request(
    req: &HttpRequest,
    connection_id: ConnectionId,
    session_id: Option<String>,
    route: ResponseRoute,
) -> PendingRequest {
    PendingRequest {
        connection_id,
        http_method: req.method.clone(),
        path: req.path.clone(),
        headers: req.headers.clone(),
        body: req.body_str().into_owned(),
        session_id,
        route,
    }
}

fn shutting_down_response() -> HttpResponse {
    let reply: JsonRpcReply = JsonRpcError::shutting_down(Value::Null).into();
    HttpResponse::json(503, reply.to_json())
        .with_header("Connection", "close")
}

fn open_stream(
    shared: &Arc<Shared>,
    config: &ServerConfig,
    req: &HttpRequest,
    connection_id: ConnectionId,
) -> Result<(String, SseRegistration, Option<SseFrame>), Rejection> {
    let (session_id, endpoint) = match req.header(SESSION_HEADER) {
        Some(id) => {
            if !shared.sessions.touch(id) {
                return Err(Rejection::SessionNotFound);
            }
            (id.to_string(), None)
        }
        None => {
            let session_id = shared.sessions.create().session_id;
            shared.emit(ServerEvent::SessionOpened {
                session_id: session_id.clone(),
            });
            let url = format!(
                "{}?{}={}",
                config.path,
                LEGACY_SESSION_PARAM,
                urlencoding::encode(&session_id)
            );
            (session_id, Some(SseFrame::endpoint(url)))
        }
    };

    let resume_after = last_event_id(req);

    let registration = shared.streams.register(connection_id, &session_id, resume_after);
    if let Some(old) = registration.superseded {
        info!(%session_id, old_connection = old, connection_id, "stream superseded");
        shared.emit(ServerEvent::StreamClosed {
            session_id: session_id.clone(),
            connection_id: old,
        });
    }
    info!(%session_id, connection_id, flushed = registration.flushed, "stream opened");
    shared.emit(ServerEvent::StreamOpened {
        session_id: session_id.clone(),
        connection_id,
    });
    Ok((session_id, registration, endpoint))
}

/// Parsed `Last-Event-ID`; ids outside `0..i32::MAX` cannot be continued
fn last_event_id(req: &HttpRequest) -> Option<i32> {
    req.header("last-event-id")
        .and_then(|v| v.trim().parse::<i32>().ok())
        .filter(|id| (0..i32::MAX).contains(id))
}

fn close_session(shared: &Arc<Shared>, req: &HttpRequest) -> Result<HttpResponse, Rejection> {
    let session_id = req.header(SESSION_HEADER).ok_or(Rejection::MissingSession)?;
    if !shared.sessions.close(session_id) {
        return Err(Rejection::SessionNotFound);
    }
    shared.streams.close_session(session_id);
    info!(%session_id, "session closed by client");
    shared.emit(ServerEvent::SessionClosed {
        session_id: session_id.to_string(),
    });
    Ok(HttpResponse::new(204))
}

/// Write the stream head, then frames from the outbox until the peer goes
/// away, the stream is superseded, or the server stops.
#[allow(clippy::too_many_arguments)]
async fn run_stream(
    shared: &Arc<Shared>,
    config: &ServerConfig,
    connection_id: ConnectionId,
    session_id: String,
    registration: SseRegistration,
    endpoint: Option<SseFrame>,
    cors: Vec<(String, String)>,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut outbox = registration.receiver;

    let mut head_headers = vec![(SESSION_HEADER.to_string(), session_id.clone())];
    head_headers.extend(cors);
    let mut preamble = stream_head(&head_headers);
    if let Some(frame) = endpoint {
        preamble.push_str(&frame.encode());
    }

    if let Err(e) = write_flush(&mut writer, preamble.as_bytes()).await {
        debug!(connection_id, error = %e, "stream head write failed");
        close_failed_stream(shared, connection_id, &session_id, None, &mut outbox);
        return;
    }

    let period = config.sse_keepalive();
    let mut keepalive = interval_at(Instant::now() + period, period);
    let mut scratch = [0u8; 512];

    loop {
        tokio::select! {
            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    // Superseded, closed by DELETE, or server shutdown.
                    debug!(connection_id, %session_id, "stream outbox closed");
                    break;
                };
                if let Err(e) = write_flush(&mut writer, frame.encode().as_bytes()).await {
                    warn!(connection_id, %session_id, error = %e, "stream write failed");
                    close_failed_stream(shared, connection_id, &session_id, Some(frame), &mut outbox);
                    return;
                }
                shared.sessions.touch(&session_id);
            }
            _ = keepalive.tick() => {
                if let Err(e) = write_flush(&mut writer, KEEPALIVE_COMMENT.as_bytes()).await {
                    debug!(connection_id, %session_id, error = %e, "keepalive write failed");
                    close_failed_stream(shared, connection_id, &session_id, None, &mut outbox);
                    return;
                }
                shared.sessions.touch(&session_id);
            }
            read = reader.read(&mut scratch) => {
                // Clients never send on a stream; EOF or error means it hung up.
                if matches!(read, Ok(0) | Err(_)) {
                    debug!(connection_id, %session_id, "stream peer disconnected");
                    close_failed_stream(shared, connection_id, &session_id, None, &mut outbox);
                    return;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if shared.streams.unregister(connection_id).is_some() {
        shared.emit(ServerEvent::StreamClosed {
            session_id: session_id.clone(),
            connection_id,
        });
    }
    let _ = writer.shutdown().await;
}

fn close_failed_stream(
    shared: &Arc<Shared>,
    connection_id: ConnectionId,
    session_id: &str,
    failed: Option<SseFrame>,
    outbox: &mut mpsc::UnboundedReceiver<SseFrame>,
) {
    if let Some(conn) = shared.streams.fail(connection_id, failed, outbox) {
        info!(
            connection_id,
            session_id,
            last_event_id = conn.last_event_id,
            requeued = shared.streams.pending_len(session_id),
            "stream closed"
        );
        shared.emit(ServerEvent::StreamClosed {
            session_id: session_id.to_string(),
            connection_id,
        });
    }
}

async fn write_flush(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

fn cors_headers(config: &ServerConfig, req: &HttpRequest) -> Vec<(String, String)> {
    match req.header("origin") {
        Some(origin) if origin_allowed(config, origin) => vec![
            ("Access-Control-Allow-Origin".to_string(), origin.to_string()),
            (
                "Access-Control-Expose-Headers".to_string(),
                SESSION_HEADER.to_string(),
            ),
            ("Vary".to_string(), "Origin".to_string()),
        ],
        _ => Vec::new(),
    }
}

fn with_headers(mut response: HttpResponse, headers: &[(String, String)]) -> HttpResponse {
    response.headers.extend(headers.iter().cloned());
    response
}

/// How long `stop` waits for connection tasks before aborting them
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "POST".to_string(),
            path: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn keyed(key: &str) -> ServerConfig {
        ServerConfig {
            api_key: Some(key.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_by_default() {
        assert_eq!(validate(&ServerConfig::default(), &request(&[])), Ok(()));
    }

    #[test]
    fn test_protocol_version() {
        let config = ServerConfig::default();
        assert_eq!(
            validate(&config, &request(&[("MCP-Protocol-Version", "2025-06-18")])),
            Ok(())
        );
        let err = validate(&config, &request(&[("MCP-Protocol-Version", "1.0")])).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_origin_allow_list() {
        let config = ServerConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            ..Default::default()
        };
        assert_eq!(
            validate(&config, &request(&[("Origin", "http://localhost:3000/")])),
            Ok(())
        );
        let err = validate(&config, &request(&[("Origin", "https://evil.example")])).unwrap_err();
        assert_eq!(err.status(), 403);
        // No Origin header: not a browser, nothing to check.
        assert_eq!(validate(&config, &request(&[])), Ok(()));
    }

    #[test]
    fn test_api_key_forms() {
        let config = keyed("secret");
        for headers in [
            [("Authorization", "secret")],
            [("Authorization", "Bearer secret")],
            [("X-API-Key", "secret")],
        ] {
            assert_eq!(validate(&config, &request(&headers)), Ok(()));
        }
        assert_eq!(
            validate(&config, &request(&[])),
            Err(Rejection::Unauthorized)
        );
        assert_eq!(
            validate(&config, &request(&[("Authorization", "Bearer wrong")])),
            Err(Rejection::Unauthorized)
        );
    }

    #[test]
    fn test_version_checked_before_auth() {
        let config = keyed("secret");
        let err = validate(&config, &request(&[("MCP-Protocol-Version", "bogus")])).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_unauthorized_response_closes() {
        let rejection = Rejection::Unauthorized;
        assert!(rejection.closes_connection());
        let response = rejection.into_response();
        assert_eq!(response.status, 401);
        assert_eq!(response.header("connection"), Some("close"));
        assert_eq!(response.header("www-authenticate"), Some("Bearer"));
    }

    #[test]
    fn test_api_key_must_match_exactly() {
        let config = keyed("secret");
        for key in ["secre", "secrets", "Secret", "secreT", ""] {
            assert_eq!(
                validate(&config, &request(&[("X-API-Key", key)])),
                Err(Rejection::Unauthorized),
                "{key:?} accepted"
            );
        }
        // The configured key is trimmed like the presented one.
        assert_eq!(
            validate(&keyed(" secret\n"), &request(&[("X-API-Key", "secret")])),
            Ok(())
        );
        // Either header may carry the key.
        assert_eq!(
            validate(
                &config,
                &request(&[("Authorization", "Bearer wrong"), ("X-API-Key", "secret")])
            ),
            Ok(())
        );
    }

    #[test]
    fn test_last_event_id_header() {
        assert_eq!(last_event_id(&request(&[("Last-Event-ID", " 41 ")])), Some(41));
        assert_eq!(last_event_id(&request(&[])), None);
        for bad in ["-1", "abc", "2147483647", "99999999999"] {
            assert_eq!(last_event_id(&request(&[("Last-Event-ID", bad)])), None, "{bad}");
        }
        assert_eq!(
            last_event_id(&request(&[("Last-Event-ID", "2147483646")])),
            Some(i32::MAX - 1)
        );
    }
}
