//! MCP bridge server
//!
//! [`McpHttpServer`] owns the listener thread and the shared registries.
//! Network tasks on that thread only parse, validate and queue; tools run in
//! the [`BridgeExecutor`] the host ticks on its own thread.

mod dispatcher;
mod events;
mod executor;
mod handlers;
mod queue;
mod router;

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{JsonRpcError, ServerInfo};
use crate::session::{ConnectionId, SessionTable, SseRegistry};
use crate::tools::ToolRegistry;

pub use dispatcher::{Dispatcher, Method};
pub use events::{ServerEvent, EVENT_CAPACITY};
pub use executor::BridgeExecutor;
pub use handlers::*;
pub use queue::{DispatchOutcome, PendingRequest, RequestQueue, ResponseRoute};
pub use router::{validate, Rejection, PROTOCOL_VERSION_HEADER, SESSION_HEADER};

/// Upper bound between session sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// State shared by the listener, connection tasks and the executor
pub(crate) struct Shared {
    pub(crate) config: RwLock<ServerConfig>,
    pub(crate) server_info: ServerInfo,
    pub(crate) sessions: SessionTable,
    pub(crate) streams: SseRegistry,
    pub(crate) queue: RequestQueue,
    pub(crate) executor_attached: AtomicBool,
    events: broadcast::Sender<ServerEvent>,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn new(config: ServerConfig, server_info: ServerInfo) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: RwLock::new(config),
            server_info,
            sessions: SessionTable::new(),
            streams: SseRegistry::new(),
            queue: RequestQueue::new(),
            executor_attached: AtomicBool::new(false),
            events,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Publish an event; having no subscribers is fine
    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn health(&self) -> Value {
        json!({
            "status": "ok",
            "name": self.server_info.name,
            "version": self.server_info.version,
            "sessions": self.sessions.len(),
            "streams": self.streams.len(),
            "queued": self.queue.len(),
        })
    }
}

struct ListenerHandle {
    thread: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// Streamable HTTP endpoint for MCP clients
pub struct McpHttpServer {
    shared: Arc<Shared>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl McpHttpServer {
    pub fn new(config: ServerConfig, server_info: ServerInfo) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, server_info)),
            listener: Mutex::new(None),
        }
    }

    /// Bind and start accepting connections.
    ///
    /// A disabled configuration is not an error: the server simply stays
    /// stopped. Bind failures leave the server stopped and are returned.
    pub fn start(&self) -> BridgeResult<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let config = self.shared.config.read().clone();
        if !config.enabled {
            info!("bridge disabled, not starting listener");
            return Ok(());
        }
        config.validate()?;

        let addr = config.socket_addr();
        let std_listener =
            StdTcpListener::bind(addr).map_err(|source| BridgeError::Bind { addr, source })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.shared.queue.reopen();
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("mcp-bridge-listener".to_string())
            .spawn(move || runtime.block_on(accept_loop(shared, std_listener, shutdown_rx)))?;

        *listener = Some(ListenerHandle {
            thread,
            shutdown: shutdown_tx,
            local_addr,
        });

        info!(addr = %local_addr, path = %config.path, "MCP bridge listening");
        self.shared.emit(ServerEvent::Started { addr: local_addr });
        Ok(())
    }

    /// Stop accepting, fail queued requests, close streams and join the
    /// listener thread. A no-op when not running.
    pub fn stop(&self) {
        let Some(handle) = self.listener.lock().take() else {
            return;
        };

        let drained = self.shared.queue.close();
        let failed = drained.len();
        for pending in drained {
            if let ResponseRoute::Direct(reply_tx) = pending.route {
                let id = serde_json::from_str::<Value>(&pending.body)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                let _ = reply_tx.send(DispatchOutcome::reply(
                    JsonRpcError::shutting_down(id),
                    pending.session_id,
                ));
            }
        }
        if failed > 0 {
            info!(failed, "failed queued requests on shutdown");
        }

        self.shared.streams.close_all();
        let _ = handle.shutdown.send(true);
        if handle.thread.join().is_err() {
            error!("listener thread panicked");
        }

        info!(addr = %handle.local_addr, "MCP bridge stopped");
        self.shared.emit(ServerEvent::Stopped);
    }

    pub fn restart(&self) -> BridgeResult<()> {
        self.stop();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Bound address while running; reflects the real port when configured
    /// with port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|h| h.local_addr)
    }

    /// Attach the executor that will run tools. Only one may be live.
    pub fn executor<R: ToolRegistry>(&self, registry: R) -> BridgeResult<BridgeExecutor<R>> {
        if self.shared.executor_attached.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::ExecutorAttached);
        }
        Ok(BridgeExecutor::new(Arc::clone(&self.shared), registry))
    }

    /// Lifecycle events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> ServerConfig {
        self.shared.config.read().clone()
    }

    pub fn set_enabled(&self, enabled: bool) -> BridgeResult<()> {
        self.shared.config.write().enabled = enabled;
        match (enabled, self.is_running()) {
            (false, true) => self.stop(),
            (true, false) => self.start()?,
            _ => {}
        }
        Ok(())
    }

    /// Change the port, rebinding if the server is running
    pub fn set_port(&self, port: u16) -> BridgeResult<()> {
        let changed = {
            let mut config = self.shared.config.write();
            let changed = config.port != port;
            config.port = port;
            changed
        };
        if changed && self.is_running() {
            self.restart()?;
        }
        Ok(())
    }

    /// Takes effect on the next request; `None` or empty disables auth
    pub fn set_api_key(&self, api_key: Option<String>) {
        self.shared.config.write().api_key = api_key;
    }

    pub fn set_allowed_origins(&self, origins: Vec<String>) {
        self.shared.config.write().allowed_origins = origins;
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }

    pub fn queued_requests(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for McpHttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    std_listener: StdTcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to register listener with runtime");
            return;
        }
    };

    let idle = shared.config.read().session_idle_timeout();
    let mut sweep = interval((idle / 4).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection_id = shared.next_connection_id();
                    debug!(connection_id, %peer, "accepted");
                    tasks.spawn(router::handle_connection(
                        Arc::clone(&shared),
                        stream,
                        connection_id,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = sweep.tick() => sweep_sessions(&shared),
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    let remaining = tasks.len();
    let drain = async { while tasks.join_next().await.is_some() {} };
    if timeout(router::SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(remaining, "connection tasks did not finish in time, aborting");
        tasks.shutdown().await;
    }
}

fn sweep_sessions(shared: &Shared) {
    let idle = shared.config.read().session_idle_timeout();
    for session_id in shared.sessions.sweep_expired(idle) {
        if let Some(connection_id) = shared.streams.close_session(&session_id) {
            shared.emit(ServerEvent::StreamClosed {
                session_id: session_id.clone(),
                connection_id,
            });
        }
        info!(%session_id, "session expired");
        shared.emit(ServerEvent::SessionClosed { session_id });
    }
    // Session ids are never reused, so a buffer for an unknown id is dead.
    for session_id in shared.streams.pending_sessions() {
        if !shared.sessions.is_valid(&session_id) {
            let dropped = shared.streams.discard_pending(&session_id);
            debug!(%session_id, dropped, "discarded responses for closed session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::StaticToolRegistry;

    fn ephemeral() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_stop() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let mut events = server.subscribe();

        server.start().unwrap();
        assert!(server.is_running());
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(server.start(), Err(BridgeError::AlreadyRunning)));

        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);

        assert_eq!(events.try_recv().unwrap(), ServerEvent::Started { addr });
        assert_eq!(events.try_recv().unwrap(), ServerEvent::Stopped);
    }

    #[test]
    fn test_disabled_does_not_bind() {
        let config = ServerConfig {
            enabled: false,
            ..ephemeral()
        };
        let server = McpHttpServer::new(config, ServerInfo::default());
        server.start().unwrap();
        assert!(!server.is_running());

        server.set_enabled(true).unwrap();
        assert!(server.is_running());
        server.set_enabled(false).unwrap();
        assert!(!server.is_running());
    }

    #[test]
    fn test_bind_failure_leaves_server_stopped() {
        let first = McpHttpServer::new(ephemeral(), ServerInfo::default());
        first.start().unwrap();
        let port = first.local_addr().unwrap().port();

        let config = ServerConfig {
            port,
            ..Default::default()
        };
        let second = McpHttpServer::new(config, ServerInfo::default());
        assert!(matches!(second.start(), Err(BridgeError::Bind { .. })));
        assert!(!second.is_running());
    }

    #[test]
    fn test_single_executor() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let executor = server.executor(StaticToolRegistry::new()).unwrap();
        assert!(matches!(
            server.executor(StaticToolRegistry::new()),
            Err(BridgeError::ExecutorAttached)
        ));
        drop(executor);
        assert!(server.executor(StaticToolRegistry::new()).is_ok());
    }

    #[test]
    fn test_tick_on_empty_queue() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let mut executor = server.executor(StaticToolRegistry::new()).unwrap();
        assert_eq!(executor.tick(), 0);
    }

    #[test]
    fn test_sweep_closes_expired_sessions() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let session = server.shared.sessions.create();
        let _stream = server.shared.streams.register(7, &session.session_id, None);
        let mut events = server.subscribe();

        server.shared.config.write().session_idle_timeout_secs = 0;
        std::thread::sleep(Duration::from_millis(5));
        sweep_sessions(&server.shared);

        assert_eq!(server.session_count(), 0);
        assert_eq!(server.stream_count(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            ServerEvent::StreamClosed {
                session_id: session.session_id.clone(),
                connection_id: 7
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ServerEvent::SessionClosed {
                session_id: session.session_id
            }
        );
    }

    fn legacy_ping(session_id: &str) -> PendingRequest {
        PendingRequest {
            connection_id: 1,
            http_method: "POST".to_string(),
            path: "/mcp".to_string(),
            headers: Default::default(),
            body: r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string(),
            session_id: Some(session_id.to_string()),
            route: ResponseRoute::Stream,
        }
    }

    #[test]
    fn test_stream_reply_for_closed_session_is_dropped() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let mut executor = server.executor(StaticToolRegistry::new()).unwrap();
        let live = server.shared.sessions.create().session_id;
        let gone = server.shared.sessions.create().session_id;

        server.shared.queue.push(legacy_ping(&live)).unwrap();
        server.shared.queue.push(legacy_ping(&gone)).unwrap();
        // DELETE lands while both requests are still queued.
        assert!(server.shared.sessions.close(&gone));
        server.shared.streams.close_session(&gone);

        assert_eq!(executor.tick(), 2);
        assert_eq!(server.shared.streams.pending_len(&live), 1);
        assert_eq!(server.shared.streams.pending_len(&gone), 0);
    }

    #[test]
    fn test_sweep_discards_buffers_of_closed_sessions() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let live = server.shared.sessions.create().session_id;
        server.shared.streams.deliver(&live, "kept".to_string());
        server.shared.streams.deliver("closed-earlier", "late".to_string());

        sweep_sessions(&server.shared);

        assert_eq!(server.shared.streams.pending_len(&live), 1);
        assert_eq!(server.shared.streams.pending_len("closed-earlier"), 0);
        assert_eq!(server.shared.streams.pending_sessions(), vec![live]);
    }

    #[test]
    fn test_health() {
        let server = McpHttpServer::new(ephemeral(), ServerInfo::default());
        let health = server.shared.health();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sessions"], 0);
    }
}
