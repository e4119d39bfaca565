//! Server lifecycle events
//!
//! Observers call [`McpHttpServer::subscribe`](super::McpHttpServer::subscribe)
//! and drop the receiver to unsubscribe. Slow observers lag rather than
//! block the server.

use std::net::SocketAddr;

use serde::Serialize;

use crate::session::ConnectionId;

/// Channel capacity; observers that fall this far behind miss events
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Started {
        addr: SocketAddr,
    },
    Stopped,
    SessionOpened {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    StreamOpened {
        session_id: String,
        connection_id: ConnectionId,
    },
    StreamClosed {
        session_id: String,
        connection_id: ConnectionId,
    },
}
