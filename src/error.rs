//! Error types for the bridge server

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::http::CodecError;
use crate::tools::ToolError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Crate-level error
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The listener socket could not be bound; the server stays stopped.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("tool execution failed: {0}")]
    Tool(#[from] ToolError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("an executor is already attached to this server")]
    ExecutorAttached,
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Config(e.to_string())
    }
}
