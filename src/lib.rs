//! MCP Bridge Server
//!
//! Exposes an application's tools to AI clients over the Model Context
//! Protocol "Streamable HTTP" transport, with the legacy HTTP+SSE handshake
//! for older clients.
//!
//! # Features
//!
//! - **Streamable HTTP**: JSON-RPC over POST, server events over SSE
//! - **Sessions**: `Mcp-Session-Id` sessions with idle expiry
//! - **Resumable streams**: `Last-Event-ID` continues event numbering
//! - **Main-thread execution**: tools only run inside [`BridgeExecutor::tick`]
//! - **Access control**: optional API key and Origin allow-list
//!
//! # Modules
//!
//! - `config`: Server configuration (JSON file, environment)
//! - `http`: HTTP/1.1 request codec and SSE framing
//! - `protocol`: MCP and JSON-RPC protocol types
//! - `session`: Session table and SSE connection registry
//! - `server`: Listener, routing, request queue and executor
//! - `tools`: Tool registry seam and built-in diagnostic tools
//! - `utils`: Utility functions (timestamps, etc.)
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mcp_bridge::{McpHttpServer, ServerConfig, ServerInfo};
//! use mcp_bridge::tools::{register_builtin_tools, StaticToolRegistry};
//!
//! fn main() -> mcp_bridge::BridgeResult<()> {
//!     let mut registry = StaticToolRegistry::new();
//!     register_builtin_tools(&mut registry);
//!
//!     let server = McpHttpServer::new(ServerConfig::default(), ServerInfo::default());
//!     let mut executor = server.executor(registry)?;
//!     server.start()?;
//!
//!     loop {
//!         executor.tick();
//!         std::thread::sleep(Duration::from_millis(16));
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tools;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::ServerConfig;
pub use error::{BridgeError, BridgeResult};
pub use protocol::{McpTool, ServerInfo, Tool, ToolDescriptor, ToolParameter};
pub use server::{BridgeExecutor, McpHttpServer, ServerEvent};
pub use tools::{StaticToolRegistry, ToolError, ToolRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
