//! Session management for MCP clients
//!
//! Two registries, each behind its own lock:
//! - [`SessionTable`]: logical client sessions keyed by `Mcp-Session-Id`
//! - [`SseRegistry`]: open event streams, their event counters, and the
//!   responses buffered for sessions that have no stream yet

pub mod sse;
pub mod table;

pub use sse::{ConnectionId, Delivery, SseConnection, SseRegistration, SseRegistry};
pub use table::{Session, SessionTable};
