//! Diagnostic tools
//!
//! Tools that need no editor attached; useful for checking a client setup.

mod echo;
mod get_current_time;

pub use echo::EchoTool;
pub use get_current_time::GetCurrentTimeTool;
