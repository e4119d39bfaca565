//! Tool registry seam
//!
//! The bridge never knows what a tool does. It only sees the [`ToolRegistry`]
//! interface: enumerate the enabled tools and execute one by name with
//! string arguments. Editor hosts implement the trait over their own tool
//! tables; [`StaticToolRegistry`] is a ready-made implementation holding
//! boxed [`Tool`]s.
//!
//! Registries are only ever touched from the executor thread, so neither the
//! trait nor [`Tool`] requires `Send` or `Sync`.

pub mod diagnostics;

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::protocol::{Tool, ToolDescriptor};

pub use diagnostics::{EchoTool, GetCurrentTimeTool};

/// Failure raised by a tool or a registry
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

/// External collaborator providing and executing tools
pub trait ToolRegistry {
    fn list_enabled_tools(&self) -> Vec<ToolDescriptor>;

    fn execute(&self, name: &str, args: &HashMap<String, String>) -> Result<String, ToolError>;
}

/// Registry backed by an in-memory table of boxed tools
#[derive(Default)]
pub struct StaticToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
    disabled: HashSet<String>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name
    pub fn register_tool(&mut self, tool: Box<dyn Tool>) -> &mut Self {
        let name = tool.name();
        self.tools.insert(name, tool);
        self
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(name);
        } else {
            self.disabled.insert(name.to_string());
        }
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    fn enabled(&self, name: &str) -> Option<&dyn Tool> {
        if self.disabled.contains(name) {
            return None;
        }
        self.tools.get(name).map(|t| t.as_ref())
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn list_enabled_tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|(name, _)| !self.disabled.contains(*name))
            .map(|(_, t)| t.definition())
            .collect()
    }

    fn execute(&self, name: &str, args: &HashMap<String, String>) -> Result<String, ToolError> {
        let tool = self
            .enabled(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(args)
    }
}

/// Register the built-in diagnostic tools
pub fn register_builtin_tools(registry: &mut StaticToolRegistry) {
    registry.register_tool(Box::new(EchoTool::new()));
    registry.register_tool(Box::new(GetCurrentTimeTool::new()));
}
