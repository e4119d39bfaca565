//! Echo tool

use std::collections::HashMap;

use crate::protocol::{Tool, ToolDescriptor, ToolParameter};
use crate::tools::ToolError;

/// Returns its `message` argument, optionally repeated
pub struct EchoTool;

impl EchoTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for EchoTool {
    fn definition(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "echo".to_string(),
            description: "Echo a message back to the caller".to_string(),
            category: "diagnostics".to_string(),
            parameters: vec![
                ToolParameter::required("message", "string", "Text to return"),
                ToolParameter::optional("repeat", "number", "Number of repetitions (default 1)"),
            ],
        }
    }

    fn execute(&self, args: &HashMap<String, String>) -> Result<String, ToolError> {
        let message = args
            .get("message")
            .ok_or_else(|| ToolError::InvalidParams("missing 'message'".to_string()))?;
        let repeat = match args.get("repeat") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ToolError::InvalidParams(format!("repeat: {v}")))?,
            None => 1,
        };
        if repeat > 64 {
            return Err(ToolError::Failed("repeat must be at most 64".to_string()));
        }
        Ok(message.repeat(repeat))
    }
}
