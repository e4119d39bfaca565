//! Get current time tool

use std::collections::HashMap;

use crate::protocol::{Tool, ToolDescriptor};
use crate::tools::ToolError;
use crate::utils::time::get_current_time;

/// Tool for getting the current datetime and timestamp
pub struct GetCurrentTimeTool;

impl GetCurrentTimeTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GetCurrentTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for GetCurrentTimeTool {
    fn definition(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "get_current_time".to_string(),
            description: "Get the current datetime and timestamp".to_string(),
            category: "diagnostics".to_string(),
            parameters: vec![],
        }
    }

    fn execute(&self, _args: &HashMap<String, String>) -> Result<String, ToolError> {
        serde_json::to_string_pretty(&get_current_time()).map_err(|e| ToolError::Failed(e.to_string()))
    }
}
