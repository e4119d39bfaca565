//! MCP (Model Context Protocol) types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::tools::ToolError;

/// Protocol versions this server accepts in `MCP-Protocol-Version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    V2024_11_05,
    V2025_03_26,
    #[default]
    V2025_06_18,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 3] = [
        ProtocolVersion::V2024_11_05,
        ProtocolVersion::V2025_03_26,
        ProtocolVersion::V2025_06_18,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "2024-11-05" => Some(Self::V2024_11_05),
            "2025-03-26" => Some(Self::V2025_03_26),
            "2025-06-18" => Some(Self::V2025_06_18),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2024_11_05 => "2024-11-05",
            Self::V2025_03_26 => "2025-03-26",
            Self::V2025_06_18 => "2025-06-18",
        }
    }

    /// Echo the client's version when supported, otherwise offer the latest
    pub fn negotiate(requested: Option<&str>) -> Self {
        requested.and_then(Self::parse).unwrap_or_default()
    }
}

/// One declared tool parameter
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    /// JSON-schema type name (`string`, `number`, `boolean`, `object`, `array`)
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type: param_type.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: &str, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// Tool as enumerated by a [`ToolRegistry`](crate::tools::ToolRegistry)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    /// JSON-schema object describing the parameter list
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                json!({ "type": p.param_type, "description": p.description }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }
}

/// MCP Tool definition as sent in `tools/list`
#[derive(Serialize, Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl From<&ToolDescriptor> for McpTool {
    fn from(d: &ToolDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            description: d.description.clone(),
            category: d.category.clone(),
            input_schema: d.input_schema(),
        }
    }
}

/// Server information for MCP handshake
#[derive(Clone, Debug)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: crate::NAME.to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Trait for tools held by a [`StaticToolRegistry`](crate::tools::StaticToolRegistry)
pub trait Tool {
    /// Get the tool definition for tools/list
    fn definition(&self) -> ToolDescriptor;

    /// Execute the tool with stringified arguments
    fn execute(&self, args: &HashMap<String, String>) -> Result<String, ToolError>;

    /// Get the tool name (convenience method)
    fn name(&self) -> String {
        self.definition().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version_parse() {
        assert_eq!(
            ProtocolVersion::parse("2025-03-26"),
            Some(ProtocolVersion::V2025_03_26)
        );
        assert_eq!(ProtocolVersion::parse("1999-01-01"), None);
        assert_eq!(
            ProtocolVersion::negotiate(Some("2024-11-05")).as_str(),
            "2024-11-05"
        );
        assert_eq!(ProtocolVersion::negotiate(None), ProtocolVersion::V2025_06_18);
    }

    #[test]
    fn test_input_schema() {
        let d = ToolDescriptor {
            name: "spawn_actor".to_string(),
            description: "Spawn an actor".to_string(),
            category: "level".to_string(),
            parameters: vec![
                ToolParameter::required("class", "string", "Actor class"),
                ToolParameter::optional("count", "number", "How many"),
            ],
        };
        let schema = d.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["count"]["type"], "number");
        assert_eq!(schema["required"], json!(["class"]));

        let tool = McpTool::from(&d);
        let v = serde_json::to_value(&tool).unwrap();
        assert_eq!(v["inputSchema"], schema);
        assert_eq!(v["category"], "level");
    }
}
