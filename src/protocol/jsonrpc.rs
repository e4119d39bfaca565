//! JSON-RPC 2.0 protocol types

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 Request
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Parse a request body, validating the envelope.
    ///
    /// Failures come back as ready-to-send error responses carrying whatever
    /// id could be recovered from the body.
    pub fn parse(body: &str) -> Result<Self, JsonRpcError> {
        if body.trim().is_empty() {
            return Err(JsonRpcError::invalid_request(
                Value::Null,
                "empty request body".to_string(),
            ));
        }

        let value: Value = serde_json::from_str(body)
            .map_err(|e| JsonRpcError::parse_error(Value::Null, e.to_string()))?;

        let Value::Object(ref obj) = value else {
            return Err(JsonRpcError::invalid_request(
                Value::Null,
                "request must be a JSON object".to_string(),
            ));
        };

        let id = obj.get("id").cloned().unwrap_or(Value::Null);

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(JsonRpcError::invalid_request(
                id,
                "jsonrpc must be '2.0'".to_string(),
            ));
        }
        if !obj.get("method").is_some_and(Value::is_string) {
            return Err(JsonRpcError::invalid_request(
                id,
                "method must be a string".to_string(),
            ));
        }

        serde_json::from_value(value).map_err(|e| JsonRpcError::invalid_request(id, e.to_string()))
    }

    /// Absent and explicit `null` ids both mark a notification
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    pub fn id_or_null(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// JSON-RPC 2.0 Success Response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Value,
}

impl JsonRpcResponse {
    /// Create a new success response
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
        }
    }
}

/// JSON-RPC 2.0 Error Response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub id: Value,
    pub error: ErrorObject,
}

impl JsonRpcError {
    /// Create a new error response
    pub fn new(id: Value, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            error: ErrorObject {
                code,
                message,
                data,
            },
        }
    }

    pub fn parse_error(id: Value, details: String) -> Self {
        Self::new(
            id,
            PARSE_ERROR,
            "Parse error".to_string(),
            Some(json!({"details": details})),
        )
    }

    pub fn invalid_request(id: Value, details: String) -> Self {
        Self::new(
            id,
            INVALID_REQUEST,
            "Invalid Request".to_string(),
            Some(json!({"details": details})),
        )
    }

    pub fn method_not_found(id: Value, method: String) -> Self {
        Self::new(
            id,
            METHOD_NOT_FOUND,
            "Method not found".to_string(),
            Some(json!({"method": method})),
        )
    }

    pub fn tool_not_found(id: Value, tool: String) -> Self {
        Self::new(
            id,
            METHOD_NOT_FOUND,
            "Tool not found".to_string(),
            Some(json!({"tool": tool})),
        )
    }

    pub fn invalid_params(id: Value, details: String) -> Self {
        Self::new(
            id,
            INVALID_PARAMS,
            "Invalid params".to_string(),
            Some(json!({"details": details})),
        )
    }

    pub fn internal_error(id: Value, details: String) -> Self {
        Self::new(
            id,
            INTERNAL_ERROR,
            "Internal error".to_string(),
            Some(json!({"details": details})),
        )
    }

    pub fn shutting_down(id: Value) -> Self {
        Self::new(
            id,
            INTERNAL_ERROR,
            "Server shutting down".to_string(),
            None,
        )
    }
}

/// JSON-RPC 2.0 Error Object
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Either kind of response, serialized without a tag
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcReply {
    Success(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcReply {
    pub fn id(&self) -> &Value {
        match self {
            JsonRpcReply::Success(r) => &r.id,
            JsonRpcReply::Error(e) => &e.id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JsonRpcReply::Error(_))
    }

    pub fn to_json(&self) -> String {
        // Both variants are plain Value trees, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<JsonRpcResponse> for JsonRpcReply {
    fn from(r: JsonRpcResponse) -> Self {
        JsonRpcReply::Success(r)
    }
}

impl From<JsonRpcError> for JsonRpcReply {
    fn from(e: JsonRpcError) -> Self {
        JsonRpcReply::Error(e)
    }
}
