//! JSON-RPC method dispatch
//!
//! Runs only inside [`BridgeExecutor::tick`](super::BridgeExecutor::tick),
//! the one place tools may execute.

use std::panic::{self, AssertUnwindSafe};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::handlers::{extract_tool_name, stringify_arguments, text_response};
use super::queue::DispatchOutcome;
use crate::protocol::{
    JsonRpcError, JsonRpcReply, JsonRpcRequest, JsonRpcResponse, McpTool, ProtocolVersion,
    ServerInfo, INTERNAL_ERROR,
};
use crate::session::SessionTable;
use crate::tools::{ToolError, ToolRegistry};

/// Methods the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    ToolsList,
    ToolsCall,
    Ping,
    Notification,
    Unknown,
}

impl Method {
    pub fn from_name(name: &str) -> Self {
        match name {
            "initialize" => Method::Initialize,
            "tools/list" => Method::ToolsList,
            "tools/call" => Method::ToolsCall,
            "ping" => Method::Ping,
            n if n.starts_with("notifications/") => Method::Notification,
            _ => Method::Unknown,
        }
    }
}

pub struct Dispatcher<'a> {
    registry: &'a dyn ToolRegistry,
    sessions: &'a SessionTable,
    server_info: &'a ServerInfo,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a dyn ToolRegistry,
        sessions: &'a SessionTable,
        server_info: &'a ServerInfo,
    ) -> Self {
        Self {
            registry,
            sessions,
            server_info,
        }
    }

    /// Handle one request body received under `session_id`
    pub fn dispatch(&self, body: &str, session_id: Option<&str>) -> DispatchOutcome {
        let session = session_id.map(str::to_string);
        let request = match JsonRpcRequest::parse(body) {
            Ok(req) => req,
            Err(error) => return DispatchOutcome::reply(error, session),
        };

        let id = request.id_or_null();
        let notification = request.is_notification();
        debug!(method = %request.method, notification, "dispatching");

        let mut outcome = match Method::from_name(&request.method) {
            Method::Initialize => self.handle_initialize(id, request.params.as_ref(), session_id),
            Method::ToolsList => DispatchOutcome::reply(self.handle_tools_list(id), session),
            Method::ToolsCall => {
                DispatchOutcome::reply(self.handle_tool_call(id, request.params), session)
            }
            Method::Ping => DispatchOutcome::reply(JsonRpcResponse::new(id, json!({})), session),
            Method::Notification => DispatchOutcome::notification(session),
            Method::Unknown => {
                DispatchOutcome::reply(JsonRpcError::method_not_found(id, request.method), session)
            }
        };

        if notification {
            outcome.reply = None;
        }
        outcome
    }

    fn handle_initialize(
        &self,
        id: Value,
        params: Option<&Value>,
        session_id: Option<&str>,
    ) -> DispatchOutcome {
        let (session, created) = self.sessions.ensure(session_id);
        let session_id = session.session_id;

        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = ProtocolVersion::negotiate(requested);

        let result = json!({
            "protocolVersion": version.as_str(),
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "serverInfo": {
                "name": self.server_info.name,
                "version": self.server_info.version
            },
            "sessionId": session_id
        });

        DispatchOutcome {
            reply: Some(JsonRpcResponse::new(id, result).into()),
            session_id: Some(session_id),
            created_session: created,
        }
    }

    fn handle_tools_list(&self, id: Value) -> JsonRpcReply {
        let tools: Vec<McpTool> = self
            .registry
            .list_enabled_tools()
            .iter()
            .map(McpTool::from)
            .collect();
        JsonRpcResponse::new(id, json!({ "tools": tools })).into()
    }

    fn handle_tool_call(&self, id: Value, params: Option<Value>) -> JsonRpcReply {
        let Some(params) = params else {
            return JsonRpcError::invalid_params(id, "Missing parameters".to_string()).into();
        };
        let Some(tool_name) = extract_tool_name(&params) else {
            return JsonRpcError::invalid_params(id, "Missing tool name".to_string()).into();
        };

        let Some(descriptor) = self
            .registry
            .list_enabled_tools()
            .into_iter()
            .find(|t| t.name == tool_name)
        else {
            return JsonRpcError::tool_not_found(id, tool_name.to_string()).into();
        };

        let empty = Map::new();
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return JsonRpcError::invalid_params(id, "arguments must be an object".to_string())
                    .into()
            }
        };
        let args = stringify_arguments(arguments);

        let missing: Vec<&str> = descriptor
            .parameters
            .iter()
            .filter(|p| p.required && !args.contains_key(&p.name))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return JsonRpcError::invalid_params(
                id,
                format!("missing required parameter(s): {}", missing.join(", ")),
            )
            .into();
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.execute(tool_name, &args)
        }));

        match result {
            Ok(Ok(text)) => JsonRpcResponse::new(id, text_response(text)).into(),
            Ok(Err(ToolError::NotFound(name))) => JsonRpcError::tool_not_found(id, name).into(),
            Ok(Err(ToolError::InvalidParams(details))) => {
                JsonRpcError::invalid_params(id, details).into()
            }
            Ok(Err(ToolError::Failed(details))) => {
                warn!(tool = tool_name, error = %details, "tool failed");
                JsonRpcError::new(
                    id,
                    INTERNAL_ERROR,
                    "Tool execution error".to_string(),
                    Some(json!({"tool": tool_name, "details": details})),
                )
                .into()
            }
            Err(payload) => {
                let details = panic_message(payload.as_ref());
                warn!(tool = tool_name, error = %details, "tool panicked");
                JsonRpcError::new(
                    id,
                    INTERNAL_ERROR,
                    "Tool execution error".to_string(),
                    Some(json!({"tool": tool_name, "details": details})),
                )
                .into()
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
