//! JSON-RPC 2.0 消息

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// 协议层错误
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// 已解析的请求；`id` 为 None 表示通知
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// 解析一行 JSON
///
/// 失败时返回可直接发送的错误响应（无法确定 id 时使用 `null`）。
pub fn parse_line(line: &str) -> Result<Request, Value> {
    let message: Value = serde_json::from_str(line)
        .map_err(|e| error_response(Value::Null, &RpcError::new(PARSE_ERROR, e.to_string())))?;
    parse_message(message)
}

fn parse_message(message: Value) -> Result<Request, Value> {
    let Value::Object(mut map) = message else {
        return Err(error_response(
            Value::Null,
            &RpcError::new(INVALID_REQUEST, "Invalid request payload"),
        ));
    };
    let id = map.remove("id").filter(|id| !id.is_null());
    let reply_id = id.clone().unwrap_or(Value::Null);

    if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(error_response(
            reply_id,
            &RpcError::new(INVALID_REQUEST, "Invalid JSON-RPC version"),
        ));
    }
    let method = match map.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err(error_response(
                reply_id,
                &RpcError::new(INVALID_REQUEST, "Missing method"),
            ));
        },
    };
    let params = map.remove("params").unwrap_or(Value::Null);
    Ok(Request { id, method, params })
}

pub fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub fn error_response(id: Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error })
}

/// 工具结果：文本内容 + `isError`
pub fn tool_result(payload: &Value, is_error: bool) -> Value {
    let text = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": payload,
        "isError": is_error,
    })
}
