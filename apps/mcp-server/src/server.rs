//! MCP stdio 服务
//!
//! 每行一个 JSON-RPC 消息。工具调用在独立线程中处理，因此一个阻塞的
//! `wait_task` 不会挡住后续请求；响应通过同一个加锁的写端输出。

use crate::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PROTOCOL_VERSION, Request, RpcError,
    error_response, parse_line, result_response, tool_result,
};
use diana_control::ToolDispatcher;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// 服务状态
pub struct McpServer {
    dispatcher: Arc<ToolDispatcher>,
    initialized: AtomicBool,
    stopping: AtomicBool,
}

impl McpServer {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            dispatcher,
            initialized: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 收到 `shutdown` 后为 true
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// 是否需要在独立线程中处理（可能阻塞的工具调用）
    fn is_tool_call(&self, method: &str) -> bool {
        method == "tools/call" || self.dispatcher.resolve_tool(method).is_some()
    }

    /// 处理一条请求；通知返回 None
    pub fn handle(&self, request: &Request) -> Option<Value> {
        if request.is_notification() && request.method.starts_with("notifications/") {
            debug!(method = %request.method, "Notification ignored");
            return None;
        }

        let outcome = self.route(request);
        let id = request.id.clone()?;
        Some(match outcome {
            Ok(result) => result_response(id, result),
            Err(err) => {
                warn!(method = %request.method, code = err.code, "Request failed: {}", err.message);
                error_response(id, &err)
            },
        })
    }

    fn route(&self, request: &Request) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "initialize" => self.initialize(&request.params),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.dispatcher.specs() })),
            "tools/call" => {
                let Value::Object(params) = &request.params else {
                    return Err(RpcError::new(
                        INVALID_PARAMS,
                        "Params must be an object for tools/call",
                    ));
                };
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| RpcError::new(INVALID_PARAMS, "Missing tool name"))?;
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.call_tool(name, &arguments)
            },
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            "shutdown" => {
                info!("Shutdown requested by client");
                self.stopping.store(true, Ordering::SeqCst);
                Ok(json!({ "ack": true }))
            },
            method if self.dispatcher.resolve_tool(method).is_some() => {
                self.call_tool(method, &request.params)
            },
            method => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Unknown method: {}", method),
            )),
        }
    }

    fn initialize(&self, params: &Value) -> Result<Value, RpcError> {
        if !(params.is_object() || params.is_null()) {
            return Err(RpcError::new(
                INVALID_PARAMS,
                "Params must be an object for initialize",
            ));
        }
        if let Some(client) = params.get("clientInfo") {
            info!(client = %client, "Client initialized");
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": {},
                "prompts": {},
            },
        }))
    }

    /// 工具失败以 `isError: true` 的结果返回；只有未知工具和参数形状错误是协议错误
    fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, RpcError> {
        if self.dispatcher.resolve_tool(name).is_none() {
            return Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Unknown tool: {}", name),
            )
            .with_data(json!({ "tool": name })));
        }
        if !(arguments.is_object() || arguments.is_null()) {
            return Err(RpcError::new(
                INVALID_PARAMS,
                "Tool arguments must be an object",
            ));
        }
        Ok(match self.dispatcher.call(name, arguments) {
            Ok(payload) => tool_result(&payload, false),
            Err(err) => tool_result(&err.to_envelope(), true),
        })
    }

    /// 读取请求直到 EOF 或 `shutdown`，然后等待仍在处理的工具调用
    pub fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> io::Result<()>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request = match parse_line(line) {
                Ok(request) => request,
                Err(response) => {
                    send(&writer, &response)?;
                    continue;
                },
            };

            if self.is_tool_call(&request.method) {
                in_flight.retain(|handle| !handle.is_finished());
                let server = Arc::clone(self);
                let writer = Arc::clone(&writer);
                let handle = thread::Builder::new()
                    .name("mcp-tool-call".to_string())
                    .spawn(move || server.respond_guarded(&request, &writer))?;
                in_flight.push(handle);
                continue;
            }

            if let Some(response) = self.handle(&request) {
                send(&writer, &response)?;
            }
            if self.is_stopping() {
                break;
            }
        }

        debug!(pending = in_flight.len(), "Waiting for in-flight tool calls");
        for handle in in_flight {
            if handle.join().is_err() {
                error!("Tool call thread panicked");
            }
        }
        Ok(())
    }

    fn respond_guarded<W: Write>(&self, request: &Request, writer: &Mutex<W>) {
        let response = catch_unwind(AssertUnwindSafe(|| self.handle(request))).unwrap_or_else(|_| {
            error!(method = %request.method, "Request handler panicked");
            request.id.clone().map(|id| {
                error_response(id, &RpcError::new(INTERNAL_ERROR, "Internal error"))
            })
        });
        if let Some(response) = response
            && let Err(e) = send(writer, &response)
        {
            error!("Failed to write response: {}", e);
        }
    }
}

fn send<W: Write>(writer: &Mutex<W>, message: &Value) -> io::Result<()> {
    let mut writer = writer.lock();
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
