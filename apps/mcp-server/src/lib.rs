//! Diana 机械臂 MCP 服务
//!
//! 通过 stdin/stdout 上的换行分隔 JSON-RPC 2.0 提供工具调用。
//! 工具本身由 [`diana_control::ToolDispatcher`] 实现，本 crate 只负责协议、
//! 配置定位与日志。

pub mod logging;
pub mod protocol;
pub mod server;
pub mod settings;

pub use server::McpServer;
