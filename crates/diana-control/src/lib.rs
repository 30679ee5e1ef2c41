//! Diana 机械臂控制引擎
//!
//! 把阻塞、可能挂起的硬件调用变成可追踪、可取消、有截止时间的工作单元，
//! 并以具名工具的形式暴露出来。组件（自底向上）：
//! - [`validate`]：参数校验，松散 JSON → 强类型值对象
//! - [`ConnectionManager`]：每个设备地址至多一个存活会话，按需连接
//! - [`RobotExecutor`]：唯一调用硬件绑定的组件，负责输出屏蔽、截止时间和错误归类
//! - [`TaskEngine`]：运动任务的排队、执行、等待、取消与回收
//! - [`ToolDispatcher`]：工具名 + 参数 → 上述组件 → JSON 结果或错误信封
//!
//! # 示例
//!
//! ```rust,ignore
//! use diana_control::{ServerConfig, ToolDispatcher};
//! use serde_json::json;
//!
//! let dispatcher = ToolDispatcher::new(binding, &ServerConfig::default());
//! let task = dispatcher.call("move_home", &json!({}))?;
//! let done = dispatcher.call("wait_task", &json!({ "task_id": task["taskId"], "timeout": 10 }))?;
//! ```

pub mod command;
pub mod config;
pub mod dispatch;
mod error;
pub mod executor;
mod native;
pub mod session;
pub mod task;
pub mod validate;

pub use command::{Command, CommandClass, CommandKind, CommandOutput, MotionReport};
pub use config::{
    ConfigError, DEFAULT_ROBOT_IP, EngineConfig, LimitsConfig, OutputConfig, RobotConfig,
    ServerConfig, TimeoutConfig,
};
pub use dispatch::{ToolClass, ToolDispatcher, ToolSpec, tool_specs};
pub use error::{ControlError, ErrorInfo, ErrorKind, Result, ValidationError, Violation};
pub use executor::{CancelToken, RobotExecutor};
pub use session::{ConnectOutcome, ConnectionManager, DeviceAddress, Session, SessionInfo};
pub use task::{TaskEngine, TaskId, TaskSnapshot, TaskState};
