//! 错误类型体系
//!
//! 工具层只看到一种错误信封：
//!
//! ```json
//! { "error": { "kind": "HARDWARE_ERROR", "message": "...", "retryable": false } }
//! ```
//!
//! - [`ValidationError`]：参数校验失败，永不重试
//! - [`ControlError`]：引擎各组件的统一错误，按 [`ErrorKind`] 归类

use diana_driver::DriverError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// 违反的约束
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// 元素个数不符
    WrongArity { expected: String, actual: usize },
    /// 数值越界
    OutOfRange { value: f64, min: f64, max: f64 },
    /// 类型不符
    WrongType { expected: &'static str },
    /// NaN 或无穷大
    NonFinite,
    /// 缺少必填参数
    Missing,
}

impl Violation {
    /// 机器可读的约束名
    pub fn code(&self) -> &'static str {
        match self {
            Violation::WrongArity { .. } => "wrong_arity",
            Violation::OutOfRange { .. } => "out_of_range",
            Violation::WrongType { .. } => "wrong_type",
            Violation::NonFinite => "non_finite",
            Violation::Missing => "missing",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::WrongArity { expected, actual } => {
                write!(f, "expected {} values, got {}", expected, actual)
            },
            Violation::OutOfRange { value, min, max } => {
                write!(f, "value {} is outside [{}, {}]", value, min, max)
            },
            Violation::WrongType { expected } => write!(f, "expected {}", expected),
            Violation::NonFinite => write!(f, "value must be a finite number"),
            Violation::Missing => write!(f, "required argument is missing"),
        }
    }
}

/// 参数校验错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid argument '{field}': {violation}")]
pub struct ValidationError {
    /// 字段路径（如 `joints[3]`、`path[2][1]`）
    pub field: String,
    /// 违反的约束
    pub violation: Violation,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, violation: Violation) -> Self {
        Self {
            field: field.into(),
            violation,
        }
    }
}

/// 工具层错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    ConnectionError,
    HardwareError,
    TimeoutError,
    NotFound,
    Cancelled,
    UnknownTool,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::HardwareError => "HARDWARE_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::UnknownTool => "UNKNOWN_TOOL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 引擎错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// 参数校验失败
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// 会话不可用（打开失败、句柄失效）
    #[error("Connection error for {address}: {message}")]
    Connection {
        /// 设备地址
        address: String,
        /// 描述
        message: String,
    },

    /// 设备报告失败或故障
    #[error("Hardware error on {address}: {message}")]
    Hardware {
        /// 设备地址
        address: String,
        /// 描述
        message: String,
    },

    /// 原生调用或运动超过截止时间
    #[error("{operation} on {address} timed out after {timeout_ms}ms")]
    Timeout {
        /// 操作名
        operation: String,
        /// 设备地址
        address: String,
        /// 截止时间（毫秒）
        timeout_ms: u64,
    },

    /// 未知任务
    #[error("Task not found: {0}")]
    NotFound(String),

    /// 任务被取消
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// 未知工具
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl ControlError {
    /// 将原生层错误归类
    pub fn from_driver(address: &str, operation: &str, err: DriverError) -> Self {
        match err {
            err if err.is_stale_handle() => ControlError::Connection {
                address: address.to_string(),
                message: err.to_string(),
            },
            DriverError::Timeout => ControlError::Timeout {
                operation: operation.to_string(),
                address: address.to_string(),
                timeout_ms: 0,
            },
            err => ControlError::Hardware {
                address: address.to_string(),
                message: format!("{}: {}", operation, err),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Validation(_) => ErrorKind::ValidationError,
            ControlError::Connection { .. } => ErrorKind::ConnectionError,
            ControlError::Hardware { .. } => ErrorKind::HardwareError,
            ControlError::Timeout { .. } => ErrorKind::TimeoutError,
            ControlError::NotFound(_) => ErrorKind::NotFound,
            ControlError::Cancelled(_) => ErrorKind::Cancelled,
            ControlError::UnknownTool(_) => ErrorKind::UnknownTool,
        }
    }

    /// 是否值得调用方重试
    ///
    /// 连接错误在执行器内部已经自动重试过一次；这里表示"稍后再试可能成功"。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::Connection { .. } | ControlError::Timeout { .. }
        )
    }

    /// 是否为会话级错误
    pub fn is_connection(&self) -> bool {
        matches!(self, ControlError::Connection { .. })
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }

    /// 工具层错误信封
    pub fn to_envelope(&self) -> Value {
        json!({ "error": self.info() })
    }
}

/// 错误信封内容（也用作任务快照的 `errorInfo`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

pub type Result<T> = std::result::Result<T, ControlError>;
