//! 原生层错误类型定义

use thiserror::Error;

/// 原生绑定返回的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// 建立连接失败（initSrv 返回失败）
    #[error("Failed to open connection to {address}: {message}")]
    ConnectFailed {
        /// 目标地址
        address: String,
        /// 原生层描述
        message: String,
    },

    /// 连接句柄无效或已过期（控制器重启、网络中断等）
    #[error("Invalid or stale connection handle: {0}")]
    InvalidHandle(String),

    /// 设备报告故障状态
    #[error("Device fault: {0}")]
    Fault(String),

    /// 原生调用返回失败（命令被控制器拒绝）
    #[error("Command rejected by controller: {0}")]
    Rejected(String),

    /// 原生调用自身报告的超时
    #[error("Native call timed out")]
    Timeout,

    /// 绑定不支持该操作
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// 是否为会话级错误（需要重连才能恢复）
    pub fn is_stale_handle(&self) -> bool {
        matches!(
            self,
            DriverError::InvalidHandle(_) | DriverError::ConnectFailed { .. }
        )
    }
}
