//! 日志初始化
//!
//! stdout 是协议通道，日志只写到私有 stderr 描述符（不受原生输出屏蔽影响），
//! 可选再写一份按天滚动的文件。

use anyhow::{Context, Result};
use diana_driver::PrivateStream;
use std::path::Path;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 默认日志过滤（可用 `RUST_LOG` 覆盖）
pub const DEFAULT_FILTER: &str = "diana_mcp_server=info,diana_control=info,diana_driver=warn";

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "diana-mcp.log";

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// 安装全局 subscriber
///
/// 返回的 guard 必须在进程退出前保持存活，否则文件日志可能丢失尾部。
pub fn init(stderr: PrivateStream, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(stderr))
        .with_ansi(false)
        .with_target(true);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
