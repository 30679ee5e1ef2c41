//! Diana MCP 服务主入口

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use diana_control::ToolDispatcher;
use diana_driver::mock::{SimConfig, SimulatedBinding};
use diana_driver::{OutputGuard, PrivateStdio, RobotBinding};
use diana_mcp_server::settings::{self, Overrides};
use diana_mcp_server::{McpServer, logging};
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// 机械臂后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// 模拟机械臂（无硬件）
    Sim,
}

/// Diana 机械臂 MCP 服务
///
/// 在 stdin/stdout 上提供 JSON-RPC 2.0 工具调用，日志写到 stderr
#[derive(Parser, Debug)]
#[command(name = "diana-mcp-server")]
#[command(about = "MCP stdio server for Diana robot arm control", long_about = None)]
struct Args {
    /// 配置文件路径（默认：<config_dir>/diana-mcp/config.toml，若存在）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 覆盖默认机械臂 IP
    #[arg(long)]
    default_ip: Option<String>,

    /// 覆盖任务工作线程数
    #[arg(long)]
    workers: Option<usize>,

    /// 机械臂后端
    #[arg(long, value_enum, default_value = "sim")]
    backend: Backend,

    /// 日志目录（按天滚动）；不指定则只写 stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// 原生库输出追加到该文件（默认丢弃）
    #[arg(long)]
    native_log: Option<PathBuf>,

    /// 打印生效配置（TOML）后退出
    #[arg(long)]
    print_config: bool,
}

fn binding(backend: Backend) -> Arc<dyn RobotBinding> {
    match backend {
        Backend::Sim => Arc::new(SimulatedBinding::new(SimConfig::default())),
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("diana-mcp-server: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    // 在任何原生调用之前复制真实的 stdout/stderr
    let stdio = PrivateStdio::capture().context("Failed to duplicate standard streams")?;

    let overrides = Overrides {
        default_ip: args.default_ip.clone(),
        workers: args.workers,
        native_log: args.native_log.clone(),
    };
    let (config, source) = settings::load(args.config.as_deref(), &overrides)?;

    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let _log_guard = logging::init(stdio.stderr.try_clone()?, args.log_dir.as_deref())?;
    match &source {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Using built-in default configuration"),
    }

    OutputGuard::set_sink(config.output.sink());
    let dispatcher = ToolDispatcher::new(binding(args.backend), &config);
    let server = Arc::new(McpServer::new(Arc::new(dispatcher)));

    // Ctrl+C：停止引擎、释放会话后退出
    let on_signal = Arc::clone(server.dispatcher());
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down");
        on_signal.shutdown();
        process::exit(0);
    })
    .context("Failed to set signal handler")?;

    info!(backend = ?args.backend, "diana-mcp-server ready on stdio");
    let result = server.serve(io::stdin().lock(), stdio.stdout);

    server.dispatcher().shutdown();
    if let Err(e) = &result {
        error!("Transport error: {}", e);
    }
    info!("diana-mcp-server stopped");
    result.context("stdio transport failed")
}
