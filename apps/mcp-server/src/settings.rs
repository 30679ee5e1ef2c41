//! 配置文件定位与命令行覆盖

use anyhow::{Context, Result};
use diana_control::{DeviceAddress, ServerConfig};
use std::path::{Path, PathBuf};

/// 用户配置目录下的子目录名
const CONFIG_DIR_NAME: &str = "diana-mcp";

/// 默认配置文件路径：`<config_dir>/diana-mcp/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join("config.toml"))
}

/// 命令行可覆盖的配置项
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub default_ip: Option<String>,
    pub workers: Option<usize>,
    pub native_log: Option<PathBuf>,
}

/// 加载配置
///
/// 顺序：显式路径（必须存在）→ 默认路径（存在时）→ 内置默认值；然后应用命令行覆盖并校验。
pub fn load(explicit: Option<&Path>, overrides: &Overrides) -> Result<(ServerConfig, Option<PathBuf>)> {
    let (mut config, source) = match explicit {
        Some(path) => {
            let config = ServerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            (config, Some(path.to_path_buf()))
        },
        None => match default_config_path().filter(|path| path.is_file()) {
            Some(path) => {
                let config = ServerConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?;
                (config, Some(path))
            },
            None => (ServerConfig::default(), None),
        },
    };

    apply(&mut config, overrides)?;
    config.validate().context("Invalid configuration")?;
    Ok((config, source))
}

fn apply(config: &mut ServerConfig, overrides: &Overrides) -> Result<()> {
    if let Some(ip) = &overrides.default_ip {
        let address: DeviceAddress = ip
            .parse()
            .with_context(|| format!("Invalid --default-ip value: {}", ip))?;
        config.robot.default_address = address.to_string();
    }
    if let Some(workers) = overrides.workers {
        config.engine.workers = workers;
    }
    if let Some(path) = &overrides.native_log {
        config.output.native_log = Some(path.clone());
    }
    Ok(())
}
