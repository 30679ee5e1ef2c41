//! # 服务配置
//!
//! 启动时读取一次，进程生命周期内不变。所有字段都有默认值，
//! 配置文件只需写出需要覆盖的部分：
//!
//! ```toml
//! [robot]
//! default_address = "192.168.10.75"
//!
//! [limits]
//! max_velocity = 0.8
//!
//! [engine]
//! workers = 2
//! ```

use diana_driver::{JOINT_COUNT, JointArray, OutputSink};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 默认设备地址
pub const DEFAULT_ROBOT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 75);

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 服务配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub robot: RobotConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub engine: EngineConfig,
    pub output: OutputConfig,
}

impl ServerConfig {
    /// 从 TOML 文件加载并校验
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// 保存到文件（目录不存在时创建）
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 一致性检查
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.robot.default_address.trim().is_empty() {
            return invalid("robot.default_address must not be empty".into());
        }
        if self
            .robot
            .default_address
            .trim()
            .parse::<Ipv4Addr>()
            .is_err()
        {
            return invalid(format!(
                "robot.default_address '{}' is not an IPv4 address",
                self.robot.default_address
            ));
        }

        let limits = &self.limits;
        for (name, value) in [
            ("limits.max_velocity", limits.max_velocity),
            ("limits.max_acceleration", limits.max_acceleration),
            ("limits.pose_angle_limit", limits.pose_angle_limit),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return invalid(format!("{} must be a positive number, got {}", name, value));
            }
        }
        if limits.joint_limits.len() != JOINT_COUNT {
            return invalid(format!(
                "limits.joint_limits must have {} entries, got {}",
                JOINT_COUNT,
                limits.joint_limits.len()
            ));
        }
        for (i, [min, max]) in limits.joint_limits.iter().enumerate() {
            if !min.is_finite() || !max.is_finite() || min >= max {
                return invalid(format!(
                    "limits.joint_limits[{}] must satisfy min < max, got [{}, {}]",
                    i, min, max
                ));
            }
        }
        if limits.max_path_points == 0 {
            return invalid("limits.max_path_points must be at least 1".into());
        }

        for (i, value) in self.robot.home_joints.iter().enumerate() {
            let [min, max] = limits.joint_limits[i];
            if !value.is_finite() || *value < min || *value > max {
                return invalid(format!(
                    "robot.home_joints[{}] = {} is outside [{}, {}]",
                    i, value, min, max
                ));
            }
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("timeouts.connect_ms", t.connect_ms),
            ("timeouts.query_ms", t.query_ms),
            ("timeouts.control_ms", t.control_ms),
            ("timeouts.command_ms", t.command_ms),
            ("timeouts.stop_ms", t.stop_ms),
            ("timeouts.motion_ms", t.motion_ms),
        ] {
            if value == 0 {
                return invalid(format!("{} must be greater than zero", name));
            }
        }

        let e = &self.engine;
        if e.workers == 0 {
            return invalid("engine.workers must be at least 1".into());
        }
        if e.poll_interval_ms == 0 {
            return invalid("engine.poll_interval_ms must be greater than zero".into());
        }
        if !e.wait_default_secs.is_finite() || e.wait_default_secs < 0.0 {
            return invalid("engine.wait_default_secs must be a non-negative number".into());
        }
        if !e.wait_max_secs.is_finite() || e.wait_max_secs < e.wait_default_secs {
            return invalid("engine.wait_max_secs must be at least engine.wait_default_secs".into());
        }

        Ok(())
    }
}

/// 设备相关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// 未指定或无法解析地址时使用的默认地址
    pub default_address: String,
    /// `move_home` 的目标关节角（弧度）
    pub home_joints: JointArray,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            default_address: DEFAULT_ROBOT_IP.to_string(),
            home_joints: [0.0; JOINT_COUNT],
        }
    }
}

/// 参数安全限制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 速度上限（含）
    pub max_velocity: f64,
    /// 加速度上限（含）
    pub max_acceleration: f64,
    /// 每个关节的 [min, max]（弧度）
    pub joint_limits: Vec<[f64; 2]>,
    /// 位姿 rx/ry/rz 的绝对值上限（弧度）
    pub pose_angle_limit: f64,
    /// 关节路径最多的路点数
    pub max_path_points: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_velocity: 1.0,
            max_acceleration: 1.0,
            joint_limits: vec![
                [-3.14, 3.14],
                [-2.09, 2.09],
                [-3.14, 3.14],
                [-3.14, 3.14],
                [-2.09, 2.09],
                [-3.14, 3.14],
                [-3.14, 3.14],
            ],
            pose_angle_limit: 3.15,
            max_path_points: 64,
        }
    }
}

/// 各类操作的截止时间（毫秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 建立连接
    pub connect_ms: u64,
    /// 状态/位置查询
    pub query_ms: u64,
    /// 即时控制（resume、free driving、断开）
    pub control_ms: u64,
    /// 运动指令下发
    pub command_ms: u64,
    /// 停止
    pub stop_ms: u64,
    /// 单次运动从下发到完成的总时长
    pub motion_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            query_ms: 2_000,
            control_ms: 3_000,
            command_ms: 5_000,
            stop_ms: 2_000,
            motion_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn query(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }

    pub fn control(&self) -> Duration {
        Duration::from_millis(self.control_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_millis(self.stop_ms)
    }

    pub fn motion(&self) -> Duration {
        Duration::from_millis(self.motion_ms)
    }
}

/// 任务引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 工作线程数
    pub workers: usize,
    /// 运动完成轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 终态且已被观察的任务保留时长（秒）
    pub retention_secs: u64,
    /// `wait_task` 未指定超时时的默认值（秒）
    pub wait_default_secs: f64,
    /// `wait_task` 超时上限（秒）
    pub wait_max_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 50,
            retention_secs: 300,
            wait_default_secs: 30.0,
            wait_max_secs: 300.0,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn wait_default(&self) -> Duration {
        Duration::from_secs_f64(self.wait_default_secs)
    }

    pub fn wait_max(&self) -> Duration {
        Duration::from_secs_f64(self.wait_max_secs)
    }
}

/// 原生输出处理
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// 原生库输出追加到该文件；未设置时丢弃
    pub native_log: Option<PathBuf>,
}

impl OutputConfig {
    pub fn sink(&self) -> OutputSink {
        match &self.native_log {
            Some(path) => OutputSink::AppendTo(path.clone()),
            None => OutputSink::Discard,
        }
    }
}
