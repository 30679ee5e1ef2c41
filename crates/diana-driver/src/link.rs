//! 硬件接口定义
//!
//! 原生 SDK 以"每个操作一次阻塞调用"的方式工作，且没有任何调用支持中断。
//! 这里的 trait 只描述调用形状，不做任何校验或重试。

use crate::error::DriverError;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 关节数量（7 自由度）
pub const JOINT_COUNT: usize = 7;

/// TCP 位姿长度（x, y, z, rx, ry, rz）
pub const POSE_LEN: usize = 6;

/// 关节角度（弧度）
pub type JointArray = [f64; JOINT_COUNT];

/// TCP 位姿（米 / 弧度）
pub type PoseArray = [f64; POSE_LEN];

/// 机械臂运行模式（由原生状态码解码）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ArmMode {
    /// 运动中
    Moving,
    /// 空闲（上一条运动已完成）
    Idle,
    /// 自由驱动（拖动示教）
    FreeDriving,
    /// 暂停
    Paused,
    /// 故障
    Fault,
}

/// 机械臂状态
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RobotState {
    /// 原生状态码（0 = 运动中，1 = 空闲）
    pub code: i32,
    /// 解码后的模式
    pub mode: ArmMode,
    /// 故障描述（仅 `Fault` 模式）
    pub fault: Option<String>,
}

impl RobotState {
    /// 从原生状态码构造
    pub fn from_code(code: i32) -> Self {
        let mode = match code {
            0 => ArmMode::Moving,
            1 => ArmMode::Idle,
            2 => ArmMode::FreeDriving,
            3 => ArmMode::Paused,
            _ => ArmMode::Fault,
        };
        Self {
            code,
            mode,
            fault: None,
        }
    }

    /// 是否仍在执行运动
    pub fn is_moving(&self) -> bool {
        self.mode == ArmMode::Moving
    }
}

/// 原生绑定入口（对应 SDK 的 initSrv）
pub trait RobotBinding: Send + Sync {
    /// 打开到 `address` 的连接
    ///
    /// 每次成功调用都会产生一个新的原生句柄；是否复用句柄由调用方决定。
    fn open(&self, address: &str) -> Result<Arc<dyn RobotLink>, DriverError>;
}

/// 一个已打开的原生连接句柄
///
/// 所有方法都是阻塞调用。运动类命令在控制器接受后即返回，
/// 运动是否完成需要通过 [`RobotLink::robot_state`] 轮询。
pub trait RobotLink: Send + Sync {
    /// 句柄对应的设备地址
    fn address(&self) -> &str;

    /// 读取关节角度
    fn joint_positions(&self) -> Result<JointArray, DriverError>;

    /// 读取 TCP 位姿
    fn tcp_pose(&self) -> Result<PoseArray, DriverError>;

    /// 读取运行状态
    fn robot_state(&self) -> Result<RobotState, DriverError>;

    /// 关节空间运动到目标（moveJToTarget）
    fn move_joints(
        &self,
        target: &JointArray,
        velocity: f64,
        acceleration: f64,
    ) -> Result<(), DriverError>;

    /// TCP 直线运动到目标位姿（moveLToPose）
    fn move_linear(
        &self,
        pose: &PoseArray,
        velocity: f64,
        acceleration: f64,
    ) -> Result<(), DriverError>;

    /// 沿 TCP 方向平移（moveTCP）
    fn move_tcp(&self, direction: i32, velocity: f64, acceleration: f64)
    -> Result<(), DriverError>;

    /// 绕 TCP 方向旋转（rotationTCP）
    fn rotate_tcp(
        &self,
        direction: i32,
        velocity: f64,
        acceleration: f64,
    ) -> Result<(), DriverError>;

    /// 停止当前运动
    fn stop(&self) -> Result<(), DriverError>;

    /// 恢复运动
    fn resume(&self) -> Result<(), DriverError>;

    /// 设置自由驱动模式（0 禁用，1 正常，2 强制）
    fn free_driving(&self, mode: i32) -> Result<(), DriverError>;

    /// 释放原生句柄（destroySrv）
    fn close(&self) -> Result<(), DriverError>;
}
