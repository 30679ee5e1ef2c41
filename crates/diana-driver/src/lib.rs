//! 硬件绑定层
//!
//! 本 crate 定义 Diana 机械臂原生 SDK 的抽象边界，包括：
//! - [`RobotBinding`] / [`RobotLink`]：阻塞式、按操作调用的硬件接口
//! - [`DriverError`]：原生层错误
//! - [`OutputGuard`]：在原生调用期间屏蔽 stdout/stderr（含文件描述符级写入）
//! - [`mock`]（feature `mock`）：确定性的模拟机械臂，用于测试和无硬件运行
//!
//! 原生 SDK 本身不在本 crate 内；任何厂商绑定只需实现 [`RobotBinding`]。

mod error;
mod link;
pub mod output;

#[cfg(feature = "mock")]
pub mod mock;

pub use error::DriverError;
pub use link::{
    ArmMode, JOINT_COUNT, JointArray, POSE_LEN, PoseArray, RobotBinding, RobotLink, RobotState,
};
pub use output::{OutputGuard, OutputSink, PrivateStdio, PrivateStream};
