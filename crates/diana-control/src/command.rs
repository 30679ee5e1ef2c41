//! 已校验的命令
//!
//! 命令只在参数校验之后构造，字段全部是强类型值对象。

use crate::session::DeviceAddress;
use crate::validate::{
    Acceleration, FreeDrivingMode, JointPath, JointVector, PoseVector, TcpDirection, Velocity,
};
use diana_driver::{JointArray, PoseArray, RobotState};
use serde::Serialize;

/// 命令类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    /// 只读查询：同步执行
    Query,
    /// 即时控制：同步执行
    Control,
    /// 运动：作为任务排队执行
    Motion,
}

/// 命令内容
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommandKind {
    JointPositions,
    TcpPose,
    RobotState,
    MoveJoints {
        target: JointVector,
        velocity: Velocity,
        acceleration: Acceleration,
    },
    MoveLinear {
        pose: PoseVector,
        velocity: Velocity,
        acceleration: Acceleration,
    },
    MoveTcp {
        direction: TcpDirection,
        velocity: Velocity,
        acceleration: Acceleration,
    },
    RotateTcp {
        direction: TcpDirection,
        velocity: Velocity,
        acceleration: Acceleration,
    },
    JointPath {
        path: JointPath,
        velocity: Velocity,
        acceleration: Acceleration,
    },
    Stop,
    Resume,
    FreeDriving {
        mode: FreeDrivingMode,
    },
}

impl CommandKind {
    pub fn class(&self) -> CommandClass {
        match self {
            CommandKind::JointPositions | CommandKind::TcpPose | CommandKind::RobotState => {
                CommandClass::Query
            },
            CommandKind::Stop | CommandKind::Resume | CommandKind::FreeDriving { .. } => {
                CommandClass::Control
            },
            CommandKind::MoveJoints { .. }
            | CommandKind::MoveLinear { .. }
            | CommandKind::MoveTcp { .. }
            | CommandKind::RotateTcp { .. }
            | CommandKind::JointPath { .. } => CommandClass::Motion,
        }
    }

    /// 对应的原生操作名（用于日志和错误信息）
    pub fn native_name(&self) -> &'static str {
        match self {
            CommandKind::JointPositions => "getJointPos",
            CommandKind::TcpPose => "getTcpPos",
            CommandKind::RobotState => "getRobotState",
            CommandKind::MoveJoints { .. } => "moveJToTarget",
            CommandKind::MoveLinear { .. } => "moveLToPose",
            CommandKind::MoveTcp { .. } => "moveTCP",
            CommandKind::RotateTcp { .. } => "rotationTCP",
            CommandKind::JointPath { .. } => "moveJToTarget[path]",
            CommandKind::Stop => "stop",
            CommandKind::Resume => "resume",
            CommandKind::FreeDriving { .. } => "freeDriving",
        }
    }
}

/// 绑定到设备地址的命令
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub address: DeviceAddress,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl Command {
    pub fn new(address: DeviceAddress, kind: CommandKind) -> Self {
        Self { address, kind }
    }

    pub fn class(&self) -> CommandClass {
        self.kind.class()
    }

    pub fn native_name(&self) -> &'static str {
        self.kind.native_name()
    }
}

/// 运动完成报告
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionReport {
    pub final_joints: JointArray,
    pub final_pose: PoseArray,
    /// 完成的路点数（单段运动为 1）
    pub points_completed: usize,
    pub elapsed_ms: u64,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Joints { joints: JointArray },
    Pose { pose: PoseArray },
    State { state: RobotState },
    Ack { status: String },
    Motion(MotionReport),
}

impl CommandOutput {
    pub fn ack(status: &str) -> Self {
        CommandOutput::Ack {
            status: status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert_eq!(CommandKind::RobotState.class(), CommandClass::Query);
        assert_eq!(CommandKind::Stop.class(), CommandClass::Control);

        let l = LimitsConfig::default();
        let motion = CommandKind::MoveTcp {
            direction: TcpDirection::new(2).unwrap(),
            velocity: Velocity::new(0.2, &l).unwrap(),
            acceleration: Acceleration::new(0.2, &l).unwrap(),
        };
        assert_eq!(motion.class(), CommandClass::Motion);
        assert_eq!(motion.native_name(), "moveTCP");
    }

    #[test]
    fn test_command_serialization() {
        let l = LimitsConfig::default();
        let command = Command::new(
            "10.0.0.3".parse().unwrap(),
            CommandKind::MoveJoints {
                target: JointVector::new(&[0.0; 7], &l).unwrap(),
                velocity: Velocity::new(0.2, &l).unwrap(),
                acceleration: Acceleration::new(0.5, &l).unwrap(),
            },
        );
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({
                "address": "10.0.0.3",
                "op": "move_joints",
                "target": [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                "velocity": 0.2,
                "acceleration": 0.5
            })
        );

        let free = Command::new(
            "10.0.0.3".parse().unwrap(),
            CommandKind::FreeDriving {
                mode: FreeDrivingMode::Forced,
            },
        );
        assert_eq!(serde_json::to_value(&free).unwrap()["mode"], "forced");
    }

    #[test]
    fn test_output_serialization() {
        assert_eq!(
            serde_json::to_value(CommandOutput::ack("stopped")).unwrap(),
            json!({"status": "stopped"})
        );
        let report = CommandOutput::Motion(MotionReport {
            final_joints: [0.0; 7],
            final_pose: [0.0; 6],
            points_completed: 1,
            elapsed_ms: 120,
        });
        let value = serde_json::to_value(report).unwrap();
        assert_eq!(value["pointsCompleted"], 1);
        assert_eq!(value["elapsedMs"], 120);
    }
}
