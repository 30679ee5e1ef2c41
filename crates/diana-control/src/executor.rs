//! 机械臂命令执行器
//!
//! 唯一调用硬件绑定的组件。职责：
//! - 每个原生调用套上输出屏蔽和按操作类别的截止时间
//! - 原生错误归类为连接 / 硬件 / 超时错误
//! - 连接错误时重连一次并重试（查询、控制、运动下发阶段）
//! - 运动分两阶段：下发，然后轮询状态直到完成、超时或被取消

use crate::command::{Command, CommandKind, CommandOutput, MotionReport};
use crate::config::{ServerConfig, TimeoutConfig};
use crate::error::{ControlError, Result};
use crate::native::call_native;
use crate::session::{ConnectionManager, DeviceAddress, Session};
use diana_driver::{ArmMode, DriverError, JointArray, RobotLink};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 协作式取消标志（一旦置位不再清除）
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 置位；返回 true 表示本次调用是第一次置位
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 命令执行器
pub struct RobotExecutor {
    sessions: Arc<ConnectionManager>,
    timeouts: TimeoutConfig,
    poll_interval: Duration,
}

impl RobotExecutor {
    pub fn new(sessions: Arc<ConnectionManager>, config: &ServerConfig) -> Self {
        Self {
            sessions,
            timeouts: config.timeouts.clone(),
            poll_interval: config.engine.poll_interval(),
        }
    }

    pub fn sessions(&self) -> &Arc<ConnectionManager> {
        &self.sessions
    }

    /// 执行一条命令（阻塞直到完成）
    pub fn execute(&self, command: &Command, cancel: &CancelToken) -> Result<CommandOutput> {
        let address = command.address;
        let op = command.native_name();
        debug!(address = %address, operation = op, "Executing command");

        match &command.kind {
            CommandKind::JointPositions => self
                .call(address, op, self.timeouts.query(), |link| link.joint_positions())
                .map(|(joints, _)| CommandOutput::Joints { joints }),
            CommandKind::TcpPose => self
                .call(address, op, self.timeouts.query(), |link| link.tcp_pose())
                .map(|(pose, _)| CommandOutput::Pose { pose }),
            CommandKind::RobotState => self
                .call(address, op, self.timeouts.query(), |link| link.robot_state())
                .map(|(state, _)| CommandOutput::State { state }),
            CommandKind::Stop => self.stop(address),
            CommandKind::Resume => self
                .call(address, op, self.timeouts.control(), |link| link.resume())
                .map(|_| CommandOutput::ack("resumed")),
            CommandKind::FreeDriving { mode } => {
                let code = mode.code();
                self.call(address, op, self.timeouts.control(), move |link| {
                    link.free_driving(code)
                })
                .map(|_| {
                    CommandOutput::ack(if code == 0 {
                        "free_driving_disabled"
                    } else {
                        "free_driving_enabled"
                    })
                })
            },
            CommandKind::MoveJoints {
                target,
                velocity,
                acceleration,
            } => {
                let (target, v, a) = (*target.as_array(), velocity.get(), acceleration.get());
                self.run_motion(address, op, cancel, move |link| link.move_joints(&target, v, a))
            },
            CommandKind::MoveLinear {
                pose,
                velocity,
                acceleration,
            } => {
                let (pose, v, a) = (*pose.as_array(), velocity.get(), acceleration.get());
                self.run_motion(address, op, cancel, move |link| link.move_linear(&pose, v, a))
            },
            CommandKind::MoveTcp {
                direction,
                velocity,
                acceleration,
            } => {
                let (d, v, a) = (direction.get(), velocity.get(), acceleration.get());
                self.run_motion(address, op, cancel, move |link| link.move_tcp(d, v, a))
            },
            CommandKind::RotateTcp {
                direction,
                velocity,
                acceleration,
            } => {
                let (d, v, a) = (direction.get(), velocity.get(), acceleration.get());
                self.run_motion(address, op, cancel, move |link| link.rotate_tcp(d, v, a))
            },
            CommandKind::JointPath {
                path,
                velocity,
                acceleration,
            } => {
                let points: Vec<JointArray> = path.points().iter().map(|p| *p.as_array()).collect();
                self.run_path(address, &points, velocity.get(), acceleration.get(), cancel)
            },
        }
    }

    /// 直接停止（不经过任务队列）
    pub fn stop(&self, address: DeviceAddress) -> Result<CommandOutput> {
        self.call(address, "stop", self.timeouts.stop(), |link| link.stop())?;
        info!(address = %address, "Stop acknowledged");
        Ok(CommandOutput::ack("stopped"))
    }

    fn invoke<T, F>(
        &self,
        session: &Session,
        op: &'static str,
        deadline: Duration,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RobotLink) -> std::result::Result<T, DriverError> + Send + 'static,
    {
        let link = session.link();
        let address = session.address().to_string();
        let result = call_native(op, &address, deadline, move || f(link.as_ref()));
        if let Err(e) = &result {
            self.sessions.record_error(session.address(), e);
        }
        result
    }

    /// 确保连接后调用；连接错误时重连一次并重试
    fn call<T, F>(
        &self,
        address: DeviceAddress,
        op: &'static str,
        deadline: Duration,
        f: F,
    ) -> Result<(T, Arc<Session>)>
    where
        T: Send + 'static,
        F: Fn(&dyn RobotLink) -> std::result::Result<T, DriverError> + Clone + Send + 'static,
    {
        let session = self.sessions.ensure_connected(address)?;
        match self.invoke(&session, op, deadline, f.clone()) {
            Ok(value) => Ok((value, session)),
            Err(err) if err.is_connection() => {
                warn!(
                    address = %address,
                    operation = op,
                    error = %err,
                    "Stale session, reconnecting once"
                );
                let fresh = self.sessions.reconnect_from(&session)?;
                let value = self.invoke(&fresh, op, deadline, f)?;
                Ok((value, fresh))
            },
            Err(err) => Err(err),
        }
    }

    fn run_motion<F>(
        &self,
        address: DeviceAddress,
        op: &'static str,
        cancel: &CancelToken,
        issue: F,
    ) -> Result<CommandOutput>
    where
        F: Fn(&dyn RobotLink) -> std::result::Result<(), DriverError> + Clone + Send + 'static,
    {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(ControlError::Cancelled(format!("{} was not issued", op)));
        }

        let (_, session) = self.call(address, op, self.timeouts.command(), issue)?;
        self.monitor(&session, op, started, cancel)?;
        self.report(address, 1, started)
    }

    fn run_path(
        &self,
        address: DeviceAddress,
        points: &[JointArray],
        velocity: f64,
        acceleration: f64,
        cancel: &CancelToken,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        let total = points.len();

        for (i, point) in points.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ControlError::Cancelled(format!(
                    "joint path cancelled after {} of {} waypoints",
                    i, total
                )));
            }
            let target = *point;
            let (_, session) = self.call(address, "moveJToTarget", self.timeouts.command(), {
                move |link: &dyn RobotLink| link.move_joints(&target, velocity, acceleration)
            })?;
            self.monitor(&session, "moveJToTarget", started, cancel)
                .map_err(|err| match err {
                    ControlError::Cancelled(_) => ControlError::Cancelled(format!(
                        "joint path cancelled after {} of {} waypoints",
                        i, total
                    )),
                    other => other,
                })?;
            debug!(address = %address, waypoint = i + 1, total, "Waypoint reached");
        }

        self.report(address, total, started)
    }

    /// 轮询运动状态直到空闲、故障、超时或取消
    ///
    /// 监视阶段的连接错误直接上报，不重新下发运动。
    fn monitor(
        &self,
        session: &Session,
        op: &'static str,
        started: Instant,
        cancel: &CancelToken,
    ) -> Result<()> {
        let motion_deadline = started + self.timeouts.motion();
        loop {
            if cancel.is_cancelled() {
                return Err(ControlError::Cancelled(format!("{} cancelled", op)));
            }

            let state = self.invoke(session, "getRobotState", self.timeouts.query(), |link| {
                link.robot_state()
            })?;
            match state.mode {
                ArmMode::Moving | ArmMode::Paused => {},
                ArmMode::Fault => {
                    return Err(ControlError::Hardware {
                        address: session.address().to_string(),
                        message: format!(
                            "{}: device entered fault state (code {}){}",
                            op,
                            state.code,
                            state.fault.map(|f| format!(": {}", f)).unwrap_or_default()
                        ),
                    });
                },
                ArmMode::Idle | ArmMode::FreeDriving => return Ok(()),
            }

            let now = Instant::now();
            if now >= motion_deadline {
                warn!(
                    address = %session.address(),
                    operation = op,
                    "Motion did not finish before its deadline; the arm may still be moving"
                );
                return Err(ControlError::Timeout {
                    operation: op.to_string(),
                    address: session.address().to_string(),
                    timeout_ms: self.timeouts.motion_ms,
                });
            }
            thread::sleep(self.poll_interval.min(motion_deadline - now));
        }
    }

    fn report(
        &self,
        address: DeviceAddress,
        points_completed: usize,
        started: Instant,
    ) -> Result<CommandOutput> {
        let (final_joints, _) = self.call(address, "getJointPos", self.timeouts.query(), |link| {
            link.joint_positions()
        })?;
        let (final_pose, _) =
            self.call(address, "getTcpPos", self.timeouts.query(), |link| link.tcp_pose())?;
        Ok(CommandOutput::Motion(MotionReport {
            final_joints,
            final_pose,
            points_completed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::error::ErrorKind;
    use crate::validate::{Acceleration, JointVector, PoseVector, Velocity};
    use diana_driver::mock::{SimConfig, SimOp, SimulatedBinding};

    const ADDR: &str = "192.168.10.75";

    fn setup(config: ServerConfig) -> (SimulatedBinding, RobotExecutor) {
        let sim = SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_millis(40),
            ..SimConfig::default()
        });
        let sessions = Arc::new(ConnectionManager::new(Arc::new(sim.clone()), &config));
        (sim, RobotExecutor::new(sessions, &config))
    }

    fn fast_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.engine.poll_interval_ms = 5;
        config
    }

    fn address() -> DeviceAddress {
        ADDR.parse().unwrap()
    }

    fn move_joints(target: [f64; 7]) -> Command {
        let l = LimitsConfig::default();
        Command::new(
            address(),
            CommandKind::MoveJoints {
                target: JointVector::new(&target, &l).unwrap(),
                velocity: Velocity::new(0.5, &l).unwrap(),
                acceleration: Acceleration::new(0.5, &l).unwrap(),
            },
        )
    }

    #[test]
    fn test_query_auto_connects() {
        let (sim, exec) = setup(fast_config());
        let out = exec
            .execute(&Command::new(address(), CommandKind::JointPositions), &CancelToken::new())
            .unwrap();
        assert_eq!(out, CommandOutput::Joints { joints: [0.0; 7] });
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_stale_handle_reconnects_once() {
        let (sim, exec) = setup(fast_config());
        let query = Command::new(address(), CommandKind::TcpPose);
        exec.execute(&query, &CancelToken::new()).unwrap();

        sim.invalidate(ADDR);
        exec.execute(&query, &CancelToken::new()).unwrap();
        assert_eq!(sim.open_count(), 2);
    }

    #[test]
    fn test_second_connection_failure_surfaces() {
        let (sim, exec) = setup(fast_config());
        let query = Command::new(address(), CommandKind::RobotState);
        exec.execute(&query, &CancelToken::new()).unwrap();

        sim.invalidate(ADDR);
        sim.inject_fault(
            ADDR,
            SimOp::Open,
            DriverError::ConnectFailed {
                address: ADDR.into(),
                message: "controller unreachable".into(),
            },
        );
        let err = exec.execute(&query, &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn test_motion_reports_final_position() {
        let (sim, exec) = setup(fast_config());
        let target = [0.3, -0.3, 0.2, 0.0, 0.1, 0.0, -0.1];
        let out = exec.execute(&move_joints(target), &CancelToken::new()).unwrap();

        let report = match out {
            CommandOutput::Motion(report) => report,
            other => panic!("expected motion report, got {:?}", other),
        };
        assert_eq!(report.points_completed, 1);
        for (a, b) in report.final_joints.iter().zip(target.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        assert!(sim.call_count(ADDR, SimOp::RobotState) >= 1);
    }

    #[test]
    fn test_hardware_fault_is_not_retried() {
        let (sim, exec) = setup(fast_config());
        let l = LimitsConfig::default();
        sim.inject_fault(ADDR, SimOp::MoveLinear, DriverError::Fault("collision".into()));
        let command = Command::new(
            address(),
            CommandKind::MoveLinear {
                pose: PoseVector::new(&[0.3, 0.0, 0.4, 3.0, 0.0, 0.0], &l).unwrap(),
                velocity: Velocity::new(0.2, &l).unwrap(),
                acceleration: Acceleration::new(0.2, &l).unwrap(),
            },
        );

        let err = exec.execute(&command, &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareError);
        assert_eq!(sim.call_count(ADDR, SimOp::MoveLinear), 1);

        // 会话仍可用
        exec.execute(&Command::new(address(), CommandKind::JointPositions), &CancelToken::new())
            .unwrap();
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_monitor_fault_state_fails_motion() {
        let (sim, exec) = setup(fast_config());
        sim.inject_fault(ADDR, SimOp::RobotState, DriverError::Fault("overcurrent".into()));
        let err = exec.execute(&move_joints([0.1; 7]), &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareError);
    }

    #[test]
    fn test_fault_mode_during_monitor_fails_motion() {
        let config = fast_config();
        let sim = SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_secs(2),
            ..SimConfig::default()
        });
        let sessions = Arc::new(ConnectionManager::new(Arc::new(sim.clone()), &config));
        let exec = RobotExecutor::new(sessions, &config);

        let tripper = {
            let sim = sim.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(2);
                while !sim.arm(ADDR).is_moving() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(2));
                }
                sim.trip_fault(ADDR, 7, "joint 2 following error");
            })
        };
        let err = exec.execute(&move_joints([0.4; 7]), &CancelToken::new()).unwrap_err();
        tripper.join().unwrap();

        assert_eq!(err.kind(), ErrorKind::HardwareError);
        let message = err.to_string();
        assert!(message.contains("fault state (code 7)"), "{}", message);
        assert!(message.contains("following error"), "{}", message);
        assert_eq!(sim.call_count(ADDR, SimOp::MoveJoints), 1);
        assert_eq!(sim.open_count(), 1);
    }

    #[test]
    fn test_cancel_before_issue() {
        let (sim, exec) = setup(fast_config());
        let cancel = CancelToken::new();
        assert!(cancel.cancel());
        assert!(!cancel.cancel());

        let err = exec.execute(&move_joints([0.1; 7]), &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(sim.call_count(ADDR, SimOp::MoveJoints), 0);
    }

    #[test]
    fn test_hung_call_times_out() {
        let mut config = fast_config();
        config.timeouts.query_ms = 50;
        let (sim, exec) = setup(config);
        exec.execute(&Command::new(address(), CommandKind::JointPositions), &CancelToken::new())
            .unwrap();

        sim.set_latency(ADDR, SimOp::JointPositions, Duration::from_millis(300));
        let started = Instant::now();
        let err = exec
            .execute(&Command::new(address(), CommandKind::JointPositions), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_motion_deadline() {
        let mut config = fast_config();
        config.timeouts.motion_ms = 60;
        let sim = SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_secs(2),
            ..SimConfig::default()
        });
        let sessions = Arc::new(ConnectionManager::new(Arc::new(sim.clone()), &config));
        let exec = RobotExecutor::new(sessions, &config);

        let err = exec.execute(&move_joints([0.5; 7]), &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        // 超时不代表设备已停止
        assert!(sim.arm(ADDR).is_moving());
    }
}
