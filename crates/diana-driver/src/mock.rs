//! 模拟机械臂（feature `mock`）
//!
//! 确定性的 [`RobotBinding`] 实现，用于测试和无硬件运行：
//! - 每个地址一台 [`ArmSim`]，状态在重连之间保留
//! - 运动按 `motion_duration` 线性插值，`stop` 会冻结在当前位置
//! - 一次性故障注入、句柄失效注入、按操作的调用延迟
//! - 打开计数和按地址的调用日志
//!
//! 不涉及运动学：关节运动不改变位姿，位姿运动不改变关节。

use crate::{DriverError, JointArray, PoseArray, RobotBinding, RobotLink, RobotState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// TCP 点动平移步长（米）
pub const TCP_STEP: f64 = 0.01;

/// TCP 点动旋转步长（弧度）
pub const ROTATION_STEP: f64 = 0.05;

/// 可注入故障/延迟的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Open,
    JointPositions,
    TcpPose,
    RobotState,
    MoveJoints,
    MoveLinear,
    MoveTcp,
    RotateTcp,
    Stop,
    Resume,
    FreeDriving,
    Close,
}

/// 模拟参数
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// 单次运动耗时
    pub motion_duration: Duration,
    /// 原生调用时向 fd 1/2 打印调试信息（验证输出屏蔽）
    pub noisy: bool,
    /// 新建机械臂的初始关节角
    pub initial_joints: JointArray,
    /// 新建机械臂的初始位姿
    pub initial_pose: PoseArray,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            motion_duration: Duration::from_millis(100),
            noisy: false,
            initial_joints: [0.0; 7],
            initial_pose: [0.4, 0.0, 0.5, 3.14, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone)]
struct Motion {
    from_joints: JointArray,
    to_joints: JointArray,
    from_pose: PoseArray,
    to_pose: PoseArray,
    started: Instant,
    duration: Duration,
}

#[derive(Debug)]
struct ArmState {
    joints: JointArray,
    pose: PoseArray,
    motion: Option<Motion>,
    free_driving: i32,
    paused: bool,
    /// 故障状态码与描述；`resume` 复位
    fault: Option<(i32, String)>,
}

impl ArmState {
    /// 按当前时间推进运动
    fn settle(&mut self, now: Instant) {
        let Some(motion) = &self.motion else {
            return;
        };
        let elapsed = now.saturating_duration_since(motion.started);
        let t = if motion.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / motion.duration.as_secs_f64()).min(1.0)
        };
        for i in 0..self.joints.len() {
            self.joints[i] = lerp(motion.from_joints[i], motion.to_joints[i], t);
        }
        for i in 0..self.pose.len() {
            self.pose[i] = lerp(motion.from_pose[i], motion.to_pose[i], t);
        }
        if t >= 1.0 {
            self.motion = None;
        }
    }

    fn start(&mut self, to_joints: JointArray, to_pose: PoseArray, duration: Duration) {
        self.settle(Instant::now());
        self.motion = Some(Motion {
            from_joints: self.joints,
            to_joints,
            from_pose: self.pose,
            to_pose,
            started: Instant::now(),
            duration,
        });
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// 单台模拟机械臂
pub struct ArmSim {
    address: String,
    state: Mutex<ArmState>,
    generation: AtomicU64,
    opens: AtomicUsize,
    faults: Mutex<HashMap<SimOp, DriverError>>,
    latency: Mutex<HashMap<SimOp, Duration>>,
    calls: Mutex<Vec<SimOp>>,
}

impl ArmSim {
    fn new(address: &str, config: &SimConfig) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(ArmState {
                joints: config.initial_joints,
                pose: config.initial_pose,
                motion: None,
                free_driving: 0,
                paused: false,
                fault: None,
            }),
            generation: AtomicU64::new(0),
            opens: AtomicUsize::new(0),
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 设备地址
    pub fn address(&self) -> &str {
        &self.address
    }

    /// 当前关节角（推进运动后）
    pub fn joints(&self) -> JointArray {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.joints
    }

    /// 当前位姿（推进运动后）
    pub fn pose(&self) -> PoseArray {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.pose
    }

    /// 是否在运动中
    pub fn is_moving(&self) -> bool {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.motion.is_some()
    }

    /// 当前自由驱动模式
    pub fn free_driving_mode(&self) -> i32 {
        self.state.lock().free_driving
    }

    fn record(&self, op: SimOp) {
        self.calls.lock().push(op);
    }

    fn delay(&self, op: SimOp) {
        let latency = self.latency.lock().get(&op).copied();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
    }

    fn take_fault(&self, op: SimOp) -> Option<DriverError> {
        self.faults.lock().remove(&op)
    }
}

struct SimShared {
    config: SimConfig,
    arms: Mutex<HashMap<String, Arc<ArmSim>>>,
    opens: AtomicUsize,
}

/// 模拟绑定
///
/// 克隆共享同一组模拟机械臂，测试可以保留一份用于注入和检查。
#[derive(Clone)]
pub struct SimulatedBinding {
    shared: Arc<SimShared>,
}

impl Default for SimulatedBinding {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedBinding {
    pub fn new(config: SimConfig) -> Self {
        Self {
            shared: Arc::new(SimShared {
                config,
                arms: Mutex::new(HashMap::new()),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    /// 获取（必要时创建）指定地址的模拟机械臂
    pub fn arm(&self, address: &str) -> Arc<ArmSim> {
        let mut arms = self.shared.arms.lock();
        arms.entry(address.to_string())
            .or_insert_with(|| Arc::new(ArmSim::new(address, &self.shared.config)))
            .clone()
    }

    /// 所有地址累计成功打开次数
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// 指定地址累计成功打开次数
    pub fn open_count_for(&self, address: &str) -> usize {
        self.arm(address).opens.load(Ordering::SeqCst)
    }

    /// 下一次 `op` 调用返回 `error`（一次性）
    pub fn inject_fault(&self, address: &str, op: SimOp, error: DriverError) {
        self.arm(address).faults.lock().insert(op, error);
    }

    /// 为 `op` 设置调用延迟（模拟卡住的原生调用）
    pub fn set_latency(&self, address: &str, op: SimOp, latency: Duration) {
        self.arm(address).latency.lock().insert(op, latency);
    }

    /// 清除所有延迟
    pub fn clear_latency(&self, address: &str) {
        self.arm(address).latency.lock().clear();
    }

    /// 使机械臂进入故障状态：运动立即停止，状态查询报告 `code`，运动指令被拒绝
    pub fn trip_fault(&self, address: &str, code: i32, message: impl Into<String>) {
        let arm = self.arm(address);
        let mut state = arm.state.lock();
        state.settle(Instant::now());
        state.motion = None;
        state.fault = Some((code, message.into()));
    }

    /// 使该地址已打开的所有句柄失效（控制器重启）
    pub fn invalidate(&self, address: &str) {
        self.arm(address).generation.fetch_add(1, Ordering::SeqCst);
    }

    /// 某操作的调用次数
    pub fn call_count(&self, address: &str, op: SimOp) -> usize {
        self.arm(address)
            .calls
            .lock()
            .iter()
            .filter(|&&c| c == op)
            .count()
    }

    /// 直接设置关节角（不经过运动）
    pub fn set_joints(&self, address: &str, joints: JointArray) {
        let arm = self.arm(address);
        let mut state = arm.state.lock();
        state.motion = None;
        state.joints = joints;
    }
}

impl RobotBinding for SimulatedBinding {
    fn open(&self, address: &str) -> Result<Arc<dyn RobotLink>, DriverError> {
        let arm = self.arm(address);
        arm.record(SimOp::Open);
        arm.delay(SimOp::Open);
        if let Some(err) = arm.take_fault(SimOp::Open) {
            return Err(err);
        }

        arm.opens.fetch_add(1, Ordering::SeqCst);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if self.shared.config.noisy {
            chatter(&format!("initSrv {}", address));
        }

        Ok(Arc::new(SimLink {
            generation: arm.generation.load(Ordering::SeqCst),
            arm,
            config: self.shared.config.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// 模拟原生库的调试输出：直接写 fd 1/2，不经过测试框架的输出捕获
fn chatter(line: &str) {
    let _ = writeln!(std::io::stdout(), "[DianaApi] {}", line);
    let _ = writeln!(std::io::stderr(), "[DianaApi] {}", line);
}

struct SimLink {
    arm: Arc<ArmSim>,
    generation: u64,
    config: SimConfig,
    closed: AtomicBool,
}

impl SimLink {
    fn enter(&self, op: SimOp) -> Result<(), DriverError> {
        self.arm.record(op);
        self.arm.delay(op);
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::InvalidHandle(format!(
                "connection to {} was closed",
                self.arm.address
            )));
        }
        if self.arm.generation.load(Ordering::SeqCst) != self.generation {
            return Err(DriverError::InvalidHandle(format!(
                "handle for {} expired",
                self.arm.address
            )));
        }
        if let Some(err) = self.arm.take_fault(op) {
            return Err(err);
        }
        if self.config.noisy {
            chatter(&format!("{:?} {}", op, self.arm.address));
        }
        Ok(())
    }

    fn ensure_drivable(state: &ArmState, command: &str) -> Result<(), DriverError> {
        if let Some((code, _)) = &state.fault {
            return Err(DriverError::Rejected(format!(
                "{} refused while the arm is in fault state {}",
                command, code
            )));
        }
        if state.free_driving != 0 {
            return Err(DriverError::Rejected(format!(
                "{} refused while free driving is enabled",
                command
            )));
        }
        Ok(())
    }

    fn jog(&self, op: SimOp, direction: i32, offset: usize, step: f64) -> Result<(), DriverError> {
        self.enter(op)?;
        let mut state = self.arm.state.lock();
        Self::ensure_drivable(&state, if offset == 0 { "moveTCP" } else { "rotationTCP" })?;
        if direction < 0 {
            return Ok(());
        }
        if direction > 5 {
            return Err(DriverError::Rejected(format!("unknown TCP direction {}", direction)));
        }
        state.settle(Instant::now());
        let axis = offset + (direction as usize / 2);
        let sign = if direction % 2 == 0 { 1.0 } else { -1.0 };
        let mut target = state.pose;
        target[axis] += sign * step;
        let joints = state.joints;
        state.start(joints, target, self.config.motion_duration);
        Ok(())
    }
}

impl RobotLink for SimLink {
    fn address(&self) -> &str {
        &self.arm.address
    }

    fn joint_positions(&self) -> Result<JointArray, DriverError> {
        self.enter(SimOp::JointPositions)?;
        let mut state = self.arm.state.lock();
        state.settle(Instant::now());
        Ok(state.joints)
    }

    fn tcp_pose(&self) -> Result<PoseArray, DriverError> {
        self.enter(SimOp::TcpPose)?;
        let mut state = self.arm.state.lock();
        state.settle(Instant::now());
        Ok(state.pose)
    }

    fn robot_state(&self) -> Result<RobotState, DriverError> {
        self.enter(SimOp::RobotState)?;
        let mut state = self.arm.state.lock();
        state.settle(Instant::now());
        if let Some((code, message)) = &state.fault {
            return Ok(RobotState {
                fault: Some(message.clone()),
                ..RobotState::from_code(*code)
            });
        }
        let code = if state.motion.is_some() {
            0
        } else if state.free_driving != 0 {
            2
        } else if state.paused {
            3
        } else {
            1
        };
        Ok(RobotState::from_code(code))
    }

    fn move_joints(
        &self,
        target: &JointArray,
        _velocity: f64,
        _acceleration: f64,
    ) -> Result<(), DriverError> {
        self.enter(SimOp::MoveJoints)?;
        let mut state = self.arm.state.lock();
        Self::ensure_drivable(&state, "moveJToTarget")?;
        state.settle(Instant::now());
        let pose = state.pose;
        state.start(*target, pose, self.config.motion_duration);
        Ok(())
    }

    fn move_linear(
        &self,
        pose: &PoseArray,
        _velocity: f64,
        _acceleration: f64,
    ) -> Result<(), DriverError> {
        self.enter(SimOp::MoveLinear)?;
        let mut state = self.arm.state.lock();
        Self::ensure_drivable(&state, "moveLToPose")?;
        state.settle(Instant::now());
        let joints = state.joints;
        state.start(joints, *pose, self.config.motion_duration);
        Ok(())
    }

    fn move_tcp(&self, direction: i32, _velocity: f64, _acceleration: f64) -> Result<(), DriverError> {
        self.jog(SimOp::MoveTcp, direction, 0, TCP_STEP)
    }

    fn rotate_tcp(
        &self,
        direction: i32,
        _velocity: f64,
        _acceleration: f64,
    ) -> Result<(), DriverError> {
        self.jog(SimOp::RotateTcp, direction, 3, ROTATION_STEP)
    }

    fn stop(&self) -> Result<(), DriverError> {
        self.enter(SimOp::Stop)?;
        let mut state = self.arm.state.lock();
        state.settle(Instant::now());
        state.motion = None;
        Ok(())
    }

    fn resume(&self) -> Result<(), DriverError> {
        self.enter(SimOp::Resume)?;
        let mut state = self.arm.state.lock();
        state.paused = false;
        state.fault = None;
        Ok(())
    }

    fn free_driving(&self, mode: i32) -> Result<(), DriverError> {
        self.enter(SimOp::FreeDriving)?;
        let mut state = self.arm.state.lock();
        state.settle(Instant::now());
        if state.motion.is_some() && mode != 0 {
            return Err(DriverError::Rejected(
                "freeDriving refused while the arm is moving".to_string(),
            ));
        }
        state.free_driving = mode;
        Ok(())
    }

    fn close(&self) -> Result<(), DriverError> {
        self.arm.record(SimOp::Close);
        self.closed.store(true, Ordering::SeqCst);
        match self.arm.take_fault(SimOp::Close) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArmMode;

    const ADDR: &str = "192.168.10.75";

    fn fast() -> SimulatedBinding {
        SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_millis(30),
            ..SimConfig::default()
        })
    }

    fn wait_idle(link: &Arc<dyn RobotLink>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while link.robot_state().unwrap().is_moving() {
            assert!(Instant::now() < deadline, "simulated motion never finished");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_motion_reaches_target() {
        let sim = fast();
        let link = sim.open(ADDR).unwrap();
        let target = [0.1, -0.2, 0.3, -0.4, 0.5, -0.6, 0.7];

        link.move_joints(&target, 0.5, 0.5).unwrap();
        wait_idle(&link);

        let joints = link.joint_positions().unwrap();
        for (a, b) in joints.iter().zip(target.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_stop_freezes_mid_motion() {
        let sim = SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_millis(500),
            ..SimConfig::default()
        });
        let link = sim.open(ADDR).unwrap();
        link.move_joints(&[1.0; 7], 0.5, 0.5).unwrap();
        thread::sleep(Duration::from_millis(50));
        link.stop().unwrap();

        let frozen = link.joint_positions().unwrap()[0];
        assert!(frozen > 0.0 && frozen < 1.0);
        assert!(!link.robot_state().unwrap().is_moving());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(link.joint_positions().unwrap()[0], frozen);
    }

    #[test]
    fn test_one_shot_fault() {
        let sim = fast();
        let link = sim.open(ADDR).unwrap();
        sim.inject_fault(ADDR, SimOp::MoveLinear, DriverError::Fault("collision".into()));

        let pose = [0.3, 0.1, 0.4, 3.0, 0.0, 0.0];
        assert_eq!(
            link.move_linear(&pose, 0.2, 0.2),
            Err(DriverError::Fault("collision".into()))
        );
        link.move_linear(&pose, 0.2, 0.2).unwrap();
    }

    #[test]
    fn test_invalidate_expires_existing_handles() {
        let sim = fast();
        let old = sim.open(ADDR).unwrap();
        sim.invalidate(ADDR);

        assert!(matches!(
            old.joint_positions(),
            Err(DriverError::InvalidHandle(_))
        ));
        let fresh = sim.open(ADDR).unwrap();
        fresh.joint_positions().unwrap();
        assert_eq!(sim.open_count_for(ADDR), 2);
    }

    #[test]
    fn test_state_survives_reconnect_and_close_invalidates() {
        let sim = fast();
        let link = sim.open(ADDR).unwrap();
        link.move_tcp(4, 0.2, 0.2).unwrap();
        wait_idle(&link);
        link.close().unwrap();
        assert!(link.tcp_pose().is_err());

        let again = sim.open(ADDR).unwrap();
        let z = again.tcp_pose().unwrap()[2];
        assert!((z - (0.5 + TCP_STEP)).abs() < 1e-9);
    }

    #[test]
    fn test_free_driving_blocks_motion() {
        let sim = fast();
        let link = sim.open(ADDR).unwrap();
        link.free_driving(1).unwrap();
        assert_eq!(link.robot_state().unwrap().code, 2);
        assert!(matches!(
            link.move_joints(&[0.0; 7], 0.5, 0.5),
            Err(DriverError::Rejected(_))
        ));
        link.free_driving(0).unwrap();
        link.move_joints(&[0.0; 7], 0.5, 0.5).unwrap();
    }

    #[test]
    fn test_fault_state_stops_motion_until_resume() {
        let sim = SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_secs(5),
            ..SimConfig::default()
        });
        let link = sim.open(ADDR).unwrap();
        link.move_joints(&[0.5; 7], 0.5, 0.5).unwrap();
        assert!(sim.arm(ADDR).is_moving());

        sim.trip_fault(ADDR, 7, "joint 2 following error");
        let state = link.robot_state().unwrap();
        assert_eq!(state.mode, ArmMode::Fault);
        assert_eq!(state.code, 7);
        assert_eq!(state.fault.as_deref(), Some("joint 2 following error"));
        assert!(!sim.arm(ADDR).is_moving());
        assert!(matches!(
            link.move_linear(&[0.4, 0.0, 0.4, 3.0, 0.0, 0.0], 0.2, 0.2),
            Err(DriverError::Rejected(_))
        ));

        link.resume().unwrap();
        assert_eq!(link.robot_state().unwrap().mode, ArmMode::Idle);
    }

    #[test]
    fn test_call_log() {
        let sim = fast();
        let link = sim.open(ADDR).unwrap();
        link.joint_positions().unwrap();
        link.stop().unwrap();
        link.stop().unwrap();

        assert_eq!(sim.call_count(ADDR, SimOp::Open), 1);
        assert_eq!(sim.call_count(ADDR, SimOp::JointPositions), 1);
        assert_eq!(sim.call_count(ADDR, SimOp::Stop), 2);
        assert_eq!(sim.call_count("10.0.0.2", SimOp::Stop), 0);
    }
}
