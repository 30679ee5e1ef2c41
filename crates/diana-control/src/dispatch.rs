//! 工具分发
//!
//! 工具调用的流程：参数校验 → 地址规范化 → 直接调用执行器（查询、即时控制）
//! 或提交任务（运动） → 组装 JSON 结果。任何失败都归一为 [`ControlError`]，
//! 由 [`ToolDispatcher::call_enveloped`] 转成错误信封。

use crate::command::{Command, CommandKind, CommandOutput};
use crate::config::{LimitsConfig, ServerConfig};
use crate::error::{ControlError, Result, ValidationError, Violation};
use crate::executor::{CancelToken, RobotExecutor};
use crate::session::{ConnectionManager, DeviceAddress};
use crate::task::{TaskEngine, TaskSnapshot};
use crate::validate::{
    Acceleration, JointVector, Velocity, validate_acceleration, validate_address,
    validate_direction, validate_joint_path, validate_joints, validate_mode, validate_pose,
    validate_task_id, validate_timeout, validate_velocity,
};
use diana_driver::{JointArray, RobotBinding};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 工具名前缀别名：`robot.get_joint_positions` 等价于 `get_joint_positions`
const TOOL_PREFIX: &str = "robot.";

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Query,
    Control,
    Motion,
    /// 只访问本地状态（任务、会话列表）
    Local,
}

/// 工具描述（用于协议层的工具列表）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub class: ToolClass,
    pub input_schema: Value,
}

fn ip_property() -> Value {
    json!({
        "type": "string",
        "description": "Robot IPv4 address; defaults to the configured address"
    })
}

fn number_property(description: &str, default: f64) -> Value {
    json!({ "type": "number", "description": description, "default": default })
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

fn motion_schema(extra: Value, required: &[&str], velocity: f64, acceleration: f64) -> Value {
    let mut properties = json!({
        "ip": ip_property(),
        "velocity": number_property("Velocity, 0 < v <= configured maximum", velocity),
        "acceleration": number_property("Acceleration, 0 < a <= configured maximum", acceleration),
    });
    if let (Some(target), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        target.extend(extra);
    }
    schema(properties, required)
}

fn joints_property() -> Value {
    json!({
        "type": "array",
        "items": { "type": "number" },
        "minItems": 7,
        "maxItems": 7,
        "description": "Seven joint angles in radians"
    })
}

/// 全部工具的描述
pub fn tool_specs() -> Vec<ToolSpec> {
    let ip_only = || schema(json!({ "ip": ip_property() }), &[]);
    let task_only = || {
        schema(
            json!({ "task_id": { "type": ["string", "integer"], "description": "Task id, e.g. \"task-3\"" } }),
            &["task_id"],
        )
    };
    let direction = json!({
        "direction": {
            "type": "integer",
            "minimum": -1,
            "maximum": 5,
            "default": 0,
            "description": "TCP direction index (-1 means no motion)"
        }
    });

    vec![
        ToolSpec {
            name: "connect_robot",
            description: "Connect to the robot (reuses an existing connection)",
            class: ToolClass::Control,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "disconnect_robot",
            description: "Disconnect from the robot",
            class: ToolClass::Control,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "get_joint_positions",
            description: "Read the current joint angles (connects on demand)",
            class: ToolClass::Query,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "get_tcp_pose",
            description: "Read the current TCP pose [x, y, z, rx, ry, rz]",
            class: ToolClass::Query,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "get_robot_state",
            description: "Read the robot state code and mode",
            class: ToolClass::Query,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "list_sessions",
            description: "List known robot sessions",
            class: ToolClass::Local,
            input_schema: schema(json!({}), &[]),
        },
        ToolSpec {
            name: "move_joint_positions",
            description: "Move in joint space to seven joint angles; returns a task",
            class: ToolClass::Motion,
            input_schema: motion_schema(json!({ "joints": joints_property() }), &["joints"], 0.5, 0.5),
        },
        ToolSpec {
            name: "move_joint_positions_json",
            description: "Same as move_joint_positions, with the joints given as a JSON string",
            class: ToolClass::Motion,
            input_schema: motion_schema(
                json!({ "joints_json": { "type": "string", "description": "JSON array of seven joint angles" } }),
                &["joints_json"],
                0.5,
                0.5,
            ),
        },
        ToolSpec {
            name: "move_linear_pose",
            description: "Move linearly to a TCP pose; returns a task",
            class: ToolClass::Motion,
            input_schema: motion_schema(
                json!({
                    "pose": {
                        "type": "array",
                        "items": { "type": "number" },
                        "minItems": 6,
                        "maxItems": 6,
                        "description": "Target pose [x, y, z, rx, ry, rz]"
                    }
                }),
                &["pose"],
                0.2,
                0.2,
            ),
        },
        ToolSpec {
            name: "move_tcp_direction",
            description: "Jog the TCP along a direction; returns a task",
            class: ToolClass::Motion,
            input_schema: motion_schema(direction.clone(), &[], 0.2, 0.2),
        },
        ToolSpec {
            name: "rotate_tcp_direction",
            description: "Rotate the TCP about a direction; returns a task",
            class: ToolClass::Motion,
            input_schema: motion_schema(direction, &[], 0.2, 0.2),
        },
        ToolSpec {
            name: "move_home",
            description: "Move to the configured home joint position; returns a task",
            class: ToolClass::Motion,
            input_schema: motion_schema(json!({}), &[], 0.5, 0.5),
        },
        ToolSpec {
            name: "execute_joint_path",
            description: "Move through a list of joint waypoints; returns a task",
            class: ToolClass::Motion,
            input_schema: motion_schema(
                json!({
                    "path": {
                        "type": "array",
                        "items": joints_property(),
                        "minItems": 1,
                        "description": "Joint waypoints"
                    }
                }),
                &["path"],
                0.5,
                0.5,
            ),
        },
        ToolSpec {
            name: "stop_motion",
            description: "Stop the robot immediately (bypasses the task queue)",
            class: ToolClass::Control,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "resume_motion",
            description: "Resume a paused motion",
            class: ToolClass::Control,
            input_schema: ip_only(),
        },
        ToolSpec {
            name: "enable_free_driving",
            description: "Set free-driving mode (0 disabled, 1 normal, 2 forced)",
            class: ToolClass::Control,
            input_schema: schema(
                json!({
                    "ip": ip_property(),
                    "mode": { "type": "integer", "enum": [0, 1, 2], "default": 1 }
                }),
                &[],
            ),
        },
        ToolSpec {
            name: "get_task",
            description: "Get a task snapshot",
            class: ToolClass::Local,
            input_schema: task_only(),
        },
        ToolSpec {
            name: "wait_task",
            description: "Wait for a task to finish, up to a timeout in seconds",
            class: ToolClass::Local,
            input_schema: schema(
                json!({
                    "task_id": { "type": ["string", "integer"] },
                    "timeout": { "type": "number", "minimum": 0, "description": "Seconds" }
                }),
                &["task_id"],
            ),
        },
        ToolSpec {
            name: "cancel_task",
            description: "Cancel a task; a running motion is stopped on the robot",
            class: ToolClass::Local,
            input_schema: task_only(),
        },
        ToolSpec {
            name: "list_tasks",
            description: "List known tasks",
            class: ToolClass::Local,
            input_schema: schema(json!({}), &[]),
        },
    ]
}

/// 工具参数视图：`null` 等同于空对象
struct Args<'a>(Option<&'a Map<String, Value>>);

impl<'a> Args<'a> {
    fn parse(raw: &'a Value) -> Result<Self> {
        match raw {
            Value::Null => Ok(Args(None)),
            Value::Object(map) => Ok(Args(Some(map))),
            _ => Err(ValidationError::new(
                "arguments",
                Violation::WrongType { expected: "object" },
            )
            .into()),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.and_then(|map| map.get(key))
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "serializationError": e.to_string() }))
}

/// 把执行结果与设备地址合并为一个对象
fn with_ip(address: DeviceAddress, output: &CommandOutput) -> Value {
    let mut value = to_json(output);
    if let Some(map) = value.as_object_mut() {
        map.insert("ip".to_string(), Value::String(address.to_string()));
    }
    value
}

/// 工具分发器
pub struct ToolDispatcher {
    sessions: Arc<ConnectionManager>,
    executor: Arc<RobotExecutor>,
    engine: TaskEngine,
    limits: LimitsConfig,
    home: JointArray,
    specs: Vec<ToolSpec>,
}

impl ToolDispatcher {
    /// 按配置装配连接管理器、执行器和任务引擎
    pub fn new(binding: Arc<dyn RobotBinding>, config: &ServerConfig) -> Self {
        let sessions = Arc::new(ConnectionManager::new(binding, config));
        let executor = Arc::new(RobotExecutor::new(Arc::clone(&sessions), config));
        let engine = TaskEngine::new(Arc::clone(&executor), config.engine.clone());
        info!(
            default_address = %sessions.default_address(),
            workers = config.engine.workers,
            "Tool dispatcher ready"
        );
        Self {
            sessions,
            executor,
            engine,
            limits: config.limits.clone(),
            home: config.robot.home_joints,
            specs: tool_specs(),
        }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn sessions(&self) -> &Arc<ConnectionManager> {
        &self.sessions
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// 解析工具名（支持 `robot.` 前缀）
    pub fn resolve_tool(&self, name: &str) -> Option<&ToolSpec> {
        let name = name.strip_prefix(TOOL_PREFIX).unwrap_or(name);
        self.specs.iter().find(|spec| spec.name == name)
    }

    /// 调用工具；失败时返回错误信封
    pub fn call_enveloped(&self, name: &str, args: &Value) -> Value {
        self.call(name, args).unwrap_or_else(|e| e.to_envelope())
    }

    /// 调用工具
    pub fn call(&self, name: &str, args: &Value) -> Result<Value> {
        let spec = self
            .resolve_tool(name)
            .ok_or_else(|| ControlError::UnknownTool(name.to_string()))?;
        let args = Args::parse(args)?;
        debug!(tool = spec.name, "Tool call");

        let result = self.route(spec.name, &args);
        if let Err(e) = &result {
            warn!(tool = spec.name, kind = %e.kind(), error = %e, "Tool call failed");
        }
        result
    }

    fn route(&self, name: &str, args: &Args<'_>) -> Result<Value> {
        match name {
            "connect_robot" => self.connect(args),
            "disconnect_robot" => {
                let address = self.address(args)?;
                let status = if self.sessions.disconnect(address) {
                    "disconnected"
                } else {
                    "already_disconnected"
                };
                Ok(json!({ "status": status, "ip": address }))
            },
            "get_joint_positions" => self.direct(args, CommandKind::JointPositions),
            "get_tcp_pose" => self.direct(args, CommandKind::TcpPose),
            "get_robot_state" => self.direct(args, CommandKind::RobotState),
            "list_sessions" => Ok(json!({ "sessions": to_json(&self.sessions.sessions()) })),
            "move_joint_positions" | "move_joint_positions_json" => {
                let field = if name == "move_joint_positions" {
                    "joints"
                } else {
                    "joints_json"
                };
                let target = validate_joints(args.get(field), field, &self.limits)?;
                self.motion(args, 0.5, 0.5, |velocity, acceleration| CommandKind::MoveJoints {
                    target,
                    velocity,
                    acceleration,
                })
            },
            "move_linear_pose" => {
                let pose = validate_pose(args.get("pose"), "pose", &self.limits)?;
                self.motion(args, 0.2, 0.2, |velocity, acceleration| CommandKind::MoveLinear {
                    pose,
                    velocity,
                    acceleration,
                })
            },
            "move_tcp_direction" => {
                let direction = validate_direction(args.get("direction"), 0)?;
                self.motion(args, 0.2, 0.2, |velocity, acceleration| CommandKind::MoveTcp {
                    direction,
                    velocity,
                    acceleration,
                })
            },
            "rotate_tcp_direction" => {
                let direction = validate_direction(args.get("direction"), 0)?;
                self.motion(args, 0.2, 0.2, |velocity, acceleration| CommandKind::RotateTcp {
                    direction,
                    velocity,
                    acceleration,
                })
            },
            "move_home" => {
                let target = JointVector::new(&self.home, &self.limits)?;
                self.motion(args, 0.5, 0.5, |velocity, acceleration| CommandKind::MoveJoints {
                    target,
                    velocity,
                    acceleration,
                })
            },
            "execute_joint_path" => {
                let path = validate_joint_path(args.get("path"), "path", &self.limits)?;
                self.motion(args, 0.5, 0.5, |velocity, acceleration| CommandKind::JointPath {
                    path,
                    velocity,
                    acceleration,
                })
            },
            "stop_motion" => {
                let address = self.address(args)?;
                let output = self.executor.stop(address)?;
                Ok(with_ip(address, &output))
            },
            "resume_motion" => self.direct(args, CommandKind::Resume),
            "enable_free_driving" => {
                let mode = validate_mode(args.get("mode"), 1)?;
                self.direct(args, CommandKind::FreeDriving { mode })
            },
            "get_task" => {
                let id = validate_task_id(args.get("task_id"))?;
                Ok(to_json(&self.engine.get(id)?))
            },
            "wait_task" => {
                let id = validate_task_id(args.get("task_id"))?;
                let timeout = validate_timeout(args.get("timeout"))?;
                Ok(to_json(&self.engine.wait(id, timeout)?))
            },
            "cancel_task" => {
                let id = validate_task_id(args.get("task_id"))?;
                Ok(to_json(&self.engine.cancel(id)?))
            },
            "list_tasks" => Ok(json!({ "tasks": to_json(&self.engine.list()) })),
            other => Err(ControlError::UnknownTool(other.to_string())),
        }
    }

    fn address(&self, args: &Args<'_>) -> Result<DeviceAddress> {
        let raw = validate_address(args.get("ip"))?;
        Ok(self.sessions.resolve(raw))
    }

    /// 连接；首次打开失败时断开并重连一次
    fn connect(&self, args: &Args<'_>) -> Result<Value> {
        let address = self.address(args)?;
        let (session, status) = match self.sessions.connect(address) {
            Ok(outcome) if outcome.newly_opened => (outcome.session, "connected"),
            Ok(outcome) => (outcome.session, "already_connected"),
            Err(e) if e.is_connection() => {
                warn!(address = %address, error = %e, "Connect failed, retrying once");
                (self.sessions.reconnect(address)?, "connected")
            },
            Err(e) => return Err(e),
        };
        Ok(json!({
            "status": status,
            "ip": address,
            "generation": session.generation(),
        }))
    }

    /// 查询和即时控制：直接调用执行器
    fn direct(&self, args: &Args<'_>, kind: CommandKind) -> Result<Value> {
        let address = self.address(args)?;
        let output = self
            .executor
            .execute(&Command::new(address, kind), &CancelToken::new())?;
        Ok(with_ip(address, &output))
    }

    /// 运动：校验速度/加速度后提交任务
    fn motion<F>(
        &self,
        args: &Args<'_>,
        default_velocity: f64,
        default_acceleration: f64,
        build: F,
    ) -> Result<Value>
    where
        F: FnOnce(Velocity, Acceleration) -> CommandKind,
    {
        let velocity = validate_velocity(args.get("velocity"), default_velocity, &self.limits)?;
        let acceleration =
            validate_acceleration(args.get("acceleration"), default_acceleration, &self.limits)?;
        let address = self.address(args)?;
        let snapshot: TaskSnapshot = self
            .engine
            .submit(Command::new(address, build(velocity, acceleration)))?;
        info!(task_id = %snapshot.task_id, address = %address, "Motion task submitted");
        Ok(to_json(&snapshot))
    }

    /// 停止任务引擎并释放所有会话
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.sessions.shutdown();
    }
}

impl Drop for ToolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diana_driver::mock::{SimConfig, SimulatedBinding};
    use std::collections::HashSet;
    use std::time::Duration;

    fn dispatcher() -> (SimulatedBinding, ToolDispatcher) {
        let sim = SimulatedBinding::new(SimConfig {
            motion_duration: Duration::from_millis(20),
            ..SimConfig::default()
        });
        let mut config = ServerConfig::default();
        config.engine.poll_interval_ms = 5;
        let dispatcher = ToolDispatcher::new(Arc::new(sim.clone()), &config);
        (sim, dispatcher)
    }

    #[test]
    fn test_catalogue_is_unique_and_complete() {
        let specs = tool_specs();
        let names: HashSet<_> = specs.iter().map(|s| s.name).collect();
        assert_eq!(names.len(), specs.len());
        assert_eq!(specs.len(), 20);
        for spec in &specs {
            assert_eq!(spec.input_schema["type"], "object");
        }
        let listed = to_json(&specs[0]);
        assert!(listed.get("inputSchema").is_some());
        assert!(listed.get("class").is_none());
    }

    #[test]
    fn test_prefixed_alias_resolves() {
        let (_sim, d) = dispatcher();
        assert_eq!(
            d.resolve_tool("robot.get_joint_positions").map(|s| s.name),
            Some("get_joint_positions")
        );
        assert!(d.resolve_tool("robot.read_file").is_none());
    }

    #[test]
    fn test_connect_statuses() {
        let (sim, d) = dispatcher();
        let first = d.call("connect_robot", &json!({})).unwrap();
        assert_eq!(first["status"], "connected");
        assert_eq!(first["ip"], "192.168.10.75");
        let second = d.call("connect_robot", &json!({ "ip": " 192.168.10.75 " })).unwrap();
        assert_eq!(second["status"], "already_connected");
        assert_eq!(sim.open_count(), 1);

        let gone = d.call("disconnect_robot", &Value::Null).unwrap();
        assert_eq!(gone["status"], "disconnected");
        let again = d.call("disconnect_robot", &json!({ "ip": "null" })).unwrap();
        assert_eq!(again["status"], "already_disconnected");
    }

    #[test]
    fn test_unknown_tool_and_bad_arguments() {
        let (_sim, d) = dispatcher();
        let err = d.call("fly_away", &json!({})).unwrap_err();
        assert!(matches!(err, ControlError::UnknownTool(_)));

        let envelope = d.call_enveloped("get_joint_positions", &json!([1, 2]));
        assert_eq!(envelope["error"]["kind"], "VALIDATION_ERROR");

        let envelope = d.call_enveloped("get_tcp_pose", &json!({ "ip": 42 }));
        assert_eq!(envelope["error"]["kind"], "VALIDATION_ERROR");
    }

    #[test]
    fn test_validation_happens_before_submission() {
        let (sim, d) = dispatcher();
        let envelope = d.call_enveloped(
            "move_joint_positions",
            &json!({ "joints": [0.0, 0.0, 0.0], "velocity": 0.2 }),
        );
        assert_eq!(envelope["error"]["kind"], "VALIDATION_ERROR");
        assert_eq!(envelope["error"]["retryable"], false);
        assert!(d.engine().is_empty());
        assert_eq!(sim.open_count(), 0);
    }

    #[test]
    fn test_free_driving_default_mode() {
        let (sim, d) = dispatcher();
        let out = d.call("enable_free_driving", &json!({})).unwrap();
        assert_eq!(out["status"], "free_driving_enabled");
        assert_eq!(sim.arm("192.168.10.75").free_driving_mode(), 1);

        let off = d.call("enable_free_driving", &json!({ "mode": 0 })).unwrap();
        assert_eq!(off["status"], "free_driving_disabled");
    }
}
