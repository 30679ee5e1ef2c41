//! 参数校验
//!
//! 工具参数在这里从松散的 JSON 转换为强类型值对象，之后的组件不再接触未校验数据。
//! 所有函数都是纯函数，不访问网络或硬件。
//!
//! 数组参数既可以是 JSON 数组，也可以是内容为 JSON 数组的字符串
//! （部分客户端只能传字符串）。

use crate::config::LimitsConfig;
use crate::error::{ValidationError, Violation};
use crate::task::TaskId;
use diana_driver::{JOINT_COUNT, JointArray, POSE_LEN, PoseArray};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

type Result<T> = std::result::Result<T, ValidationError>;

/// 校验后的关节角（弧度）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JointVector(JointArray);

impl JointVector {
    /// 从已有数值构造（与 JSON 入口执行相同的检查）
    pub fn new(values: &[f64], limits: &LimitsConfig) -> Result<Self> {
        Self::checked(values, "joints", limits)
    }

    fn checked(values: &[f64], field: &str, limits: &LimitsConfig) -> Result<Self> {
        if values.len() != JOINT_COUNT {
            return Err(ValidationError::new(
                field,
                Violation::WrongArity {
                    expected: JOINT_COUNT.to_string(),
                    actual: values.len(),
                },
            ));
        }
        let mut joints = [0.0; JOINT_COUNT];
        for (i, &value) in values.iter().enumerate() {
            let name = format!("{}[{}]", field, i);
            let value = finite(value, &name)?;
            let [min, max] = limits.joint_limits.get(i).copied().unwrap_or([-3.14, 3.14]);
            joints[i] = in_range(value, min, max, &name)?;
        }
        Ok(Self(joints))
    }

    pub fn as_array(&self) -> &JointArray {
        &self.0
    }
}

/// 校验后的 TCP 位姿（x, y, z 米；rx, ry, rz 弧度）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PoseVector(PoseArray);

impl PoseVector {
    pub fn new(values: &[f64], limits: &LimitsConfig) -> Result<Self> {
        Self::checked(values, "pose", limits)
    }

    fn checked(values: &[f64], field: &str, limits: &LimitsConfig) -> Result<Self> {
        if values.len() != POSE_LEN {
            return Err(ValidationError::new(
                field,
                Violation::WrongArity {
                    expected: POSE_LEN.to_string(),
                    actual: values.len(),
                },
            ));
        }
        let mut pose = [0.0; POSE_LEN];
        for (i, &value) in values.iter().enumerate() {
            let name = format!("{}[{}]", field, i);
            let value = finite(value, &name)?;
            // 平移分量只要求有限；姿态分量有角度上限
            pose[i] = if i < 3 {
                value
            } else {
                in_range(value, -limits.pose_angle_limit, limits.pose_angle_limit, &name)?
            };
        }
        Ok(Self(pose))
    }

    pub fn as_array(&self) -> &PoseArray {
        &self.0
    }
}

/// 关节路径（至少一个路点）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JointPath(Vec<JointVector>);

impl JointPath {
    pub fn points(&self) -> &[JointVector] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 速度（0, max]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Velocity(f64);

impl Velocity {
    pub fn new(value: f64, limits: &LimitsConfig) -> Result<Self> {
        positive_bounded(value, limits.max_velocity, "velocity").map(Self)
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

/// 加速度（0, max]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Acceleration(f64);

impl Acceleration {
    pub fn new(value: f64, limits: &LimitsConfig) -> Result<Self> {
        positive_bounded(value, limits.max_acceleration, "acceleration").map(Self)
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

/// TCP 点动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TcpDirection(i32);

impl TcpDirection {
    pub const MIN: i32 = -1;
    pub const MAX: i32 = 5;

    pub fn new(value: i32) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ValidationError::new(
                "direction",
                Violation::OutOfRange {
                    value: value as f64,
                    min: Self::MIN as f64,
                    max: Self::MAX as f64,
                },
            ));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

/// 自由驱动模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeDrivingMode {
    Disabled = 0,
    Normal = 1,
    Forced = 2,
}

impl FreeDrivingMode {
    pub fn from_code(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Forced),
            _ => Err(ValidationError::new(
                "mode",
                Violation::OutOfRange {
                    value: value as f64,
                    min: 0.0,
                    max: 2.0,
                },
            )),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

fn finite(value: f64, field: &str) -> Result<f64> {
    if !value.is_finite() {
        return Err(ValidationError::new(field, Violation::NonFinite));
    }
    Ok(value)
}

fn in_range(value: f64, min: f64, max: f64, field: &str) -> Result<f64> {
    if value < min || value > max {
        return Err(ValidationError::new(
            field,
            Violation::OutOfRange { value, min, max },
        ));
    }
    Ok(value)
}

fn positive_bounded(value: f64, max: f64, field: &str) -> Result<f64> {
    let value = finite(value, field)?;
    if value <= 0.0 || value > max {
        return Err(ValidationError::new(
            field,
            Violation::OutOfRange {
                value,
                min: 0.0,
                max,
            },
        ));
    }
    Ok(value)
}

/// `null` 视为缺省
fn present(raw: Option<&Value>) -> Option<&Value> {
    raw.filter(|v| !v.is_null())
}

fn required<'a>(raw: Option<&'a Value>, field: &str) -> Result<&'a Value> {
    present(raw).ok_or_else(|| ValidationError::new(field, Violation::Missing))
}

fn number(value: &Value, field: &str) -> Result<f64> {
    match value.as_f64() {
        Some(n) => finite(n, field),
        None => Err(ValidationError::new(
            field,
            Violation::WrongType { expected: "number" },
        )),
    }
}

fn integer(value: &Value, field: &str) -> Result<i32> {
    if let Some(n) = value.as_i64() {
        return i32::try_from(n).map_err(|_| {
            ValidationError::new(
                field,
                Violation::OutOfRange {
                    value: n as f64,
                    min: i32::MIN as f64,
                    max: i32::MAX as f64,
                },
            )
        });
    }
    match value.as_f64() {
        Some(n) if n.is_finite() && n.fract() == 0.0 && n.abs() <= i32::MAX as f64 => Ok(n as i32),
        _ => Err(ValidationError::new(
            field,
            Violation::WrongType { expected: "integer" },
        )),
    }
}

/// 数组或 JSON 数组字符串
fn array<'a>(value: &'a Value, field: &str) -> Result<std::borrow::Cow<'a, [Value]>> {
    const EXPECTED: &str = "array or JSON array string";
    match value {
        Value::Array(items) => Ok(std::borrow::Cow::Borrowed(items.as_slice())),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => Ok(std::borrow::Cow::Owned(items)),
            _ => Err(ValidationError::new(
                field,
                Violation::WrongType { expected: EXPECTED },
            )),
        },
        _ => Err(ValidationError::new(
            field,
            Violation::WrongType { expected: EXPECTED },
        )),
    }
}

fn number_list(value: &Value, field: &str) -> Result<Vec<f64>> {
    array(value, field)?
        .iter()
        .enumerate()
        .map(|(i, item)| number(item, &format!("{}[{}]", field, i)))
        .collect()
}

/// 关节向量：恰好 7 个有限值，且各自在关节限位内
pub fn validate_joints(
    raw: Option<&Value>,
    field: &str,
    limits: &LimitsConfig,
) -> Result<JointVector> {
    let values = number_list(required(raw, field)?, field)?;
    JointVector::checked(&values, field, limits)
}

/// 位姿向量：恰好 6 个有限值，姿态分量在角度上限内
pub fn validate_pose(raw: Option<&Value>, field: &str, limits: &LimitsConfig) -> Result<PoseVector> {
    let values = number_list(required(raw, field)?, field)?;
    PoseVector::checked(&values, field, limits)
}

/// 关节路径：1..=max_path_points 个路点，每个路点按关节向量校验
pub fn validate_joint_path(
    raw: Option<&Value>,
    field: &str,
    limits: &LimitsConfig,
) -> Result<JointPath> {
    let points = array(required(raw, field)?, field)?;
    if points.is_empty() || points.len() > limits.max_path_points {
        return Err(ValidationError::new(
            field,
            Violation::WrongArity {
                expected: format!("1..={}", limits.max_path_points),
                actual: points.len(),
            },
        ));
    }
    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let name = format!("{}[{}]", field, i);
            let values = number_list(point, &name)?;
            JointVector::checked(&values, &name, limits)
        })
        .collect::<Result<Vec<_>>>()
        .map(JointPath)
}

/// 速度；缺省时使用 `default`（同样经过校验）
pub fn validate_velocity(
    raw: Option<&Value>,
    default: f64,
    limits: &LimitsConfig,
) -> Result<Velocity> {
    let value = match present(raw) {
        Some(v) => number(v, "velocity")?,
        None => default,
    };
    Velocity::new(value, limits)
}

/// 加速度；缺省时使用 `default`
pub fn validate_acceleration(
    raw: Option<&Value>,
    default: f64,
    limits: &LimitsConfig,
) -> Result<Acceleration> {
    let value = match present(raw) {
        Some(v) => number(v, "acceleration")?,
        None => default,
    };
    Acceleration::new(value, limits)
}

/// TCP 方向：[-1, 5] 内的整数
pub fn validate_direction(raw: Option<&Value>, default: i32) -> Result<TcpDirection> {
    let value = match present(raw) {
        Some(v) => integer(v, "direction")?,
        None => default,
    };
    TcpDirection::new(value)
}

/// 自由驱动模式：0、1 或 2
pub fn validate_mode(raw: Option<&Value>, default: i32) -> Result<FreeDrivingMode> {
    let value = match present(raw) {
        Some(v) => integer(v, "mode")?,
        None => default,
    };
    FreeDrivingMode::from_code(value)
}

/// 设备地址参数：字符串或缺省（规范化由连接管理器完成）
pub fn validate_address(raw: Option<&Value>) -> Result<Option<&str>> {
    match present(raw) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ValidationError::new(
            "ip",
            Violation::WrongType { expected: "string" },
        )),
    }
}

/// 等待超时（秒）：非负有限数
pub fn validate_timeout(raw: Option<&Value>) -> Result<Option<Duration>> {
    let Some(value) = present(raw) else {
        return Ok(None);
    };
    let secs = number(value, "timeout")?;
    if secs < 0.0 {
        return Err(ValidationError::new(
            "timeout",
            Violation::OutOfRange {
                value: secs,
                min: 0.0,
                max: f64::MAX,
            },
        ));
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

/// 任务 ID：`task-<n>` 字符串或整数
pub fn validate_task_id(raw: Option<&Value>) -> Result<TaskId> {
    const EXPECTED: &str = "task id (\"task-<n>\" or integer)";
    let value = required(raw, "task_id")?;
    let parsed = match value {
        Value::String(s) => s.parse::<TaskId>().ok(),
        Value::Number(n) => n.as_u64().map(TaskId::from_raw),
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::new("task_id", Violation::WrongType { expected: EXPECTED }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    fn violation<T: std::fmt::Debug>(result: Result<T>) -> (String, Violation) {
        let err = result.unwrap_err();
        (err.field, err.violation)
    }

    #[test]
    fn test_joints_accepts_array_and_json_string() {
        let v = json!([0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]);
        let from_array = validate_joints(Some(&v), "joints", &limits()).unwrap();
        let s = json!("[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]");
        let from_string = validate_joints(Some(&s), "joints_json", &limits()).unwrap();

        assert_eq!(from_array, from_string);
        assert_eq!(from_array.as_array(), &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]);
    }

    #[test]
    fn test_joints_rejections() {
        let l = limits();

        let (field, v) = violation(validate_joints(Some(&json!(vec![0.0; 6])), "joints", &l));
        assert_eq!(field, "joints");
        assert_eq!(
            v,
            Violation::WrongArity {
                expected: "7".into(),
                actual: 6
            }
        );

        // J2 限位 ±2.09
        let (field, v) = violation(validate_joints(
            Some(&json!([0.0, 2.5, 0.0, 0.0, 0.0, 0.0, 0.0])),
            "joints",
            &l,
        ));
        assert_eq!(field, "joints[1]");
        assert_eq!(v.code(), "out_of_range");

        let (field, v) = violation(validate_joints(
            Some(&json!([0.0, "x", 0.0, 0.0, 0.0, 0.0, 0.0])),
            "joints",
            &l,
        ));
        assert_eq!(field, "joints[1]");
        assert_eq!(v, Violation::WrongType { expected: "number" });

        let (_, v) = violation(validate_joints(Some(&json!("not json")), "joints", &l));
        assert_eq!(v.code(), "wrong_type");

        let (_, v) = violation(validate_joints(Some(&json!({"a": 1})), "joints", &l));
        assert_eq!(v.code(), "wrong_type");

        let (_, v) = violation(validate_joints(None, "joints", &l));
        assert_eq!(v, Violation::Missing);

        let (_, v) = violation(validate_joints(Some(&Value::Null), "joints", &l));
        assert_eq!(v, Violation::Missing);
    }

    #[test]
    fn test_typed_entry_rejects_non_finite() {
        let l = limits();
        let mut values = [0.0; 7];
        values[4] = f64::NAN;
        let err = JointVector::new(&values, &l).unwrap_err();
        assert_eq!(err.field, "joints[4]");
        assert_eq!(err.violation, Violation::NonFinite);

        let pose = [0.1, f64::INFINITY, 0.3, 0.0, 0.0, 0.0];
        assert_eq!(
            PoseVector::new(&pose, &l).unwrap_err().violation,
            Violation::NonFinite
        );
        assert_eq!(
            Velocity::new(f64::NAN, &l).unwrap_err().violation,
            Violation::NonFinite
        );
    }

    #[test]
    fn test_pose_angle_limit() {
        let l = limits();
        let ok = json!([1.5, -20.0, 0.3, 3.15, -3.15, 0.0]);
        validate_pose(Some(&ok), "pose", &l).unwrap();

        let (field, v) = violation(validate_pose(
            Some(&json!([0.0, 0.0, 0.0, 0.0, 3.2, 0.0])),
            "pose",
            &l,
        ));
        assert_eq!(field, "pose[4]");
        assert_eq!(v.code(), "out_of_range");
    }

    #[test]
    fn test_velocity_and_acceleration() {
        let l = limits();
        assert_eq!(validate_velocity(None, 0.5, &l).unwrap().get(), 0.5);
        assert_eq!(validate_velocity(Some(&json!(1.0)), 0.5, &l).unwrap().get(), 1.0);
        assert!(validate_velocity(Some(&json!(0.0)), 0.5, &l).is_err());
        assert!(validate_velocity(Some(&json!(-0.1)), 0.5, &l).is_err());
        assert!(validate_velocity(Some(&json!(1.01)), 0.5, &l).is_err());
        assert!(validate_velocity(Some(&json!("fast")), 0.5, &l).is_err());
        assert_eq!(
            validate_acceleration(Some(&json!(2.0)), 0.5, &l)
                .unwrap_err()
                .field,
            "acceleration"
        );
    }

    #[test]
    fn test_direction_and_mode() {
        for d in -1..=5 {
            assert_eq!(validate_direction(Some(&json!(d)), 0).unwrap().get(), d);
        }
        assert!(validate_direction(Some(&json!(-2)), 0).is_err());
        assert!(validate_direction(Some(&json!(6)), 0).is_err());
        assert_eq!(
            validate_direction(Some(&json!(1.5)), 0).unwrap_err().violation,
            Violation::WrongType { expected: "integer" }
        );
        assert_eq!(validate_direction(Some(&json!(2.0)), 0).unwrap().get(), 2);
        assert_eq!(validate_direction(None, 0).unwrap().get(), 0);

        assert_eq!(validate_mode(None, 1).unwrap(), FreeDrivingMode::Normal);
        assert_eq!(validate_mode(Some(&json!(0)), 1).unwrap().code(), 0);
        assert_eq!(validate_mode(Some(&json!(2)), 1).unwrap(), FreeDrivingMode::Forced);
        assert!(validate_mode(Some(&json!(3)), 1).is_err());
        assert!(validate_mode(Some(&json!(true)), 1).is_err());
    }

    #[test]
    fn test_joint_path() {
        let l = limits();
        let zero = [0.0; 7];
        let path = json!([zero, [0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1]]);
        assert_eq!(validate_joint_path(Some(&path), "path", &l).unwrap().len(), 2);

        let (_, v) = violation(validate_joint_path(Some(&json!([])), "path", &l));
        assert_eq!(v.code(), "wrong_arity");

        let bad = json!([zero, zero, zero, [0.0, 9.0, 0.0, 0.0, 0.0, 0.0, 0.0]]);
        let (field, _) = violation(validate_joint_path(Some(&bad), "path", &l));
        assert_eq!(field, "path[3][1]");

        let too_long: Vec<[f64; 7]> = vec![[0.0; 7]; l.max_path_points + 1];
        assert!(validate_joint_path(Some(&json!(too_long)), "path", &l).is_err());
    }

    #[test]
    fn test_address_timeout_and_task_id() {
        assert_eq!(validate_address(None).unwrap(), None);
        assert_eq!(validate_address(Some(&Value::Null)).unwrap(), None);
        assert_eq!(
            validate_address(Some(&json!("10.0.0.1"))).unwrap(),
            Some("10.0.0.1")
        );
        assert!(validate_address(Some(&json!(42))).is_err());

        assert_eq!(validate_timeout(None).unwrap(), None);
        assert_eq!(
            validate_timeout(Some(&json!(0.25))).unwrap(),
            Some(Duration::from_millis(250))
        );
        assert!(validate_timeout(Some(&json!(-1))).is_err());

        assert_eq!(
            validate_task_id(Some(&json!("task-12"))).unwrap(),
            TaskId::from_raw(12)
        );
        assert_eq!(validate_task_id(Some(&json!(7))).unwrap(), TaskId::from_raw(7));
        assert!(validate_task_id(Some(&json!("job-1"))).is_err());
        assert_eq!(
            validate_task_id(None).unwrap_err().violation,
            Violation::Missing
        );
    }
}
