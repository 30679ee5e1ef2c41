//! 参数校验与地址规范化的属性测试

use diana_control::validate::{
    JointVector, Velocity, validate_direction, validate_joints, validate_pose, validate_velocity,
};
use diana_control::{ConnectionManager, LimitsConfig, ServerConfig, Violation};
use diana_driver::mock::{SimConfig, SimulatedBinding};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;

fn manager() -> ConnectionManager {
    let sim = SimulatedBinding::new(SimConfig::default());
    ConnectionManager::new(Arc::new(sim), &ServerConfig::default())
}

proptest! {
    /// 长度不为 7 的关节向量一律拒绝
    #[test]
    fn joints_with_wrong_arity_are_rejected(values in prop::collection::vec(-1.0..1.0f64, 0..16)) {
        prop_assume!(values.len() != 7);
        let err = validate_joints(Some(&json!(values)), "joints", &LimitsConfig::default()).unwrap_err();
        let is_arity = matches!(err.violation, Violation::WrongArity { .. });
        prop_assert!(is_arity);
        prop_assert_eq!(err.field, "joints");
    }

    /// 限位内的 7 维向量原样返回
    #[test]
    fn joints_within_limits_are_unchanged(values in prop::array::uniform7(-2.0..2.0f64)) {
        let joints = validate_joints(Some(&json!(values.to_vec())), "joints", &LimitsConfig::default()).unwrap();
        prop_assert_eq!(*joints.as_array(), values);
    }

    /// JSON 字符串形式与数组形式等价
    #[test]
    fn joints_json_string_matches_array(values in prop::array::uniform7(-2.0..2.0f64)) {
        let limits = LimitsConfig::default();
        let text = serde_json::to_string(&values.to_vec()).unwrap();
        let from_string = validate_joints(Some(&Value::String(text)), "joints_json", &limits).unwrap();
        let from_array = validate_joints(Some(&json!(values.to_vec())), "joints", &limits).unwrap();
        prop_assert_eq!(from_string, from_array);
    }

    /// 超出限位的单个关节报告其下标
    #[test]
    fn out_of_range_joint_names_its_index(index in 0usize..7, excess in 0.01..10.0f64) {
        let limits = LimitsConfig::default();
        let mut values = vec![0.0; 7];
        values[index] = limits.joint_limits[index][1] + excess;
        let err = validate_joints(Some(&json!(values)), "joints", &limits).unwrap_err();
        prop_assert_eq!(err.field, format!("joints[{}]", index));
        let is_range = matches!(err.violation, Violation::OutOfRange { .. });
        prop_assert!(is_range);
    }

    /// 位置分量只要求有限；姿态分量受角度上限约束
    #[test]
    fn pose_orientation_is_bounded(xyz in prop::array::uniform3(-100.0..100.0f64), angle in -6.0..6.0f64) {
        let limits = LimitsConfig::default();
        let pose = json!([xyz[0], xyz[1], xyz[2], angle, 0.0, 0.0]);
        let result = validate_pose(Some(&pose), "pose", &limits);
        prop_assert_eq!(result.is_ok(), angle.abs() <= limits.pose_angle_limit);
    }

    /// 速度必须在 (0, max] 内
    #[test]
    fn velocity_range(v in -2.0..2.0f64) {
        let limits = LimitsConfig::default();
        let ok = validate_velocity(Some(&json!(v)), 0.5, &limits).is_ok();
        prop_assert_eq!(ok, v > 0.0 && v <= limits.max_velocity);
    }

    /// 方向只接受 [-1, 5] 内的整数
    #[test]
    fn direction_range(d in -20i64..20) {
        let ok = validate_direction(Some(&json!(d)), 0).is_ok();
        prop_assert_eq!(ok, (-1..=5).contains(&d));
    }

    /// 空白、null 类字符串回落到默认地址
    #[test]
    fn absent_addresses_resolve_to_default(
        pad_left in "[ \t]{0,3}",
        pad_right in "[ \t]{0,3}",
        word in prop::sample::select(vec!["", "null", "NULL", "None", "none", "undefined"]),
    ) {
        let m = manager();
        let raw = format!("{}{}{}", pad_left, word, pad_right);
        prop_assert_eq!(m.resolve(Some(&raw)), m.default_address());
    }

    /// 合法 IPv4 地址（含首尾空白）规范化为自身
    #[test]
    fn valid_addresses_are_kept(octets in prop::array::uniform4(0u8..=255), pad in "[ ]{0,2}") {
        let m = manager();
        let text = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
        let resolved = m.resolve(Some(&format!("{}{}{}", pad, text, pad)));
        prop_assert_eq!(resolved.to_string(), text);
    }
}

#[test]
fn test_non_finite_values_are_rejected() {
    let limits = LimitsConfig::default();
    let text = Value::String("[0, 0, 0, 0, 0, 0, NaN]".to_string());
    assert!(validate_joints(Some(&text), "joints", &limits).is_err());

    let err = JointVector::new(
        &[0.0, 0.0, f64::NAN, 0.0, 0.0, 0.0, 0.0],
        &limits,
    )
    .unwrap_err();
    assert_eq!(err.violation, Violation::NonFinite);
    assert_eq!(err.field, "joints[2]");

    // JSON 没有无穷大，typed 入口同样拒绝
    assert!(Velocity::new(f64::INFINITY, &limits).is_err());
}

#[test]
fn test_json_string_keeps_full_float_precision() {
    let limits = LimitsConfig::default();
    let values: [f64; 7] = [
        0.36035866877676836,
        -1.8600795271598733,
        0.1,
        -0.30000000000000004,
        1.9999999999999998,
        0.0,
        2.0943951023931953,
    ];
    let text = serde_json::to_string(&values.to_vec()).unwrap();
    let joints = validate_joints(Some(&Value::String(text)), "joints_json", &limits).unwrap();
    for (parsed, sent) in joints.as_array().iter().zip(values) {
        assert_eq!(parsed.to_bits(), sent.to_bits());
    }
}
