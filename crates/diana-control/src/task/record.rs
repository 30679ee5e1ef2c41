//! 任务记录与快照

use crate::command::{Command, CommandOutput};
use crate::error::{ControlError, ErrorInfo};
use serde::{Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 进程内唯一的任务 ID，显示为 `task-<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = ParseIntError;

    /// 接受 `task-12` 或 `12`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix("task-").unwrap_or(s);
        digits.parse::<u64>().map(Self)
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 任务状态
///
/// ```text
/// PENDING --> RUNNING --> SUCCEEDED | FAILED | CANCELLED
/// PENDING --> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// 任务的只读快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub state: TaskState,
    pub command: Command,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_error: Option<String>,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Unix 纪元毫秒
pub fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 任务的可变记录（仅由引擎持锁修改）
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub(crate) id: TaskId,
    pub(crate) state: TaskState,
    pub(crate) command: Command,
    result: Option<CommandOutput>,
    error: Option<ErrorInfo>,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    ended_at: Option<SystemTime>,
    /// 进入终态的单调时间（用于回收）
    pub(crate) ended: Option<Instant>,
    pub(crate) cancel_requested: bool,
    pub(crate) stop_error: Option<String>,
    /// 终态快照是否已交给调用方
    pub(crate) observed: bool,
}

impl TaskRecord {
    pub(crate) fn new(id: TaskId, command: Command) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            command,
            result: None,
            error: None,
            created_at: SystemTime::now(),
            started_at: None,
            ended_at: None,
            ended: None,
            cancel_requested: false,
            stop_error: None,
            observed: false,
        }
    }

    /// PENDING -> RUNNING；其他状态返回 false
    pub(crate) fn start(&mut self) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Running;
        self.started_at = Some(SystemTime::now());
        true
    }

    /// 进入终态；已是终态时不做任何修改并返回 false
    pub(crate) fn finish(&mut self, outcome: Result<CommandOutput, ControlError>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match outcome {
            Ok(output) => {
                self.state = TaskState::Succeeded;
                self.result = Some(output);
            },
            Err(err @ ControlError::Cancelled(_)) => {
                self.state = TaskState::Cancelled;
                self.error = Some(err.info());
            },
            Err(err) => {
                self.state = TaskState::Failed;
                self.error = Some(err.info());
            },
        }
        self.ended_at = Some(SystemTime::now());
        self.ended = Some(Instant::now());
        true
    }

    /// 生成快照；终态快照会标记为已观察
    pub(crate) fn snapshot(&mut self) -> TaskSnapshot {
        if self.state.is_terminal() {
            self.observed = true;
        }
        TaskSnapshot {
            task_id: self.id,
            state: self.state,
            command: self.command.clone(),
            result: self.result.clone(),
            error_info: self.error.clone(),
            created_at: epoch_ms(self.created_at),
            started_at: self.started_at.map(epoch_ms),
            ended_at: self.ended_at.map(epoch_ms),
            cancel_requested: self.cancel_requested,
            stop_error: self.stop_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    fn record() -> TaskRecord {
        let command = Command::new("10.0.0.1".parse().unwrap(), CommandKind::Stop);
        TaskRecord::new(TaskId::from_raw(3), command)
    }

    #[test]
    fn test_task_id_format() {
        let id = TaskId::from_raw(42);
        assert_eq!(id.to_string(), "task-42");
        assert_eq!("task-42".parse::<TaskId>().unwrap(), id);
        assert_eq!(" 42 ".parse::<TaskId>().unwrap(), id);
        assert!("task-".parse::<TaskId>().is_err());
        assert!("job-42".parse::<TaskId>().is_err());
        assert_eq!(serde_json::to_value(id).unwrap(), "task-42");
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut rec = record();
        assert!(rec.start());
        assert!(!rec.start());
        assert!(rec.finish(Ok(CommandOutput::ack("stopped"))));
        assert_eq!(rec.state, TaskState::Succeeded);

        assert!(!rec.finish(Err(ControlError::Cancelled("late".into()))));
        assert_eq!(rec.state, TaskState::Succeeded);
        assert!(rec.snapshot().error_info.is_none());
    }

    #[test]
    fn test_failure_populates_error_info() {
        let mut rec = record();
        rec.start();
        rec.finish(Err(ControlError::Hardware {
            address: "10.0.0.1".into(),
            message: "estop".into(),
        }));
        let snap = rec.snapshot();
        assert_eq!(snap.state, TaskState::Failed);
        assert_eq!(snap.error_info.unwrap().kind.as_str(), "HARDWARE_ERROR");
        assert!(snap.ended_at.is_some());
        assert!(rec.observed);
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut rec = record();
        let value = serde_json::to_value(rec.snapshot()).unwrap();
        assert_eq!(value["taskId"], "task-3");
        assert_eq!(value["state"], "PENDING");
        assert_eq!(value["cancelRequested"], false);
        assert!(value.get("result").is_none());
        assert!(!rec.observed);
    }
}
