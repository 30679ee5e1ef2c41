//! 任务引擎
//!
//! 把阻塞的执行器调用变成可追踪、可取消、可等待的任务：
//! - 查询类命令在 `submit` 内同步执行，直接返回终态快照
//! - 其他命令进入按设备串行的队列，由固定数量的工作线程执行
//! - 取消是协作式的：置位取消标志，对运行中的任务再下发一次停止

use super::record::{TaskId, TaskRecord, TaskSnapshot, TaskState};
use super::scheduler::Scheduler;
use crate::command::{Command, CommandClass, CommandOutput};
use crate::config::EngineConfig;
use crate::error::{ControlError, Result};
use crate::executor::{CancelToken, RobotExecutor};
use crate::session::DeviceAddress;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 关闭时等待全部工作线程退出的上限
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 工作线程退出时（包括 panic 展开）报告自己的编号
struct ExitNotice {
    index: usize,
    tx: Sender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.index);
    }
}

struct Worker {
    index: usize,
    handle: JoinHandle<()>,
}

/// 单个任务的共享单元：记录 + 状态变化通知 + 取消标志
pub(crate) struct TaskCell {
    id: TaskId,
    address: DeviceAddress,
    class: CommandClass,
    record: Mutex<TaskRecord>,
    changed: Condvar,
    cancel: CancelToken,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId, command: Command) -> Self {
        Self {
            id,
            address: command.address,
            class: command.class(),
            record: Mutex::new(TaskRecord::new(id, command)),
            changed: Condvar::new(),
            cancel: CancelToken::new(),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn address(&self) -> DeviceAddress {
        self.address
    }

    fn snapshot(&self) -> TaskSnapshot {
        self.record.lock().snapshot()
    }

    /// 进入终态并唤醒等待者
    fn finish(&self, outcome: Result<CommandOutput>) -> bool {
        let finished = self.record.lock().finish(outcome);
        if finished {
            self.changed.notify_all();
        }
        finished
    }
}

struct EngineShared {
    executor: Arc<RobotExecutor>,
    config: EngineConfig,
    registry: RwLock<HashMap<TaskId, Arc<TaskCell>>>,
    scheduler: Scheduler,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl EngineShared {
    fn worker_loop(&self, index: usize) {
        debug!(worker = index, "Task worker started");
        while let Some(cell) = self.scheduler.next() {
            self.run(&cell);
            self.scheduler.release(cell.address());
        }
        debug!(worker = index, "Task worker exiting");
    }

    fn run(&self, cell: &TaskCell) {
        let command = {
            let mut record = cell.record.lock();
            if !record.start() {
                // 排队期间已被取消
                return;
            }
            record.command.clone()
        };
        cell.changed.notify_all();
        info!(task_id = %cell.id, address = %cell.address, operation = command.native_name(), "Task started");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.executor.execute(&command, &cell.cancel)
        }))
        .unwrap_or_else(|_| {
            error!(task_id = %cell.id, "Executor panicked");
            Err(ControlError::Hardware {
                address: cell.address.to_string(),
                message: format!("{}: executor panicked", command.native_name()),
            })
        });

        let outcome = match outcome {
            _ if cell.cancel.is_cancelled() => {
                Err(ControlError::Cancelled(format!("{} cancelled by request", cell.id)))
            },
            other => other,
        };

        match &outcome {
            Ok(_) => info!(task_id = %cell.id, "Task succeeded"),
            Err(ControlError::Cancelled(_)) => info!(task_id = %cell.id, "Task cancelled"),
            Err(e) => warn!(task_id = %cell.id, error = %e, "Task failed"),
        }
        cell.finish(outcome);
    }

    fn cell(&self, id: TaskId) -> Result<Arc<TaskCell>> {
        self.registry
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }
}

/// 任务引擎
pub struct TaskEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<Worker>>,
    exited: Receiver<usize>,
}

impl TaskEngine {
    /// 创建引擎并启动 `config.workers` 个工作线程
    pub fn new(executor: Arc<RobotExecutor>, config: EngineConfig) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(EngineShared {
            executor,
            config,
            registry: RwLock::new(HashMap::new()),
            scheduler: Scheduler::default(),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });

        let (exit_tx, exited) = crossbeam_channel::unbounded();
        let workers = (0..worker_count)
            .filter_map(|index| {
                let shared = Arc::clone(&shared);
                let notice = ExitNotice {
                    index,
                    tx: exit_tx.clone(),
                };
                std::thread::Builder::new()
                    .name(format!("task-worker-{}", index))
                    .spawn(move || {
                        let _notice = notice;
                        shared.worker_loop(index);
                    })
                    .map(|handle| Worker { index, handle })
                    .map_err(|e| error!(worker = index, "Failed to spawn task worker: {}", e))
                    .ok()
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
            exited,
        }
    }

    pub fn executor(&self) -> &Arc<RobotExecutor> {
        &self.shared.executor
    }

    /// 提交命令
    ///
    /// 查询类命令同步执行并返回终态快照；其他命令返回 `PENDING` 快照。
    pub fn submit(&self, command: Command) -> Result<TaskSnapshot> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(ControlError::Cancelled(
                "task engine is shutting down".to_string(),
            ));
        }
        self.reap();

        let id = TaskId::from_raw(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let cell = Arc::new(TaskCell::new(id, command));
        let class = cell.class;
        self.shared
            .registry
            .write()
            .insert(id, Arc::clone(&cell));

        if class == CommandClass::Query {
            self.shared.run(&cell);
            return Ok(cell.snapshot());
        }

        if !self.shared.scheduler.push(Arc::clone(&cell)) {
            cell.finish(Err(ControlError::Cancelled(
                "task engine is shutting down".to_string(),
            )));
            return Ok(cell.snapshot());
        }
        debug!(
            task_id = %id,
            address = %cell.address,
            pending = self.shared.scheduler.pending_len(),
            "Task queued"
        );
        Ok(cell.snapshot())
    }

    /// 当前快照
    pub fn get(&self, id: TaskId) -> Result<TaskSnapshot> {
        Ok(self.shared.cell(id)?.snapshot())
    }

    /// 等待任务进入终态，最多 `timeout`（缺省用配置值，上限 `wait_max`）
    ///
    /// 超时返回当前（非终态）快照，不视为错误。
    pub fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<TaskSnapshot> {
        let cell = self.shared.cell(id)?;
        let timeout = timeout
            .map(|t| t.min(self.shared.config.wait_max()))
            .unwrap_or_else(|| self.shared.config.wait_default());
        let deadline = Instant::now() + timeout;

        let mut record = cell.record.lock();
        while !record.state.is_terminal() {
            if cell.changed.wait_until(&mut record, deadline).timed_out() {
                break;
            }
        }
        Ok(record.snapshot())
    }

    /// 取消任务
    ///
    /// - `PENDING`：直接进入 `CANCELLED`，不会执行
    /// - `RUNNING`：置位取消标志并向设备下发一次停止；停止被确认即进入 `CANCELLED`，
    ///   否则记录 `stopError`，等执行器返回后进入 `CANCELLED`
    /// - 终态：无操作
    pub fn cancel(&self, id: TaskId) -> Result<TaskSnapshot> {
        let cell = self.shared.cell(id)?;
        let first_request = cell.cancel.cancel();

        let state = {
            let mut record = cell.record.lock();
            if !record.state.is_terminal() {
                record.cancel_requested = true;
            }
            let state = record.state;
            // 持锁完成 PENDING -> CANCELLED，工作线程随后的 start() 会失败
            if state == TaskState::Pending {
                record.finish(Err(ControlError::Cancelled(format!(
                    "{} cancelled before it started",
                    id
                ))));
            }
            state
        };
        cell.changed.notify_all();

        match state {
            TaskState::Pending => {
                self.shared.scheduler.remove(id);
                info!(task_id = %id, "Pending task cancelled");
            },
            // 只有运动需要补偿停止；控制指令在返回后按取消收尾
            TaskState::Running if first_request && cell.class != CommandClass::Motion => {
                info!(task_id = %id, "Cancel requested for running non-motion task");
            },
            TaskState::Running if first_request => {
                info!(task_id = %id, address = %cell.address, "Cancelling running task, issuing stop");
                match self.shared.executor.stop(cell.address) {
                    Ok(_) => {
                        cell.finish(Err(ControlError::Cancelled(format!(
                            "{} cancelled; stop acknowledged",
                            id
                        ))));
                    },
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Stop for cancelled task failed");
                        cell.record.lock().stop_error = Some(e.to_string());
                        cell.changed.notify_all();
                    },
                }
            },
            _ => {},
        }

        Ok(cell.snapshot())
    }

    /// 所有任务快照（按 ID 排序）
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let cells: Vec<Arc<TaskCell>> = self.shared.registry.read().values().cloned().collect();
        let mut snapshots: Vec<TaskSnapshot> = cells.iter().map(|cell| cell.snapshot()).collect();
        snapshots.sort_by_key(|s| s.task_id);
        snapshots
    }

    /// 回收终态、已被观察且超过保留期的任务；返回回收数量
    pub fn reap(&self) -> usize {
        let retention = self.shared.config.retention();
        let now = Instant::now();
        let mut registry = self.shared.registry.write();
        let before = registry.len();
        registry.retain(|_, cell| {
            let record = cell.record.lock();
            let expired = record.state.is_terminal()
                && record.observed
                && record
                    .ended
                    .is_some_and(|ended| now.saturating_duration_since(ended) >= retention);
            !expired
        });
        let reaped = before - registry.len();
        if reaped > 0 {
            debug!(reaped, "Reaped finished tasks");
        }
        reaped
    }

    /// 注册表中的任务数
    pub fn len(&self) -> usize {
        self.shared.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止接收任务，取消未完成任务，并等待工作线程退出
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down task engine");

        for cell in self.shared.scheduler.close() {
            cell.cancel.cancel();
            cell.record.lock().cancel_requested = true;
            cell.finish(Err(ControlError::Cancelled(
                "task engine shut down before the task started".to_string(),
            )));
        }

        let running: Vec<TaskId> = self
            .list()
            .into_iter()
            .filter(|s| s.state == TaskState::Running)
            .map(|s| s.task_id)
            .collect();
        for id in running {
            let _ = self.cancel(id);
        }

        // 整体截止时间；迟迟不退出的工作线程（卡在原生调用里）被分离
        let mut workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
        while !workers.is_empty() {
            let index = match self.exited.recv_deadline(deadline) {
                Ok(index) => index,
                Err(_) => break,
            };
            if let Some(pos) = workers.iter().position(|w| w.index == index) {
                let worker = workers.swap_remove(pos);
                if worker.handle.join().is_err() {
                    warn!(worker = index, "Task worker panicked");
                }
            }
        }
        for worker in &workers {
            warn!(worker = worker.index, "Task worker did not exit in time; detaching");
        }
        info!(detached = workers.len(), "Task engine stopped");
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
