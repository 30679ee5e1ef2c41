//! 按设备串行的任务队列
//!
//! 工作线程总是取"最早提交、且目标地址当前空闲"的任务。地址在取出时标记为忙，
//! 直到处理它的工作线程调用 [`Scheduler::release`]。因此同一地址的任务按提交顺序
//! 执行且互不重叠，不同地址的任务可以并行。

use super::engine::TaskCell;
use super::record::TaskId;
use crate::session::DeviceAddress;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<TaskCell>>,
    busy: HashSet<DeviceAddress>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Scheduler {
    /// 入队；队列已关闭时返回 false
    pub(crate) fn push(&self, cell: Arc<TaskCell>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.pending.push_back(cell);
        drop(state);
        self.available.notify_one();
        true
    }

    /// 阻塞直到有可运行任务；队列关闭后返回 None
    pub(crate) fn next(&self) -> Option<Arc<TaskCell>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            let runnable = state
                .pending
                .iter()
                .position(|cell| !state.busy.contains(&cell.address()));
            if let Some(index) = runnable
                && let Some(cell) = state.pending.remove(index)
            {
                state.busy.insert(cell.address());
                return Some(cell);
            }
            self.available.wait(&mut state);
        }
    }

    /// 释放地址，唤醒等待该地址的工作线程
    pub(crate) fn release(&self, address: DeviceAddress) {
        self.state.lock().busy.remove(&address);
        self.available.notify_all();
    }

    /// 从队列中移除尚未被取走的任务
    pub(crate) fn remove(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|cell| cell.id() != id);
        before != state.pending.len()
    }

    /// 关闭队列并取出所有未开始的任务
    pub(crate) fn close(&self) -> Vec<Arc<TaskCell>> {
        let mut state = self.state.lock();
        state.closed = true;
        let drained = state.pending.drain(..).collect();
        drop(state);
        self.available.notify_all();
        drained
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
