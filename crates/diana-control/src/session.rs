//! 连接管理
//!
//! 每个设备地址至多一个活动会话。首次使用时惰性连接；同一地址的连接操作
//! 由该地址自己的锁串行化，不同地址互不阻塞。

use crate::config::{DEFAULT_ROBOT_IP, ServerConfig, TimeoutConfig};
use crate::error::{ControlError, Result};
use crate::native::{call_native, call_native_or_release};
use crate::task::epoch_ms;
use diana_driver::{RobotBinding, RobotLink};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// 规范化后的设备地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(Ipv4Addr);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeviceAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 一个活动会话（独占一个原生句柄）
pub struct Session {
    address: DeviceAddress,
    link: Arc<dyn RobotLink>,
    generation: u64,
}

impl Session {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn link(&self) -> Arc<dyn RobotLink> {
        Arc::clone(&self.link)
    }

    /// 该地址第几次成功打开产生的会话
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish()
    }
}

/// `connect` 的结果
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub session: Arc<Session>,
    /// true 表示本次调用新打开了句柄，false 表示复用
    pub newly_opened: bool,
}

/// 会话状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub address: DeviceAddress,
    pub connected: bool,
    pub generation: u64,
    pub last_error: Option<String>,
    pub connected_at: Option<u64>,
}

#[derive(Default)]
struct SlotState {
    session: Option<Arc<Session>>,
    last_error: Option<String>,
    generation: u64,
    connected_at: Option<SystemTime>,
}

#[derive(Default)]
struct SessionSlot {
    state: Mutex<SlotState>,
}

/// 连接管理器
pub struct ConnectionManager {
    binding: Arc<dyn RobotBinding>,
    default_address: DeviceAddress,
    timeouts: TimeoutConfig,
    slots: Mutex<HashMap<DeviceAddress, Arc<SessionSlot>>>,
}

impl ConnectionManager {
    pub fn new(binding: Arc<dyn RobotBinding>, config: &ServerConfig) -> Self {
        let default_address = config
            .robot
            .default_address
            .parse()
            .unwrap_or_else(|_| {
                warn!(
                    configured = %config.robot.default_address,
                    "Invalid default address in config, using {}", DEFAULT_ROBOT_IP
                );
                DeviceAddress(DEFAULT_ROBOT_IP)
            });
        Self {
            binding,
            default_address,
            timeouts: config.timeouts.clone(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_address(&self) -> DeviceAddress {
        self.default_address
    }

    /// 地址规范化
    ///
    /// 缺省、空白、`null`/`None`/`undefined`（不区分大小写）以及无法解析的
    /// 字符串都回落到默认地址；无法解析时记录警告。
    pub fn resolve(&self, raw: Option<&str>) -> DeviceAddress {
        let Some(raw) = raw.map(str::trim) else {
            return self.default_address;
        };
        if raw.is_empty()
            || ["null", "none", "undefined"]
                .iter()
                .any(|absent| raw.eq_ignore_ascii_case(absent))
        {
            return self.default_address;
        }
        match raw.parse::<DeviceAddress>() {
            Ok(address) => address,
            Err(_) => {
                warn!(
                    input = raw,
                    default = %self.default_address,
                    "Malformed device address, using default"
                );
                self.default_address
            },
        }
    }

    fn slot(&self, address: DeviceAddress) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(address).or_default())
    }

    fn existing_slot(&self, address: DeviceAddress) -> Option<Arc<SessionSlot>> {
        self.slots.lock().get(&address).cloned()
    }

    /// 返回现有会话，或打开一个新会话（不自动重试）
    pub fn ensure_connected(&self, address: DeviceAddress) -> Result<Arc<Session>> {
        self.connect(address).map(|outcome| outcome.session)
    }

    /// 同 [`ensure_connected`](Self::ensure_connected)，并报告是否新打开
    pub fn connect(&self, address: DeviceAddress) -> Result<ConnectOutcome> {
        let slot = self.slot(address);
        let mut state = slot.state.lock();
        if let Some(session) = &state.session {
            return Ok(ConnectOutcome {
                session: Arc::clone(session),
                newly_opened: false,
            });
        }
        let session = self.open_locked(address, &mut state)?;
        Ok(ConnectOutcome {
            session,
            newly_opened: true,
        })
    }

    fn open_locked(&self, address: DeviceAddress, state: &mut SlotState) -> Result<Arc<Session>> {
        let binding = Arc::clone(&self.binding);
        let target = address.to_string();
        let opened = call_native_or_release(
            "initSrv",
            &target,
            self.timeouts.connect(),
            {
                let target = target.clone();
                move || binding.open(&target)
            },
            // 超时后才打开的句柄不会进入会话表，必须就地关闭
            move |late: Arc<dyn RobotLink>| {
                warn!(address = %address, "Closing handle opened after connect deadline");
                if let Err(e) = late.close() {
                    warn!(address = %address, error = %e, "Failed to close late handle");
                }
            },
        );

        match opened {
            Ok(link) => {
                state.generation += 1;
                state.connected_at = Some(SystemTime::now());
                state.last_error = None;
                let session = Arc::new(Session {
                    address,
                    link,
                    generation: state.generation,
                });
                state.session = Some(Arc::clone(&session));
                info!(address = %address, generation = state.generation, "Robot connected");
                Ok(session)
            },
            Err(err) => {
                let err = match err {
                    // 打开失败统一视为连接错误
                    ControlError::Hardware { message, .. } => ControlError::Connection {
                        address: target,
                        message,
                    },
                    other => other,
                };
                warn!(address = %address, error = %err, "Failed to connect");
                state.last_error = Some(err.to_string());
                Err(err)
            },
        }
    }

    fn close_session(&self, session: &Session) {
        let link = session.link();
        let address = session.address.to_string();
        if let Err(e) = call_native("destroySrv", &address, self.timeouts.control(), move || {
            link.close()
        }) {
            warn!(address = %session.address, error = %e, "Failed to close native handle cleanly");
        }
    }

    /// 断开（幂等）；返回是否确实释放了句柄
    pub fn disconnect(&self, address: DeviceAddress) -> bool {
        let Some(slot) = self.existing_slot(address) else {
            return false;
        };
        let mut state = slot.state.lock();
        match state.session.take() {
            Some(session) => {
                self.close_session(&session);
                state.connected_at = None;
                info!(address = %address, "Robot disconnected");
                true
            },
            None => false,
        }
    }

    pub fn is_connected(&self, address: DeviceAddress) -> bool {
        self.existing_slot(address)
            .is_some_and(|slot| slot.state.lock().session.is_some())
    }

    /// 断开后重新连接
    pub fn reconnect(&self, address: DeviceAddress) -> Result<Arc<Session>> {
        let slot = self.slot(address);
        let mut state = slot.state.lock();
        if let Some(old) = state.session.take() {
            self.close_session(&old);
        }
        self.open_locked(address, &mut state)
    }

    /// 替换已失效的会话
    ///
    /// 若该地址的当前会话已不是 `stale`（其他调用方已重连），直接返回当前会话。
    pub fn reconnect_from(&self, stale: &Session) -> Result<Arc<Session>> {
        let address = stale.address;
        let slot = self.slot(address);
        let mut state = slot.state.lock();
        let replaced = state
            .session
            .as_ref()
            .filter(|current| current.generation != stale.generation)
            .cloned();
        if let Some(current) = replaced {
            debug!(address = %address, "Session already replaced by another caller");
            return Ok(current);
        }
        if let Some(old) = state.session.take() {
            self.close_session(&old);
        }
        self.open_locked(address, &mut state)
    }

    /// 记录最近一次失败
    pub fn record_error(&self, address: DeviceAddress, error: &ControlError) {
        self.slot(address).state.lock().last_error = Some(error.to_string());
    }

    /// 所有已知地址的会话状态（按地址排序）
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let slots: Vec<(DeviceAddress, Arc<SessionSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(address, slot)| (*address, Arc::clone(slot)))
            .collect();

        let mut infos: Vec<SessionInfo> = slots
            .into_iter()
            .map(|(address, slot)| {
                let state = slot.state.lock();
                SessionInfo {
                    address,
                    connected: state.session.is_some(),
                    generation: state.generation,
                    last_error: state.last_error.clone(),
                    connected_at: state.connected_at.map(epoch_ms),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.address);
        infos
    }

    /// 释放所有句柄
    pub fn shutdown(&self) {
        let slots: Vec<Arc<SessionSlot>> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            let mut state = slot.state.lock();
            if let Some(session) = state.session.take() {
                self.close_session(&session);
                state.connected_at = None;
                info!(address = %session.address, "Released session on shutdown");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
