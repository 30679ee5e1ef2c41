//! 受保护的原生调用
//!
//! 每次原生调用都在独立的辅助线程中执行，并在该线程内持有 [`OutputGuard`]。
//! 调用方用 `recv_timeout` 等待结果：超过截止时间即返回超时错误，
//! 辅助线程继续运行直到原生调用自行返回（原生调用无法中断）。
//!
//! 结果通道容量为 0：只有调用方仍在等待时交付才会成功。
//! 调用方离开后才到达的结果退回辅助线程，由 `release` 回收
//! （例如关闭迟到的连接句柄）。

use crate::error::ControlError;
use crossbeam_channel::{RecvTimeoutError, SendError};
use diana_driver::{DriverError, OutputGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 在辅助线程中执行 `call`，最多等待 `deadline`
pub(crate) fn call_native<T, F>(
    operation: &'static str,
    address: &str,
    deadline: Duration,
    call: F,
) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DriverError> + Send + 'static,
{
    call_native_or_release(operation, address, deadline, call, drop)
}

/// 同 [`call_native`]；调用方超时离开后才成功返回的值交给 `release`
pub(crate) fn call_native_or_release<T, F, R>(
    operation: &'static str,
    address: &str,
    deadline: Duration,
    call: F,
    release: R,
) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DriverError> + Send + 'static,
    R: FnOnce(T) + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(0);
    let target = address.to_string();

    let spawned = thread::Builder::new()
        .name(format!("native-{}", operation))
        .spawn(move || {
            let result = OutputGuard::scope(call);
            if let Err(SendError(Ok(value))) = tx.send(result) {
                debug!(address = %target, operation, "Releasing result of abandoned native call");
                OutputGuard::scope(|| release(value));
            }
        });
    if let Err(e) = spawned {
        return Err(ControlError::Hardware {
            address: address.to_string(),
            message: format!("{}: failed to spawn native call thread: {}", operation, e),
        });
    }

    match rx.recv_timeout(deadline) {
        Ok(Ok(value)) => {
            trace!(address, operation, "Native call completed");
            Ok(value)
        },
        Ok(Err(DriverError::Timeout)) => Err(timeout(operation, address, deadline)),
        Ok(Err(err)) => Err(ControlError::from_driver(address, operation, err)),
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                address,
                operation,
                deadline_ms = deadline.as_millis() as u64,
                "Native call exceeded its deadline; the call keeps running in the background"
            );
            Err(timeout(operation, address, deadline))
        },
        Err(RecvTimeoutError::Disconnected) => Err(ControlError::Hardware {
            address: address.to_string(),
            message: format!("{}: native call panicked", operation),
        }),
    }
}

fn timeout(operation: &str, address: &str, deadline: Duration) -> ControlError {
    ControlError::Timeout {
        operation: operation.to_string(),
        address: address.to_string(),
        timeout_ms: deadline.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;
    use std::time::Instant;

    #[test]
    #[serial]
    fn test_value_is_returned() {
        let v = call_native("getJointPos", "10.0.0.1", Duration::from_secs(1), || Ok(42)).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    #[serial]
    fn test_deadline_bounds_hung_call() {
        let start = Instant::now();
        let err = call_native("moveTCP", "10.0.0.1", Duration::from_millis(50), || {
            thread::sleep(Duration::from_millis(400));
            Ok(())
        })
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    #[serial]
    fn test_late_result_is_released() {
        let (released_tx, released_rx) = crossbeam_channel::bounded(1);
        let err = call_native_or_release(
            "initSrv",
            "10.0.0.1",
            Duration::from_millis(30),
            || {
                thread::sleep(Duration::from_millis(120));
                Ok(7)
            },
            move |value| {
                let _ = released_tx.send(value);
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert_eq!(released_rx.recv_timeout(Duration::from_secs(2)), Ok(7));
    }

    #[test]
    #[serial]
    fn test_delivered_result_is_not_released() {
        let (released_tx, released_rx) = crossbeam_channel::bounded::<i32>(1);
        let v = call_native_or_release(
            "initSrv",
            "10.0.0.1",
            Duration::from_secs(1),
            || Ok(3),
            move |value| {
                let _ = released_tx.send(value);
            },
        )
        .unwrap();
        assert_eq!(v, 3);
        assert!(released_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    #[serial]
    fn test_driver_errors_are_classified() {
        let err = call_native::<(), _>("stop", "10.0.0.1", Duration::from_secs(1), || {
            Err(DriverError::InvalidHandle("gone".into()))
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);

        let err = call_native::<(), _>("stop", "10.0.0.1", Duration::from_secs(1), || {
            Err(DriverError::Timeout)
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
    }

    #[test]
    #[serial]
    fn test_panicking_call_is_hardware_error_and_restores_output() {
        let err = call_native::<(), _>("resume", "10.0.0.1", Duration::from_secs(1), || {
            panic!("binding blew up")
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareError);

        // 其他测试遗留的辅助线程可能仍持有守卫
        let deadline = Instant::now() + Duration::from_secs(2);
        while OutputGuard::depth() != 0 {
            assert!(Instant::now() < deadline, "output guard never released");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
