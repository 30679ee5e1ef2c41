//! 原生输出隔离
//!
//! 厂商 SDK 会直接向文件描述符 1/2 打印调试信息，这会污染 stdio 协议通道。
//! [`OutputGuard`] 在作用域内把 fd 1/2 重定向到丢弃目标，离开作用域时无条件恢复
//! （包括错误返回和 panic 展开）。
//!
//! 重定向是进程级的：嵌套或并发的获取共享同一次重定向（引用计数），
//! 最后一个守卫释放时才恢复。协议传输和日志必须通过 [`PrivateStdio`] 写出，
//! 它持有原始描述符的副本，不受重定向影响。
//!
//! 非 Unix 平台上守卫为空操作。

use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::warn;

/// 被屏蔽输出的去向
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputSink {
    /// 丢弃（/dev/null）
    #[default]
    Discard,
    /// 追加写入日志文件
    AppendTo(PathBuf),
}

struct GuardState {
    depth: usize,
    sink: OutputSink,
    saved: Option<imp::Saved>,
}

static STATE: Mutex<GuardState> = parking_lot::const_mutex(GuardState {
    depth: 0,
    sink: OutputSink::Discard,
    saved: None,
});

/// 输出屏蔽守卫（RAII）
#[must_use = "output is restored as soon as the guard is dropped"]
pub struct OutputGuard {
    _private: (),
}

impl OutputGuard {
    /// 获取守卫
    ///
    /// 最外层获取执行重定向；重定向失败只记录警告，不阻止原生调用。
    pub fn acquire() -> Self {
        let mut state = STATE.lock();
        if state.depth == 0 {
            match imp::redirect(&state.sink) {
                Ok(saved) => state.saved = Some(saved),
                Err(e) => warn!("Failed to redirect native output: {}", e),
            }
        }
        state.depth += 1;
        OutputGuard { _private: () }
    }

    /// 在守卫作用域内执行闭包
    pub fn scope<T>(f: impl FnOnce() -> T) -> T {
        let _guard = Self::acquire();
        f()
    }

    /// 设置屏蔽输出的去向（下一次最外层获取时生效）
    pub fn set_sink(sink: OutputSink) {
        STATE.lock().sink = sink;
    }

    /// 当前嵌套深度（0 表示未重定向）
    pub fn depth() -> usize {
        STATE.lock().depth
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0
            && let Some(saved) = state.saved.take()
            && let Err(e) = imp::restore(saved)
        {
            warn!("Failed to restore standard streams: {}", e);
        }
    }
}

/// 原始 stdout/stderr 的私有副本
pub struct PrivateStdio {
    /// 原始 stdout
    pub stdout: PrivateStream,
    /// 原始 stderr
    pub stderr: PrivateStream,
}

impl PrivateStdio {
    /// 复制原始标准流
    ///
    /// 若调用时重定向正在生效，复制的是被保存的原始描述符。
    pub fn capture() -> io::Result<Self> {
        let state = STATE.lock();
        let (stdout, stderr) = imp::capture(state.saved.as_ref())?;
        Ok(Self {
            stdout: PrivateStream { inner: stdout },
            stderr: PrivateStream { inner: stderr },
        })
    }
}

/// 不受 [`OutputGuard`] 影响的输出流
pub struct PrivateStream {
    inner: imp::Stream,
}

impl PrivateStream {
    /// 复制一个指向同一目标的新流
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            inner: imp::try_clone(&self.inner)?,
        })
    }
}

impl Write for PrivateStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(unix)]
mod imp {
    use super::OutputSink;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    const STDOUT_FD: RawFd = libc::STDOUT_FILENO;
    const STDERR_FD: RawFd = libc::STDERR_FILENO;

    pub(super) struct Saved {
        stdout: OwnedFd,
        stderr: OwnedFd,
    }

    pub(super) type Stream = File;

    fn dup(fd: RawFd) -> io::Result<OwnedFd> {
        // SAFETY: dup 不访问调用方内存；成功时返回的新描述符由 OwnedFd 独占
        let ret = unsafe { libc::dup(fd) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(ret) })
    }

    fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
        loop {
            // SAFETY: 两个描述符在调用期间都有效；dup2 原子地替换 dst
            let ret = unsafe { libc::dup2(src, dst) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush_std() {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }

    pub(super) fn redirect(sink: &OutputSink) -> io::Result<Saved> {
        let target = match sink {
            OutputSink::Discard => OpenOptions::new().write(true).open("/dev/null")?,
            OutputSink::AppendTo(path) => {
                OpenOptions::new().create(true).append(true).open(path)?
            },
        };

        flush_std();
        let saved = Saved {
            stdout: dup(STDOUT_FD)?,
            stderr: dup(STDERR_FD)?,
        };

        dup2(target.as_raw_fd(), STDOUT_FD)?;
        if let Err(e) = dup2(target.as_raw_fd(), STDERR_FD) {
            let _ = dup2(saved.stdout.as_raw_fd(), STDOUT_FD);
            return Err(e);
        }
        // target 在这里关闭；fd 1/2 仍指向同一打开文件
        Ok(saved)
    }

    pub(super) fn restore(saved: Saved) -> io::Result<()> {
        flush_std();
        let out = dup2(saved.stdout.as_raw_fd(), STDOUT_FD);
        let err = dup2(saved.stderr.as_raw_fd(), STDERR_FD);
        out.and(err)
    }

    pub(super) fn capture(saved: Option<&Saved>) -> io::Result<(Stream, Stream)> {
        let (out, err) = match saved {
            Some(saved) => (saved.stdout.try_clone()?, saved.stderr.try_clone()?),
            None => (dup(STDOUT_FD)?, dup(STDERR_FD)?),
        };
        Ok((File::from(out), File::from(err)))
    }

    pub(super) fn try_clone(stream: &Stream) -> io::Result<Stream> {
        stream.try_clone()
    }
}

#[cfg(not(unix))]
mod imp {
    use super::OutputSink;
    use std::io::{self, Write};

    pub(super) struct Saved;

    #[derive(Clone, Copy)]
    pub(super) enum Stream {
        Stdout,
        Stderr,
    }

    impl Write for Stream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self {
                Stream::Stdout => io::stdout().write(buf),
                Stream::Stderr => io::stderr().write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            match self {
                Stream::Stdout => io::stdout().flush(),
                Stream::Stderr => io::stderr().flush(),
            }
        }
    }

    pub(super) fn redirect(_sink: &OutputSink) -> io::Result<Saved> {
        Ok(Saved)
    }

    pub(super) fn restore(_saved: Saved) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn capture(_saved: Option<&Saved>) -> io::Result<(Stream, Stream)> {
        Ok((Stream::Stdout, Stream::Stderr))
    }

    pub(super) fn try_clone(stream: &Stream) -> io::Result<Stream> {
        Ok(*stream)
    }
}
