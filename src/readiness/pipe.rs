// src/readiness/pipe.rs
//! Pipe-backed readiness descriptor
//!
//! The read end holds at most one byte: `raise` writes it, `lower` drains
//! it. Both ends are non-blocking and close-on-exec.

use crate::readiness::ReadinessSignal;
use crate::utils::errors::{EngineError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{pipe, read, write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::warn;

pub struct PipeSignal {
    read: OwnedFd,
    write: OwnedFd,
}

impl PipeSignal {
    pub fn new() -> Result<Self> {
        let (read, write) = pipe().map_err(|e| EngineError::Io(format!("pipe: {}", e)))?;

        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_flags(fd)?;
        }

        Ok(Self { read, write })
    }

    /// Descriptor to hand to a reactor
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_flags(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map(OFlag::from_bits_truncate)
        .map_err(|e| EngineError::Io(format!("fcntl F_GETFL: {}", e)))?;
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map_err(|e| EngineError::Io(format!("fcntl O_NONBLOCK: {}", e)))?;

    let fd_flags = fcntl(fd, FcntlArg::F_GETFD)
        .map(FdFlag::from_bits_truncate)
        .map_err(|e| EngineError::Io(format!("fcntl F_GETFD: {}", e)))?;
    fcntl(fd, FcntlArg::F_SETFD(fd_flags | FdFlag::FD_CLOEXEC))
        .map_err(|e| EngineError::Io(format!("fcntl FD_CLOEXEC: {}", e)))?;
    Ok(())
}

impl ReadinessSignal for PipeSignal {
    fn raise(&self) {
        match write(&self.write, &[1u8]) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => warn!("Failed to raise readiness pipe: {}", e),
        }
    }

    fn lower(&self) {
        let mut buf = [0u8; 64];
        // Stops on EAGAIN once the pipe is empty
        while let Ok(n) = read(self.read.as_raw_fd(), &mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    fn raw_fd(&self) -> Option<i32> {
        Some(self.read_fd())
    }
}

#[cfg(test)]
pub(crate) fn poll_readable(fd: RawFd, timeout_ms: u16) -> bool {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;

    // SAFETY: callers pass a descriptor that stays open for the duration of the poll
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(1) => fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)),
        _ => false,
    }
}
