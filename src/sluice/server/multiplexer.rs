use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bitflags::bitflags;

use crate::sluice::config::MAX_EVENTS;

bitflags! {
    /// Readiness doubles as the interest mask handed to the multiplexer and
    /// as the notification mask it hands back. ERROR and HANGUP are always
    /// reported and never need to be requested.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Readiness: u32 {
        const READ   = 0x1;
        const WRITE  = 0x2;
        const ERROR  = 0x4;
        const HANGUP = 0x8;
        const IO     = 0x3;
    }
}

impl Readiness {
    fn from_epoll(events: u32) -> Self {
        let mut r = Readiness::empty();
        if events & libc::EPOLLIN as u32 != 0 {
            r |= Readiness::READ;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            r |= Readiness::WRITE;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            r |= Readiness::ERROR;
        }
        if events & libc::EPOLLHUP as u32 != 0 {
            r |= Readiness::HANGUP;
        }
        r
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0u32;
        if self.contains(Readiness::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if self.contains(Readiness::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

// Compact rendering for channel traces, one letter per bit.
impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(Readiness::READ) {
            f.write_str("I")?;
        }
        if self.contains(Readiness::WRITE) {
            f.write_str("O")?;
        }
        if self.contains(Readiness::ERROR) {
            f.write_str("E")?;
        }
        if self.contains(Readiness::HANGUP) {
            f.write_str("H")?;
        }
        Ok(())
    }
}

/// One readiness notification: the opaque token registered with the fd plus
/// the readiness observed on it.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: u64,
    pub readiness: Readiness,
}

/// Thin epoll wrapper. Every registration is edge-triggered and one-shot:
/// a single notification is delivered per arming, and interest must be
/// re-established with `modify` after each one. This makes interest changes
/// atomic with event consumption.
pub struct Multiplexer {
    epfd: OwnedFd,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Multiplexer {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    /// Remove a registration. A racing close may have removed it already,
    /// so ENOENT is not an error here.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        loop {
            let rc = unsafe {
                libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ENOENT) => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Readiness) -> io::Result<()> {
        let mut evt = libc::epoll_event {
            events: interest.to_epoll() | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
            u64: token,
        };
        loop {
            let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut evt) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    /// Block until readiness arrives (or the timeout elapses; `None` blocks
    /// indefinitely) and append the notifications to `out`. An interrupted
    /// wait surfaces as ErrorKind::Interrupted so the caller can check its
    /// running flag.
    pub fn wait(&self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let mut buf: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                buf.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        for evt in buf.iter().take(rc as usize) {
            out.push(Event {
                token: evt.u64,
                readiness: Readiness::from_epoll(evt.events),
            });
        }
        Ok(rc as usize)
    }
}
