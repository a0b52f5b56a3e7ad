use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::sluice::config::PIPE_SIZE;

/// Outcome of a single zero-copy move.
pub enum Spliced {
    Bytes(usize),
    Eof,
    WouldBlock,
}

/// Move up to `max` bytes between a socket and a pipe end (either
/// direction) without copying through user space.
pub fn splice(from: RawFd, to: RawFd, max: usize) -> io::Result<Spliced> {
    loop {
        let rc = unsafe {
            libc::splice(
                from,
                std::ptr::null_mut(),
                to,
                std::ptr::null_mut(),
                max,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_MORE | libc::SPLICE_F_NONBLOCK,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => Ok(Spliced::WouldBlock),
                _ => Err(err),
            };
        }
        if rc == 0 {
            return Ok(Spliced::Eof);
        }
        return Ok(Spliced::Bytes(rc as usize));
    }
}

/// An anonymous kernel pipe pair used as a staging buffer between two
/// sockets. `load` counts the bytes currently queued in the kernel buffer.
/// A pipe recycled while still loaded loses its descriptors (the stale
/// bytes cannot be salvaged) and lazily recreates them on next acquire.
pub struct Pipe {
    load: usize,
    fds: Option<(OwnedFd, OwnedFd)>, // (read end, write end)
}

impl Pipe {
    fn empty() -> Self {
        Pipe { load: 0, fds: None }
    }

    fn ensure_fds(&mut self) -> io::Result<()> {
        if self.fds.is_some() {
            return Ok(());
        }
        let mut raw = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(raw.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let rd = unsafe { OwnedFd::from_raw_fd(raw[0]) };
        let wr = unsafe { OwnedFd::from_raw_fd(raw[1]) };
        // Best effort: the kernel may cap the pipe below PIPE_SIZE, in
        // which case splice simply fills less per round.
        let rc = unsafe { libc::fcntl(wr.as_raw_fd(), libc::F_SETPIPE_SZ, PIPE_SIZE as libc::c_int) };
        if rc < 0 {
            debug!(err = %io::Error::last_os_error(), "F_SETPIPE_SZ failed");
        }
        self.fds = Some((rd, wr));
        Ok(())
    }

    pub fn load(&self) -> usize {
        self.load
    }

    pub fn add_load(&mut self, n: usize) {
        self.load += n;
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.load);
        self.load -= n;
    }

    pub fn read_fd(&self) -> RawFd {
        self.fds.as_ref().expect("pipe has no descriptors").0.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.fds.as_ref().expect("pipe has no descriptors").1.as_raw_fd()
    }
}

/// Free list of pipes. The kernel object is the expensive part, so idle
/// pipes keep their descriptors; only loaded ones are stripped on release.
pub struct PipePool {
    idle: Vec<Pipe>,
}

impl PipePool {
    pub fn new() -> Self {
        PipePool { idle: Vec::new() }
    }

    /// Pop an idle pipe (or make a new one) and guarantee it has live,
    /// empty descriptors.
    pub fn acquire(&mut self) -> io::Result<Pipe> {
        let mut p = self.idle.pop().unwrap_or_else(Pipe::empty);
        debug_assert_eq!(p.load, 0);
        if let Err(e) = p.ensure_fds() {
            self.idle.push(p);
            return Err(e);
        }
        Ok(p)
    }

    pub fn release(&mut self, mut p: Pipe) {
        if p.load > 0 {
            p.fds = None;
            p.load = 0;
        }
        self.idle.push(p);
    }

    pub fn purge(&mut self) {
        self.idle.clear();
    }

    #[cfg(test)]
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }
}
