use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::sluice::config::PIPE_SIZE;

/// Create a non-blocking front socket bound to `addr` with SO_REUSEADDR.
/// listen() happens later, once per worker.
pub fn bind_front(addr: SocketAddr) -> io::Result<Socket> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    Ok(sock)
}

/// Start a non-blocking connect towards a backend. EINPROGRESS is the
/// normal outcome; the multiplexer reports write-readiness once the
/// handshake settles.
pub fn connect_backend(addr: SocketAddr) -> io::Result<Socket> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    match sock.connect(&addr.into()) {
        Ok(()) => Ok(sock),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(sock),
        Err(e) => Err(e),
    }
}

/// Size the socket buffers so one pipe round fills exactly: the receive
/// side holds half a pipe, the send side a full one.
pub fn tune_buffers(sock: &Socket) {
    if let Err(e) = sock.set_recv_buffer_size(PIPE_SIZE / 2) {
        debug!(err = %e, "SO_RCVBUF failed");
    }
    if let Err(e) = sock.set_send_buffer_size(PIPE_SIZE) {
        debug!(err = %e, "SO_SNDBUF failed");
    }
}

/// Toggle TCP_NODELAY. Chatty sockets push segments out immediately.
pub fn set_chatty(sock: &Socket, on: bool) {
    if let Err(e) = sock.set_nodelay(on) {
        debug!(err = %e, "TCP_NODELAY failed");
    }
}

/// Raise the soft RLIMIT_NOFILE to the hard limit and return the hard
/// limit. The tunnel budget is derived from it: each tunnel holds at most
/// 2 sockets and 2 pipe pairs.
pub fn raise_nofile_limit() -> io::Result<u64> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
        return Err(io::Error::last_os_error());
    }
    rl.rlim_cur = rl.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rl.rlim_max as u64)
}
