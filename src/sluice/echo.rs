//! The degenerate case of the forwarding engine: every connection is its
//! own peer, so a single socket and a single staging pipe make a tunnel.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use slab::Slab;
use socket2::Socket;
use tracing::{debug, error, info, warn};

use crate::sluice::common::Result;
use crate::sluice::config::{Settings, PIPE_SIZE};
use crate::sluice::server::{
    set_chatty, splice, tune_buffers, Event, Multiplexer, Pipe, PipePool, Readiness, Spliced,
};
use crate::sluice::worker::running;

const TAG_SHIFT: u32 = 62;
const TAG_LISTENER: u64 = 1;
const TAG_CONN: u64 = 2;

fn listener_token(i: usize) -> u64 {
    (TAG_LISTENER << TAG_SHIFT) | i as u64
}

fn conn_token(slot: usize) -> u64 {
    (TAG_CONN << TAG_SHIFT) | slot as u64
}

struct EchoConn {
    sock: Socket,
    pipe: Pipe,
    shut_recv: bool,
}

/// Echo server sharing the proxy's multiplexer and pipe machinery. Bytes
/// are spliced from the socket into the connection's pipe and back out
/// to the same socket.
pub struct EchoServer {
    conf: &'static Settings,
    mux: Multiplexer,
    listeners: Vec<(Socket, SocketAddr)>,
    conns: Slab<EchoConn>,
    pipes: PipePool,
    pending: Vec<Event>,
}

impl EchoServer {
    /// Takes bound (not yet listening) sockets, one per URL on the
    /// command line.
    pub fn new(conf: &'static Settings, listeners: Vec<(Socket, SocketAddr)>) -> Result<Self> {
        Ok(EchoServer {
            conf,
            mux: Multiplexer::new()?,
            listeners,
            conns: Slab::new(),
            pipes: PipePool::new(),
            pending: Vec::new(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        for (i, (sock, addr)) in self.listeners.iter().enumerate() {
            sock.listen(self.conf.listen_backlog)?;
            self.mux
                .add(sock.as_raw_fd(), listener_token(i), Readiness::READ)?;
            info!(addr = %addr, "echo ready");
        }

        while running() {
            self.pending.clear();
            match self.mux.wait(&mut self.pending, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(err = %e, "multiplexer wait failed");
                    return Err(e.into());
                }
            }
            let events = std::mem::take(&mut self.pending);
            for evt in &events {
                match evt.token >> TAG_SHIFT {
                    TAG_LISTENER => self.accept_pending((evt.token & 0xFFFF_FFFF) as usize),
                    TAG_CONN => {
                        self.conn_event((evt.token & 0xFFFF_FFFF) as usize, evt.readiness)
                    }
                    _ => {}
                }
            }
            self.pending = events;
        }
        self.pipes.purge();
        Ok(())
    }

    /// Edge-triggered accept: take everything the backlog has, then rearm.
    fn accept_pending(&mut self, i: usize) {
        loop {
            let (sock, from) = match self.listeners[i].0.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(err = %e, "accept error");
                    break;
                }
            };
            if let Err(e) = sock.set_nonblocking(true) {
                debug!(err = %e, "accepted socket nonblocking failed");
                continue;
            }
            if self.conf.set_buffer_sizes {
                tune_buffers(&sock);
            }
            set_chatty(&sock, self.conf.nodelay_front);

            let pipe = match self.pipes.acquire() {
                Ok(p) => p,
                Err(e) => {
                    warn!(err = %e, "pipe acquisition failed");
                    continue;
                }
            };
            let fd = sock.as_raw_fd();
            let slot = self.conns.insert(EchoConn {
                sock,
                pipe,
                shut_recv: false,
            });
            if let Err(e) = self.mux.add(fd, conn_token(slot), Readiness::READ) {
                warn!(err = %e, "conn register failed");
                let conn = self.conns.remove(slot);
                self.pipes.release(conn.pipe);
                continue;
            }
            if let Some(a) = from.as_socket() {
                debug!(fd, %a, "echo connection");
            }
        }
        let (sock, _) = &self.listeners[i];
        if let Err(e) = self
            .mux
            .modify(sock.as_raw_fd(), listener_token(i), Readiness::READ)
        {
            error!(err = %e, "listener rearm failed");
        }
    }

    fn conn_event(&mut self, slot: usize, mut evt: Readiness) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        let fd = conn.sock.as_raw_fd();

        if evt.contains(Readiness::READ) {
            match splice(fd, conn.pipe.write_fd(), PIPE_SIZE) {
                Ok(Spliced::Bytes(n)) => {
                    conn.pipe.add_load(n);
                    evt |= Readiness::WRITE;
                }
                Ok(Spliced::Eof) => evt |= Readiness::HANGUP,
                Ok(Spliced::WouldBlock) => {}
                Err(_) => evt |= Readiness::ERROR,
            }
        }
        if evt.contains(Readiness::WRITE) && conn.pipe.load() > 0 {
            match splice(conn.pipe.read_fd(), fd, conn.pipe.load()) {
                Ok(Spliced::Bytes(n)) => conn.pipe.consume(n),
                Ok(Spliced::WouldBlock) => {}
                Ok(Spliced::Eof) | Err(_) => evt |= Readiness::ERROR,
            }
        }
        if evt.contains(Readiness::HANGUP) && !evt.contains(Readiness::ERROR) {
            conn.shut_recv = true;
        }

        if evt.contains(Readiness::ERROR) {
            return self.conn_close(slot);
        }
        if conn.shut_recv && conn.pipe.load() == 0 {
            // everything echoed back; propagate the half-close and tear down
            let _ = conn.sock.shutdown(std::net::Shutdown::Write);
            return self.conn_close(slot);
        }

        let mut interest = Readiness::empty();
        if !conn.shut_recv && conn.pipe.load() < PIPE_SIZE {
            interest |= Readiness::READ;
        }
        if conn.pipe.load() > 0 {
            interest |= Readiness::WRITE;
        }
        if let Err(e) = self.mux.modify(fd, conn_token(slot), interest) {
            debug!(err = %e, "conn rearm failed");
            self.conn_close(slot);
        }
    }

    fn conn_close(&mut self, slot: usize) {
        let conn = self.conns.remove(slot);
        self.pipes.release(conn.pipe);
    }
}
