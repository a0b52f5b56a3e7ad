use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use memchr::memchr;
use socket2::Socket;
use tracing::{debug, info, warn};

use crate::sluice::config::{Settings, MAX_FEED_LINE};
use crate::sluice::proxy::Target;
use crate::sluice::server::{connect_backend, Multiplexer, Readiness};

enum FeedState {
    Down { retry_at: Instant },
    Connecting(Socket),
    Connected(Socket),
}

/// One dispatcher endpoint. Lost connections come back on a flat
/// reconnect interval; a partially received line survives across reads
/// but not across reconnects.
pub(crate) struct FeedConn {
    addr: SocketAddr,
    state: FeedState,
    line: Vec<u8>,
    overflow: bool,
    paused: bool,
}

impl FeedConn {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        FeedConn {
            addr,
            state: FeedState::Down {
                retry_at: Instant::now(),
            },
            line: Vec::new(),
            overflow: false,
            paused: false,
        }
    }

    /// Split received bytes into newline-delimited messages. A line longer
    /// than MAX_FEED_LINE is capped (the tail up to the newline is
    /// dropped) but still delivered, so the admission check rejects it
    /// exactly once. Empty lines carry no message.
    pub(crate) fn ingest(
        &mut self,
        mut data: &[u8],
        queue: &mut VecDeque<Vec<u8>>,
        queued_bytes: &mut usize,
    ) {
        while let Some(nl) = memchr(b'\n', data) {
            let (head, rest) = data.split_at(nl);
            data = &rest[1..];
            self.append_capped(head);
            let mut line = std::mem::take(&mut self.line);
            self.overflow = false;
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            *queued_bytes += line.len();
            queue.push_back(line);
        }
        self.append_capped(data);
    }

    fn append_capped(&mut self, data: &[u8]) {
        if self.overflow {
            return;
        }
        let room = MAX_FEED_LINE - self.line.len();
        if data.len() > room {
            self.line.extend_from_slice(&data[..room]);
            self.overflow = true;
        } else {
            self.line.extend_from_slice(data);
        }
    }

    fn reset_line(&mut self) {
        self.line.clear();
        self.overflow = false;
    }
}

/// The dispatcher feed: pull semantics over one or more endpoints.
/// Messages (backend URLs) are buffered up to `feed_recv_buffer` bytes;
/// reading pauses at the bound and resumes as the accept path drains
/// the queue. Feed sockets are multiplexer targets like channels, but
/// their events never touch tunnel state and are handled inline.
pub struct Feed {
    conf: &'static Settings,
    conns: Vec<FeedConn>,
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
}

impl Feed {
    pub(crate) fn new(conf: &'static Settings, endpoints: Vec<SocketAddr>) -> Self {
        Feed {
            conf,
            conns: endpoints.into_iter().map(FeedConn::new).collect(),
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.conf.feed_reconnect_ms)
    }

    /// Attempt the reconnects that are due. Called once per loop turn.
    pub(crate) fn tick(&mut self, mux: &Multiplexer, now: Instant) {
        for i in 0..self.conns.len() {
            let due = matches!(self.conns[i].state, FeedState::Down { retry_at } if retry_at <= now);
            if due {
                self.connect_one(i, mux, now);
            }
        }
    }

    fn connect_one(&mut self, i: usize, mux: &Multiplexer, now: Instant) {
        let retry_at = now + self.reconnect_interval();
        let conn = &mut self.conns[i];
        conn.reset_line();
        conn.paused = false;
        let token = Target::Feed(i).encode();
        match connect_backend(conn.addr) {
            Ok(sock) => match mux.add(sock.as_raw_fd(), token, Readiness::WRITE) {
                Ok(()) => {
                    info!(addr = %conn.addr, "feed connecting");
                    conn.state = FeedState::Connecting(sock);
                }
                Err(e) => {
                    warn!(addr = %conn.addr, err = %e, "feed register failed");
                    conn.state = FeedState::Down { retry_at };
                }
            },
            Err(e) => {
                warn!(addr = %conn.addr, err = %e, "feed connect failed");
                conn.state = FeedState::Down { retry_at };
            }
        }
    }

    /// Dispatch one readiness notification for a feed connection.
    pub(crate) fn handle_event(&mut self, i: usize, readiness: Readiness, mux: &Multiplexer) {
        let reconnect = self.reconnect_interval();
        let limit = self.conf.feed_recv_buffer;
        let Feed {
            conns,
            queue,
            queued_bytes,
            ..
        } = self;
        let conn = match conns.get_mut(i) {
            Some(c) => c,
            None => return,
        };
        let token = Target::Feed(i).encode();
        let down = FeedState::Down {
            retry_at: Instant::now() + reconnect,
        };
        match std::mem::replace(&mut conn.state, down) {
            FeedState::Down { retry_at } => {
                // stale notification for a connection already given up on
                conn.state = FeedState::Down { retry_at };
            }
            FeedState::Connecting(sock) => {
                let pending = sock.take_error().unwrap_or(None);
                if readiness.intersects(Readiness::ERROR | Readiness::HANGUP) || pending.is_some() {
                    warn!(addr = %conn.addr, "feed connect refused");
                    return;
                }
                match mux.modify(sock.as_raw_fd(), token, Readiness::READ) {
                    Ok(()) => {
                        info!(addr = %conn.addr, "feed connected");
                        conn.state = FeedState::Connected(sock);
                    }
                    Err(e) => {
                        warn!(addr = %conn.addr, err = %e, "feed rearm failed");
                    }
                }
            }
            FeedState::Connected(sock) => {
                // edge-triggered: read until the socket runs dry
                loop {
                    let mut buf = [MaybeUninit::<u8>::uninit(); 4096];
                    match sock.recv(&mut buf) {
                        Ok(0) => {
                            warn!(addr = %conn.addr, "feed endpoint closed");
                            conn.reset_line();
                            return;
                        }
                        Ok(n) => {
                            let bytes =
                                unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
                            conn.ingest(bytes, queue, queued_bytes);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(addr = %conn.addr, err = %e, "feed read error");
                            conn.reset_line();
                            return;
                        }
                    }
                }
                if *queued_bytes >= limit {
                    // queue at capacity: hold the socket unarmed until the
                    // accept path drains some messages
                    conn.paused = true;
                    conn.state = FeedState::Connected(sock);
                } else {
                    match mux.modify(sock.as_raw_fd(), token, Readiness::READ) {
                        Ok(()) => conn.state = FeedState::Connected(sock),
                        Err(e) => {
                            warn!(addr = %conn.addr, err = %e, "feed rearm failed");
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking pull of the next backend URL.
    pub(crate) fn poll(&mut self) -> Option<Vec<u8>> {
        let msg = self.queue.pop_front()?;
        self.queued_bytes -= msg.len();
        Some(msg)
    }

    /// Rearm connections that were paused on a full queue.
    pub(crate) fn maybe_resume(&mut self, mux: &Multiplexer) {
        if self.queued_bytes >= self.conf.feed_recv_buffer {
            return;
        }
        let reconnect = self.reconnect_interval();
        for i in 0..self.conns.len() {
            if !self.conns[i].paused {
                continue;
            }
            self.conns[i].paused = false;
            let fd = match &self.conns[i].state {
                FeedState::Connected(s) => s.as_raw_fd(),
                _ => continue,
            };
            let token = Target::Feed(i).encode();
            if let Err(e) = mux.modify(fd, token, Readiness::READ) {
                debug!(err = %e, "feed rearm failed");
                self.conns[i].state = FeedState::Down {
                    retry_at: Instant::now() + reconnect,
                };
            }
        }
    }

    /// The next moment a reconnect attempt is due, if any connection is
    /// down. Bounds the multiplexer wait while the loop is otherwise idle.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.conns
            .iter()
            .filter_map(|c| match c.state {
                FeedState::Down { retry_at } => Some(retry_at),
                _ => None,
            })
            .min()
    }
}
