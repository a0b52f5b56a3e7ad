pub mod channel;
pub(crate) mod feed;
pub mod tunnel;

pub use channel::{Channel, Flags, Status};
pub use tunnel::{ChannelId, Side, Tunnel};

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use slab::Slab;
use socket2::Socket;
use tracing::{debug, error, info, warn};

use crate::sluice::common::{parse_addr, Error, Result};
use crate::sluice::config::{Settings, MAX_BACKEND_URL, MAX_EVENTS};
use crate::sluice::proxy::feed::Feed;
use crate::sluice::server::{
    connect_backend, raise_nofile_limit, set_chatty, tune_buffers, Event, Multiplexer, PipePool,
    Readiness,
};
use crate::sluice::worker::running;

const TAG_SHIFT: u32 = 62;
const TAG_FRONT: u64 = 1;
const TAG_FEED: u64 = 2;
const TAG_CHANNEL: u64 = 3;
const SIDE_BACK_BIT: u64 = 1 << 40;

/// What a multiplexer token points at. The readiness loop dispatches on
/// this instead of chasing opaque pointers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Target {
    Front,
    Feed(usize),
    Channel(ChannelId),
}

impl Target {
    pub(crate) fn encode(self) -> u64 {
        match self {
            Target::Front => TAG_FRONT << TAG_SHIFT,
            Target::Feed(i) => (TAG_FEED << TAG_SHIFT) | i as u64,
            Target::Channel(id) => {
                debug_assert!((id.slot as u64) < SIDE_BACK_BIT);
                let side = match id.side {
                    Side::Front => 0,
                    Side::Back => SIDE_BACK_BIT,
                };
                (TAG_CHANNEL << TAG_SHIFT) | side | id.slot as u64
            }
        }
    }

    pub(crate) fn decode(token: u64) -> Option<Target> {
        match token >> TAG_SHIFT {
            TAG_FRONT => Some(Target::Front),
            TAG_FEED => Some(Target::Feed((token & 0xFFFF_FFFF) as usize)),
            TAG_CHANNEL => {
                let side = if token & SIDE_BACK_BIT != 0 {
                    Side::Back
                } else {
                    Side::Front
                };
                Some(Target::Channel(ChannelId::new(
                    (token & (SIDE_BACK_BIT - 1)) as usize,
                    side,
                )))
            }
            _ => None,
        }
    }
}

/// The client-facing listener as a multiplexer target.
struct Front {
    sock: Socket,
    local: SocketAddr,
    flags: Flags,
    events: Readiness,
}

/// The forwarding engine: one listener, the dispatcher feed, the tunnel
/// and pipe pools, and the readiness loop driving them. Single-threaded
/// and cooperative; every descriptor is non-blocking and only the
/// multiplexer wait ever blocks.
pub struct Proxy {
    conf: &'static Settings,
    mux: Multiplexer,
    front: Front,
    feed: Feed,
    tunnels: Slab<Tunnel>,
    dirty: Vec<usize>,
    pipes: PipePool,
    active_channels: Vec<ChannelId>,
    front_active: bool,
    monitored: usize,
    count: usize,
    max: usize,
    next_tunnel_id: u64,
    pending: Vec<Event>,
}

impl Proxy {
    /// `front` must already be bound (but not yet listening: that happens
    /// once per worker in `run`).
    pub fn new(
        conf: &'static Settings,
        front: Socket,
        local: SocketAddr,
        feeds: Vec<SocketAddr>,
    ) -> Result<Self> {
        let mux = Multiplexer::new()?;
        let max = match conf.max_tunnels {
            0 => (raise_nofile_limit()? / 2) as usize,
            n => {
                if let Err(e) = raise_nofile_limit() {
                    debug!(err = %e, "rlimit raise failed");
                }
                n as usize
            }
        };
        info!(limit = max, "admission limit");
        Ok(Proxy {
            conf,
            mux,
            front: Front {
                sock: front,
                local,
                flags: Flags::empty(),
                events: Readiness::empty(),
            },
            feed: Feed::new(conf, feeds),
            tunnels: Slab::new(),
            dirty: Vec::new(),
            pipes: PipePool::new(),
            active_channels: Vec::new(),
            front_active: false,
            monitored: 0,
            count: 0,
            max,
            next_tunnel_id: 0,
            pending: Vec::with_capacity(MAX_EVENTS),
        })
    }

    /// Run the readiness loop until the process running flag clears.
    pub fn run(&mut self) -> Result<()> {
        self.front.sock.listen(self.conf.listen_backlog)?;
        info!(addr = %self.front.local, "front ready");
        self.front_register()?;
        self.feed.tick(&self.mux, Instant::now());

        while running() {
            // Block only when there is no local work left; a pending feed
            // reconnect bounds the wait.
            let timeout = if self.active_channels.is_empty() && !self.front_active {
                self.feed
                    .next_deadline()
                    .map(|at| at.saturating_duration_since(Instant::now()))
            } else {
                Some(Duration::ZERO)
            };
            if !self.wait_monitored(timeout)? {
                break;
            }
            self.feed.tick(&self.mux, Instant::now());

            let chans = std::mem::take(&mut self.active_channels);
            for id in chans {
                if let Some(t) = self.tunnels.get_mut(id.slot) {
                    t[id.side].flags.remove(Flags::LISTED);
                }
                self.channel_manage_events(id);
            }

            if self.front_active {
                self.front_active = false;
                self.front.flags.remove(Flags::LISTED);
                self.front_manage_event();
            }

            self.drain_dirty();
        }
        self.pipes.purge();
        Ok(())
    }

    /// Wait for readiness and promote every notified target from the
    /// monitored set to the matching active set. Returns false when the
    /// wait was interrupted by shutdown.
    fn wait_monitored(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.pending.clear();
        loop {
            match self.mux.wait(&mut self.pending, timeout) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if !running() {
                        return Ok(false);
                    }
                    continue;
                }
                Err(e) => {
                    error!(err = %e, "multiplexer wait failed");
                    return Err(Error::from(e));
                }
            }
        }
        let events = std::mem::take(&mut self.pending);
        for evt in &events {
            match Target::decode(evt.token) {
                Some(Target::Front) => {
                    debug_assert!(self.front.flags.contains(Flags::MONITORED));
                    self.monitored -= 1;
                    self.front.events = evt.readiness;
                    self.front.flags.remove(Flags::LISTED);
                    self.front.flags.insert(Flags::ACTIVE);
                    self.front_active = true;
                }
                Some(Target::Feed(i)) => {
                    self.feed.handle_event(i, evt.readiness, &self.mux);
                }
                Some(Target::Channel(id)) => {
                    let Some(t) = self.tunnels.get_mut(id.slot) else {
                        continue;
                    };
                    let c = &mut t[id.side];
                    debug_assert!(c.flags.contains(Flags::MONITORED));
                    self.monitored -= 1;
                    c.events = evt.readiness;
                    c.flags.remove(Flags::LISTED | Flags::ACTIVITY);
                    c.flags.insert(Flags::ACTIVE);
                    self.active_channels.push(id);
                }
                None => debug!(token = evt.token, "unknown readiness token"),
            }
        }
        self.pending = events;
        Ok(true)
    }

    fn front_register(&mut self) -> io::Result<()> {
        let token = Target::Front.encode();
        let fd = self.front.sock.as_raw_fd();
        if self.front.flags.contains(Flags::REGISTERED) {
            self.mux.modify(fd, token, Readiness::READ)?;
        } else {
            self.mux.add(fd, token, Readiness::READ)?;
        }
        if !self.front.flags.contains(Flags::MONITORED) {
            self.monitored += 1;
        }
        self.front.flags.remove(Flags::LISTED);
        self.front.flags.insert(Flags::REGISTERED | Flags::MONITORED);
        Ok(())
    }

    /// Admission control reached the limit: keep the listener registered
    /// but stop asking for accept readiness.
    fn front_pause(&mut self) {
        self.front.events = Readiness::empty();
        if !self.front.flags.contains(Flags::MONITORED) {
            return;
        }
        let token = Target::Front.encode();
        if let Err(e) = self
            .mux
            .modify(self.front.sock.as_raw_fd(), token, Readiness::empty())
        {
            warn!(err = %e, "listener pause failed");
        }
        self.monitored -= 1;
        self.front.flags.remove(Flags::LISTED);
    }

    /// Queue the listener for another accept attempt on the next turn.
    pub(crate) fn front_resume(&mut self) {
        debug_assert!(!self.front.flags.intersects(Flags::LISTED));
        self.front.flags.insert(Flags::ACTIVE);
        self.front.events = Readiness::READ;
        self.front_active = true;
    }

    /// Accept one client, pull a backend from the dispatcher feed and
    /// start the tunnel. The listener re-queues itself, so accepting one
    /// connection per turn keeps tunnels and accepts fairly interleaved.
    fn front_manage_event(&mut self) {
        debug_assert!(!self.front.flags.intersects(Flags::LISTED));
        if self.front.events.is_empty() {
            return;
        }
        let (sock, from) = loop {
            match self.front.sock.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = self.front_register() {
                        error!(err = %e, "listener rearm failed");
                    }
                    return;
                }
                Err(e) => {
                    // transient exhaustion (EMFILE and friends); retry on
                    // the next readiness
                    warn!(err = %e, "accept error");
                    if let Err(e) = self.front_register() {
                        error!(err = %e, "listener rearm failed");
                    }
                    return;
                }
            }
        };
        if let Err(e) = sock.set_nonblocking(true) {
            debug!(err = %e, "accepted socket nonblocking failed");
        }
        let from = from.as_socket();

        let slot = self.tunnel_reserve();
        self.tunnels[slot][Side::Front].sock = Some(sock);

        // The front socket may well still be ready; instead of always
        // re-queueing, check the limit first and pause if this tunnel
        // filled the last slot.
        self.count += 1;
        if self.count == self.max {
            self.front_pause();
        } else {
            self.front_resume();
        }

        // Poll a backend for this client
        let msg = match self.feed.poll() {
            Some(m) => m,
            None => return self.tunnel_abort(slot, "backend starvation: feed queue empty"),
        };
        self.feed.maybe_resume(&self.mux);
        if msg.len() > MAX_BACKEND_URL {
            return self.tunnel_abort(slot, "invalid backend: URL too big");
        }
        let to = match std::str::from_utf8(&msg).map_err(Error::from).and_then(parse_addr) {
            Ok(a) => a,
            Err(_) => return self.tunnel_abort(slot, "invalid backend: bad URL"),
        };

        let back = match connect_backend(to) {
            Ok(s) => s,
            Err(e) => {
                return self.tunnel_abort(
                    slot,
                    format!("connect() error: ({}) {}", e.raw_os_error().unwrap_or(0), e),
                )
            }
        };

        // Tweak the socket options
        if self.conf.set_buffer_sizes {
            if let Some(s) = &self.tunnels[slot][Side::Front].sock {
                tune_buffers(s);
            }
            tune_buffers(&back);
        }
        if let Some(s) = &self.tunnels[slot][Side::Front].sock {
            set_chatty(s, self.conf.nodelay_front);
        }
        set_chatty(&back, self.conf.nodelay_back);
        self.tunnels[slot][Side::Back].sock = Some(back);

        let id = self.tunnels[slot].id;
        match from {
            Some(a) => info!("{} {} -> {}", id, a, to),
            None => info!("{} ? -> {}", id, to),
        }
        if let Err(e) = self.tunnel_register(slot) {
            self.tunnel_abort(slot, format!("multiplexer error: {}", e));
        }
    }
}
