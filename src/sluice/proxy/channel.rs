use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;

use bitflags::bitflags;
use socket2::Socket;
use tracing::debug;

use crate::sluice::config::PIPE_SIZE;
use crate::sluice::proxy::tunnel::ChannelId;
use crate::sluice::proxy::Proxy;
use crate::sluice::server::{splice, Pipe, Readiness, Spliced};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Flags: u32 {
        /// We have half-closed the write side of our socket.
        const SHUT_SENT  = 0x0001;
        /// EOF was observed on our read side.
        const SHUT_RECV  = 0x0002;
        const SHUT_BOTH  = 0x0003;

        /// Armed in the multiplexer, waiting for a notification.
        const MONITORED  = 0x0004;
        /// On the active list, waiting for local processing.
        const ACTIVE     = 0x0008;
        /// A channel is on exactly one of the two lists, or neither.
        const LISTED     = 0x000c;

        /// An I/O error was latched; resolved by the next update.
        const ERRONEOUS  = 0x0020;
        const ACTIVITY   = 0x0020;

        /// Ever added to the multiplexer, so rearm picks MOD over ADD.
        const REGISTERED = 0x0040;
    }
}

// Compact rendering for channel traces, one letter per bit.
impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(Flags::SHUT_SENT) {
            f.write_str(">")?;
        }
        if self.contains(Flags::SHUT_RECV) {
            f.write_str("<")?;
        }
        if self.contains(Flags::MONITORED) {
            f.write_str("M")?;
        }
        if self.contains(Flags::ACTIVE) {
            f.write_str("A")?;
        }
        if self.contains(Flags::ERRONEOUS) {
            f.write_str("E")?;
        }
        if self.contains(Flags::REGISTERED) {
            f.write_str("R")?;
        }
        Ok(())
    }
}

/// Only the back starts out connecting; the front is connected from birth
/// because it was just accepted. Unset doubles as the tombstone for a
/// channel whose tunnel was torn down earlier in the same loop turn.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    Unset,
    Connecting,
    Connected,
}

/// One end of a tunnel: a socket, at most one staging pipe, and the flag
/// and readiness state the event loop steers it with. `tosend` holds
/// bytes received on the peer that still have to be written to this
/// channel's socket.
pub struct Channel {
    pub sock: Option<Socket>,
    pub status: Status,
    pub flags: Flags,
    pub events: Readiness,
    pub tosend: Option<Pipe>,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Channel {
            sock: None,
            status: Status::Unset,
            flags: Flags::empty(),
            events: Readiness::empty(),
            tosend: None,
        }
    }
}

impl Proxy {
    pub(crate) fn chan(&self, id: ChannelId) -> &Channel {
        &self.tunnels[id.slot][id.side]
    }

    pub(crate) fn chan_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.tunnels[id.slot][id.side]
    }

    /// Drain this channel's staging pipe into its socket. On EAGAIN the
    /// pipe is reinstalled and write interest cleared; any other failure
    /// latches ERRONEOUS for the next update to resolve.
    pub(crate) fn pipe_resume(&mut self, dst: ChannelId) {
        let Some(mut p) = self.chan_mut(dst).tosend.take() else {
            return;
        };
        let sock_fd = match &self.chan(dst).sock {
            Some(s) => s.as_raw_fd(),
            None => {
                self.pipes.release(p);
                return;
            }
        };
        while p.load() > 0 {
            match splice(p.read_fd(), sock_fd, p.load()) {
                Ok(Spliced::Bytes(n)) => p.consume(n),
                Ok(Spliced::WouldBlock) => {
                    let c = self.chan_mut(dst);
                    c.events.remove(Readiness::WRITE);
                    c.tosend = Some(p);
                    return;
                }
                Ok(Spliced::Eof) | Err(_) => {
                    let c = self.chan_mut(dst);
                    c.events.remove(Readiness::WRITE);
                    c.flags.insert(Flags::ERRONEOUS);
                    self.pipes.release(p);
                    return;
                }
            }
        }
        self.pipes.release(p);
    }

    pub(crate) fn channel_close(&mut self, id: ChannelId) {
        if self.chan(id).sock.is_none() {
            return;
        }
        if self.chan(id).flags.contains(Flags::MONITORED) {
            self.monitored -= 1;
        }
        let c = self.chan_mut(id);
        c.sock = None;
        c.status = Status::Unset;
        c.flags = Flags::empty();
        c.events = Readiness::empty();
        let pipe = c.tosend.take();
        if let Some(p) = pipe {
            self.pipes.release(p);
        }
    }

    /// Idempotently half-close the write side, unless bytes are still
    /// owed to this channel.
    pub(crate) fn channel_shut(&mut self, id: ChannelId) {
        let c = self.chan_mut(id);
        if c.flags.contains(Flags::SHUT_SENT) || c.tosend.is_some() {
            return;
        }
        c.flags.insert(Flags::SHUT_SENT);
        if let Some(s) = &c.sock {
            let _ = s.shutdown(Shutdown::Write);
        }
        c.events.remove(Readiness::WRITE);
    }

    /// Pull bytes from this channel's socket into the pipe destined for
    /// its peer, then try an immediate drain so a kernel round-trip is
    /// only needed when a buffer actually fills.
    pub(crate) fn channel_transfer(&mut self, src: ChannelId) {
        let peer = src.peer();
        self.chan_mut(src).flags.remove(Flags::ACTIVITY);

        let mut p = match self.chan_mut(peer).tosend.take() {
            Some(p) => p,
            None => match self.pipes.acquire() {
                Ok(p) => p,
                Err(e) => {
                    debug!(err = %e, "pipe acquisition failed");
                    self.chan_mut(src).flags.insert(Flags::ERRONEOUS);
                    return;
                }
            },
        };
        let sock_fd = match &self.chan(src).sock {
            Some(s) => s.as_raw_fd(),
            None => {
                self.pipes.release(p);
                return;
            }
        };
        match splice(sock_fd, p.write_fd(), PIPE_SIZE) {
            Ok(Spliced::Eof) => {
                let c = self.chan_mut(src);
                c.events.remove(Readiness::READ);
                c.flags.insert(Flags::SHUT_RECV);
            }
            Ok(Spliced::WouldBlock) => {
                self.chan_mut(src).events.remove(Readiness::READ);
            }
            Ok(Spliced::Bytes(n)) => p.add_load(n),
            Err(_) => {
                let c = self.chan_mut(src);
                c.events.remove(Readiness::READ);
                c.flags.insert(Flags::ERRONEOUS);
            }
        }
        if p.load() == 0 {
            self.pipes.release(p);
            return;
        }
        self.chan_mut(peer).tosend = Some(p);
        self.pipe_resume(peer);
    }

    /// Re-establish interest in the multiplexer (edge-triggered, one
    /// shot). A fully shut channel is unregistered entirely.
    pub(crate) fn channel_rearm(&mut self, id: ChannelId, io_mask: Readiness) -> io::Result<()> {
        let token = super::Target::Channel(id).encode();
        if self.chan(id).flags.contains(Flags::SHUT_BOTH) {
            let flags = self.chan(id).flags;
            if flags.contains(Flags::MONITORED) {
                self.monitored -= 1;
            }
            let res = if flags.contains(Flags::REGISTERED) {
                match &self.chan(id).sock {
                    Some(s) => self.mux.delete(s.as_raw_fd()),
                    None => Ok(()),
                }
            } else {
                Ok(())
            };
            let c = self.chan_mut(id);
            c.flags.remove(Flags::LISTED | Flags::ACTIVITY | Flags::REGISTERED);
            c.events = Readiness::empty();
            return res;
        }
        let fd = match &self.chan(id).sock {
            Some(s) => s.as_raw_fd(),
            None => return Ok(()),
        };
        if self.chan(id).flags.contains(Flags::REGISTERED) {
            self.mux.modify(fd, token, io_mask)?;
        } else {
            self.mux.add(fd, token, io_mask)?;
        }
        if !self.chan(id).flags.contains(Flags::MONITORED) {
            self.monitored += 1;
        }
        let c = self.chan_mut(id);
        c.events = io_mask;
        c.flags.remove(Flags::LISTED | Flags::ACTIVITY);
        c.flags.insert(Flags::MONITORED | Flags::REGISTERED);
        Ok(())
    }

    /// Once EOF is seen on this channel, nothing more will ever reach the
    /// peer: propagate the half-close and give up any staged bytes.
    pub(crate) fn channel_patch(&mut self, id: ChannelId) {
        if !self.chan(id).flags.contains(Flags::SHUT_RECV) {
            return;
        }
        self.chan_mut(id).events.remove(Readiness::READ);
        self.channel_shut(id.peer());
        let pipe = self.chan_mut(id).tosend.take();
        if let Some(p) = pipe {
            self.pipes.release(p);
        }
    }

    /// The interest mask the multiplexer should carry for this channel.
    /// The read guard enforces single-pipe back-pressure: no more is
    /// pulled from a source while the pipe destined for its peer is
    /// still occupied.
    pub(crate) fn channel_events(&self, id: ChannelId) -> Readiness {
        let c = self.chan(id);
        let peer = self.chan(id.peer());
        let mut evt = Readiness::empty();
        if (c.status == Status::Connecting || c.tosend.is_some())
            && !c.flags.contains(Flags::SHUT_SENT)
        {
            evt |= Readiness::WRITE;
        }
        if peer.status == Status::Connected
            && !peer.flags.contains(Flags::SHUT_SENT)
            && !c.flags.contains(Flags::SHUT_RECV)
            && peer.tosend.is_none()
        {
            evt |= Readiness::READ;
        }
        evt
    }

    /// Refresh a channel that is still on one of the lists: a monitored
    /// one is rearmed with fresh interest, an active one just has its
    /// cached mask updated.
    pub(crate) fn channel_update_listed(&mut self, id: ChannelId) {
        let flags = self.chan(id).flags;
        if flags.contains(Flags::MONITORED) {
            let interest = self.channel_events(id);
            if let Err(e) = self.channel_rearm(id, interest) {
                self.tunnel_abort(id.slot, format!("multiplexer error: {}", e));
            }
        } else if flags.contains(Flags::ACTIVE) {
            let interest = self.channel_events(id);
            self.chan_mut(id).events = interest;
        }
    }

    /// Settle a channel after its event was serviced: propagate shutdowns,
    /// resolve latched errors, then either keep it active (it consumed
    /// I/O readiness and may still be usable without a kernel round-trip)
    /// or rearm it. The peer's interest is recomputed either way.
    pub(crate) fn channel_update(&mut self, id: ChannelId) {
        debug_assert!(!self.chan(id).flags.intersects(Flags::LISTED));
        self.channel_patch(id);
        self.channel_patch(id.peer());
        if self.chan(id).flags.contains(Flags::SHUT_BOTH)
            && self.chan(id.peer()).flags.contains(Flags::SHUT_BOTH)
        {
            return self.tunnel_unref(id.slot);
        }
        if self.chan(id).flags.contains(Flags::ERRONEOUS)
            || self.chan(id.peer()).flags.contains(Flags::ERRONEOUS)
        {
            return self.tunnel_abort(id.slot, format!("Peer error: {}", id.side));
        }
        let interest = self.channel_events(id);
        if self.chan(id).events.intersects(Readiness::IO) {
            let c = self.chan_mut(id);
            c.events = interest;
            c.flags.remove(Flags::LISTED | Flags::ACTIVITY);
            c.flags.insert(Flags::ACTIVE);
            self.active_channels.push(id);
        } else if let Err(e) = self.channel_rearm(id, interest) {
            return self.tunnel_abort(id.slot, format!("multiplexer error: {}", e));
        }
        self.channel_update_listed(id.peer());
    }

    /// Dispatch one readiness notification for a channel.
    pub(crate) fn channel_manage_events(&mut self, id: ChannelId) {
        let Some(t) = self.tunnels.get(id.slot) else {
            return;
        };
        let c = &t[id.side];
        if c.status == Status::Unset {
            // the tunnel was torn down earlier in this turn
            return;
        }
        let events = c.events;
        debug!(
            id = t.id,
            side = %id.side,
            status = ?c.status,
            flags = %c.flags,
            events = %events,
            monitored = self.monitored,
            "channel event"
        );
        debug_assert!(!c.flags.intersects(Flags::LISTED));
        if events.contains(Readiness::ERROR) {
            return self.tunnel_abort(id.slot, format!("Channel error: {}", id.side));
        }
        if events.contains(Readiness::WRITE) && c.status == Status::Connecting {
            self.chan_mut(id).status = Status::Connected;
            return self.channel_update(id);
        }
        if self.chan(id).tosend.is_some() {
            debug_assert_eq!(self.chan(id).status, Status::Connected);
            self.pipe_resume(id);
        }
        if events.contains(Readiness::READ) {
            self.channel_transfer(id);
        }
        if events.contains(Readiness::HANGUP) {
            self.chan_mut(id).flags.insert(Flags::SHUT_RECV);
        }
        self.channel_update(id);
    }
}
