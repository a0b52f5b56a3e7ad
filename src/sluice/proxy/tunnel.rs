use std::io;
use std::ops::{Index, IndexMut};

use strum::Display;
use tracing::warn;

use crate::sluice::proxy::channel::{Channel, Status};
use crate::sluice::proxy::Proxy;
use crate::sluice::server::Readiness;

/// Which end of a tunnel a channel is. The peer relation is derived from
/// this rather than stored, so there are no cyclic back-references.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Side {
    Front,
    Back,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Front => Side::Back,
            Side::Back => Side::Front,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Handle addressing one channel: the tunnel's slab slot plus the side.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelId {
    pub slot: usize,
    pub side: Side,
}

impl ChannelId {
    pub fn new(slot: usize, side: Side) -> Self {
        ChannelId { slot, side }
    }

    pub fn peer(self) -> ChannelId {
        ChannelId {
            slot: self.slot,
            side: self.side.other(),
        }
    }
}

/// A pair of peered channels forwarding between a client and a backend.
pub struct Tunnel {
    pub id: u64,
    chans: [Channel; 2],
}

impl Tunnel {
    pub(crate) fn new(id: u64) -> Self {
        Tunnel {
            id,
            chans: [Channel::new(), Channel::new()],
        }
    }
}

impl Index<Side> for Tunnel {
    type Output = Channel;

    fn index(&self, side: Side) -> &Channel {
        &self.chans[side.index()]
    }
}

impl IndexMut<Side> for Tunnel {
    fn index_mut(&mut self, side: Side) -> &mut Channel {
        &mut self.chans[side.index()]
    }
}

impl Proxy {
    /// Take a tunnel slot and stamp it with a fresh monotonic id.
    pub(crate) fn tunnel_reserve(&mut self) -> usize {
        let id = self.next_tunnel_id;
        self.next_tunnel_id += 1;
        self.tunnels.insert(Tunnel::new(id))
    }

    /// Close both channels and park the slot on the dirty list. The slot
    /// stays occupied until the end of the loop turn so a stale readiness
    /// token from the same batch cannot alias a recycled tunnel.
    pub(crate) fn tunnel_release(&mut self, slot: usize) {
        self.channel_close(ChannelId::new(slot, Side::Front));
        self.channel_close(ChannelId::new(slot, Side::Back));
        self.dirty.push(slot);
    }

    /// Release the tunnel and give its admission slot back; a listener
    /// paused at the limit is resumed by this decrement, which is the
    /// reliable trigger (error-only interest on the listener is not).
    pub(crate) fn tunnel_unref(&mut self, slot: usize) {
        let was_at_limit = self.count == self.max;
        self.count -= 1;
        self.tunnel_release(slot);
        if was_at_limit {
            self.front_resume();
        }
    }

    pub(crate) fn tunnel_abort(&mut self, slot: usize, reason: impl AsRef<str>) {
        warn!(id = self.tunnels[slot].id, "Tunnel aborted: {}", reason.as_ref());
        self.tunnel_unref(slot);
    }

    /// Arm a freshly connected pair: the front is born connected but mute
    /// (no interest until the back settles), the back waits for the
    /// non-blocking connect to report write-readiness.
    pub(crate) fn tunnel_register(&mut self, slot: usize) -> io::Result<()> {
        {
            let t = &mut self.tunnels[slot];
            t[Side::Front].status = Status::Connected;
            t[Side::Front].events = Readiness::empty();
            t[Side::Back].status = Status::Connecting;
            t[Side::Back].events = Readiness::empty();
        }
        self.channel_rearm(ChannelId::new(slot, Side::Front), Readiness::empty())?;
        self.channel_rearm(ChannelId::new(slot, Side::Back), Readiness::WRITE)?;
        Ok(())
    }

    /// End-of-turn reclaim: dirty slots become vacant and reusable.
    pub(crate) fn drain_dirty(&mut self) {
        for slot in self.dirty.drain(..) {
            debug_assert!(self.tunnels.contains(slot));
            let _ = self.tunnels.try_remove(slot);
        }
    }
}
