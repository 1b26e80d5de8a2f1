//! Boundary between the core and whatever transport carries events to players.
//!
//! The transport owns each player's channel. The core only keeps a [`ChannelRef`] (a weak
//! reference), so a closed connection silently turns every later delivery into a no-op.

use std::sync::{mpsc, Arc, Mutex, Weak};

use anyhow::anyhow;
use tracing::{debug, trace};

use crate::protocol::ServerEvent;

/// Outbound half of a player's connection.
pub trait ClientChannel: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the event could not be handed to the transport (closed socket,
    /// write timeout, ...). The core never propagates it.
    fn send(&self, event: &ServerEvent) -> anyhow::Result<()>;
}

/// Reference held by the core.
pub type ChannelRef = Weak<dyn ClientChannel>;

/// Downgrades an owned channel into the reference the core keeps.
pub fn channel_ref<C: ClientChannel + 'static>(channel: &Arc<C>) -> ChannelRef {
    let channel: Arc<dyn ClientChannel> = channel.clone();
    Arc::downgrade(&channel)
}

/// Delivers `event` if the channel still exists. Returns whether the transport accepted it.
pub fn deliver(channel: &ChannelRef, event: &ServerEvent) -> bool {
    let Some(channel) = channel.upgrade() else {
        debug!(kind = event.kind(), "channel closed, event dropped");
        return false;
    };
    match channel.send(event) {
        Ok(()) => {
            trace!(kind = event.kind(), "event delivered");
            true
        }
        Err(e) => {
            debug!(kind = event.kind(), "delivery failed: {e:#}");
            false
        }
    }
}

/// Events produced while the lobby lock is held, delivered once it is released.
#[derive(Default)]
pub struct Outbox {
    pending: Vec<(ChannelRef, ServerEvent)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: &ChannelRef, event: ServerEvent) {
        self.pending.push((channel.clone(), event));
    }

    pub fn flush(self) {
        for (channel, event) in self.pending {
            deliver(&channel, &event);
        }
    }
}

/// In-process channel: every event is forwarded to an [`mpsc::Receiver`].
pub struct MemoryChannel {
    sender: Mutex<mpsc::Sender<ServerEvent>>,
}

impl MemoryChannel {
    pub fn new() -> (Arc<MemoryChannel>, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Arc::new(MemoryChannel {
                sender: Mutex::new(sender),
            }),
            receiver,
        )
    }
}

impl ClientChannel for MemoryChannel {
    fn send(&self, event: &ServerEvent) -> anyhow::Result<()> {
        self.sender
            .lock()
            .map_err(|_| anyhow!("memory channel poisoned"))?
            .send(event.clone())
            .map_err(|_| anyhow!("receiver dropped"))
    }
}
