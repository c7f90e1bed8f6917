//! Lock-free packet inbox funneling I/O tasks into the tick owner
//!
//! Connection read tasks push raw frames without blocking; the sync
//! session drains everything at the start of each tick. This keeps all
//! mutation of shared structures inside the single tick-owning context.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::net::framing::Frame;

/// A received frame tagged with its source connection
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub conn_id: u64,
    pub frame: Frame,
}

/// Bounded MPSC inbox; one receiver (the session), many senders (readers)
pub struct PacketInbox {
    sender: Sender<RawPacket>,
    receiver: Receiver<RawPacket>,
    capacity: usize,
}

impl PacketInbox {
    /// Capacity should absorb the burst between two ticks; frames past it
    /// are dropped at submission
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Create a sender handle for a connection read task
    pub fn sender(&self) -> PacketSender {
        PacketSender {
            sender: self.sender.clone(),
        }
    }

    /// Drain all frames queued since the last tick
    pub fn drain(&self) -> Vec<RawPacket> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Cloneable submission handle held by connection read tasks
#[derive(Clone)]
pub struct PacketSender {
    sender: Sender<RawPacket>,
}

impl PacketSender {
    /// Non-blocking submit. Returns false if the inbox is full or closed.
    #[inline]
    pub fn try_submit(&self, packet: RawPacket) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
