//! Outbound control-chunk queue.
//!
//! Control chunks (handshake, acks, heartbeats, shutdown, forward-TSN)
//! are queued here and drained ahead of user data when packets are built.
//! Payload data never goes through this queue.

use crate::wire::chunk::Chunk;

/// FIFO of control chunks awaiting transmission.
#[derive(Debug, Default)]
pub struct OutControlQueue {
    storage: Vec<Chunk>,
}

impl OutControlQueue {
    /// Queue a control chunk.
    pub fn push(&mut self, chunk: Chunk) {
        debug_assert!(!matches!(chunk, Chunk::PayloadData(_)));
        self.storage.push(chunk);
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Take every queued chunk, oldest first.
    pub fn drain(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.storage)
    }

    /// Drop everything queued.
    pub fn reset(&mut self) {
        self.storage.clear();
    }
}
