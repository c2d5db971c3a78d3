//! Receive-side reassembly queue.
//!
//! Fragments above the cumulative-ack point sit in a map keyed by an
//! unwrapped (64-bit, monotonic) image of their TSN, which keeps the map
//! totally ordered across TSN wraparound. The cumulative point
//! (`peer_last_tsn`) only ever moves forward.

use std::collections::BTreeMap;

use crate::wire::chunk::{GapAckBlock, PayloadData};
use crate::wire::serial::Tsn;

struct Entry {
    payload: PayloadData,
    consumed: bool,
}

/// Result of offering one fragment to the queue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushResult {
    /// False for duplicates and TSNs at or below the cumulative point.
    pub success: bool,
    /// The fragment landed beyond the next expected TSN.
    pub has_packet_loss: bool,
    /// A complete message this fragment finished, if any.
    pub user_data: Option<Vec<u8>>,
}

/// Inbound data queue for one association.
pub struct InDataQueue {
    /// Unwrapped TSN -> stored fragment.
    storage: BTreeMap<u64, Entry>,
    peer_last_tsn: Tsn,
    /// Unwrapped image of `peer_last_tsn`; starts at 0 for TSN u32::MAX
    /// so the first expected TSN (0) unwraps to 1.
    peer_last_unwrapped: u64,
}

impl Default for InDataQueue {
    fn default() -> Self {
        Self {
            storage: BTreeMap::new(),
            peer_last_tsn: Tsn(u32::MAX),
            peer_last_unwrapped: 0,
        }
    }
}

impl InDataQueue {
    /// The cumulative-ack point: every TSN up to here has been received.
    pub fn peer_last_tsn(&self) -> Tsn {
        self.peer_last_tsn
    }

    /// Offer one fragment.
    pub fn push(&mut self, payload: PayloadData) -> PushResult {
        let tsn = payload.tsn;
        let key = match self.insert_fragment(payload) {
            Some(key) => key,
            None => return PushResult::default(),
        };
        self.shift_peer_last_tsn();
        PushResult {
            success: true,
            has_packet_loss: tsn.follows(self.peer_last_tsn),
            user_data: self.reassemble_fragments(key),
        }
    }

    /// Contiguous received runs above the cumulative point, as offsets
    /// from it, capped at `max_blocks`. Offsets past the representable
    /// range saturate at `u16::MAX`.
    pub fn gap_ack_blocks(&self, max_blocks: usize) -> Vec<GapAckBlock> {
        let mut result: Vec<GapAckBlock> = Vec::new();
        if max_blocks == 0 {
            return result;
        }
        let mut expected = self.peer_last_unwrapped + 1;
        for (&key, _) in self.storage.range(self.peer_last_unwrapped + 1..) {
            let offset = (key - self.peer_last_unwrapped).min(u16::MAX as u64) as u16;
            if key == expected {
                if let Some(last) = result.last_mut() {
                    last.end = offset;
                }
                expected += 1;
            } else {
                if result.len() == max_blocks {
                    break;
                }
                result.push(GapAckBlock {
                    start: offset,
                    end: offset,
                });
                expected = key + 1;
            }
        }
        result
    }

    /// Drop everything and restart before TSN 0.
    pub fn reset(&mut self) {
        self.storage.clear();
        self.peer_last_tsn = Tsn(u32::MAX);
        self.peer_last_unwrapped = 0;
    }

    fn unwrap_tsn(&self, tsn: Tsn) -> u64 {
        // Valid for TSNs serially above the cumulative point.
        self.peer_last_unwrapped + tsn.offset_from(self.peer_last_tsn) as u64
    }

    fn insert_fragment(&mut self, payload: PayloadData) -> Option<u64> {
        if !payload.tsn.follows(self.peer_last_tsn) {
            return None;
        }
        let key = self.unwrap_tsn(payload.tsn);
        if self.storage.contains_key(&key) {
            return None;
        }
        self.storage.insert(
            key,
            Entry {
                payload,
                consumed: false,
            },
        );
        Some(key)
    }

    fn shift_peer_last_tsn(&mut self) {
        while self.storage.contains_key(&(self.peer_last_unwrapped + 1)) {
            self.peer_last_unwrapped += 1;
            self.peer_last_tsn = self.peer_last_tsn.next();
        }
    }

    /// Walk backward to the begin fragment over contiguous keys.
    fn find_beginning_fragment(&self, key: u64) -> Option<u64> {
        let mut expected = key;
        loop {
            let entry = self.storage.get(&expected)?;
            if entry.payload.begin {
                return Some(expected);
            }
            expected = expected.checked_sub(1)?;
        }
    }

    /// Walk forward to the end fragment over contiguous keys.
    fn find_ending_fragment(&self, key: u64) -> Option<u64> {
        let mut expected = key;
        loop {
            let entry = self.storage.get(&expected)?;
            if entry.payload.end {
                return Some(expected);
            }
            expected += 1;
        }
    }

    fn reassemble_fragments(&mut self, key: u64) -> Option<Vec<u8>> {
        let begin = self.find_beginning_fragment(key)?;
        let end = self.find_ending_fragment(key)?;
        let size = self
            .storage
            .range(begin..=end)
            .map(|(_, e)| e.payload.data.len())
            .sum();
        let mut user_data = Vec::with_capacity(size);
        for (_, entry) in self.storage.range_mut(begin..=end) {
            user_data.extend_from_slice(&entry.payload.data);
            entry.consumed = true;
        }
        // Garbage-collect the consumed prefix at or below the cumulative
        // point, starting from the message's first fragment.
        let mut cursor = begin;
        while let Some(entry) = self.storage.get(&cursor) {
            if cursor > self.peer_last_unwrapped || !entry.consumed {
                break;
            }
            self.storage.remove(&cursor);
            cursor += 1;
        }
        Some(user_data)
    }
}
