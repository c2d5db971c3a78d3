//! Per-stream sequencing: outbound message fragmentation and inbound
//! head-of-line ordering.
//!
//! Streams are created lazily on first use. Ordered delivery holds a
//! message back until every predecessor on the same stream has been
//! delivered; unordered messages bypass the stream sequence entirely.

use std::collections::{BTreeMap, HashMap};

use crate::core::error::ConnectionError;
use crate::wire::chunk::PayloadData;
use crate::wire::{Ssn, Tsn};

/// Retransmission policy applied to every fragment of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityPolicy {
    /// Retransmit until acknowledged.
    #[default]
    Reliable,
    /// Abandon after this many transmissions.
    Rexmit(u32),
    /// Abandon once the first transmission is this many milliseconds old.
    Timed(u64),
}

#[derive(Debug, Default)]
struct OutStream {
    next_ssn: Ssn,
    unordered: bool,
}

#[derive(Debug, Default)]
struct InStream {
    next_ssn: Ssn,
    /// Ordered messages waiting for their predecessors, keyed by raw SSN.
    buffered: BTreeMap<u16, Vec<u8>>,
}

/// Tracks outbound and inbound sequence state for every stream in use.
#[derive(Debug)]
pub struct StreamManager {
    max_streams: u16,
    out: HashMap<u16, OutStream>,
    inbound: HashMap<u16, InStream>,
}

impl StreamManager {
    /// A manager admitting stream identifiers below `max_streams`.
    pub fn new(max_streams: u16) -> Self {
        Self {
            max_streams,
            out: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    /// Marks a stream's future messages as unordered (or ordered again).
    pub fn set_unordered(&mut self, sid: u16, unordered: bool) -> Result<(), ConnectionError> {
        self.check_sid(sid)?;
        self.out.entry(sid).or_default().unordered = unordered;
        Ok(())
    }

    /// Splits a message into payload chunks no larger than `max_payload`,
    /// consuming one stream sequence number for the whole message.
    ///
    /// The returned fragments carry a placeholder TSN; the outbound queue
    /// assigns the real one at first transmission. An empty message
    /// produces no fragments.
    pub fn fragment(
        &mut self,
        sid: u16,
        message: &[u8],
        max_payload: usize,
    ) -> Result<Vec<PayloadData>, ConnectionError> {
        self.check_sid(sid)?;
        if message.is_empty() {
            return Ok(Vec::new());
        }
        let stream = self.out.entry(sid).or_default();
        let ssn = stream.next_ssn;
        stream.next_ssn = stream.next_ssn.next();
        let unordered = stream.unordered;

        let mut fragments = Vec::with_capacity(message.len().div_ceil(max_payload));
        let mut offset = 0;
        while offset != message.len() {
            let take = max_payload.min(message.len() - offset);
            fragments.push(PayloadData {
                begin: offset == 0,
                end: offset + take == message.len(),
                unordered,
                tsn: Tsn(0),
                sid,
                ssn,
                data: message[offset..offset + take].to_vec(),
            });
            offset += take;
        }
        Ok(fragments)
    }

    /// Accepts a reassembled message from the inbound queue and returns
    /// every message that is now deliverable on that stream, in order.
    ///
    /// Unordered messages are deliverable immediately. Ordered messages
    /// are buffered until the stream's next expected sequence number
    /// arrives; duplicates and already-delivered sequence numbers are
    /// dropped.
    pub fn handle_data(
        &mut self,
        unordered: bool,
        sid: u16,
        ssn: Ssn,
        message: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        if unordered {
            return vec![message];
        }
        let stream = self.inbound.entry(sid).or_default();
        if ssn.precedes(stream.next_ssn) {
            return Vec::new();
        }
        stream.buffered.entry(ssn.0).or_insert(message);

        let mut ready = Vec::new();
        while let Some(message) = stream.buffered.remove(&stream.next_ssn.0) {
            stream.next_ssn = stream.next_ssn.next();
            ready.push(message);
        }
        ready
    }

    /// Forget all per-stream state on both directions.
    pub fn reset(&mut self) {
        self.out.clear();
        self.inbound.clear();
    }

    fn check_sid(&self, sid: u16) -> Result<(), ConnectionError> {
        if sid >= self.max_streams {
            return Err(ConnectionError::StreamOutOfRange(sid));
        }
        Ok(())
    }
}
