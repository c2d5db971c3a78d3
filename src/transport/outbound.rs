//! Outbound data queue: TSN assignment, retransmission bookkeeping and
//! partial-reliability abandonment.
//!
//! Payload chunks wait in an unsent queue until the congestion window
//! admits them, then move to the in-flight queue where acknowledgements,
//! miss indications and abandonment are tracked per fragment.

use std::collections::VecDeque;

use crate::core::constants::MAX_MISS_INDICATIONS;
use crate::wire::Tsn;
use crate::wire::chunk::{ForwardTsn, GapAckBlock, PAYLOAD_DATA_OVERHEAD, PayloadData};

use super::congestion::CongestionController;
use super::stream::ReliabilityPolicy;
use super::timing::RtoEstimator;

#[derive(Debug)]
struct OutEntry {
    payload: PayloadData,
    policy: ReliabilityPolicy,
    abandoned: bool,
    acked: bool,
    retransmit: bool,
    miss_indications: u8,
    transmits: u8,
    sent_at_ms: i64,
}

impl OutEntry {
    fn new(payload: PayloadData, policy: ReliabilityPolicy) -> Self {
        Self {
            payload,
            policy,
            abandoned: false,
            acked: false,
            retransmit: false,
            miss_indications: 0,
            transmits: 0,
            sent_at_ms: -1,
        }
    }

    /// Size of the encoded chunk body.
    fn chunk_size(&self) -> usize {
        PAYLOAD_DATA_OVERHEAD + self.payload.data.len()
    }
}

/// Sender-side transmission queue.
#[derive(Debug)]
pub struct OutDataQueue {
    advanced_peer_tsn_ack_point: Tsn,
    cum_tsn_ack_point: Tsn,
    /// Fragments below this TSN are excluded from RTT sampling (Karn).
    min_tsn_for_rtt: Tsn,
    my_next_tsn: Tsn,
    unsent: VecDeque<OutEntry>,
    sent: VecDeque<OutEntry>,
    will_retransmit_fast: bool,
}

impl Default for OutDataQueue {
    fn default() -> Self {
        Self {
            advanced_peer_tsn_ack_point: Tsn(u32::MAX),
            cum_tsn_ack_point: Tsn(u32::MAX),
            min_tsn_for_rtt: Tsn(0),
            my_next_tsn: Tsn(0),
            unsent: VecDeque::new(),
            sent: VecDeque::new(),
            will_retransmit_fast: false,
        }
    }
}

impl OutDataQueue {
    /// An empty queue starting at TSN 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one fragment for its first transmission.
    pub fn push(&mut self, payload: PayloadData, policy: ReliabilityPolicy) {
        self.unsent.push_back(OutEntry::new(payload, policy));
    }

    /// Processes a cumulative acknowledgement that moved forward.
    ///
    /// Every in-flight fragment at or before `cum` is released; newly
    /// acknowledged ones contribute an RTT sample when eligible and are
    /// counted in the returned byte total.
    pub fn acknowledge(&mut self, cum: Tsn, now_ms: i64, rto: &mut RtoEstimator, in_fast_recovery: bool) -> usize {
        debug_assert!(self.cum_tsn_ack_point.precedes(cum));
        let mut bytes_acked = 0;
        loop {
            let done = match self.sent.front() {
                Some(entry) => entry.payload.tsn.follows(cum),
                None => true,
            };
            if done {
                break;
            }
            let Some(mut entry) = self.sent.pop_front() else {
                break;
            };
            self.cum_tsn_ack_point = entry.payload.tsn;
            if !entry.acked {
                entry.acked = true;
                self.sample_rtt(&entry, now_ms, rto);
                bytes_acked += entry.payload.data.len();
            }
        }
        if self.advanced_peer_tsn_ack_point.precedes(self.cum_tsn_ack_point) {
            self.advanced_peer_tsn_ack_point = self.cum_tsn_ack_point;
        }
        if in_fast_recovery {
            self.will_retransmit_fast = true;
        }
        bytes_acked
    }

    /// Processes the gap-ack blocks of a selective acknowledgement. Block
    /// offsets are relative to our cumulative point, which the preceding
    /// cumulative processing has already aligned with the peer's.
    ///
    /// Returns the highest TSN newly acknowledged (the cumulative point
    /// if none) and the newly acknowledged byte total. A block referencing
    /// a TSN we never sent ends the scan.
    pub fn acknowledge_gaps(
        &mut self,
        gap_ack_blocks: &[GapAckBlock],
        now_ms: i64,
        rto: &mut RtoEstimator,
    ) -> (Tsn, usize) {
        let mut htna = self.cum_tsn_ack_point;
        if gap_ack_blocks.is_empty() {
            return (htna, 0);
        }
        let base = self.cum_tsn_ack_point;
        let mut bytes_acked = 0;
        let mut index = 0;
        'blocks: for block in gap_ack_blocks {
            if block.start > block.end {
                continue;
            }
            for offset in block.start..=block.end {
                let tsn = Tsn(base.0.wrapping_add(u32::from(offset)));
                let mut found = false;
                while index < self.sent.len() {
                    if self.sent[index].payload.tsn.follows(tsn) {
                        break;
                    }
                    if self.sent[index].payload.tsn == tsn {
                        found = true;
                        break;
                    }
                    index += 1;
                }
                if !found {
                    break 'blocks;
                }
                let entry = &mut self.sent[index];
                if entry.acked {
                    continue;
                }
                entry.acked = true;
                let snapshot = RttSample {
                    tsn: entry.payload.tsn,
                    transmits: entry.transmits,
                    sent_at_ms: entry.sent_at_ms,
                };
                bytes_acked += entry.payload.data.len();
                self.sample_rtt_fields(&snapshot, now_ms, rto);
                htna = tsn;
            }
        }
        (htna, bytes_acked)
    }

    /// Moves the forward point past abandoned fragments and, when it
    /// passed the cumulative point, emits the chunk telling the peer to
    /// skip them.
    pub fn advance_peer_ack_point(&mut self) -> Option<ForwardTsn> {
        for entry in &self.sent {
            if !entry.abandoned {
                break;
            }
            self.advanced_peer_tsn_ack_point = entry.payload.tsn;
        }
        if self.advanced_peer_tsn_ack_point.follows(self.cum_tsn_ack_point) {
            return Some(ForwardTsn {
                new_cumulative_tsn: self.advanced_peer_tsn_ack_point,
                streams: Vec::new(),
            });
        }
        None
    }

    /// Takes unsent fragments the congestion window admits, assigning
    /// each its transmission sequence number.
    pub fn gather_unsent(
        &mut self,
        now_ms: i64,
        congestion: &mut CongestionController,
    ) -> Vec<PayloadData> {
        let mut chunks = Vec::new();
        loop {
            let admitted = match self.unsent.front() {
                Some(entry) => congestion.is_transmittable(entry.payload.data.len()),
                None => false,
            };
            if !admitted {
                break;
            }
            let Some(mut entry) = self.unsent.pop_front() else {
                break;
            };
            entry.payload.tsn = self.my_next_tsn;
            self.my_next_tsn = self.my_next_tsn.next();
            entry.transmits = 1;
            entry.sent_at_ms = now_ms;
            congestion.transmitted(entry.payload.data.len());
            chunks.push(entry.payload.clone());
            self.sent.push_back(entry);
        }
        chunks
    }

    /// Takes the fragments reported missing three times, up to `budget`
    /// bytes of chunk data, ignoring the congestion window.
    pub fn gather_fast_retransmit(
        &mut self,
        budget: usize,
        now_ms: i64,
        congestion: &mut CongestionController,
    ) -> Vec<PayloadData> {
        if !self.will_retransmit_fast {
            return Vec::new();
        }
        self.will_retransmit_fast = false;
        let mut chunks = Vec::new();
        let mut remains = budget;
        let mut index = 0;
        while index < self.sent.len() && remains != 0 {
            let entry = &self.sent[index];
            if entry.acked
                || entry.transmits > 1
                || entry.miss_indications < MAX_MISS_INDICATIONS
            {
                index += 1;
                continue;
            }
            self.check_partial_reliability_status(index, now_ms, congestion);
            let entry = &mut self.sent[index];
            if entry.abandoned {
                index += 1;
                continue;
            }
            if remains < entry.chunk_size() {
                break;
            }
            remains -= entry.chunk_size();
            entry.transmits += 1;
            chunks.push(entry.payload.clone());
            index += 1;
        }
        chunks
    }

    /// Takes the fragments marked for timeout retransmission that the
    /// congestion window admits.
    pub fn gather_retransmit(
        &mut self,
        now_ms: i64,
        congestion: &mut CongestionController,
    ) -> Vec<PayloadData> {
        let mut chunks = Vec::new();
        let mut index = 0;
        while index < self.sent.len() {
            let entry = &self.sent[index];
            if !entry.retransmit || entry.acked {
                index += 1;
                continue;
            }
            self.check_partial_reliability_status(index, now_ms, congestion);
            let entry = &mut self.sent[index];
            if entry.abandoned {
                index += 1;
                continue;
            }
            if !congestion.is_transmittable(entry.payload.data.len()) {
                break;
            }
            entry.retransmit = false;
            entry.transmits += 1;
            congestion.transmitted(entry.payload.data.len());
            chunks.push(entry.payload.clone());
            index += 1;
        }
        chunks
    }

    /// Counts one missing report against every unacknowledged fragment
    /// before `max_tsn`. A fragment reaching three reports triggers fast
    /// recovery.
    pub fn inc_miss_indications(&mut self, max_tsn: Tsn, congestion: &mut CongestionController) {
        let mut three_missing_reports = false;
        for entry in &mut self.sent {
            if !entry.payload.tsn.precedes(max_tsn) {
                break;
            }
            if entry.acked
                || entry.abandoned
                || entry.miss_indications >= MAX_MISS_INDICATIONS
            {
                continue;
            }
            entry.miss_indications += 1;
            if entry.miss_indications == MAX_MISS_INDICATIONS {
                three_missing_reports = true;
            }
        }
        if !congestion.in_fast_recovery() && three_missing_reports {
            self.will_retransmit_fast = true;
            congestion.enter_fast_recovery(max_tsn);
        }
    }

    /// Flags every unacknowledged in-flight fragment for retransmission.
    pub fn mark_all_to_retransmit(&mut self) {
        for entry in &mut self.sent {
            if entry.acked || entry.abandoned {
                continue;
            }
            entry.retransmit = true;
        }
    }

    /// Whether any transmitted fragment still awaits acknowledgement.
    pub fn has_inflight(&self) -> bool {
        !self.sent.is_empty()
    }

    /// Whether any fragment awaits its first transmission.
    pub fn has_pending(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// Whether nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.unsent.is_empty()
    }

    /// The last TSN the peer has cumulatively acknowledged.
    pub fn cum_tsn_ack_point(&self) -> Tsn {
        self.cum_tsn_ack_point
    }

    /// The forward-TSN point abandoned fragments have advanced to.
    pub fn advanced_peer_tsn_ack_point(&self) -> Tsn {
        self.advanced_peer_tsn_ack_point
    }

    /// The TSN the next queued fragment will take.
    pub fn my_next_tsn(&self) -> Tsn {
        self.my_next_tsn
    }

    /// Drop everything and restart before TSN 0.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Abandons the fragment at `index` (and the rest of its message)
    /// when its reliability policy has expired.
    fn check_partial_reliability_status(
        &mut self,
        index: usize,
        now_ms: i64,
        congestion: &mut CongestionController,
    ) {
        let entry = &self.sent[index];
        if entry.abandoned {
            return;
        }
        debug_assert!(!entry.acked);
        match entry.policy {
            ReliabilityPolicy::Reliable => return,
            ReliabilityPolicy::Rexmit(limit) => {
                if u32::from(entry.transmits) < limit {
                    return;
                }
            }
            ReliabilityPolicy::Timed(lifetime_ms) => {
                if now_ms.saturating_sub(entry.sent_at_ms) < lifetime_ms as i64 {
                    return;
                }
            }
        }
        // Abandon through the end of the message: the remaining in-flight
        // fragments first, then any unsent tail.
        for entry in self.sent.iter_mut().skip(index) {
            entry.acked = true;
            entry.abandoned = true;
            congestion.acknowledged(entry.payload.data.len(), false, false);
            if entry.payload.end {
                return;
            }
        }
        while let Some(entry) = self.unsent.pop_front() {
            if entry.payload.end {
                return;
            }
        }
    }

    fn sample_rtt(&mut self, entry: &OutEntry, now_ms: i64, rto: &mut RtoEstimator) {
        let sample = RttSample {
            tsn: entry.payload.tsn,
            transmits: entry.transmits,
            sent_at_ms: entry.sent_at_ms,
        };
        self.sample_rtt_fields(&sample, now_ms, rto);
    }

    /// Karn's rule: only first-transmission fragments at or past the
    /// sampling floor contribute, and a sample pushes the floor to the
    /// end of the current flight.
    fn sample_rtt_fields(&mut self, sample: &RttSample, now_ms: i64, rto: &mut RtoEstimator) {
        if sample.transmits != 1 || sample.tsn.precedes(self.min_tsn_for_rtt) {
            return;
        }
        self.min_tsn_for_rtt = self.my_next_tsn;
        let rtt = now_ms - sample.sent_at_ms;
        if rtt >= 0 {
            rto.recalculate(rtt as f64);
        }
    }
}

struct RttSample {
    tsn: Tsn,
    transmits: u8,
    sent_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::DEFAULT_MTU;

    fn fragment(data: &[u8], begin: bool, end: bool) -> PayloadData {
        PayloadData {
            begin,
            end,
            unordered: false,
            tsn: Tsn(0),
            sid: 0,
            ssn: crate::wire::Ssn(0),
            data: data.to_vec(),
        }
    }

    fn whole(data: &[u8]) -> PayloadData {
        fragment(data, true, true)
    }

    fn queue_with_inflight(count: usize, congestion: &mut CongestionController) -> OutDataQueue {
        let mut queue = OutDataQueue::new();
        for _ in 0..count {
            queue.push(whole(b"data"), ReliabilityPolicy::Reliable);
        }
        let chunks = queue.gather_unsent(1_000, congestion);
        assert_eq!(chunks.len(), count);
        queue
    }

    #[test]
    fn unsent_fragments_get_sequential_tsns() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let queue = queue_with_inflight(3, &mut congestion);
        assert_eq!(queue.my_next_tsn(), Tsn(3));
        assert!(queue.has_inflight());
        assert!(!queue.has_pending());
        assert_eq!(congestion.bytes_outstanding(), 12);
        assert_eq!(queue.cum_tsn_ack_point(), Tsn(u32::MAX));
    }

    #[test]
    fn congestion_window_gates_first_transmission() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = OutDataQueue::new();
        let big = vec![0u8; congestion.cwnd()];
        queue.push(whole(&big), ReliabilityPolicy::Reliable);
        queue.push(whole(b"late"), ReliabilityPolicy::Reliable);
        let chunks = queue.gather_unsent(0, &mut congestion);
        assert_eq!(chunks.len(), 1);
        assert!(queue.has_pending());
    }

    #[test]
    fn cumulative_ack_releases_fragments_and_samples_rtt() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(3, &mut congestion);
        let mut rto = RtoEstimator::default();
        let bytes = queue.acknowledge(Tsn(1), 1_400, &mut rto, false);
        assert_eq!(bytes, 8);
        assert_eq!(queue.cum_tsn_ack_point(), Tsn(1));
        assert!(queue.has_inflight());
        // One sample at 400ms: srtt = 400, rttvar = 200.
        assert_eq!(rto.rto(), 1_200.0);
    }

    #[test]
    fn rtt_is_sampled_once_per_flight() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(3, &mut congestion);
        let mut rto = RtoEstimator::default();
        queue.acknowledge(Tsn(0), 1_400, &mut rto, false);
        let after_first = rto.rto();
        // The second ack covers a TSN below my_next_tsn, so no new sample.
        queue.acknowledge(Tsn(2), 9_999, &mut rto, false);
        assert_eq!(rto.rto(), after_first);
    }

    #[test]
    fn retransmitted_fragments_never_sample_rtt() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(1, &mut congestion);
        queue.mark_all_to_retransmit();
        let chunks = queue.gather_retransmit(2_000, &mut congestion);
        assert_eq!(chunks.len(), 1);
        let mut rto = RtoEstimator::default();
        queue.acknowledge(Tsn(0), 3_000, &mut rto, false);
        assert_eq!(rto.rto(), crate::core::constants::RTO_INITIAL_MS);
    }

    #[test]
    fn gap_acks_report_the_highest_newly_acked_tsn() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(5, &mut congestion);
        let mut rto = RtoEstimator::default();
        // Peer has TSNs 1..=2 beyond the cumulative point.
        let blocks = [GapAckBlock { start: 2, end: 3 }];
        let (htna, bytes) = queue.acknowledge_gaps(&blocks, 1_000, &mut rto);
        assert_eq!(htna, Tsn(2));
        assert_eq!(bytes, 8);
    }

    #[test]
    fn gap_acks_for_unknown_tsns_stop_the_scan() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(2, &mut congestion);
        let mut rto = RtoEstimator::default();
        let blocks = [
            GapAckBlock { start: 8, end: 9 },
            GapAckBlock { start: 1, end: 1 },
        ];
        let (htna, bytes) = queue.acknowledge_gaps(&blocks, 1_000, &mut rto);
        assert_eq!(htna, Tsn(u32::MAX));
        assert_eq!(bytes, 0);
    }

    #[test]
    fn three_miss_indications_trigger_fast_retransmit() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(2, &mut congestion);
        for _ in 0..3 {
            queue.inc_miss_indications(Tsn(1), &mut congestion);
        }
        assert!(congestion.in_fast_recovery());
        let chunks =
            queue.gather_fast_retransmit(usize::MAX, 1_000, &mut congestion);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tsn, Tsn(0));
        // The flag is consumed.
        assert!(queue
            .gather_fast_retransmit(usize::MAX, 1_000, &mut congestion)
            .is_empty());
    }

    #[test]
    fn fast_retransmit_respects_the_byte_budget() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(3, &mut congestion);
        for _ in 0..3 {
            queue.inc_miss_indications(Tsn(3), &mut congestion);
        }
        let budget = PAYLOAD_DATA_OVERHEAD + 4;
        let chunks = queue.gather_fast_retransmit(budget, 1_000, &mut congestion);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn timeout_retransmission_resends_everything_unacked() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(3, &mut congestion);
        let mut rto = RtoEstimator::default();
        queue.acknowledge(Tsn(0), 1_000, &mut rto, false);
        congestion.on_retransmission();
        queue.mark_all_to_retransmit();
        let chunks = queue.gather_retransmit(2_000, &mut congestion);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].tsn, Tsn(1));
        assert_eq!(chunks[1].tsn, Tsn(2));
    }

    #[test]
    fn rexmit_policy_abandons_after_the_transmission_limit() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = OutDataQueue::new();
        queue.push(whole(b"lossy"), ReliabilityPolicy::Rexmit(1));
        queue.gather_unsent(1_000, &mut congestion);
        queue.mark_all_to_retransmit();
        // One transmission already used up, so abandonment wins.
        assert!(queue.gather_retransmit(2_000, &mut congestion).is_empty());
        assert_eq!(congestion.bytes_outstanding(), 0);
        let forward = queue.advance_peer_ack_point();
        assert_eq!(
            forward.map(|f| f.new_cumulative_tsn),
            Some(Tsn(0))
        );
    }

    #[test]
    fn timed_policy_abandons_expired_messages_with_unsent_tail() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = OutDataQueue::new();
        queue.push(fragment(b"head", true, false), ReliabilityPolicy::Timed(500));
        queue.push(fragment(b"tail", false, true), ReliabilityPolicy::Timed(500));
        queue.push(whole(b"next"), ReliabilityPolicy::Reliable);
        // Leave room for the head only, so the tail stays unsent.
        congestion.transmitted(congestion.cwnd() - 4);
        let sent = queue.gather_unsent(0, &mut congestion);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"head".to_vec());
        queue.mark_all_to_retransmit();
        // 600ms later the lifetime has expired: the in-flight head and the
        // unsent tail are both dropped.
        assert!(queue.gather_retransmit(600, &mut congestion).is_empty());
        assert!(queue.has_pending());
        let sent = queue.gather_unsent(600, &mut congestion);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"next".to_vec());
    }

    #[test]
    fn reliable_fragments_are_never_abandoned() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(1, &mut congestion);
        queue.mark_all_to_retransmit();
        congestion.on_retransmission();
        for _ in 0..10 {
            let chunks = queue.gather_retransmit(1_000_000, &mut congestion);
            assert_eq!(chunks.len(), 1);
            queue.mark_all_to_retransmit();
            congestion.on_retransmission();
        }
    }

    #[test]
    fn forward_point_stops_at_the_first_live_fragment() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = OutDataQueue::new();
        queue.push(whole(b"drop"), ReliabilityPolicy::Rexmit(1));
        queue.push(whole(b"keep"), ReliabilityPolicy::Reliable);
        queue.gather_unsent(1_000, &mut congestion);
        queue.mark_all_to_retransmit();
        let chunks = queue.gather_retransmit(2_000, &mut congestion);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, b"keep".to_vec());
        let forward = queue.advance_peer_ack_point();
        assert_eq!(forward.map(|f| f.new_cumulative_tsn), Some(Tsn(0)));
    }

    #[test]
    fn reset_restores_initial_sequence_state() {
        let mut congestion = CongestionController::new(DEFAULT_MTU);
        let mut queue = queue_with_inflight(2, &mut congestion);
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.my_next_tsn(), Tsn(0));
        assert_eq!(queue.cum_tsn_ack_point(), Tsn(u32::MAX));
    }
}
