//! AIMD congestion control with fast recovery (RFC 4960 §7).

use crate::core::constants::CWND_INITIAL_FLOOR;
use crate::wire::serial::Tsn;

/// Congestion state for one association.
#[derive(Debug, Clone)]
pub struct CongestionController {
    mtu: usize,
    cwnd: usize,
    ssthresh: usize,
    bytes_outstanding: usize,
    partial_bytes_acked: usize,
    in_fast_recovery: bool,
    fast_recovery_exit_point: Tsn,
}

impl CongestionController {
    /// Fresh controller for the given path MTU.
    pub fn new(mtu: usize) -> Self {
        let mut this = Self {
            mtu,
            cwnd: 0,
            ssthresh: 0,
            bytes_outstanding: 0,
            partial_bytes_acked: 0,
            in_fast_recovery: false,
            fast_recovery_exit_point: Tsn(0),
        };
        this.reset();
        this
    }

    fn initial_cwnd(&self) -> usize {
        (4 * self.mtu).min((2 * self.mtu).max(CWND_INITIAL_FLOOR))
    }

    /// Current congestion window in bytes.
    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    /// Current slow-start threshold in bytes.
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    /// Bytes currently in flight.
    pub fn bytes_outstanding(&self) -> usize {
        self.bytes_outstanding
    }

    /// Whether `bytes` more may enter the network.
    pub fn is_transmittable(&self, bytes: usize) -> bool {
        self.bytes_outstanding + bytes <= self.cwnd
    }

    /// Count freshly sent bytes into the flight.
    pub fn transmitted(&mut self, bytes: usize) {
        self.bytes_outstanding += bytes;
    }

    /// Process `bytes` leaving the flight via acknowledgement (or
    /// abandonment, in which case `cum_advanced` is false and the window
    /// never grows).
    ///
    /// `has_pending` is whether the outbound queue still holds data; the
    /// window only grows while the sender is actually using it.
    pub fn acknowledged(&mut self, bytes: usize, cum_advanced: bool, has_pending: bool) {
        self.bytes_outstanding -= self.bytes_outstanding.min(bytes);
        if !cum_advanced {
            return;
        }
        if self.cwnd <= self.ssthresh {
            // Slow start.
            if !self.in_fast_recovery && has_pending {
                self.cwnd += bytes.min(self.cwnd);
            }
        } else {
            // Congestion avoidance: one MTU per window's worth of acks.
            self.partial_bytes_acked += bytes;
            if self.partial_bytes_acked >= self.cwnd && has_pending {
                self.partial_bytes_acked -= self.cwnd;
                self.cwnd += self.mtu;
            }
        }
    }

    /// Multiplicative decrease on the third miss indication.
    pub fn enter_fast_recovery(&mut self, exit_point: Tsn) {
        if self.in_fast_recovery {
            return;
        }
        self.in_fast_recovery = true;
        self.fast_recovery_exit_point = exit_point;
        self.ssthresh = (self.cwnd / 2).max(4 * self.mtu);
        self.cwnd = self.ssthresh;
        self.partial_bytes_acked = 0;
    }

    /// Leave fast recovery once the cumulative ack passes the exit point.
    pub fn exit_fast_recovery(&mut self) {
        self.in_fast_recovery = false;
    }

    /// Whether fast recovery is active.
    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    /// The TSN whose cumulative acknowledgement ends fast recovery.
    pub fn fast_recovery_exit_point(&self) -> Tsn {
        self.fast_recovery_exit_point
    }

    /// Collapse the window after a retransmission timeout.
    pub fn on_retransmission(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(4 * self.mtu);
        self.cwnd = self.mtu;
        self.bytes_outstanding = 0;
    }

    /// Restart from the initial window after the association sat idle.
    pub fn on_long_idle_period(&mut self) {
        self.cwnd = self.initial_cwnd();
        self.partial_bytes_acked = 0;
    }

    /// Back to a fresh window.
    pub fn reset(&mut self) {
        self.ssthresh = 4 * self.mtu;
        self.cwnd = self.initial_cwnd();
        self.bytes_outstanding = 0;
        self.partial_bytes_acked = 0;
        self.in_fast_recovery = false;
    }
}
