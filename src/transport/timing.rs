//! Retransmission-timeout estimation (RFC 6298 / RFC 4960 style).
//!
//! Jacobson/Karels smoothing in floating-point milliseconds. Karn's rule
//! is enforced by the outbound queue: only chunks acked on their first
//! transmission produce samples.

use crate::core::constants::{RTO_ALPHA, RTO_BETA, RTO_INITIAL_MS, RTO_MAX_MS, RTO_MIN_MS};

/// Smoothed RTT state and the derived retransmission timeout.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: f64,
    rttvar: f64,
    rto: f64,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: RTO_INITIAL_MS,
        }
    }
}

impl RtoEstimator {
    /// Current retransmission timeout in milliseconds.
    pub fn rto(&self) -> f64 {
        self.rto
    }

    /// Current RTO as a [`Duration`](std::time::Duration).
    pub fn rto_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rto as u64)
    }

    /// Feed one round-trip sample in milliseconds.
    pub fn recalculate(&mut self, rtt_ms: f64) {
        if self.srtt == 0.0 {
            self.srtt = rtt_ms;
            self.rttvar = rtt_ms / 2.0;
        } else {
            self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt - rtt_ms).abs();
            self.srtt = (1.0 - RTO_ALPHA) * self.srtt + RTO_ALPHA * rtt_ms;
        }
        self.rto = (self.srtt + 4.0 * self.rttvar).clamp(RTO_MIN_MS, RTO_MAX_MS);
    }

    /// Double the RTO after a retransmission timeout.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(RTO_MAX_MS);
    }

    /// Back to the initial timeout with no history.
    pub fn reset(&mut self) {
        self.srtt = 0.0;
        self.rttvar = 0.0;
        self.rto = RTO_INITIAL_MS;
    }
}
