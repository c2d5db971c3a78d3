//! Protocol constants.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// ENCRYPTION LAYER
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// ChaCha20 IV size (8-byte nonce counter plus 4-byte direction count).
pub const AEAD_IV_SIZE: usize = 12;

/// Size of the explicit per-packet nonce counter on the wire.
pub const NONCE_SIZE: usize = 8;

/// ChaCha20-Poly1305 session key size.
pub const SESSION_KEY_SIZE: usize = 32;

/// IV direction count used by the client when encrypting.
pub const CLIENT_INITIAL_COUNT: u32 = 0;

/// IV direction count used by the server when encrypting.
pub const SERVER_INITIAL_COUNT: u32 = 1;

/// Number of 64-bit blocks backing the anti-replay window.
pub const REPLAY_WINDOW_BLOCKS: usize = 128;

// =============================================================================
// TRANSPORT TUNING
// =============================================================================

/// Default path MTU assumed for outbound packets.
pub const DEFAULT_MTU: usize = 1228;

/// Initial retransmission timeout (RFC 4960 RTO.Initial), milliseconds.
pub const RTO_INITIAL_MS: f64 = 3000.0;

/// Minimum retransmission timeout (RFC 4960 RTO.Min), milliseconds.
pub const RTO_MIN_MS: f64 = 1000.0;

/// Maximum retransmission timeout (RFC 4960 RTO.Max), milliseconds.
pub const RTO_MAX_MS: f64 = 60000.0;

/// Smoothed-RTT gain (RFC 4960 RTO.Alpha = 1/8).
pub const RTO_ALPHA: f64 = 0.125;

/// RTT-variance gain (RFC 4960 RTO.Beta = 1/4).
pub const RTO_BETA: f64 = 0.25;

/// Delay before a scheduled selective acknowledgement goes out.
pub const ACK_INTERVAL: Duration = Duration::from_millis(200);

/// Added to the current RTO to form the heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Miss-indication count that triggers a fast retransmission.
pub const MAX_MISS_INDICATIONS: u8 = 3;

/// Slow-start cwnd floor term (RFC 4960 initial cwnd rule), bytes.
pub const CWND_INITIAL_FLOOR: usize = 4380;

/// Initiation retransmissions before the association gives up.
pub const MAX_INIT_RETRANSMITS: u32 = 8;

/// Shutdown retransmissions before the association gives up.
pub const MAX_SHUTDOWN_RETRANSMITS: u32 = 8;

// =============================================================================
// LISTENER
// =============================================================================

/// Default number of not-yet-accepted associations a listener will hold.
pub const DEFAULT_BACKLOG: usize = 8;

/// Sweep interval for dropping closed associations from the registry.
pub const CLOSING_INTERVAL: Duration = Duration::from_secs(10);

/// Default cap on addressable stream identifiers per association.
pub const DEFAULT_MAX_STREAMS: u16 = u16::MAX;
