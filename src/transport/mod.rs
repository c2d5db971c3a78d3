//! The transport engine: timing, congestion control, acknowledgement
//! scheduling, the inbound and outbound data queues, the control-chunk
//! queue, packet building, and per-stream delivery buffers.
//!
//! Everything here is synchronous state manipulated under the
//! association's lock; the async edges live in [`crate::connection`].

pub mod ack;
pub mod builder;
pub mod congestion;
pub mod control;
pub mod inbound;
pub mod outbound;
pub mod stream;
pub mod timing;

pub use ack::AckScheduler;
pub use builder::PacketBuilder;
pub use congestion::CongestionController;
pub use control::OutControlQueue;
pub use inbound::InDataQueue;
pub use outbound::OutDataQueue;
pub use stream::{ReliabilityPolicy, StreamManager};
pub use timing::RtoEstimator;
