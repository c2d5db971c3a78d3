//! Encryption layer: the fixed cipher-suite boundary, the anti-replay
//! window, and the per-association session crypto.

pub mod replay;
pub mod session;
pub mod suite;

pub use replay::AntiReplayWindow;
pub use session::CryptoSession;
