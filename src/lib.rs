//! # Squall
//!
//! Squall is an SCTP-style reliable transport protocol carried over UDP,
//! with an always-on authenticated encryption layer. It provides:
//!
//! - **Reliability**: Retransmission with selective acknowledgements and
//!   AIMD congestion control
//! - **Multi-streaming**: Independent message streams over one association,
//!   each ordered or unordered, so one lost message only stalls its own
//!   stream
//! - **Partial reliability**: Per-message limits on retransmission count or
//!   lifetime, with forward-TSN recovery on abandonment
//! - **Security**: Every post-handshake packet is sealed with
//!   ChaCha20-Poly1305 under a session key agreed by an authenticated
//!   two-role key exchange; replayed packets are dropped before decryption
//! - **Simplicity**: Fixed cryptographic suite, no negotiation
//!
//! ## Modules
//!
//! - [`core`]: Constants and error types
//! - [`wire`]: Serial-number arithmetic and packet/chunk codecs
//! - [`crypto`]: Cipher-suite boundary, anti-replay window, session crypto
//! - [`transport`]: RTO estimation, congestion control, ack scheduling,
//!   data queues, packet building
//! - [`connection`]: The association state machine and the async
//!   [`Connection`](connection::Connection) handle
//! - [`server`]: The [`Listener`](server::Listener) demultiplexer for
//!   accepting inbound associations on a shared socket
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use squall::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SquallError> {
//!     let identity = ServerIdentity::generate();
//!     let listener = Listener::bind("127.0.0.1:0".parse().unwrap(),
//!                                   identity.secret_key(),
//!                                   ListenerConfig::default()).await?;
//!     let server_addr = listener.local_addr()?;
//!     let server_pk = *identity.public_key();
//!
//!     tokio::spawn(async move {
//!         while let Some(conn) = listener.accept().await {
//!             tokio::spawn(async move {
//!                 while let Some((sid, msg)) = conn.recv().await {
//!                     let _ = conn.write(sid, msg, ReliabilityPolicy::Reliable);
//!                 }
//!             });
//!         }
//!     });
//!
//!     let conn = Connection::connect("0.0.0.0:0".parse().unwrap(),
//!                                    server_addr, &server_pk,
//!                                    ConnectionConfig::default()).await?;
//!     conn.write(0, b"hello".to_vec(), ReliabilityPolicy::Reliable)?;
//!     let (_, echoed) = conn.recv().await.ok_or(SquallError::Closed)?;
//!     assert_eq!(echoed, b"hello");
//!     conn.shutdown()?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod wire;
pub mod crypto;
pub mod transport;
pub mod connection;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionConfig, State};
    pub use crate::core::error::SquallError;
    pub use crate::crypto::suite::{PublicKey, SecretKey, ServerIdentity};
    pub use crate::server::{Listener, ListenerConfig};
    pub use crate::transport::stream::ReliabilityPolicy;
    pub use crate::wire::serial::{Ssn, Tsn};
}
