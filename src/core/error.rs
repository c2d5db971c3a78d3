//! Error types.
//!
//! Invalid input from the network is never reported back to the peer; the
//! packet handler drops it silently. The types here cover the local API
//! surface and internal codec/crypto plumbing.

use thiserror::Error;

/// Errors decoding wire structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the structure was complete.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unknown chunk type identifier.
    #[error("unknown chunk type: {0}")]
    UnknownChunkType(u8),

    /// A declared length field does not match the available bytes.
    #[error("length field out of range")]
    BadLength,
}

/// Errors in the encryption layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Nonce counter already seen inside the replay window.
    #[error("replay detected")]
    ReplayDetected,

    /// Nonce counter exhausted - association must terminate.
    #[error("nonce counter exhausted - association must terminate")]
    CounterExhaustion,

    /// No session key has been agreed yet.
    #[error("no session key established")]
    NoSessionKey,

    /// Handshake message failed authentication.
    #[error("handshake authentication failed")]
    HandshakeAuthentication,
}

/// Errors from association-level operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The operation is not valid in the current state.
    #[error("invalid state for operation: {0}")]
    InvalidState(&'static str),

    /// Stream identifier beyond the configured maximum.
    #[error("stream id {0} exceeds the configured maximum")]
    StreamOutOfRange(u16),

    /// The association closed before the operation completed.
    #[error("association closed")]
    Closed,
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum SquallError {
    /// Wire codec error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Encryption layer error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Association error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The association closed before the operation completed.
    #[error("association closed")]
    Closed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
