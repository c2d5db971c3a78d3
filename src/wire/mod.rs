//! Wire formats: serial-number arithmetic and packet/chunk codecs.
//!
//! All multi-byte integers are big-endian. Decoding is bounds-checked and
//! returns [`WireError`](crate::core::error::WireError); the packet handler
//! turns any decode failure into a silent drop.

pub mod chunk;
pub mod packet;
pub mod serial;

pub use chunk::{Chunk, ChunkType};
pub use packet::{ChunkList, EncryptedPacketData, PacketHeader};
pub use serial::{Ssn, Tsn};
