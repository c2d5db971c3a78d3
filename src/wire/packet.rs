//! Packet-level codecs: the outer header, the encrypted payload wrapper,
//! and the chunk list carried inside.

use crate::core::constants::{AEAD_TAG_SIZE, NONCE_SIZE};
use crate::core::error::WireError;
use crate::wire::chunk::{Chunk, Reader};

/// Encoded packet header size: flag byte plus connection id.
pub const PACKET_HEADER_SIZE: usize = 1 + 4;

/// Packet flag: the payload is an [`EncryptedPacketData`].
const FLAG_ENCRYPTED: u8 = 0b1;

/// The outer packet header.
///
/// Wire: `flags:u8 (bit0 = encrypted), connection_id:u32`, then the
/// payload (an encrypted wrapper or a cleartext chunk list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Whether the payload is encrypted.
    pub encrypted: bool,
    /// Association identifier (0 during the client's handshake).
    pub connection_id: u32,
}

impl PacketHeader {
    /// Append the header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(if self.encrypted { FLAG_ENCRYPTED } else { 0 });
        out.extend_from_slice(&self.connection_id.to_be_bytes());
    }

    /// Split a datagram into its header and payload.
    pub fn decode(buf: &[u8]) -> Result<(PacketHeader, &[u8]), WireError> {
        let mut reader = Reader::new(buf);
        let flags = reader.u8()?;
        let connection_id = reader.u32()?;
        let header = PacketHeader {
            encrypted: flags & FLAG_ENCRYPTED != 0,
            connection_id,
        };
        Ok((header, reader.rest()))
    }
}

/// Overhead of the encrypted payload wrapper: tag plus explicit nonce.
pub const ENCRYPTED_DATA_OVERHEAD: usize = AEAD_TAG_SIZE + NONCE_SIZE;

/// The encrypted payload wrapper.
///
/// Wire: `mac:[u8;16], nonce:u64, ciphertext`. The tag is detached so the
/// replay window can be consulted before any AEAD work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacketData {
    /// Poly1305 tag over the ciphertext.
    pub mac: [u8; AEAD_TAG_SIZE],
    /// Sender's nonce counter for this packet.
    pub nonce: u64,
}

impl EncryptedPacketData {
    /// Append the wrapper and ciphertext to `out`.
    pub fn encode(&self, ciphertext: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(ciphertext);
    }

    /// Split an encrypted payload into its wrapper and ciphertext.
    pub fn decode(buf: &[u8]) -> Result<(EncryptedPacketData, &[u8]), WireError> {
        let mut reader = Reader::new(buf);
        let mut mac = [0u8; AEAD_TAG_SIZE];
        mac.copy_from_slice(reader.take(AEAD_TAG_SIZE)?);
        let nonce = reader.u64()?;
        Ok((EncryptedPacketData { mac, nonce }, reader.rest()))
    }
}

/// Chunk-list overhead: the count byte.
pub const CHUNK_LIST_OVERHEAD: usize = 1;

/// Per-chunk overhead inside a chunk list: the u16 length prefix.
pub const CHUNK_ENTRY_OVERHEAD: usize = 2;

/// Codec for the chunk list carried in every packet payload.
///
/// Wire: `count:u8`, then `count` entries of `len:u16` followed by an
/// encoded chunk.
pub struct ChunkList;

impl ChunkList {
    /// Encoded size of `chunks` as a chunk list.
    pub fn encoded_len(chunks: &[Chunk]) -> usize {
        CHUNK_LIST_OVERHEAD
            + chunks
                .iter()
                .map(|c| CHUNK_ENTRY_OVERHEAD + c.encoded_len())
                .sum::<usize>()
    }

    /// Encode `chunks` into a fresh buffer.
    ///
    /// At most 255 chunks fit the count byte; the packet builder never
    /// packs more.
    pub fn encode(chunks: &[Chunk]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(chunks));
        out.push(chunks.len().min(u8::MAX as usize) as u8);
        for chunk in chunks.iter().take(u8::MAX as usize) {
            out.extend_from_slice(&(chunk.encoded_len() as u16).to_be_bytes());
            chunk.encode(&mut out);
        }
        out
    }

    /// Decode a chunk list payload.
    pub fn decode(buf: &[u8]) -> Result<Vec<Chunk>, WireError> {
        let mut reader = Reader::new(buf);
        let count = reader.u8()? as usize;
        let mut chunks = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let len = reader.u16()? as usize;
            if len == 0 {
                return Err(WireError::BadLength);
            }
            let raw = reader.take(len)?;
            chunks.push(Chunk::decode(raw[0], &raw[1..])?);
        }
        Ok(chunks)
    }
}
