//! Packet assembly: packing chunks into MTU-sized datagrams and sealing
//! the encryptable ones.
//!
//! Handshake chunks travel in cleartext packets; everything else is
//! wrapped in the encrypted payload format. The size helpers expose how
//! much chunk data fits each layer so the queues can budget before
//! chunks ever reach the builder.

use crate::core::constants::DEFAULT_MTU;
use crate::core::error::CryptoError;
use crate::crypto::CryptoSession;
use crate::wire::chunk::{
    Chunk, GAP_ACK_BLOCK_SIZE, PAYLOAD_DATA_OVERHEAD, SACK_OVERHEAD,
};
use crate::wire::packet::{
    CHUNK_ENTRY_OVERHEAD, CHUNK_LIST_OVERHEAD, ENCRYPTED_DATA_OVERHEAD, PACKET_HEADER_SIZE,
    PacketHeader,
};

/// Encoded chunk overhead: the type byte.
const CHUNK_TYPE_OVERHEAD: usize = 1;

/// Most chunks a single list can carry (one count byte).
const MAX_CHUNKS_PER_LIST: usize = u8::MAX as usize;

/// Builds wire datagrams from chunks, honoring the path MTU.
#[derive(Debug)]
pub struct PacketBuilder {
    mtu: usize,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self { mtu: DEFAULT_MTU }
    }
}

impl PacketBuilder {
    /// A builder for the given path MTU.
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    /// The path MTU every built datagram fits within.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Changes the path MTU for subsequent builds.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Packs `chunks` into as few datagrams as fit the MTU.
    ///
    /// Cleartext packets come first, then encrypted ones. Sealing needs a
    /// session key unless every chunk is a handshake chunk.
    pub fn build(
        &self,
        chunks: Vec<Chunk>,
        crypto: &mut CryptoSession,
        connection_id: u32,
    ) -> Result<Vec<Vec<u8>>, CryptoError> {
        let mut cleartext = Vec::new();
        let mut encryptable = Vec::new();
        for chunk in &chunks {
            let mut encoded = Vec::with_capacity(chunk.encoded_len());
            chunk.encode(&mut encoded);
            if chunk.is_encryptable() {
                encryptable.push(encoded);
            } else {
                cleartext.push(encoded);
            }
        }
        let mut packets = Vec::new();
        for list in self.pack_lists(cleartext, self.max_packet_data_size()) {
            let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + list.len());
            PacketHeader {
                encrypted: false,
                connection_id,
            }
            .encode(&mut packet);
            packet.extend_from_slice(&list);
            packets.push(packet);
        }
        for mut list in self.pack_lists(encryptable, self.max_encrypted_data_size()) {
            let wrapper = crypto.encrypt(&mut list)?;
            let mut packet =
                Vec::with_capacity(PACKET_HEADER_SIZE + ENCRYPTED_DATA_OVERHEAD + list.len());
            PacketHeader {
                encrypted: true,
                connection_id,
            }
            .encode(&mut packet);
            wrapper.encode(&list, &mut packet);
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Largest chunk body that fits one packet of the given kind.
    pub fn max_chunk_data_size(&self, encryptable: bool) -> usize {
        self.max_chunk_list_chunk_data_size(encryptable) - CHUNK_TYPE_OVERHEAD
    }

    /// Largest user-data fragment a payload chunk can carry.
    pub fn max_payload_size(&self) -> usize {
        self.max_chunk_data_size(true) - PAYLOAD_DATA_OVERHEAD
    }

    /// Most gap-ack blocks a single acknowledgement chunk can carry.
    pub fn max_sack_gap_blocks(&self) -> usize {
        (self.max_chunk_data_size(true) - SACK_OVERHEAD) / GAP_ACK_BLOCK_SIZE
    }

    /// Splits encoded chunks into chunk-list payloads no larger than
    /// `max_list_size`, preserving order.
    fn pack_lists(&self, encoded: Vec<Vec<u8>>, max_list_size: usize) -> Vec<Vec<u8>> {
        let mut lists = Vec::new();
        let mut iter = encoded.into_iter().peekable();
        while iter.peek().is_some() {
            let mut members: Vec<Vec<u8>> = Vec::new();
            let mut size = CHUNK_LIST_OVERHEAD;
            while let Some(chunk) = iter.peek() {
                let grown = size + CHUNK_ENTRY_OVERHEAD + chunk.len();
                if grown > max_list_size || members.len() == MAX_CHUNKS_PER_LIST {
                    break;
                }
                size = grown;
                members.push(match iter.next() {
                    Some(chunk) => chunk,
                    None => break,
                });
            }
            if members.is_empty() {
                // A chunk larger than the budget; the queues never produce
                // one, so drop it rather than loop.
                debug_assert!(false, "oversized chunk reached the packet builder");
                iter.next();
                continue;
            }
            let mut list = Vec::with_capacity(size);
            list.push(members.len() as u8);
            for member in members {
                list.extend_from_slice(&(member.len() as u16).to_be_bytes());
                list.extend_from_slice(&member);
            }
            lists.push(list);
        }
        lists
    }

    fn max_packet_data_size(&self) -> usize {
        self.mtu - PACKET_HEADER_SIZE
    }

    fn max_encrypted_data_size(&self) -> usize {
        self.max_packet_data_size() - ENCRYPTED_DATA_OVERHEAD
    }

    fn max_chunk_list_chunk_data_size(&self, encryptable: bool) -> usize {
        let outer = if encryptable {
            self.max_encrypted_data_size()
        } else {
            self.max_packet_data_size()
        };
        outer - CHUNK_LIST_OVERHEAD - CHUNK_ENTRY_OVERHEAD
    }
}
