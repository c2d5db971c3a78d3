//! Chunk codecs.
//!
//! A chunk is a type byte followed by a type-specific body. Chunks are
//! decoded into one tagged enum so every dispatch site is an exhaustive
//! match.

use crate::core::error::WireError;
use crate::wire::serial::{Ssn, Tsn};

/// Chunk type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Immediate association teardown.
    Abort = 0,
    /// First handshake message (client to server, cleartext).
    Initiation = 1,
    /// Second handshake message (server to client, cleartext).
    InitiationAcknowledgement = 2,
    /// Third handshake message (client to server, encrypted).
    InitiationComplete = 3,
    /// User data fragment.
    PayloadData = 4,
    /// Selective acknowledgement.
    SelectiveAcknowledgement = 5,
    /// Keep-alive probe carrying the sender's clock.
    HeartbeatRequest = 6,
    /// Keep-alive reply echoing the probe's clock.
    HeartbeatAcknowledgement = 7,
    /// Graceful shutdown request.
    ShutdownAssociation = 8,
    /// Shutdown acknowledgement.
    ShutdownAcknowledgement = 9,
    /// Final shutdown confirmation.
    ShutdownComplete = 10,
    /// Cumulative-TSN advance past abandoned data.
    ForwardCumulativeTsn = 11,
}

impl TryFrom<u8> for ChunkType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::Abort,
            1 => Self::Initiation,
            2 => Self::InitiationAcknowledgement,
            3 => Self::InitiationComplete,
            4 => Self::PayloadData,
            5 => Self::SelectiveAcknowledgement,
            6 => Self::HeartbeatRequest,
            7 => Self::HeartbeatAcknowledgement,
            8 => Self::ShutdownAssociation,
            9 => Self::ShutdownAcknowledgement,
            10 => Self::ShutdownComplete,
            11 => Self::ForwardCumulativeTsn,
            other => return Err(WireError::UnknownChunkType(other)),
        })
    }
}

/// Bit flags of a payload-data chunk.
mod bits {
    /// First fragment of a message.
    pub const B: u8 = 0b001;
    /// Last fragment of a message.
    pub const E: u8 = 0b010;
    /// Message bypasses stream ordering.
    pub const U: u8 = 0b100;
}

/// A user data fragment.
///
/// Body: `bits:u8, tsn:u32, sid:u16, ssn:u16, data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadData {
    /// First fragment of its message.
    pub begin: bool,
    /// Last fragment of its message.
    pub end: bool,
    /// Message is delivered without stream ordering.
    pub unordered: bool,
    /// Transmission sequence number.
    pub tsn: Tsn,
    /// Stream identifier.
    pub sid: u16,
    /// Stream sequence number of the message.
    pub ssn: Ssn,
    /// Fragment bytes.
    pub data: Vec<u8>,
}

/// Fixed body overhead of a payload-data chunk (everything but the data).
pub const PAYLOAD_DATA_OVERHEAD: usize = 1 + 4 + 2 + 2;

/// One gap-ack run, as offsets from the cumulative TSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapAckBlock {
    /// Offset of the first received TSN of the run.
    pub start: u16,
    /// Offset of the last received TSN of the run.
    pub end: u16,
}

/// Encoded size of one gap-ack block.
pub const GAP_ACK_BLOCK_SIZE: usize = 4;

/// A selective acknowledgement.
///
/// Body: `cum_tsn_ack:u32` followed by gap blocks; the block count is
/// implied by the remaining length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sack {
    /// Every TSN up to and including this one has been received.
    pub cum_tsn_ack: Tsn,
    /// Received runs beyond the cumulative point.
    pub gap_ack_blocks: Vec<GapAckBlock>,
}

/// Fixed body overhead of a selective acknowledgement.
pub const SACK_OVERHEAD: usize = 4;

/// First handshake message.
///
/// Body: `pk_a (u16 len + bytes), pk_b (u16 len + bytes),
/// pk_b_mac (u8 len + bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiation {
    /// Client's ephemeral role-A public key.
    pub public_key_a: Vec<u8>,
    /// Client's ephemeral role-B public key.
    pub public_key_b: Vec<u8>,
    /// MAC over `public_key_b`, keyed with the temporary agreed secret.
    pub public_key_b_mac: Vec<u8>,
}

/// Second handshake message.
///
/// Body: `connection_id:u32, pk_a (u16 len + bytes),
/// pk_a_mac (u8 len + bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiationAck {
    /// Identifier the client must put on all further packets.
    pub connection_id: u32,
    /// Server's ephemeral role-A public key.
    pub public_key_a: Vec<u8>,
    /// MAC over `public_key_a`, keyed with the temporary agreed secret.
    pub public_key_a_mac: Vec<u8>,
}

/// Cumulative-TSN advance past abandoned data.
///
/// Body: `new_cumulative_tsn:u32` followed by `(sid:u16, ssn:u16)` pairs;
/// the pair count is implied by the remaining length. The sender always
/// emits an empty pair list and the receiver only uses the TSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTsn {
    /// The receiver should move its cumulative point here.
    pub new_cumulative_tsn: Tsn,
    /// Per-stream sequence hints (unused, kept on the wire).
    pub streams: Vec<(u16, Ssn)>,
}

/// A decoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Immediate association teardown.
    Abort,
    /// First handshake message.
    Initiation(Initiation),
    /// Second handshake message.
    InitiationAck(InitiationAck),
    /// Third handshake message.
    InitiationComplete,
    /// User data fragment.
    PayloadData(PayloadData),
    /// Selective acknowledgement.
    Sack(Sack),
    /// Keep-alive probe; the value is the sender's steady clock in ms.
    HeartbeatRequest(i64),
    /// Keep-alive reply echoing the probe's clock.
    HeartbeatAck(i64),
    /// Graceful shutdown request.
    Shutdown,
    /// Shutdown acknowledgement.
    ShutdownAck,
    /// Final shutdown confirmation.
    ShutdownComplete,
    /// Cumulative-TSN advance past abandoned data.
    ForwardTsn(ForwardTsn),
}

impl Chunk {
    /// The wire type identifier of this chunk.
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Abort => ChunkType::Abort,
            Chunk::Initiation(_) => ChunkType::Initiation,
            Chunk::InitiationAck(_) => ChunkType::InitiationAcknowledgement,
            Chunk::InitiationComplete => ChunkType::InitiationComplete,
            Chunk::PayloadData(_) => ChunkType::PayloadData,
            Chunk::Sack(_) => ChunkType::SelectiveAcknowledgement,
            Chunk::HeartbeatRequest(_) => ChunkType::HeartbeatRequest,
            Chunk::HeartbeatAck(_) => ChunkType::HeartbeatAcknowledgement,
            Chunk::Shutdown => ChunkType::ShutdownAssociation,
            Chunk::ShutdownAck => ChunkType::ShutdownAcknowledgement,
            Chunk::ShutdownComplete => ChunkType::ShutdownComplete,
            Chunk::ForwardTsn(_) => ChunkType::ForwardCumulativeTsn,
        }
    }

    /// Whether this chunk must travel inside an encrypted packet.
    ///
    /// Only the two cleartext handshake messages may go out unencrypted.
    pub fn is_encryptable(&self) -> bool {
        !matches!(self, Chunk::Initiation(_) | Chunk::InitiationAck(_))
    }

    /// Encoded body length, excluding the type byte.
    pub fn body_len(&self) -> usize {
        match self {
            Chunk::Abort
            | Chunk::InitiationComplete
            | Chunk::Shutdown
            | Chunk::ShutdownAck
            | Chunk::ShutdownComplete => 0,
            Chunk::Initiation(init) => {
                2 + init.public_key_a.len() + 2 + init.public_key_b.len()
                    + 1
                    + init.public_key_b_mac.len()
            }
            Chunk::InitiationAck(ack) => {
                4 + 2 + ack.public_key_a.len() + 1 + ack.public_key_a_mac.len()
            }
            Chunk::PayloadData(data) => PAYLOAD_DATA_OVERHEAD + data.data.len(),
            Chunk::Sack(sack) => {
                SACK_OVERHEAD + sack.gap_ack_blocks.len() * GAP_ACK_BLOCK_SIZE
            }
            Chunk::HeartbeatRequest(_) | Chunk::HeartbeatAck(_) => 8,
            Chunk::ForwardTsn(fwd) => 4 + fwd.streams.len() * 4,
        }
    }

    /// Encoded length including the type byte.
    pub fn encoded_len(&self) -> usize {
        1 + self.body_len()
    }

    /// Append the chunk (type byte plus body) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.chunk_type() as u8);
        match self {
            Chunk::Abort
            | Chunk::InitiationComplete
            | Chunk::Shutdown
            | Chunk::ShutdownAck
            | Chunk::ShutdownComplete => {}
            Chunk::Initiation(init) => {
                out.extend_from_slice(&(init.public_key_a.len() as u16).to_be_bytes());
                out.extend_from_slice(&init.public_key_a);
                out.extend_from_slice(&(init.public_key_b.len() as u16).to_be_bytes());
                out.extend_from_slice(&init.public_key_b);
                out.push(init.public_key_b_mac.len() as u8);
                out.extend_from_slice(&init.public_key_b_mac);
            }
            Chunk::InitiationAck(ack) => {
                out.extend_from_slice(&ack.connection_id.to_be_bytes());
                out.extend_from_slice(&(ack.public_key_a.len() as u16).to_be_bytes());
                out.extend_from_slice(&ack.public_key_a);
                out.push(ack.public_key_a_mac.len() as u8);
                out.extend_from_slice(&ack.public_key_a_mac);
            }
            Chunk::PayloadData(data) => {
                let mut flags = 0u8;
                if data.begin {
                    flags |= bits::B;
                }
                if data.end {
                    flags |= bits::E;
                }
                if data.unordered {
                    flags |= bits::U;
                }
                out.push(flags);
                out.extend_from_slice(&data.tsn.0.to_be_bytes());
                out.extend_from_slice(&data.sid.to_be_bytes());
                out.extend_from_slice(&data.ssn.0.to_be_bytes());
                out.extend_from_slice(&data.data);
            }
            Chunk::Sack(sack) => {
                out.extend_from_slice(&sack.cum_tsn_ack.0.to_be_bytes());
                for block in &sack.gap_ack_blocks {
                    out.extend_from_slice(&block.start.to_be_bytes());
                    out.extend_from_slice(&block.end.to_be_bytes());
                }
            }
            Chunk::HeartbeatRequest(time) | Chunk::HeartbeatAck(time) => {
                out.extend_from_slice(&time.to_be_bytes());
            }
            Chunk::ForwardTsn(fwd) => {
                out.extend_from_slice(&fwd.new_cumulative_tsn.0.to_be_bytes());
                for (sid, ssn) in &fwd.streams {
                    out.extend_from_slice(&sid.to_be_bytes());
                    out.extend_from_slice(&ssn.0.to_be_bytes());
                }
            }
        }
    }

    /// Decode a chunk from a type byte and its body.
    pub fn decode(raw_type: u8, body: &[u8]) -> Result<Chunk, WireError> {
        let chunk_type = ChunkType::try_from(raw_type)?;
        let mut reader = Reader::new(body);
        let chunk = match chunk_type {
            ChunkType::Abort => Chunk::Abort,
            ChunkType::InitiationComplete => Chunk::InitiationComplete,
            ChunkType::ShutdownAssociation => Chunk::Shutdown,
            ChunkType::ShutdownAcknowledgement => Chunk::ShutdownAck,
            ChunkType::ShutdownComplete => Chunk::ShutdownComplete,
            ChunkType::Initiation => {
                let pk_a_len = reader.u16()? as usize;
                let public_key_a = reader.take(pk_a_len)?.to_vec();
                let pk_b_len = reader.u16()? as usize;
                let public_key_b = reader.take(pk_b_len)?.to_vec();
                let mac_len = reader.u8()? as usize;
                let public_key_b_mac = reader.take(mac_len)?.to_vec();
                Chunk::Initiation(Initiation {
                    public_key_a,
                    public_key_b,
                    public_key_b_mac,
                })
            }
            ChunkType::InitiationAcknowledgement => {
                let connection_id = reader.u32()?;
                let pk_a_len = reader.u16()? as usize;
                let public_key_a = reader.take(pk_a_len)?.to_vec();
                let mac_len = reader.u8()? as usize;
                let public_key_a_mac = reader.take(mac_len)?.to_vec();
                Chunk::InitiationAck(InitiationAck {
                    connection_id,
                    public_key_a,
                    public_key_a_mac,
                })
            }
            ChunkType::PayloadData => {
                let flags = reader.u8()?;
                let tsn = Tsn(reader.u32()?);
                let sid = reader.u16()?;
                let ssn = Ssn(reader.u16()?);
                let data = reader.rest().to_vec();
                Chunk::PayloadData(PayloadData {
                    begin: flags & bits::B != 0,
                    end: flags & bits::E != 0,
                    unordered: flags & bits::U != 0,
                    tsn,
                    sid,
                    ssn,
                    data,
                })
            }
            ChunkType::SelectiveAcknowledgement => {
                let cum_tsn_ack = Tsn(reader.u32()?);
                if reader.remaining() % GAP_ACK_BLOCK_SIZE != 0 {
                    return Err(WireError::BadLength);
                }
                let mut gap_ack_blocks =
                    Vec::with_capacity(reader.remaining() / GAP_ACK_BLOCK_SIZE);
                while reader.remaining() != 0 {
                    gap_ack_blocks.push(GapAckBlock {
                        start: reader.u16()?,
                        end: reader.u16()?,
                    });
                }
                Chunk::Sack(Sack {
                    cum_tsn_ack,
                    gap_ack_blocks,
                })
            }
            ChunkType::HeartbeatRequest => Chunk::HeartbeatRequest(reader.i64()?),
            ChunkType::HeartbeatAcknowledgement => Chunk::HeartbeatAck(reader.i64()?),
            ChunkType::ForwardCumulativeTsn => {
                let new_cumulative_tsn = Tsn(reader.u32()?);
                if reader.remaining() % 4 != 0 {
                    return Err(WireError::BadLength);
                }
                let mut streams = Vec::with_capacity(reader.remaining() / 4);
                while reader.remaining() != 0 {
                    let sid = reader.u16()?;
                    let ssn = Ssn(reader.u16()?);
                    streams.push((sid, ssn));
                }
                Chunk::ForwardTsn(ForwardTsn {
                    new_cumulative_tsn,
                    streams,
                })
            }
        };
        Ok(chunk)
    }
}

/// Bounds-checked big-endian reader over a byte slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap_or([0; 2])))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap_or([0; 4])))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap_or([0; 8])))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, WireError> {
        Ok(self.u64()? as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(chunk: Chunk) -> Chunk {
        let mut buf = Vec::new();
        chunk.encode(&mut buf);
        assert_eq!(buf.len(), chunk.encoded_len());
        Chunk::decode(buf[0], &buf[1..]).unwrap()
    }

    #[test]
    fn payload_data_round_trip() {
        let chunk = Chunk::PayloadData(PayloadData {
            begin: true,
            end: false,
            unordered: true,
            tsn: Tsn(0xdead_beef),
            sid: 7,
            ssn: Ssn(42),
            data: b"fragment".to_vec(),
        });
        assert_eq!(round_trip(chunk.clone()), chunk);
    }

    #[test]
    fn sack_known_bytes() {
        let chunk = Chunk::Sack(Sack {
            cum_tsn_ack: Tsn(0x01020304),
            gap_ack_blocks: vec![GapAckBlock { start: 2, end: 3 }],
        });
        let mut buf = Vec::new();
        chunk.encode(&mut buf);
        assert_eq!(buf, hex::decode("050102030400020003").unwrap());
    }

    #[test]
    fn sack_rejects_ragged_blocks() {
        // 4-byte cum point plus 3 trailing bytes is not a whole block.
        let body = [0, 0, 0, 9, 0, 0, 1];
        assert_eq!(
            Chunk::decode(ChunkType::SelectiveAcknowledgement as u8, &body),
            Err(WireError::BadLength)
        );
    }

    #[test]
    fn initiation_round_trip() {
        let chunk = Chunk::Initiation(Initiation {
            public_key_a: vec![1; 32],
            public_key_b: vec![2; 32],
            public_key_b_mac: vec![3; 32],
        });
        assert_eq!(round_trip(chunk.clone()), chunk);
    }

    #[test]
    fn initiation_truncated_key_rejected() {
        let good = Chunk::Initiation(Initiation {
            public_key_a: vec![1; 32],
            public_key_b: vec![2; 32],
            public_key_b_mac: vec![3; 32],
        });
        let mut buf = Vec::new();
        good.encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert_eq!(
            Chunk::decode(buf[0], &buf[1..]),
            Err(WireError::UnexpectedEof)
        );
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(Chunk::decode(200, &[]), Err(WireError::UnknownChunkType(200)));
    }

    #[test]
    fn empty_chunks() {
        for chunk in [
            Chunk::Abort,
            Chunk::InitiationComplete,
            Chunk::Shutdown,
            Chunk::ShutdownAck,
            Chunk::ShutdownComplete,
        ] {
            assert_eq!(chunk.body_len(), 0);
            assert_eq!(round_trip(chunk.clone()), chunk);
        }
    }

    #[test]
    fn heartbeat_round_trip() {
        let chunk = Chunk::HeartbeatRequest(123_456_789);
        assert_eq!(round_trip(chunk.clone()), chunk);
        let ack = Chunk::HeartbeatAck(-1);
        assert_eq!(round_trip(ack.clone()), ack);
    }

    #[test]
    fn forward_tsn_round_trip() {
        let chunk = Chunk::ForwardTsn(ForwardTsn {
            new_cumulative_tsn: Tsn(77),
            streams: vec![],
        });
        assert_eq!(round_trip(chunk.clone()), chunk);
    }
}
