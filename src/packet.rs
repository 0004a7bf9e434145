use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::chunk::Chunk;
use crate::control_messages::{NackMessage, SyncMessage};
use crate::error::TransportError;
use crate::sequence::SessionId;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    Chunk = 0,
    Nack = 1,
    Sync = 2,
}

/// Every packet starts with this header:
///
/// ```ascii
/// 0: checksum (u32): CRC-32 over the rest of the packet, starting at offset 4
/// 4: protocol version (u8)
/// 5: packet kind (u8)
/// 6: sender session id (u64)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub checksum: u32,
    pub protocol_version: u8,
    pub packet_kind: PacketKind,
    pub sender: SessionId,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 0;
    pub const SERIALIZED_LEN: usize = 14;
    const OFFSET_CHECKSUM_START: usize = 4;

    pub fn new(packet_kind: PacketKind, sender: SessionId) -> PacketHeader {
        PacketHeader {
            checksum: 0,
            protocol_version: Self::PROTOCOL_VERSION_1,
            packet_kind,
            sender,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.checksum);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.packet_kind.into());
        buf.put_u64(self.sender.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let checksum = buf.try_get_u32()?;
        let protocol_version = buf.try_get_u8()?;
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", protocol_version);
        }
        let packet_kind = PacketKind::try_from(buf.try_get_u8()?)?;
        let sender = SessionId::from_raw(buf.try_get_u64()?);

        Ok(PacketHeader {
            checksum,
            protocol_version,
            packet_kind,
            sender,
        })
    }

    fn checksum_of(buf: &[u8]) -> u32 {
        Crc::<u32>::new(&crc::CRC_32_ISCSI)
            .checksum(&buf[Self::OFFSET_CHECKSUM_START..])
    }

    /// patches the checksum into a fully serialized packet
    pub fn init_checksum(buf: &mut [u8]) {
        let checksum = Self::checksum_of(buf);
        buf[..Self::OFFSET_CHECKSUM_START].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn verify_checksum(buf: &[u8]) -> anyhow::Result<()> {
        if buf.len() < Self::SERIALIZED_LEN {
            bail!("packet of {} bytes is shorter than the packet header", buf.len());
        }
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let actual = Self::checksum_of(buf);
        if declared != actual {
            bail!("checksum mismatch: declared {:08x}, actual {:08x}", declared, actual);
        }
        Ok(())
    }
}

/// The payload of a packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    Chunk(Chunk),
    Nack(NackMessage),
    Sync(SyncMessage),
}

impl Packet {
    pub fn encode(&self, sender: SessionId) -> Bytes {
        let (kind, payload_len) = match self {
            Packet::Chunk(chunk) => (PacketKind::Chunk, chunk.serialized_len()),
            Packet::Nack(nack) => (PacketKind::Nack, 8 + 10 + 16 * nack.frames.num_ranges()),
            Packet::Sync(_) => (PacketKind::Sync, SyncMessage::SERIALIZED_LEN),
        };

        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload_len);
        PacketHeader::new(kind, sender).ser(&mut buf);
        match self {
            Packet::Chunk(chunk) => chunk.ser(&mut buf),
            Packet::Nack(nack) => nack.ser(&mut buf),
            Packet::Sync(sync) => sync.ser(&mut buf),
        }
        PacketHeader::init_checksum(&mut buf);
        buf.freeze()
    }

    /// Parses a received datagram, returning the sender's session id and the packet.
    pub fn decode(raw: &[u8]) -> Result<(SessionId, Packet), TransportError> {
        Self::try_decode(raw)
            .map_err(TransportError::deser)
    }

    fn try_decode(raw: &[u8]) -> anyhow::Result<(SessionId, Packet)> {
        PacketHeader::verify_checksum(raw)?;

        let mut buf = raw;
        let header = PacketHeader::deser(&mut buf)?;
        let packet = match header.packet_kind {
            PacketKind::Chunk => Packet::Chunk(Chunk::deser(&mut buf)?),
            PacketKind::Nack => Packet::Nack(NackMessage::deser(&mut buf)?),
            PacketKind::Sync => Packet::Sync(SyncMessage::deser(&mut buf)?),
        };
        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?} packet", buf.remaining(), header.packet_kind);
        }
        Ok((header.sender, packet))
    }
}
