use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::sequence::{FrameSeq, MessageSeq};

/// A bounded-size fragment of one serialized message, the unit of transmission and
///  retransmission.
///
/// Wire layout (big endian, in this order):
/// ```ascii
/// 0:  message sequence (u64)
/// 8:  chunk sequence in message (u32)
/// 12: first chunk sequence of message (u64)
/// 20: number of chunks in message (u32)
/// 24: frame sequence (u64)
/// 32: message dependency (u64)
/// 40: oldest recoverable frame (u64)
/// 48: oldest recoverable message (u64)
/// 56: payload length (u32)
/// 60: payload
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub message_sequence: MessageSeq,
    /// zero-based index of this chunk in its message
    pub chunk_sequence_in_message: u32,
    /// the sender-wide running chunk number of the message's first chunk
    pub first_chunk_sequence: u64,
    pub number_of_chunks: u32,
    /// 0 for real-time chunks which are never retained or retransmitted
    pub frame_sequence: FrameSeq,
    /// the previous default-priority message, 0 if there is none
    pub message_dependency: MessageSeq,
    pub oldest_recoverable_frame: FrameSeq,
    pub oldest_recoverable_message: MessageSeq,
    pub data: Bytes,
}

impl Chunk {
    pub const HEADER_LEN: usize = 60;

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    pub fn is_retainable(&self) -> bool {
        !self.frame_sequence.is_zero()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.message_sequence.to_raw());
        buf.put_u32(self.chunk_sequence_in_message);
        buf.put_u64(self.first_chunk_sequence);
        buf.put_u32(self.number_of_chunks);
        buf.put_u64(self.frame_sequence.to_raw());
        buf.put_u64(self.message_dependency.to_raw());
        buf.put_u64(self.oldest_recoverable_frame.to_raw());
        buf.put_u64(self.oldest_recoverable_message.to_raw());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Chunk> {
        let message_sequence = MessageSeq::from_raw(buf.try_get_u64()?);
        let chunk_sequence_in_message = buf.try_get_u32()?;
        let first_chunk_sequence = buf.try_get_u64()?;
        let number_of_chunks = buf.try_get_u32()?;
        let frame_sequence = FrameSeq::from_raw(buf.try_get_u64()?);
        let message_dependency = MessageSeq::from_raw(buf.try_get_u64()?);
        let oldest_recoverable_frame = FrameSeq::from_raw(buf.try_get_u64()?);
        let oldest_recoverable_message = MessageSeq::from_raw(buf.try_get_u64()?);
        let data_len = buf.try_get_u32()? as usize;

        if message_sequence.is_zero() {
            bail!("message sequence 0 is reserved");
        }
        if number_of_chunks == 0 {
            bail!("message without chunks");
        }
        if chunk_sequence_in_message >= number_of_chunks {
            bail!("chunk {} of a message with {} chunks", chunk_sequence_in_message, number_of_chunks);
        }
        if buf.remaining() < data_len {
            bail!("chunk declares {} bytes of payload, but only {} remain", data_len, buf.remaining());
        }

        Ok(Chunk {
            message_sequence,
            chunk_sequence_in_message,
            first_chunk_sequence,
            number_of_chunks,
            frame_sequence,
            message_dependency,
            oldest_recoverable_frame,
            oldest_recoverable_message,
            data: buf.copy_to_bytes(data_len),
        })
    }
}
