use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::range_set::RangeSet;
use crate::sequence::{FrameSeq, MessageSeq, SessionId};

/// A receiver's request to retransmit frames. NACKs are sent to the whole group, so that other
///  receivers missing the same frames can hold back their own requests.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NackMessage {
    /// the sender whose frames are missing
    pub missing_from: SessionId,
    pub frames: RangeSet,
}

impl NackMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.missing_from.to_raw());
        buf.put_usize_varint(self.frames.num_ranges());
        for (start, end) in self.frames.iter() {
            buf.put_u64(start);
            buf.put_u64(end);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<NackMessage> {
        let missing_from = SessionId::from_raw(buf.try_get_u64()?);
        let num_ranges = buf.try_get_usize_varint()
            .map_err(|e| anyhow!("varint: {:?}", e))?;
        if num_ranges.saturating_mul(16) > buf.remaining() {
            bail!("NACK declares {} ranges, but only {} bytes remain", num_ranges, buf.remaining());
        }

        let mut frames = RangeSet::new();
        for _ in 0..num_ranges {
            let start = buf.try_get_u64()?;
            let end = buf.try_get_u64()?;
            if start == 0 || start > end {
                bail!("invalid NACK range {}..={}", start, end);
            }
            frames.insert(start, end);
        }
        Ok(NackMessage { missing_from, frames })
    }
}

/// Sent periodically by every node that sent retainable frames. This allows receivers to detect
///  lost frames at the end of the send history, which no later frame reveals, and to catch up
///  with the sender's watermarks while it is idle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SyncMessage {
    pub high_water_frame: FrameSeq,
    pub oldest_recoverable_frame: FrameSeq,
    pub oldest_recoverable_message: MessageSeq,
}

impl SyncMessage {
    pub const SERIALIZED_LEN: usize = 24;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.high_water_frame.to_raw());
        buf.put_u64(self.oldest_recoverable_frame.to_raw());
        buf.put_u64(self.oldest_recoverable_message.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SyncMessage> {
        let high_water_frame = FrameSeq::from_raw(buf.try_get_u64()?);
        let oldest_recoverable_frame = FrameSeq::from_raw(buf.try_get_u64()?);
        let oldest_recoverable_message = MessageSeq::from_raw(buf.try_get_u64()?);

        if high_water_frame.is_zero() {
            bail!("SYNC without frames");
        }
        if oldest_recoverable_frame > high_water_frame.next() {
            bail!("oldest recoverable frame #{} is above high-water frame #{}", oldest_recoverable_frame, high_water_frame);
        }
        Ok(SyncMessage {
            high_water_frame,
            oldest_recoverable_frame,
            oldest_recoverable_message,
        })
    }
}
