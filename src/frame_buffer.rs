use std::collections::BTreeMap;
use tracing::trace;
use crate::chunk::Chunk;
use crate::sequence::{FrameSeq, MessageSeq};

struct RetainedFrame {
    chunk: Chunk,
    /// a retransmission of this frame is queued but was not sent yet
    resend_pending: bool,
}

/// The sender's history of retainable chunks, kept for servicing retransmission requests.
///
/// Capacity is measured in payload bytes. Inserting beyond capacity evicts the oldest frames,
///  though the most recently inserted frame is always retained.
pub struct FrameBuffer {
    capacity_bytes: usize,
    used_bytes: usize,
    frames: BTreeMap<FrameSeq, RetainedFrame>,
    high_water_frame: FrameSeq,
    high_water_message: MessageSeq,
}

impl FrameBuffer {
    pub fn new(capacity_bytes: usize) -> FrameBuffer {
        FrameBuffer {
            capacity_bytes,
            used_bytes: 0,
            frames: BTreeMap::new(),
            high_water_frame: FrameSeq::ZERO,
            high_water_message: MessageSeq::ZERO,
        }
    }

    /// Retains a chunk under its frame sequence. Real-time chunks (frame sequence 0) are
    ///  ignored.
    pub fn insert(&mut self, chunk: Chunk) {
        if !chunk.is_retainable() {
            return;
        }

        let frame = chunk.frame_sequence;
        self.high_water_frame = self.high_water_frame.max(frame);
        self.high_water_message = self.high_water_message.max(chunk.message_sequence);

        self.used_bytes += chunk.data.len();
        if let Some(prev) = self.frames.insert(frame, RetainedFrame { chunk, resend_pending: false }) {
            self.used_bytes -= prev.chunk.data.len();
        }

        while self.used_bytes > self.capacity_bytes && self.frames.len() > 1 {
            if let Some((evicted, retained)) = self.frames.pop_first() {
                trace!("evicting frame #{} from frame buffer", evicted);
                self.used_bytes -= retained.chunk.data.len();
            }
        }
    }

    /// Returns a copy of a retained frame for retransmission, marking it as 'resend pending'.
    ///  Returns `None` if the frame is not (or no longer) retained, or if a resend is pending
    ///  already so that concurrent NACKs for the same frame cause a single resend.
    pub fn take(&mut self, frame: FrameSeq) -> Option<Chunk> {
        let retained = self.frames.get_mut(&frame)?;
        if retained.resend_pending {
            trace!("resend of frame #{} is pending already", frame);
            return None;
        }
        retained.resend_pending = true;
        Some(retained.chunk.clone())
    }

    /// called after a retransmitted frame was sent, making it eligible for the next resend
    pub fn resend_complete(&mut self, frame: FrameSeq) {
        if let Some(retained) = self.frames.get_mut(&frame) {
            retained.resend_pending = false;
        }
    }

    /// the smallest retained frame, or the frame after the highest frame ever inserted if
    ///  nothing is retained
    pub fn oldest_recoverable_frame(&self) -> FrameSeq {
        self.frames.keys()
            .next()
            .copied()
            .unwrap_or(self.high_water_frame.next())
    }

    /// The oldest message that is completely retained, i.e. whose first chunk is still in the
    ///  buffer
    pub fn oldest_recoverable_message(&self) -> MessageSeq {
        match self.frames.values().next() {
            Some(oldest) if oldest.chunk.chunk_sequence_in_message == 0 => oldest.chunk.message_sequence,
            Some(oldest) => oldest.chunk.message_sequence.next(),
            None => self.high_water_message.next(),
        }
    }

    /// the highest frame sequence ever inserted
    pub fn high_water_frame(&self) -> FrameSeq {
        self.high_water_frame
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.used_bytes = 0;
    }
}
