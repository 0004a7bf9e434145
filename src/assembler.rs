use std::collections::{BTreeMap, VecDeque};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::chunk::Chunk;
use crate::codec::ChunkCodec;
use crate::control_messages::SyncMessage;
use crate::message::MessageTree;
use crate::range_set::RangeSet;
use crate::sequence::{FrameSeq, MessageSeq, SessionId};

/// A completed message, ready to be dispatched
#[derive(Debug)]
pub struct AssembledMessage {
    pub sender: SessionId,
    pub sequence: MessageSeq,
    /// the default-priority message that must be dispatched before this one, 0 for none
    pub dependency: MessageSeq,
    pub tree: MessageTree,
}

struct PartialMessage {
    number_of_chunks: u32,
    dependency: MessageSeq,
    chunks: BTreeMap<u32, Bytes>,
    size: usize,
}

impl PartialMessage {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.number_of_chunks as usize
    }

    fn join(self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.into_values().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.size);
        for data in self.chunks.into_values() {
            buf.extend_from_slice(&data);
        }
        buf.freeze()
    }
}

/// Reassembles the chunks received from one sender into messages, and tracks missing frames.
///
/// Missing frames are detected from gaps in the frame sequence: a frame is missing if a higher
///  frame arrived before it. The receiving side starts tracking frames at the first frame it
///  sees from a sender, i.e. it does not request history from before it joined.
///
/// Missing frames are not reported immediately, but only after they were missing for a full
///  polling interval, to allow for reordering in the network. This is implemented by a 'tick'
///  counter that is incremented for each call to [ChunkAssembler::take_nack_ranges], and the
///  set of missing frames stores the tick counter value of the time when their absence was
///  noticed.
///
/// Completed messages are passed on in causal order: a message that depends on a message that
///  was not delivered yet is held back until the dependency is delivered, or until the
///  dependency is known to be unrecoverable.
pub struct ChunkAssembler {
    sender: SessionId,
    max_incomplete_messages: usize,
    max_message_size: usize,
    /// every chunk carries at least one byte of its message
    max_chunks_per_message: usize,
    max_missing_frames: usize,

    incomplete: BTreeMap<MessageSeq, PartialMessage>,
    /// messages that were delivered, or dropped as undecodable or incomplete
    done: RangeSet,
    /// completed messages waiting for their dependency, keyed by the dependency
    held: BTreeMap<MessageSeq, Vec<AssembledMessage>>,
    /// Dependencies below this are not waited for: they are either from before the first
    ///  message we saw from this sender, or below the sender's oldest recoverable message
    message_floor: Option<MessageSeq>,

    frame_floor: Option<FrameSeq>,
    highest_frame: FrameSeq,
    missing_frames: BTreeMap<FrameSeq, u64>,
    tick_counter: u64,
}

impl ChunkAssembler {
    pub fn new(sender: SessionId, max_incomplete_messages: usize, max_message_size: usize, max_missing_frames: usize) -> ChunkAssembler {
        ChunkAssembler {
            sender,
            max_incomplete_messages,
            max_message_size,
            max_chunks_per_message: max_message_size.max(1),
            max_missing_frames,
            incomplete: BTreeMap::new(),
            done: RangeSet::new(),
            held: BTreeMap::new(),
            message_floor: None,
            frame_floor: None,
            highest_frame: FrameSeq::ZERO,
            missing_frames: BTreeMap::new(),
            tick_counter: 0,
        }
    }

    /// Adds a received chunk, returning the messages that became deliverable as a consequence,
    ///  in the order in which they must be dispatched. This is usually empty or a single
    ///  message, but a chunk completing a message that others were waiting for releases those
    ///  as well.
    pub fn add(&mut self, chunk: Chunk) -> Vec<AssembledMessage> {
        let mut result = Vec::new();

        self.on_watermarks(Some(chunk.message_sequence), chunk.oldest_recoverable_frame, chunk.oldest_recoverable_message, &mut result);
        self.track_frame(&chunk);

        let message_sequence = chunk.message_sequence;
        if self.done.contains(message_sequence.to_raw()) {
            trace!("chunk {} of message #{} from {}: message was processed already - ignoring", chunk.chunk_sequence_in_message, message_sequence, self.sender);
            return result;
        }

        if !self.incomplete.contains_key(&message_sequence) {
            if chunk.number_of_chunks as usize > self.max_chunks_per_message {
                warn!("message #{} from {} declares {} chunks which exceeds the maximum message size - dropping", message_sequence, self.sender, chunk.number_of_chunks);
                self.finish(message_sequence, None, &mut result);
                return result;
            }

            self.incomplete.insert(message_sequence, PartialMessage {
                number_of_chunks: chunk.number_of_chunks,
                dependency: chunk.message_dependency,
                chunks: BTreeMap::new(),
                size: 0,
            });
            while self.incomplete.len() > self.max_incomplete_messages {
                if let Some((evicted, _)) = self.incomplete.pop_first() {
                    debug!("too many incomplete messages from {}: dropping message #{}", self.sender, evicted);
                    self.finish(evicted, None, &mut result);
                }
            }
        }

        let Some(partial) = self.incomplete.get_mut(&message_sequence) else {
            // the new message itself was the oldest and got evicted
            return result;
        };

        if partial.number_of_chunks != chunk.number_of_chunks {
            warn!("chunk {} of message #{} from {} declares {} chunks, previous chunks declared {} - ignoring", chunk.chunk_sequence_in_message, message_sequence, self.sender, chunk.number_of_chunks, partial.number_of_chunks);
            return result;
        }
        if partial.chunks.contains_key(&chunk.chunk_sequence_in_message) {
            trace!("duplicate chunk {} of message #{} from {} - ignoring", chunk.chunk_sequence_in_message, message_sequence, self.sender);
            return result;
        }

        partial.size += chunk.data.len();
        partial.chunks.insert(chunk.chunk_sequence_in_message, chunk.data);

        if partial.size > self.max_message_size {
            warn!("message #{} from {} exceeds the maximum message size of {} - dropping", message_sequence, self.sender, self.max_message_size);
            self.incomplete.remove(&message_sequence);
            self.finish(message_sequence, None, &mut result);
            return result;
        }
        if !partial.is_complete() {
            return result;
        }

        if let Some(complete) = self.incomplete.remove(&message_sequence) {
            let dependency = complete.dependency;
            match ChunkCodec::decode(&complete.join()) {
                Ok(tree) => {
                    trace!("message #{} from {} is complete", message_sequence, self.sender);
                    self.deliver_or_hold(AssembledMessage {
                        sender: self.sender,
                        sequence: message_sequence,
                        dependency,
                        tree,
                    }, &mut result);
                }
                Err(e) => {
                    warn!("message #{} from {} could not be decoded - dropping: {}", message_sequence, self.sender, e);
                    self.finish(message_sequence, None, &mut result);
                }
            }
        }
        result
    }

    /// `current` is the message of the chunk being added, if any
    fn on_watermarks(&mut self, current: Option<MessageSeq>, oldest_recoverable_frame: FrameSeq, oldest_recoverable_message: MessageSeq, result: &mut Vec<AssembledMessage>) {
        let floor = match (self.message_floor, current) {
            (Some(floor), _) => Some(floor.max(oldest_recoverable_message)),
            (None, Some(first_seen)) => Some(first_seen.max(oldest_recoverable_message)),
            (None, None) => None,
        };
        if let Some(floor) = floor {
            self.message_floor = Some(floor);
            self.drop_incomplete_below(floor, current, result);
            self.release_below_floor(result);
        }

        if !oldest_recoverable_frame.is_zero() {
            let num_missing_before = self.missing_frames.len();
            self.missing_frames = self.missing_frames.split_off(&oldest_recoverable_frame);
            if self.missing_frames.len() < num_missing_before {
                debug!("{} missing frames from {} are below its oldest recoverable frame #{} - no longer requesting them", num_missing_before - self.missing_frames.len(), self.sender, oldest_recoverable_frame);
            }
        }
    }

    /// Handles a sender's periodic SYNC: frames up to its high-water frame that were not
    ///  received are missing, even if no later frame arrived. Returns messages released by the
    ///  updated watermarks.
    pub fn on_sync(&mut self, sync: &SyncMessage) -> Vec<AssembledMessage> {
        let mut result = Vec::new();
        self.on_watermarks(None, sync.oldest_recoverable_frame, sync.oldest_recoverable_message, &mut result);

        let high_water = sync.high_water_frame;
        match self.frame_floor {
            None => {
                // joined while the sender was idle: track from its next frame on
                trace!("first SYNC from {}: tracking frames after #{}", self.sender, high_water);
                self.frame_floor = Some(high_water.next());
                self.highest_frame = high_water;
            }
            Some(_) if high_water > self.highest_frame => {
                self.register_missing_up_to(high_water.next(), sync.oldest_recoverable_frame);
                self.highest_frame = high_water;
            }
            Some(_) => {}
        }
        result
    }

    fn track_frame(&mut self, chunk: &Chunk) {
        if !chunk.is_retainable() {
            return;
        }
        let frame = chunk.frame_sequence;

        let Some(frame_floor) = self.frame_floor else {
            trace!("first frame from {}: #{}", self.sender, frame);
            self.frame_floor = Some(frame);
            self.highest_frame = frame;
            return;
        };
        if frame < frame_floor {
            return;
        }

        if frame > self.highest_frame {
            self.register_missing_up_to(frame, chunk.oldest_recoverable_frame);
            self.highest_frame = frame;
        }
        else {
            self.missing_frames.remove(&frame);
        }
    }

    /// registers the frames after the highest received frame and before `end` as missing
    fn register_missing_up_to(&mut self, end: FrameSeq, oldest_recoverable_frame: FrameSeq) {
        let first_missing = self.highest_frame.next()
            .max(oldest_recoverable_frame)
            .max(end.checked_minus(self.max_missing_frames as u64).unwrap_or(FrameSeq::ZERO));

        let mut missing = first_missing;
        while missing < end {
            self.missing_frames.insert(missing, self.tick_counter);
            missing = missing.next();
        }
        if first_missing < end {
            trace!("frames #{} to #{} from {} are missing", first_missing, end.checked_minus(1).unwrap_or(FrameSeq::ZERO), self.sender);
        }

        while self.missing_frames.len() > self.max_missing_frames {
            self.missing_frames.pop_first();
        }
    }

    fn is_satisfied(&self, dependency: MessageSeq) -> bool {
        if dependency.is_zero() || self.done.contains(dependency.to_raw()) {
            return true;
        }
        match self.message_floor {
            Some(floor) => dependency < floor && !self.incomplete.contains_key(&dependency),
            None => false,
        }
    }

    fn deliver_or_hold(&mut self, message: AssembledMessage, result: &mut Vec<AssembledMessage>) {
        if self.is_satisfied(message.dependency) {
            self.finish(message.sequence, Some(message), result);
        }
        else {
            debug!("message #{} from {} depends on #{} which was not delivered yet - holding it back", message.sequence, self.sender, message.dependency);
            self.held.entry(message.dependency)
                .or_default()
                .push(message);
        }
    }

    /// marks a message as processed (delivering it if it is present), and releases the
    ///  messages that were waiting for it
    fn finish(&mut self, sequence: MessageSeq, message: Option<AssembledMessage>, result: &mut Vec<AssembledMessage>) {
        let mut queue = VecDeque::new();
        queue.push_back((sequence, message));

        while let Some((sequence, message)) = queue.pop_front() {
            self.done.insert_one(sequence.to_raw());
            if let Some(message) = message {
                result.push(message);
            }
            if let Some(dependents) = self.held.remove(&sequence) {
                for dependent in dependents {
                    queue.push_back((dependent.sequence, Some(dependent)));
                }
            }
        }
    }

    /// The sender no longer retains all chunks of messages below its oldest recoverable
    ///  message, so partially received ones can not be completed. The exception is the message
    ///  of a chunk that is being added: a retransmitted chunk may be the one completing it. If
    ///  it does not, the message is dropped with the next chunk or SYNC from this sender.
    fn drop_incomplete_below(&mut self, floor: MessageSeq, current: Option<MessageSeq>, result: &mut Vec<AssembledMessage>) {
        let recoverable = self.incomplete.split_off(&floor);
        let mut unrecoverable = std::mem::replace(&mut self.incomplete, recoverable);
        if let Some(current) = current {
            if let Some(partial) = unrecoverable.remove(&current) {
                self.incomplete.insert(current, partial);
            }
        }
        for (sequence, partial) in unrecoverable {
            debug!("message #{} from {} is incomplete with {} of {} chunks and not recoverable any more - dropping it", sequence, self.sender, partial.chunks.len(), partial.number_of_chunks);
            self.finish(sequence, None, result);
        }
    }

    fn release_below_floor(&mut self, result: &mut Vec<AssembledMessage>) {
        let releasable = self.held.keys()
            .copied()
            .filter(|&dependency| self.is_satisfied(dependency))
            .collect::<Vec<_>>();

        for dependency in releasable {
            debug!("dependency #{} from {} is not recoverable any more - releasing the messages waiting for it", dependency, self.sender);
            for message in self.held.remove(&dependency).unwrap_or_default() {
                self.finish(message.sequence, Some(message), result);
            }
        }
    }

    /// Returns the missing frames that should be requested now. Frames are reported only
    ///  after they were missing for a full polling interval, and each frame is reported once:
    ///  re-requesting is the NACK manager's job.
    pub fn take_nack_ranges(&mut self) -> RangeSet {
        self.tick_counter += 1;

        let due = self.missing_frames.iter()
            .filter(|&(_, &tick)| tick + 1 < self.tick_counter)
            .map(|(&frame, _)| frame)
            .collect::<Vec<_>>();

        let mut result = RangeSet::new();
        for frame in due {
            self.missing_frames.remove(&frame);
            result.insert_one(frame.to_raw());
        }
        result
    }

    pub fn num_incomplete(&self) -> usize {
        self.incomplete.len()
    }

    pub fn num_held(&self) -> usize {
        self.held.values().map(|v| v.len()).sum()
    }

    pub fn num_missing_frames(&self) -> usize {
        self.missing_frames.len()
    }

    pub fn clear(&mut self) {
        self.incomplete.clear();
        self.held.clear();
        self.missing_frames.clear();
    }
}
