use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use crate::chunk::Chunk;
use crate::codec::ChunkCodec;
use crate::config::TransportConfig;
use crate::control_messages::SyncMessage;
use crate::error::{Result, TransportError};
use crate::frame_buffer::FrameBuffer;
use crate::merge::MergePolicy;
use crate::message::{MessageTree, Priority};
use crate::packet::Packet;
use crate::range_set::RangeSet;
use crate::send_pipeline::SendPipeline;
use crate::sequence::{FrameSeq, MessageSeq};

enum SendWork {
    /// encode the pending message of the work item's priority
    Flush,
    Message(MessageTree),
    Chunk(Chunk),
    Retransmit(Chunk),
}

/// Messages that were sent but not encoded yet, per priority. Messages sent while a message of
///  the same priority is pending are merged into it.
#[derive(Default)]
struct PendingMessages {
    real_time: Mutex<Option<MessageTree>>,
    default: Mutex<Option<MessageTree>>,
    low: Mutex<Option<MessageTree>>,
}

impl PendingMessages {
    fn slot(&self, priority: Priority) -> &Mutex<Option<MessageTree>> {
        match priority {
            Priority::RealTime => &self.real_time,
            Priority::Default => &self.default,
            Priority::Low => &self.low,
        }
    }
}

/// The producer side of the sending queue. It can be shared between any number of tasks and
///  threads, while a single [SendQueueWorker] encodes and transmits in strict priority order.
pub struct SendQueue {
    real_time: mpsc::UnboundedSender<SendWork>,
    default: mpsc::UnboundedSender<SendWork>,
    low: mpsc::UnboundedSender<SendWork>,
    pending: Arc<PendingMessages>,
    frame_buffer: Arc<Mutex<FrameBuffer>>,
    merge_policy: Arc<dyn MergePolicy>,
    coalesce: bool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SendQueue {
    pub fn new(config: &TransportConfig, pipeline: SendPipeline, frame_buffer: Arc<Mutex<FrameBuffer>>, merge_policy: Arc<dyn MergePolicy>) -> (SendQueue, SendQueueWorker) {
        let (real_time, real_time_recv) = mpsc::unbounded_channel();
        let (default, default_recv) = mpsc::unbounded_channel();
        let (low, low_recv) = mpsc::unbounded_channel();
        let (shutdown, shutdown_recv) = watch::channel(false);
        let pending = Arc::new(PendingMessages::default());

        let worker = SendQueueWorker {
            real_time_recv,
            default_recv,
            low_recv,
            real_time: real_time.clone(),
            default: default.clone(),
            low: low.clone(),
            shutdown: shutdown_recv,
            pending: pending.clone(),
            frame_buffer: frame_buffer.clone(),
            codec: ChunkCodec::from_config(config),
            next_frame: FrameSeq::FIRST,
            last_default_message: MessageSeq::ZERO,
            pipeline,
        };

        let queue = SendQueue {
            real_time,
            default,
            low,
            pending,
            frame_buffer,
            merge_policy,
            coalesce: config.coalesce_pending_messages,
            closed: AtomicBool::new(false),
            shutdown,
        };
        (queue, worker)
    }

    /// Enqueues a message for sending. This never waits for network I/O.
    pub async fn send(&self, tree: MessageTree, priority: Priority) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.coalesce {
            return self.post(priority, SendWork::Message(tree));
        }

        let mut slot = self.pending.slot(priority).lock().await;
        match slot.as_mut() {
            Some(pending) => {
                trace!("merging message into pending {:?} message", priority);
                pending.merge_newer(tree, self.merge_policy.as_ref())
            }
            None => {
                *slot = Some(tree);
                self.post(priority, SendWork::Flush)
            }
        }
    }

    fn post(&self, priority: Priority, work: SendWork) -> Result<()> {
        let channel = match priority {
            Priority::RealTime => &self.real_time,
            Priority::Default => &self.default,
            Priority::Low => &self.low,
        };
        channel.send(work)
            .map_err(|_| TransportError::Closed)
    }

    /// Schedules retransmission of those of the given frames that are still retained,
    ///  returning the number of frames that were scheduled. Retransmissions are sent with
    ///  real-time priority, regardless of the original message's priority.
    pub async fn retransmit(&self, frames: &RangeSet) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let mut frame_buffer = self.frame_buffer.lock().await;
        let live = frames.intersect(
            frame_buffer.oldest_recoverable_frame().to_raw(),
            frame_buffer.high_water_frame().to_raw(),
        );
        if live.num_values() < frames.num_values() {
            debug!("{} requested frames are not retained any more", frames.num_values() - live.num_values());
        }

        let mut num_scheduled = 0;
        for frame in live.values() {
            if let Some(chunk) = frame_buffer.take(FrameSeq::from_raw(frame)) {
                if self.real_time.send(SendWork::Retransmit(chunk)).is_err() {
                    break;
                }
                num_scheduled += 1;
            }
        }
        trace!("scheduled {} frames for retransmission", num_scheduled);
        num_scheduled
    }

    /// The SYNC advertisement of the frame buffer's current state, `None` if no retainable
    ///  frame was sent yet
    pub async fn sync_message(&self) -> Option<SyncMessage> {
        if self.is_closed() {
            return None;
        }

        let frame_buffer = self.frame_buffer.lock().await;
        let high_water_frame = frame_buffer.high_water_frame();
        if high_water_frame.is_zero() {
            return None;
        }
        Some(SyncMessage {
            high_water_frame,
            oldest_recoverable_frame: frame_buffer.oldest_recoverable_frame(),
            oldest_recoverable_message: frame_buffer.oldest_recoverable_message(),
        })
    }

    /// Stops accepting messages, makes the worker stop after the chunk it is currently sending,
    ///  and releases pending messages and the frame buffer
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);

        for priority in [Priority::RealTime, Priority::Default, Priority::Low] {
            self.pending.slot(priority).lock().await.take();
        }
        self.frame_buffer.lock().await.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The single consumer of a [SendQueue]: it turns messages into chunks, and chunks into packets
pub struct SendQueueWorker {
    real_time_recv: mpsc::UnboundedReceiver<SendWork>,
    default_recv: mpsc::UnboundedReceiver<SendWork>,
    low_recv: mpsc::UnboundedReceiver<SendWork>,
    // for posting chunks of encoded messages
    real_time: mpsc::UnboundedSender<SendWork>,
    default: mpsc::UnboundedSender<SendWork>,
    low: mpsc::UnboundedSender<SendWork>,
    shutdown: watch::Receiver<bool>,
    pending: Arc<PendingMessages>,
    frame_buffer: Arc<Mutex<FrameBuffer>>,
    codec: ChunkCodec,
    next_frame: FrameSeq,
    last_default_message: MessageSeq,
    pipeline: SendPipeline,
}

impl SendQueueWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // higher priorities are always drained first
            let (work, priority) = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(work) = self.real_time_recv.recv() => (work, Priority::RealTime),
                Some(work) = self.default_recv.recv() => (work, Priority::Default),
                Some(work) = self.low_recv.recv() => (work, Priority::Low),
                else => break,
            };
            self.on_work(work, priority).await;
        }
        debug!("send queue worker shutting down");
    }

    async fn on_work(&mut self, work: SendWork, priority: Priority) {
        match work {
            SendWork::Flush => {
                let pending = self.pending.slot(priority).lock().await.take();
                if let Some(tree) = pending {
                    self.encode_message(tree, priority);
                }
            }
            SendWork::Message(tree) => self.encode_message(tree, priority),
            SendWork::Chunk(chunk) => self.send_chunk(chunk, priority).await,
            SendWork::Retransmit(chunk) => self.resend_chunk(chunk).await,
        }
    }

    fn encode_message(&mut self, tree: MessageTree, priority: Priority) {
        let chunks = match self.codec.encode(&tree) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("dropping {:?} message: {}", priority, e);
                return;
            }
        };
        let Some(message_sequence) = chunks.first().map(|c| c.message_sequence) else {
            return;
        };

        // only default priority messages form a causal chain
        let dependency = if priority == Priority::Default {
            std::mem::replace(&mut self.last_default_message, message_sequence)
        }
        else {
            MessageSeq::ZERO
        };
        trace!("encoded {:?} message #{} into {} chunks, depending on #{}", priority, message_sequence, chunks.len(), dependency);

        let channel = match priority {
            Priority::RealTime => &self.real_time,
            Priority::Default => &self.default,
            Priority::Low => &self.low,
        };
        for mut chunk in chunks {
            chunk.message_dependency = dependency;
            let _ = channel.send(SendWork::Chunk(chunk));
        }
    }

    async fn send_chunk(&mut self, mut chunk: Chunk, priority: Priority) {
        {
            let mut frame_buffer = self.frame_buffer.lock().await;
            if priority != Priority::RealTime {
                chunk.frame_sequence = self.next_frame;
                self.next_frame = self.next_frame.next();
                frame_buffer.insert(chunk.clone());
            }
            chunk.oldest_recoverable_frame = frame_buffer.oldest_recoverable_frame();
            chunk.oldest_recoverable_message = frame_buffer.oldest_recoverable_message();
        }

        trace!("sending chunk {} of message #{} as frame #{}", chunk.chunk_sequence_in_message, chunk.message_sequence, chunk.frame_sequence);
        self.pipeline.send_packet(&Packet::Chunk(chunk)).await;
    }

    async fn resend_chunk(&mut self, mut chunk: Chunk) {
        let frame = chunk.frame_sequence;
        {
            let frame_buffer = self.frame_buffer.lock().await;
            chunk.oldest_recoverable_frame = frame_buffer.oldest_recoverable_frame();
            chunk.oldest_recoverable_message = frame_buffer.oldest_recoverable_message();
        }

        trace!("retransmitting frame #{}", frame);
        self.pipeline.send_packet(&Packet::Chunk(chunk)).await;
        self.frame_buffer.lock().await.resend_complete(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::merge::KeepAll;
    use crate::message::{MessageNode, TargetId};
    use crate::sequence::SessionId;
    use crate::test_util::CollectingSendSocket;

    fn send_queue(socket: Arc<CollectingSendSocket>, coalesce: bool) -> (SendQueue, SendQueueWorker, Arc<Mutex<FrameBuffer>>) {
        let mut config = TransportConfig::default_ipv4();
        config.payload_size_inside_udp = 200;
        config.coalesce_pending_messages = coalesce;

        let pipeline = SendPipeline::new(socket, SessionId::from_raw(1), SocketAddr::from(([239, 0, 0, 1], 9000)));
        let frame_buffer = Arc::new(Mutex::new(FrameBuffer::new(config.frame_buffer_capacity_bytes)));
        let (queue, worker) = SendQueue::new(&config, pipeline, frame_buffer.clone(), Arc::new(KeepAll));
        (queue, worker, frame_buffer)
    }

    fn tree(kind: u16, payload_len: usize) -> MessageTree {
        MessageTree::new(MessageNode::new(TargetId::new_guid(), kind, vec![0u8; payload_len]))
    }

    /// the root kinds of all messages that were sent, in order of their first chunk
    fn sent_message_kinds(chunks: &[Chunk]) -> Vec<u16> {
        let mut result = Vec::new();
        for chunk in chunks.iter().filter(|c| c.chunk_sequence_in_message == 0) {
            let data = chunks.iter()
                .filter(|c| c.message_sequence == chunk.message_sequence)
                .flat_map(|c| c.data.iter().cloned())
                .collect::<Vec<_>>();
            let tree = ChunkCodec::decode(&data).unwrap();
            result.extend(tree.processing_order().into_iter().map(|id| tree.node(id).kind));
        }
        result
    }

    #[rstest]
    #[case::single_chunk_messages(10)]
    #[case::multi_chunk_messages(300)]
    fn test_priority_order(#[case] payload_len: usize) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(CollectingSendSocket::new());
            let (queue, worker, _) = send_queue(socket.clone(), false);

            // kind: 1xx = real time, 2xx = default, 3xx = low
            queue.send(tree(301, payload_len), Priority::Low).await.unwrap();
            queue.send(tree(201, payload_len), Priority::Default).await.unwrap();
            queue.send(tree(101, payload_len), Priority::RealTime).await.unwrap();
            queue.send(tree(302, payload_len), Priority::Low).await.unwrap();
            queue.send(tree(202, payload_len), Priority::Default).await.unwrap();
            queue.send(tree(102, payload_len), Priority::RealTime).await.unwrap();
            queue.send(tree(203, payload_len), Priority::Default).await.unwrap();

            let handle = worker.spawn();
            tokio::time::sleep(Duration::from_millis(10)).await;

            let chunks = socket.chunks();
            assert_eq!(sent_message_kinds(&chunks), vec![101, 102, 201, 202, 203, 301, 302]);

            // frame sequences are assigned in send order, real time chunks get none
            let frames = chunks.iter()
                .filter(|c| c.is_retainable())
                .map(|c| c.frame_sequence.to_raw())
                .collect::<Vec<_>>();
            assert_eq!(frames, (1..=frames.len() as u64).collect::<Vec<_>>());
            let num_real_time = chunks.iter().filter(|c| !c.is_retainable()).count();
            assert_eq!(num_real_time, chunks.len() / 7 * 2);

            queue.shutdown().await;
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_dependency_chain() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(CollectingSendSocket::new());
            let (queue, worker, _) = send_queue(socket.clone(), false);
            let handle = worker.spawn();

            queue.send(tree(201, 10), Priority::Default).await.unwrap();
            queue.send(tree(301, 10), Priority::Low).await.unwrap();
            queue.send(tree(101, 10), Priority::RealTime).await.unwrap();
            queue.send(tree(202, 10), Priority::Default).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.send(tree(203, 10), Priority::Default).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;

            let chunks = socket.chunks();
            let by_kind = |kind: u16| {
                chunks.iter()
                    .find(|c| sent_message_kinds(std::slice::from_ref(*c)) == vec![kind])
                    .cloned()
                    .unwrap()
            };

            let d1 = by_kind(201);
            let d2 = by_kind(202);
            let d3 = by_kind(203);
            assert_eq!(d1.message_dependency, MessageSeq::ZERO);
            assert_eq!(d2.message_dependency, d1.message_sequence);
            assert_eq!(d3.message_dependency, d2.message_sequence);
            assert_eq!(by_kind(301).message_dependency, MessageSeq::ZERO);
            assert_eq!(by_kind(101).message_dependency, MessageSeq::ZERO);

            queue.shutdown().await;
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_coalesce_pending() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(CollectingSendSocket::new());
            let (queue, worker, _) = send_queue(socket.clone(), true);

            queue.send(tree(201, 0), Priority::Default).await.unwrap();
            queue.send(tree(101, 0), Priority::RealTime).await.unwrap();
            queue.send(tree(202, 0), Priority::Default).await.unwrap();
            queue.send(tree(203, 0), Priority::Default).await.unwrap();

            let handle = worker.spawn();
            tokio::time::sleep(Duration::from_millis(10)).await;

            let chunks = socket.chunks();
            // the three default messages were merged into one
            assert_eq!(chunks.len(), 2);
            assert_eq!(sent_message_kinds(&chunks), vec![101, 201, 202, 203]);

            // a message sent after the flush is a new message
            queue.send(tree(204, 0), Priority::Default).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let chunks = socket.chunks();
            assert_eq!(chunks.len(), 3);
            assert_eq!(chunks[2].message_dependency, chunks[1].message_sequence);

            queue.shutdown().await;
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_retransmit() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(CollectingSendSocket::new());
            let (queue, worker, frame_buffer) = send_queue(socket.clone(), false);
            let handle = worker.spawn();

            queue.send(tree(201, 400), Priority::Default).await.unwrap();
            queue.send(tree(101, 10), Priority::RealTime).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let sent = socket.chunks();
            assert_eq!(frame_buffer.lock().await.len(), sent.len() - 1);
            socket.clear();

            // frame 2 twice: it is resent once only. Frames 0 and 100 do not exist
            let requested = [0, 2, 3, 100].into_iter().collect::<RangeSet>();
            assert_eq!(queue.retransmit(&requested).await, 2);
            assert_eq!(queue.retransmit(&RangeSet::single(2)).await, 0);
            tokio::time::sleep(Duration::from_millis(10)).await;

            let resent = socket.chunks();
            assert_eq!(resent.iter().map(|c| c.frame_sequence.to_raw()).collect::<Vec<_>>(), vec![2, 3]);
            for chunk in &resent {
                let original = sent.iter().find(|c| c.frame_sequence == chunk.frame_sequence).unwrap();
                assert_eq!(chunk.data, original.data);
                assert_eq!(chunk.message_sequence, original.message_sequence);
            }

            // after the resend, the frame can be requested again
            assert_eq!(queue.retransmit(&RangeSet::single(2)).await, 1);

            queue.shutdown().await;
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_send_after_shutdown() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(CollectingSendSocket::new());
            let (queue, worker, frame_buffer) = send_queue(socket.clone(), true);
            let handle = worker.spawn();

            queue.send(tree(201, 10), Priority::Default).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(frame_buffer.lock().await.len(), 1);

            queue.shutdown().await;
            handle.await.unwrap();

            assert!(queue.is_closed());
            assert!(frame_buffer.lock().await.is_empty());
            match queue.send(tree(202, 10), Priority::Default).await {
                Err(TransportError::Closed) => {}
                other => panic!("unexpected result {:?}", other),
            }
            assert_eq!(queue.retransmit(&RangeSet::single(1)).await, 0);
        });
    }

    #[test]
    fn test_sync_message() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(CollectingSendSocket::new());
            let (queue, worker, _) = send_queue(socket.clone(), false);
            let handle = worker.spawn();

            // real time chunks are not retained
            queue.send(tree(101, 10), Priority::RealTime).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(queue.sync_message().await, None);

            queue.send(tree(201, 10), Priority::Default).await.unwrap();
            queue.send(tree(301, 10), Priority::Low).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(queue.sync_message().await, Some(SyncMessage {
                high_water_frame: FrameSeq::from_raw(2),
                oldest_recoverable_frame: FrameSeq::from_raw(1),
                oldest_recoverable_message: MessageSeq::from_raw(2),
            }));

            queue.shutdown().await;
            handle.await.unwrap();
            assert_eq!(queue.sync_message().await, None);
        });
    }
}
