use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::assembler::{AssembledMessage, ChunkAssembler};
use crate::chunk::Chunk;
use crate::config::TransportConfig;
use crate::control_messages::{NackMessage, SyncMessage};
use crate::error::Result;
use crate::frame_buffer::FrameBuffer;
use crate::merge::MergePolicy;
use crate::message::{Group, MessageTree, Priority, TargetId};
use crate::nack_manager::NackManager;
use crate::packet::Packet;
use crate::receive_dispatcher::{ReceiveDispatcher, TargetUpdater};
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::send_queue::SendQueue;
use crate::sequence::SessionId;

/// Received datagrams waiting for the receive worker. Datagrams arriving while this is full are
///  dropped, and recovered through NACKs like any other loss.
const RECEIVE_QUEUE_CAPACITY: usize = 4096;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// What is known about a remote sender
struct RemoteSender {
    assembler: ChunkAssembler,
    last_heard: Instant,
}

/// State shared between the endpoint's API and its background tasks
struct Shared<U: TargetUpdater> {
    config: Arc<TransportConfig>,
    session: SessionId,
    pipeline: SendPipeline,
    send_queue: SendQueue,
    nack_manager: Mutex<NackManager>,
    remote_senders: Mutex<FxHashMap<SessionId, RemoteSender>>,
    dispatcher: Mutex<ReceiveDispatcher<U>>,
}

/// EndPoint is where all parts of the transport come together: it sends application messages
///  to a (typically multicast) destination, and turns received datagrams into updates that are
///  applied through the application's [TargetUpdater].
///
/// Work is done by background tasks: the send queue's worker, a receive worker that does
///  reassembly and dispatch so that receiving a datagram never waits for the application, and a
///  maintenance loop that emits NACKs and SYNCs and sweeps the target registry.
pub struct EndPoint<U: TargetUpdater> {
    shared: Arc<Shared<U>>,
    inbound: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<U: TargetUpdater> Drop for EndPoint<U> {
    fn drop(&mut self) {
        if let Ok(mut handles) = self.handles.try_lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

impl<U: TargetUpdater> EndPoint<U> {
    /// Binds a UDP socket and starts receiving on it. If `destination` is an IPv4 multicast
    ///  address, the socket joins that group.
    pub async fn bind(
        config: Arc<TransportConfig>,
        bind_addr: SocketAddr,
        destination: SocketAddr,
        updater: U,
        merge_policy: Arc<dyn MergePolicy>,
    ) -> anyhow::Result<EndPoint<U>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound socket to {:?}", UdpSocket::local_addr(&socket)?);

        if let SocketAddr::V4(group) = destination {
            if group.ip().is_multicast() {
                socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;
                socket.set_multicast_loop_v4(true)?;
                info!("joined multicast group {}", group.ip());
            }
        }

        let end_point = Self::new(config, Arc::new(socket.clone()), destination, updater, merge_policy).await?;
        let recv_handle = tokio::spawn(Self::recv_loop(socket, end_point.inbound.clone(), end_point.shutdown.subscribe()));
        end_point.handles.lock().await.push(recv_handle);
        Ok(end_point)
    }

    /// Creates an endpoint sending through an arbitrary socket. Received datagrams are passed
    ///  in through [EndPoint::receive].
    pub async fn new(
        config: Arc<TransportConfig>,
        send_socket: Arc<dyn SendSocket>,
        destination: SocketAddr,
        updater: U,
        merge_policy: Arc<dyn MergePolicy>,
    ) -> anyhow::Result<EndPoint<U>> {
        let session = SessionId::from_timestamp()?;
        Self::with_session(config, session, send_socket, destination, updater, merge_policy).await
    }

    pub(crate) async fn with_session(
        config: Arc<TransportConfig>,
        session: SessionId,
        send_socket: Arc<dyn SendSocket>,
        destination: SocketAddr,
        updater: U,
        merge_policy: Arc<dyn MergePolicy>,
    ) -> anyhow::Result<EndPoint<U>> {
        config.validate()?;
        info!("starting endpoint with session {}, sending to {:?}", session, destination);

        let pipeline = SendPipeline::new(send_socket, session, destination);
        let frame_buffer = Arc::new(Mutex::new(FrameBuffer::new(config.frame_buffer_capacity_bytes)));
        let (send_queue, send_worker) = SendQueue::new(&config, pipeline.clone(), frame_buffer, merge_policy);

        let shared = Arc::new(Shared {
            nack_manager: Mutex::new(NackManager::new(&config)),
            remote_senders: Default::default(),
            dispatcher: Mutex::new(ReceiveDispatcher::new(updater)),
            config,
            session,
            pipeline,
            send_queue,
        });

        let (inbound, inbound_recv) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let handles = vec![
            send_worker.spawn(),
            tokio::spawn(Self::receive_worker(shared.clone(), inbound_recv, shutdown.subscribe())),
            tokio::spawn(Self::maintenance_loop(shared.clone(), shutdown.subscribe())),
        ];

        Ok(EndPoint {
            shared,
            inbound,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    pub fn session(&self) -> SessionId {
        self.shared.session
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.pipeline.local_addr()
    }

    /// Enqueues a message for sending with the given priority. This never waits for network
    ///  I/O.
    pub async fn send(&self, tree: MessageTree, priority: Priority) -> Result<()> {
        self.shared.send_queue.send(tree, priority).await
    }

    /// Enqueues a message with the priority its root node is tagged with
    pub async fn send_tagged(&self, tree: MessageTree) -> Result<()> {
        let priority = tree.get(tree.root())
            .map(|root| root.tags.priority)
            .unwrap_or_default();
        self.send(tree, priority).await
    }

    /// the number of senders this endpoint currently keeps reassembly state for
    pub async fn num_remote_senders(&self) -> usize {
        self.shared.remote_senders.lock().await.len()
    }

    /// Hands a received datagram to the receive worker. This returns immediately.
    pub fn receive(&self, raw: Bytes) {
        Self::enqueue_received(&self.inbound, raw);
    }

    fn enqueue_received(inbound: &mpsc::Sender<Bytes>, raw: Bytes) {
        match inbound.try_send(raw) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("receive queue is full - dropping datagram"),
            Err(TrySendError::Closed(_)) => trace!("endpoint is shut down - dropping datagram"),
        }
    }

    pub async fn join_group(&self, group: Group) {
        debug!("joining {}", group);
        self.shared.dispatcher.lock().await
            .participant_mut()
            .join(group);
    }

    pub async fn leave_group(&self, group: &Group) {
        debug!("leaving {}", group);
        self.shared.dispatcher.lock().await
            .participant_mut()
            .leave(group);
    }

    /// to be called when the application destroyed a target, so that later updates addressed
    ///  to it are not applied to a stale registration
    pub async fn remove_target(&self, id: &TargetId) -> bool {
        self.shared.dispatcher.lock().await
            .remove_target(id)
    }

    /// Stops sending and receiving: new sends are rejected, background tasks finish their
    ///  current unit of work, and NACK state, partially received messages and the frame buffer
    ///  are released.
    pub async fn shutdown(&self) {
        info!("shutting down endpoint {}", self.shared.session);

        self.shared.send_queue.shutdown().await;
        let _ = self.shutdown.send(true);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("background task failed: {}", e);
                }
            }
        }

        self.shared.nack_manager.lock().await.clear();
        self.shared.remote_senders.lock().await.clear();
        debug!("endpoint {} is shut down", self.shared.session);
    }

    async fn recv_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Bytes>, mut shutdown: watch::Receiver<bool>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((num_read, from)) => {
                        trace!("received {} bytes from {:?}", num_read, from);
                        Self::enqueue_received(&inbound, Bytes::copy_from_slice(&buf[..num_read]));
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                },
            }
        }
        debug!("receive loop shutting down");
    }

    async fn receive_worker(shared: Arc<Shared<U>>, mut inbound: mpsc::Receiver<Bytes>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let raw = select! {
                _ = shutdown.changed() => break,
                raw = inbound.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            shared.on_packet(&raw).instrument(span).await;
        }
        debug!("receive worker shutting down");
    }

    async fn maintenance_loop(shared: Arc<Shared<U>>, mut shutdown: watch::Receiver<bool>) {
        let mut nack_interval = interval(shared.config.nack_interval);
        let mut sync_interval = interval(shared.config.sync_interval);
        let mut sweep_interval = interval(shared.config.registry_sweep_interval);
        for i in [&mut nack_interval, &mut sync_interval, &mut sweep_interval] {
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            select! {
                _ = shutdown.changed() => break,
                _ = nack_interval.tick() => shared.do_send_nacks().await,
                _ = sync_interval.tick() => shared.do_send_sync().await,
                _ = sweep_interval.tick() => {
                    shared.dispatcher.lock().await
                        .sweep_registry();
                    shared.expire_idle_senders(Instant::now()).await;
                }
            }
        }
        debug!("maintenance loop shutting down");
    }
}

impl<U: TargetUpdater> Shared<U> {
    async fn on_packet(&self, raw: &[u8]) {
        let (sender, packet) = match Packet::decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping packet: {}", e);
                return;
            }
        };
        if sender == self.session {
            // multicast loopback
            return;
        }

        match packet {
            Packet::Chunk(chunk) => self.on_chunk(sender, chunk).await,
            Packet::Nack(nack) => self.on_nack(sender, nack).await,
            Packet::Sync(sync) => self.on_sync(sender, sync).await,
        }
    }

    async fn on_chunk(&self, sender: SessionId, chunk: Chunk) {
        trace!("received chunk {} of message #{} as frame #{} from {}", chunk.chunk_sequence_in_message, chunk.message_sequence, chunk.frame_sequence, sender);
        {
            let mut nack_manager = self.nack_manager.lock().await;
            if !chunk.oldest_recoverable_frame.is_zero() {
                nack_manager.advance_watermark(sender, chunk.oldest_recoverable_frame);
            }
            if chunk.is_retainable() {
                nack_manager.discard(sender, chunk.frame_sequence, chunk.frame_sequence);
            }
        }

        let delivered = self.assembler_for(sender, |assembler| assembler.add(chunk)).await;
        self.dispatch(delivered).await;
    }

    async fn on_nack(&self, requester: SessionId, nack: NackMessage) {
        if nack.missing_from == self.session {
            let num_scheduled = self.send_queue.retransmit(&nack.frames).await;
            debug!("NACK from {} for {} frames: scheduled {} retransmissions", requester, nack.frames.num_values(), num_scheduled);
        }
        else {
            trace!("observed NACK from {} for frames from {} - postponing own requests", requester, nack.missing_from);
            self.nack_manager.lock().await
                .delay(nack.missing_from, &nack.frames, Instant::now());
        }
    }

    async fn on_sync(&self, sender: SessionId, sync: SyncMessage) {
        trace!("received SYNC from {}: {:?}", sender, sync);
        self.nack_manager.lock().await
            .advance_watermark(sender, sync.oldest_recoverable_frame);

        let delivered = self.assembler_for(sender, |assembler| assembler.on_sync(&sync)).await;
        self.dispatch(delivered).await;
    }

    async fn assembler_for<R>(&self, sender: SessionId, f: impl FnOnce(&mut ChunkAssembler) -> R) -> R {
        let mut remote_senders = self.remote_senders.lock().await;
        let remote = remote_senders.entry(sender)
            .or_insert_with(|| {
                debug!("first packet from sender {}", sender);
                RemoteSender {
                    assembler: ChunkAssembler::new(
                        sender,
                        self.config.max_incomplete_messages_per_sender,
                        self.config.max_message_size,
                        self.config.max_outstanding_nack_frames_per_sender,
                    ),
                    last_heard: Instant::now(),
                }
            });
        remote.last_heard = Instant::now();
        f(&mut remote.assembler)
    }

    /// Discards reassembly and NACK state for senders that were not heard from for longer than
    ///  the idle timeout. Partially received messages from them are lost.
    async fn expire_idle_senders(&self, now: Instant) {
        let idle_timeout = self.config.sender_idle_timeout;

        let expired = {
            let mut remote_senders = self.remote_senders.lock().await;
            let expired = remote_senders.iter()
                .filter(|(_, remote)| now.saturating_duration_since(remote.last_heard) > idle_timeout)
                .map(|(&sender, _)| sender)
                .collect::<Vec<_>>();
            for sender in &expired {
                remote_senders.remove(sender);
            }
            expired
        };
        if expired.is_empty() {
            return;
        }

        let mut nack_manager = self.nack_manager.lock().await;
        for sender in expired {
            info!("nothing received from {} for more than {:?} - discarding its state", sender, idle_timeout);
            nack_manager.remove_sender(sender);
        }
    }

    async fn dispatch(&self, delivered: Vec<AssembledMessage>) {
        if delivered.is_empty() {
            return;
        }

        let mut dispatcher = self.dispatcher.lock().await;
        for message in delivered {
            let stats = dispatcher.on_receive(&message.tree, message.sender, message.sequence);
            debug!("applied message #{} from {}: {:?}", message.sequence, message.sender, stats);
        }
    }

    async fn do_send_nacks(&self) {
        let now = Instant::now();

        let missing = {
            let mut remote_senders = self.remote_senders.lock().await;
            remote_senders.iter_mut()
                .map(|(&sender, remote)| (sender, remote.assembler.take_nack_ranges()))
                .filter(|(_, frames)| !frames.is_empty())
                .collect::<Vec<_>>()
        };

        let due = {
            let mut nack_manager = self.nack_manager.lock().await;
            for (sender, frames) in &missing {
                nack_manager.nack(*sender, frames, now);
            }
            nack_manager.poll(now)
        };

        for (sender, frames) in due {
            for part in frames.split_by_num_ranges(self.config.max_nack_ranges_per_packet) {
                trace!("requesting frames {:?} from {}", part, sender);
                self.pipeline.send_packet(&Packet::Nack(NackMessage {
                    missing_from: sender,
                    frames: part,
                })).await;
            }
        }
    }

    async fn do_send_sync(&self) {
        if let Some(sync) = self.send_queue.sync_message().await {
            self.pipeline.send_packet(&Packet::Sync(sync)).await;
        }
    }
}
