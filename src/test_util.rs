//! Test doubles for the socket seam: a socket that records everything sent through it, and an
//!  in-memory 'multicast' network connecting endpoints with optional simulated loss.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use crate::chunk::Chunk;
use crate::packet::Packet;
use crate::send_pipeline::SendSocket;
use crate::sequence::SessionId;

pub struct CollectingSendSocket {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl CollectingSendSocket {
    pub fn new() -> CollectingSendSocket {
        CollectingSendSocket {
            sent: Default::default(),
        }
    }

    /// all packets sent so far, decoded
    pub fn packets(&self) -> Vec<(SessionId, Packet)> {
        self.sent.lock().unwrap().iter()
            .map(|(_, buf)| Packet::decode(buf).unwrap())
            .collect()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.packets().into_iter()
            .filter_map(|(_, p)| match p {
                Packet::Chunk(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SendSocket for CollectingSendSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }
}

type Delivery = Box<dyn Fn(Bytes) + Send + Sync>;
type DropFilter = Box<dyn FnMut(&Packet) -> bool + Send>;

/// Delivers every packet sent by any member to all members, including the sender itself, the
///  way a multicast group with loopback does
pub struct LoopbackNetwork {
    members: Mutex<Vec<Delivery>>,
    drop_filter: Mutex<Option<DropFilter>>,
    num_dropped: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        Arc::new(LoopbackNetwork {
            members: Default::default(),
            drop_filter: Default::default(),
            num_dropped: AtomicUsize::new(0),
        })
    }

    pub fn socket(self: &Arc<Self>, port: u16) -> Arc<LoopbackSocket> {
        Arc::new(LoopbackSocket {
            network: self.clone(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        })
    }

    pub fn connect(&self, deliver: impl Fn(Bytes) + Send + Sync + 'static) {
        self.members.lock().unwrap().push(Box::new(deliver));
    }

    /// Packets for which the filter returns `true` are lost
    pub fn set_drop_filter(&self, filter: impl FnMut(&Packet) -> bool + Send + 'static) {
        *self.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::Acquire)
    }

    fn transmit(&self, packet_buf: &[u8]) {
        if let Some(filter) = self.drop_filter.lock().unwrap().as_mut() {
            let (_, packet) = Packet::decode(packet_buf).unwrap();
            if filter(&packet) {
                debug!("loopback network: dropping {:?}", packet);
                self.num_dropped.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }

        let raw = Bytes::copy_from_slice(packet_buf);
        for deliver in self.members.lock().unwrap().iter() {
            deliver(raw.clone());
        }
    }
}

pub struct LoopbackSocket {
    network: Arc<LoopbackNetwork>,
    addr: SocketAddr,
}

#[async_trait]
impl SendSocket for LoopbackSocket {
    async fn do_send_packet(&self, _to: SocketAddr, packet_buf: &[u8]) {
        self.network.transmit(packet_buf);
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}
