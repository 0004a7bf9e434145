use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};
use crate::packet::Packet;
use crate::sequence::SessionId;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        // transient failures are not retried here: lost chunks are recovered by NACK
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}


/// Encodes packets for this node's session and sends them to the destination, which is
///  typically a multicast group
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    session: SessionId,
    destination: SocketAddr,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, session: SessionId, destination: SocketAddr) -> SendPipeline {
        SendPipeline { socket, session, destination, }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, packet: &Packet) {
        let packet_buf = packet.encode(self.session);
        self.socket.do_send_packet(self.destination, &packet_buf).await;
    }
}
