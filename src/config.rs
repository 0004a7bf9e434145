use std::time::Duration;
use anyhow::bail;
use crate::chunk::Chunk;
use crate::packet::PacketHeader;

pub struct TransportConfig {
    /// This is the payload size inside UDP packets that the transport assumes. Chunks are
    ///  sized so that a packet never exceeds this, so this size (and the implied packet size)
    ///  must be supported by all network connections between instructor and students.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    pub payload_size_inside_udp: usize,

    /// Serialized messages bigger than this are rejected when sending, and partially received
    ///  messages declaring a bigger size are dropped
    pub max_message_size: usize,

    /// Total bytes of chunk payload retained for retransmission. Measured in bytes rather than
    ///  chunks so that memory usage is predictable regardless of message sizes.
    pub frame_buffer_capacity_bytes: usize,

    /// Upper bound for partially assembled messages per sender. The oldest is dropped when a
    ///  new message would exceed this.
    pub max_incomplete_messages_per_sender: usize,

    /// How often missing frames are collected and NACK requests are (re-)sent. Configure to
    ///  roughly 2x RTT.
    pub nack_interval: Duration,
    /// Delay before a NACK request is repeated for the first time. The delay doubles for every
    ///  repetition up to `nack_retry_max`.
    pub nack_retry_initial: Duration,
    pub nack_retry_max: Duration,
    /// When another receiver's NACK for the same frames is observed, this node's own request is
    ///  postponed by this window
    pub nack_suppression_window: Duration,
    pub max_nack_ranges_per_packet: usize,
    pub max_outstanding_nack_frames_per_sender: usize,

    /// How often a node that sent retainable frames advertises its high-water frame, allowing
    ///  receivers to detect the loss of the most recent frames
    pub sync_interval: Duration,

    /// How often the target registry is swept for targets that were dropped by the application,
    ///  and for idle senders
    pub registry_sweep_interval: Duration,

    /// Reassembly and NACK state for a sender is discarded when nothing was received from it for
    ///  this long. A restarted node is a new sender, so without this the state of senders that
    ///  went away would accumulate. Senders with retained frames advertise them through SYNC,
    ///  so this must be well above `sync_interval`.
    pub sender_idle_timeout: Duration,

    /// If set, a message that is sent while another message of the same priority is still
    ///  pending is merged into it
    pub coalesce_pending_messages: bool,
}

impl TransportConfig {
    /// ipv4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            payload_size_inside_udp: 1472,
            max_message_size: 16*1024*1024,
            frame_buffer_capacity_bytes: 4*1024*1024,
            max_incomplete_messages_per_sender: 256,
            nack_interval: Duration::from_millis(20),
            nack_retry_initial: Duration::from_millis(40),
            nack_retry_max: Duration::from_millis(1000),
            nack_suppression_window: Duration::from_millis(40),
            max_nack_ranges_per_packet: 64,
            max_outstanding_nack_frames_per_sender: 8192,
            sync_interval: Duration::from_millis(100),
            registry_sweep_interval: Duration::from_secs(5),
            sender_idle_timeout: Duration::from_secs(30),
            coalesce_pending_messages: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < PacketHeader::SERIALIZED_LEN + Chunk::HEADER_LEN + 16 {
            bail!("Payload size is too small");
        }
        if self.payload_size_inside_udp > 65507 {
            bail!("Payload size does not fit into a UDP datagram");
        }
        if self.frame_buffer_capacity_bytes < self.max_chunk_payload() {
            bail!("Frame buffer must be able to hold at least one chunk");
        }
        if self.max_incomplete_messages_per_sender == 0 {
            bail!("At least one incomplete message per sender must be allowed");
        }
        if self.max_nack_ranges_per_packet == 0 {
            bail!("NACK packets must hold at least one range");
        }
        if self.max_nack_ranges_per_packet > self.max_nack_ranges_fitting_into_packet() {
            bail!("max_nack_ranges_per_packet does not fit into a single packet");
        }
        if self.nack_interval.is_zero() || self.sync_interval.is_zero() || self.registry_sweep_interval.is_zero() {
            bail!("Intervals must be positive");
        }
        if self.sender_idle_timeout <= self.sync_interval {
            bail!("sender_idle_timeout must exceed sync_interval");
        }
        if self.nack_retry_initial > self.nack_retry_max {
            bail!("nack_retry_initial must not exceed nack_retry_max");
        }
        Ok(())
    }

    /// The number of payload bytes that fit into a single chunk
    pub fn max_chunk_payload(&self) -> usize {
        self.payload_size_inside_udp
            .saturating_sub(PacketHeader::SERIALIZED_LEN + Chunk::HEADER_LEN)
    }

    fn max_nack_ranges_fitting_into_packet(&self) -> usize {
        // session id, range count varint (at most 10 bytes), 16 bytes per range
        self.payload_size_inside_udp.saturating_sub(PacketHeader::SERIALIZED_LEN + 8 + 10) / 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = TransportConfig::default_ipv4();
        config.validate().unwrap();
        assert_eq!(config.max_chunk_payload(), 1472 - 14 - 60);
    }

    #[rstest]
    #[case::tiny_payload(|c: &mut TransportConfig| c.payload_size_inside_udp = 50)]
    #[case::jumbo_payload(|c: &mut TransportConfig| c.payload_size_inside_udp = 100_000)]
    #[case::frame_buffer(|c: &mut TransportConfig| c.frame_buffer_capacity_bytes = 100)]
    #[case::no_incomplete(|c: &mut TransportConfig| c.max_incomplete_messages_per_sender = 0)]
    #[case::no_nack_ranges(|c: &mut TransportConfig| c.max_nack_ranges_per_packet = 0)]
    #[case::too_many_nack_ranges(|c: &mut TransportConfig| c.max_nack_ranges_per_packet = 1000)]
    #[case::zero_interval(|c: &mut TransportConfig| c.nack_interval = Duration::ZERO)]
    #[case::zero_sync_interval(|c: &mut TransportConfig| c.sync_interval = Duration::ZERO)]
    #[case::idle_timeout(|c: &mut TransportConfig| c.sender_idle_timeout = Duration::from_millis(100))]
    #[case::retry(|c: &mut TransportConfig| c.nack_retry_initial = Duration::from_secs(10))]
    fn test_invalid(#[case] modify: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
