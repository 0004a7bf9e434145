//! A reliable transport for application messages over an unreliable, typically multicast,
//!  datagram channel. It carries the state changes of a classroom presentation (slide
//!  navigation, ink, deck changes) from an instructor to students and back.
//!
//! Messages are trees of updates ([message::MessageTree]) that are split into datagram-sized
//!  chunks on sending and reassembled on receipt. Lost chunks are requested through NACKs and
//!  retransmitted from the sender's bounded history. Messages waiting to be sent can be merged,
//!  and received messages are applied to the application's objects in causal order.
//!
//! [end_point::EndPoint] wires all of this together.

pub mod assembler;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod control_messages;
pub mod end_point;
pub mod error;
pub mod frame_buffer;
pub mod merge;
pub mod message;
pub mod nack_manager;
pub mod packet;
pub mod range_set;
pub mod receive_dispatcher;
pub mod send_pipeline;
pub mod send_queue;
pub mod sequence;
pub mod target_registry;

#[cfg(test)]
mod test_util;
