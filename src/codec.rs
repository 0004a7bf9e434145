//! Serialization of message trees, and splitting of serialized messages into chunks.
//!
//! A tree is serialized as its top-level list, each list being a varint count followed by its
//!  nodes oldest-first. Every node is followed by the list of its children:
//!
//! ```ascii
//! list:  count (varint), node*
//! node:  target tag (u8: 0 = guid, 1 = key), target (16 or 32 bytes)
//!        group flag (u8), group (16 bytes if the flag is 1)
//!        message identifier (16 bytes)
//!        kind (u16)
//!        payload length (varint), payload
//!        children (list)
//! ```
//!
//! Tags are local scheduling metadata and are not serialized.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;
use uuid::Uuid;
use crate::chunk::Chunk;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::message::{Group, MessageIdentifier, MessageNode, MessageTree, NodeId, TargetId};
use crate::sequence::{FrameSeq, MessageSeq};

/// Trees nested deeper than this are rejected, both when serializing and when deserializing
pub const MAX_NESTING_DEPTH: usize = 64;

/// tag, target, group flag, message identifier, kind, payload length, children count
const MIN_SERIALIZED_NODE_LEN: usize = 1 + 16 + 1 + 16 + 2 + 1 + 1;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum TargetKind {
    Guid = 0,
    Key = 1,
}

pub struct ChunkCodec {
    max_chunk_payload: usize,
    max_message_size: usize,
    next_message_sequence: MessageSeq,
    next_chunk_sequence: u64,
}

impl ChunkCodec {
    pub fn new(max_chunk_payload: usize, max_message_size: usize) -> ChunkCodec {
        assert!(max_chunk_payload > 0);

        ChunkCodec {
            max_chunk_payload,
            max_message_size,
            next_message_sequence: MessageSeq::FIRST,
            next_chunk_sequence: 1,
        }
    }

    pub fn from_config(config: &TransportConfig) -> ChunkCodec {
        Self::new(config.max_chunk_payload(), config.max_message_size)
    }

    /// Serializes a message tree and splits it into chunks, assigning the next message
    ///  sequence. Frame sequence, dependency and watermarks are left at 0 for the sending
    ///  side to stamp.
    pub fn encode(&mut self, tree: &MessageTree) -> Result<Vec<Chunk>> {
        let serialized = serialize_tree(tree)?;
        if serialized.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: serialized.len(),
                max: self.max_message_size,
            });
        }

        // an empty serialized message (which the tree format does not produce) still needs a
        //  chunk to be transmitted
        let number_of_chunks = serialized.len().div_ceil(self.max_chunk_payload).max(1);
        let number_of_chunks_u32 = u32::try_from(number_of_chunks)
            .map_err(|_| TransportError::MessageTooLarge { size: serialized.len(), max: self.max_message_size })?;

        let message_sequence = self.next_message_sequence;
        self.next_message_sequence = message_sequence.next();
        let first_chunk_sequence = self.next_chunk_sequence;
        self.next_chunk_sequence += number_of_chunks as u64;

        trace!("encoding message #{} of {} bytes into {} chunks", message_sequence, serialized.len(), number_of_chunks);

        let chunks = (0..number_of_chunks)
            .map(|i| {
                let start = i * self.max_chunk_payload;
                let end = (start + self.max_chunk_payload).min(serialized.len());
                Chunk {
                    message_sequence,
                    chunk_sequence_in_message: i as u32,
                    first_chunk_sequence,
                    number_of_chunks: number_of_chunks_u32,
                    frame_sequence: FrameSeq::ZERO,
                    message_dependency: MessageSeq::ZERO,
                    oldest_recoverable_frame: FrameSeq::ZERO,
                    oldest_recoverable_message: MessageSeq::ZERO,
                    data: serialized.slice(start..end),
                }
            })
            .collect();
        Ok(chunks)
    }

    /// Deserializes a complete message, i.e. the concatenated data of all its chunks
    pub fn decode(buf: &[u8]) -> Result<MessageTree> {
        let mut buf = buf;
        let tree = deser_tree(&mut buf)
            .map_err(TransportError::deser)?;
        if buf.has_remaining() {
            return Err(TransportError::Deserialization(format!("{} trailing bytes after message", buf.remaining())));
        }
        Ok(tree)
    }
}

fn serialize_tree(tree: &MessageTree) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    ser_list(tree, Some(tree.root()), &mut buf, 0)?;
    Ok(buf.freeze())
}

fn ser_list(tree: &MessageTree, head: Option<NodeId>, buf: &mut BytesMut, depth: usize) -> Result<()> {
    let list = head.map(|h| tree.chain(h)).unwrap_or_default();
    if !list.is_empty() && depth >= MAX_NESTING_DEPTH {
        return Err(TransportError::NestingTooDeep { max: MAX_NESTING_DEPTH });
    }

    buf.put_usize_varint(list.len());
    for id in list {
        let node = tree.node(id);
        ser_node(node, buf);
        ser_list(tree, node.child(), buf, depth + 1)?;
    }
    Ok(())
}

fn ser_node(node: &MessageNode, buf: &mut BytesMut) {
    match &node.target {
        TargetId::Guid(guid) => {
            buf.put_u8(TargetKind::Guid.into());
            buf.put_slice(guid.as_bytes());
        }
        TargetId::Key(key) => {
            buf.put_u8(TargetKind::Key.into());
            buf.put_slice(key);
        }
    }
    match &node.group {
        None => buf.put_u8(0),
        Some(group) => {
            buf.put_u8(1);
            buf.put_slice(group.0.as_bytes());
        }
    }
    buf.put_slice(node.id().0.as_bytes());
    buf.put_u16(node.kind);
    buf.put_usize_varint(node.payload.len());
    buf.put_slice(&node.payload);
}

fn deser_tree(buf: &mut impl Buf) -> anyhow::Result<MessageTree> {
    let count = deser_count(buf)?;
    if count == 0 {
        bail!("message without nodes");
    }

    let mut tree = MessageTree::new(deser_node(buf)?);
    let root = tree.root();
    deser_children(buf, &mut tree, root, 1)?;

    for _ in 1..count {
        let id = tree.push_update(deser_node(buf)?);
        deser_children(buf, &mut tree, id, 1)?;
    }
    Ok(tree)
}

fn deser_children(buf: &mut impl Buf, tree: &mut MessageTree, parent: NodeId, depth: usize) -> anyhow::Result<()> {
    let count = deser_count(buf)?;
    if count > 0 && depth >= MAX_NESTING_DEPTH {
        bail!("message nesting exceeds {} levels", MAX_NESTING_DEPTH);
    }

    for _ in 0..count {
        let id = tree.add_child(parent, deser_node(buf)?);
        deser_children(buf, tree, id, depth + 1)?;
    }
    Ok(())
}

fn deser_count(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let count = buf.try_get_usize_varint()
        .map_err(|e| anyhow!("varint: {:?}", e))?;
    if count > buf.remaining() / MIN_SERIALIZED_NODE_LEN {
        bail!("list of {} nodes cannot fit into the remaining {} bytes", count, buf.remaining());
    }
    Ok(count)
}

fn deser_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    let mut raw = [0u8; 16];
    buf.try_copy_to_slice(&mut raw)?;
    Ok(Uuid::from_bytes(raw))
}

fn deser_node(buf: &mut impl Buf) -> anyhow::Result<MessageNode> {
    let target = match TargetKind::try_from(buf.try_get_u8()?)? {
        TargetKind::Guid => TargetId::Guid(deser_uuid(buf)?),
        TargetKind::Key => {
            let mut key = [0u8; 32];
            buf.try_copy_to_slice(&mut key)?;
            TargetId::Key(key)
        }
    };
    let group = match buf.try_get_u8()? {
        0 => None,
        1 => Some(Group(deser_uuid(buf)?)),
        other => bail!("invalid group flag {}", other),
    };
    let id = MessageIdentifier(deser_uuid(buf)?);
    let kind = buf.try_get_u16()?;

    let payload_len = buf.try_get_usize_varint()
        .map_err(|e| anyhow!("varint: {:?}", e))?;
    if payload_len > buf.remaining() {
        bail!("payload of {} bytes exceeds the remaining {} bytes", payload_len, buf.remaining());
    }
    let payload = buf.copy_to_bytes(payload_len);

    let mut node = MessageNode::new(target, kind, payload)
        .with_identifier(id);
    node.group = group;
    Ok(node)
}
