use crate::message::TargetId;
use crate::sequence::SessionId;

/// Errors surfaced by the transport core. Loss-related conditions are expected during regular
///  operation: they are logged and handled where they occur rather than propagated to the
///  application.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A malformed or corrupt packet, chunk or message. The receive path drops it and continues.
    #[error("malformed chunk or message: {0}")]
    Deserialization(String),

    /// Merging was attempted on nodes that cannot be merged. This is a bug in the calling code.
    #[error("invalid merge: {0}")]
    InvalidMerge(&'static str),

    /// A node references a target that is not registered and cannot be created from the node
    #[error("target {0} is unknown and cannot be created from this message")]
    UnresolvableTarget(TargetId),

    /// Frames were not recovered before the sender dropped them from its frame buffer
    #[error("frames {first}..={last} from sender {sender} are no longer recoverable")]
    RetransmissionExhausted {
        sender: SessionId,
        first: u64,
        last: u64,
    },

    #[error("message of {size} bytes exceeds the configured maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// A message to be sent nests sub-updates deeper than receivers accept
    #[error("message nesting exceeds {max} levels")]
    NestingTooDeep { max: usize },

    #[error("transport is shut down")]
    Closed,
}

impl TransportError {
    pub(crate) fn deser(e: impl std::fmt::Display) -> TransportError {
        TransportError::Deserialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
