//! The message model: one logical update is a tree of [MessageNode]s.
//!
//! Each node may have a list of sub-updates (its children) and is itself part of a list of
//!  siblings. Lists are singly linked from the newest element via `predecessor` links, i.e.
//!  `child` points to the *newest* child and the oldest child has no predecessor. `parent` is
//!  the common parent of all nodes in a list, `None` for the top-level list.
//!
//! Processing order is defined recursively: a node's predecessors first, then the node itself,
//!  then its children.
//!
//! Nodes live in an arena owned by [MessageTree] and reference each other by [NodeId]. This
//!  makes re-linking during a merge an index rewrite rather than a deep copy.

use std::fmt::{Display, Formatter};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable identifier of the application object that a node updates
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum TargetId {
    Guid(Uuid),
    Key([u8; 32]),
}

impl TargetId {
    pub fn new_guid() -> TargetId {
        TargetId::Guid(Uuid::new_v4())
    }

    /// A key derived from content, so that nodes created independently for the same content
    ///  (e.g. the same deck file) address the same target
    pub fn from_content(content: &[u8]) -> TargetId {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(content));
        TargetId::Key(key)
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetId::Guid(guid) => write!(f, "{}", guid),
            TargetId::Key(key) => {
                write!(f, "key:")?;
                for b in key {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Routing tag: a node with a group is applied only by participants that are members of
///  that group
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Group(pub Uuid);

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "group:{}", self.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub enum Priority {
    RealTime,
    #[default]
    Default,
    Low,
}

/// Scheduling metadata. Tags are used on the sending side only and are not serialized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags {
    pub priority: Priority,
    pub slide: Option<Uuid>,
}

/// Unique id stamped once when a node is created, for diagnostics
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageIdentifier(pub Uuid);

impl Display for MessageIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a node inside its [MessageTree]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(usize);

#[derive(Clone, Debug)]
pub struct MessageNode {
    pub target: TargetId,
    pub group: Option<Group>,
    /// application-level discriminator of the update's type, opaque to the transport
    pub kind: u16,
    pub payload: Bytes,
    pub tags: Tags,
    id: MessageIdentifier,
    parent: Option<NodeId>,
    child: Option<NodeId>,
    predecessor: Option<NodeId>,
}

impl MessageNode {
    pub fn new(target: TargetId, kind: u16, payload: impl Into<Bytes>) -> MessageNode {
        MessageNode {
            target,
            group: None,
            kind,
            payload: payload.into(),
            tags: Tags::default(),
            id: MessageIdentifier(Uuid::new_v4()),
            parent: None,
            child: None,
            predecessor: None,
        }
    }

    pub fn with_group(mut self, group: Group) -> MessageNode {
        self.group = Some(group);
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> MessageNode {
        self.tags = tags;
        self
    }

    pub(crate) fn with_identifier(mut self, id: MessageIdentifier) -> MessageNode {
        self.id = id;
        self
    }

    pub fn id(&self) -> MessageIdentifier {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// the newest child
    pub fn child(&self) -> Option<NodeId> {
        self.child
    }

    pub fn predecessor(&self) -> Option<NodeId> {
        self.predecessor
    }

    /// everything that is transmitted, i.e. all fields except tags and links
    fn same_content(&self, other: &MessageNode) -> bool {
        self.target == other.target &&
            self.group == other.group &&
            self.kind == other.kind &&
            self.payload == other.payload &&
            self.id == other.id
    }
}


#[derive(Clone, Debug)]
pub struct MessageTree {
    nodes: Vec<Option<MessageNode>>,
    /// the newest top-level node
    root: NodeId,
}

impl MessageTree {
    pub fn new(root: MessageNode) -> MessageTree {
        let mut result = MessageTree {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        result.root = result.alloc(root, None, None);
        result
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&MessageNode> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut MessageNode> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    pub(crate) fn node(&self, id: NodeId) -> &MessageNode {
        self.get(id)
            .expect("this is a bug: dangling node id")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut MessageNode {
        self.get_mut(id)
            .expect("this is a bug: dangling node id")
    }

    /// number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.iter()
            .filter(|n| n.is_some())
            .count()
    }

    fn alloc(&mut self, mut node: MessageNode, parent: Option<NodeId>, predecessor: Option<NodeId>) -> NodeId {
        node.parent = parent;
        node.predecessor = predecessor;
        node.child = None;
        self.nodes.push(Some(node));
        NodeId(self.nodes.len() - 1)
    }

    /// Adds a top-level update that is processed after everything that is already in the tree.
    ///  The new node becomes the root.
    pub fn push_update(&mut self, node: MessageNode) -> NodeId {
        let predecessor = self.root;
        self.root = self.alloc(node, None, Some(predecessor));
        self.root
    }

    /// Adds a node as the newest child of `parent`
    pub fn add_child(&mut self, parent: NodeId, node: MessageNode) -> NodeId {
        let predecessor = self.node(parent).child;
        let id = self.alloc(node, Some(parent), predecessor);
        self.node_mut(parent).child = Some(id);
        id
    }

    /// The list that `head` is the newest element of, oldest first
    pub fn chain(&self, head: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut cur = Some(head);
        while let Some(id) = cur {
            result.push(id);
            cur = self.node(id).predecessor;
        }
        result.reverse();
        result
    }

    /// the node's children, oldest first
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).child
            .map(|c| self.chain(c))
            .unwrap_or_default()
    }

    /// all nodes in the order in which they are applied on the receiving side
    pub fn processing_order(&self) -> Vec<NodeId> {
        let mut result = Vec::with_capacity(self.nodes.len());
        self.collect_processing_order(self.root, &mut result);
        result
    }

    fn collect_processing_order(&self, head: NodeId, result: &mut Vec<NodeId>) {
        for id in self.chain(head) {
            result.push(id);
            if let Some(child) = self.node(id).child {
                self.collect_processing_order(child, result);
            }
        }
    }

    /// shared access to one node and exclusive access to another, different node
    pub(crate) fn pair_mut(&mut self, shared: NodeId, exclusive: NodeId) -> (&MessageNode, &mut MessageNode) {
        assert_ne!(shared, exclusive, "this is a bug: a node cannot be paired with itself");

        let (shared, exclusive) = if shared.0 < exclusive.0 {
            let (lo, hi) = self.nodes.split_at_mut(exclusive.0);
            (&lo[shared.0], &mut hi[0])
        }
        else {
            let (lo, hi) = self.nodes.split_at_mut(shared.0);
            (&hi[0], &mut lo[exclusive.0])
        };
        (
            shared.as_ref().expect("this is a bug: dangling node id"),
            exclusive.as_mut().expect("this is a bug: dangling node id"),
        )
    }

    pub(crate) fn oldest_in_chain(&self, head: NodeId) -> NodeId {
        let mut cur = head;
        while let Some(pred) = self.node(cur).predecessor {
            cur = pred;
        }
        cur
    }

    /// appends the list starting at `older_head` as the oldest part of the list `head`
    pub(crate) fn append_oldest(&mut self, head: NodeId, older_head: NodeId) {
        let oldest = self.oldest_in_chain(head);
        self.node_mut(oldest).predecessor = Some(older_head);
    }

    pub(crate) fn set_predecessor(&mut self, id: NodeId, predecessor: Option<NodeId>) {
        self.node_mut(id).predecessor = predecessor;
    }

    pub(crate) fn set_child(&mut self, id: NodeId, child: Option<NodeId>) {
        self.node_mut(id).child = child;
    }

    pub(crate) fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    /// sets `parent` for all nodes in the list `head`
    pub(crate) fn reparent_chain(&mut self, head: NodeId, parent: Option<NodeId>) {
        let mut cur = Some(head);
        while let Some(id) = cur {
            let node = self.node_mut(id);
            node.parent = parent;
            cur = node.predecessor;
        }
    }

    pub(crate) fn free(&mut self, id: NodeId) -> MessageNode {
        self.nodes[id.0].take()
            .expect("this is a bug: node freed twice")
    }

    /// Moves all of `other`'s nodes into this tree's arena, returning the (rebased) id of
    ///  `other`'s root. The moved nodes are not linked to this tree's nodes yet.
    pub(crate) fn absorb(&mut self, other: MessageTree) -> NodeId {
        let offset = self.nodes.len();
        let rebase = |id: Option<NodeId>| id.map(|NodeId(raw)| NodeId(raw + offset));

        for slot in other.nodes {
            self.nodes.push(slot.map(|mut node| {
                node.parent = rebase(node.parent);
                node.child = rebase(node.child);
                node.predecessor = rebase(node.predecessor);
                node
            }));
        }
        NodeId(other.root.0 + offset)
    }

    fn chains_equal(&self, head: Option<NodeId>, other: &MessageTree, other_head: Option<NodeId>) -> bool {
        let chain = head.map(|h| self.chain(h)).unwrap_or_default();
        let other_chain = other_head.map(|h| other.chain(h)).unwrap_or_default();

        chain.len() == other_chain.len() &&
            chain.iter().zip(other_chain.iter())
                .all(|(&a, &b)| {
                    let a = self.node(a);
                    let b = other.node(b);
                    a.same_content(b) && self.chains_equal(a.child, other, b.child)
                })
    }
}

/// Structural equality: same shape, same transmitted content. Arena layout and tags are
///  ignored.
impl PartialEq for MessageTree {
    fn eq(&self, other: &Self) -> bool {
        self.chains_equal(Some(self.root), other, Some(other.root))
    }
}
