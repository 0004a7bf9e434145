//! Combining message trees that are both still pending, so that bursts of updates to the same
//!  target collapse into a single unit before they are serialized.
//!
//! Merging walks two lists of nodes ('zips' them): if the newest nodes of both lists address
//!  the same target, a [MergePolicy] decides whether both nodes are kept or one of them absorbs
//!  the other. If one node is discarded, the two nodes' children are merged recursively. Nodes
//!  addressing different targets are never merged but only chained in chronological order.

use tracing::trace;
use crate::error::{Result, TransportError};
use crate::message::{MessageNode, MessageTree, NodeId};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MergeAction {
    /// Neither node is redundant: the older node becomes the newer node's oldest predecessor
    KeepBothInOrder,
    /// The newer node supersedes the older node, e.g. a full snapshot replacing an increment
    DiscardOlder,
    /// The policy copied everything relevant from the newer node into the older node, e.g.
    ///  by accumulating ink stroke deltas
    DiscardNewer,
}

/// Decides per pair of nodes addressing the same target how they are merged. This is where
///  the application's per-message-type rules live.
///
/// The policy may modify the older node, typically to absorb the newer node's content before
///  returning [MergeAction::DiscardNewer].
pub trait MergePolicy: Send + Sync {
    fn merge_action(&self, newer: &MessageNode, older: &mut MessageNode) -> MergeAction;
}

/// The default policy: never discard anything
#[derive(Copy, Clone, Debug, Default)]
pub struct KeepAll;

impl MergePolicy for KeepAll {
    fn merge_action(&self, _newer: &MessageNode, _older: &mut MessageNode) -> MergeAction {
        MergeAction::KeepBothInOrder
    }
}

impl<F> MergePolicy for F
where F: Fn(&MessageNode, &mut MessageNode) -> MergeAction + Send + Sync
{
    fn merge_action(&self, newer: &MessageNode, older: &mut MessageNode) -> MergeAction {
        self(newer, older)
    }
}

impl MessageTree {
    /// Merges a tree that was created after this one into this tree. Afterwards, this tree
    ///  holds the information of both in processing order.
    pub fn merge_newer(&mut self, newer: MessageTree, policy: &dyn MergePolicy) -> Result<()> {
        let older_root = self.root();
        let newer_root = self.absorb(newer);
        let root = self.zip_into(newer_root, older_root, policy)?;
        self.set_root(root);
        Ok(())
    }

    /// Merges the list starting at `newer` with the list starting at `older`, both of which
    ///  must be part of this tree and have the same parent. Returns the head of the merged
    ///  list.
    ///
    /// This is the building block of [MessageTree::merge_newer], exposed for combining
    ///  sub-updates that were accumulated separately inside one tree.
    pub fn merge_nodes(&mut self, newer: NodeId, older: NodeId, policy: &dyn MergePolicy) -> Result<NodeId> {
        if self.get(newer).is_none() || self.get(older).is_none() {
            return Err(TransportError::InvalidMerge("node is not part of this tree"));
        }
        self.zip_into(newer, older, policy)
    }

    fn zip_into(&mut self, newer: NodeId, older: NodeId, policy: &dyn MergePolicy) -> Result<NodeId> {
        if newer == older {
            return Err(TransportError::InvalidMerge("a node cannot be merged with itself"));
        }
        if self.node(newer).parent() != self.node(older).parent() {
            return Err(TransportError::InvalidMerge("nodes have different parents"));
        }

        if self.node(newer).target != self.node(older).target {
            self.append_oldest(newer, older);
            return Ok(newer);
        }

        let action = {
            let (newer_node, older_node) = self.pair_mut(newer, older);
            policy.merge_action(newer_node, older_node)
        };
        trace!("merging {} into {}: {:?}", self.node(newer).id(), self.node(older).id(), action);

        match action {
            MergeAction::KeepBothInOrder => {
                self.append_oldest(newer, older);
                Ok(newer)
            }
            MergeAction::DiscardOlder => {
                if let Some(older_predecessor) = self.node(older).predecessor() {
                    self.append_oldest(newer, older_predecessor);
                }
                let older_child = self.node(older).child();
                if let Some(older_child) = older_child {
                    self.reparent_chain(older_child, Some(newer));
                }
                let merged_children = self.zip_optional(self.node(newer).child(), older_child, policy)?;
                self.set_child(newer, merged_children);
                self.free(older);
                Ok(newer)
            }
            MergeAction::DiscardNewer => {
                // the newer node's predecessors are processed before the node that now holds
                //  the newer node's content
                if let Some(newer_predecessor) = self.node(newer).predecessor() {
                    if let Some(older_predecessor) = self.node(older).predecessor() {
                        self.append_oldest(newer_predecessor, older_predecessor);
                    }
                    self.set_predecessor(older, Some(newer_predecessor));
                }
                let newer_child = self.node(newer).child();
                if let Some(newer_child) = newer_child {
                    self.reparent_chain(newer_child, Some(older));
                }
                let merged_children = self.zip_optional(newer_child, self.node(older).child(), policy)?;
                self.set_child(older, merged_children);
                self.free(newer);
                Ok(older)
            }
        }
    }

    fn zip_optional(&mut self, newer: Option<NodeId>, older: Option<NodeId>, policy: &dyn MergePolicy) -> Result<Option<NodeId>> {
        match (newer, older) {
            (Some(newer), Some(older)) => self.zip_into(newer, older, policy).map(Some),
            (newer, None) => Ok(newer),
            (None, older) => Ok(older),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use uuid::Uuid;
    use crate::message::TargetId;
    use super::*;

    const SNAPSHOT: u16 = 1;
    const DELTA: u16 = 2;

    fn target(n: u128) -> TargetId {
        TargetId::Guid(Uuid::from_u128(n))
    }

    fn node(target_no: u128, kind: u16, payload: &'static [u8]) -> MessageNode {
        MessageNode::new(target(target_no), kind, payload)
    }

    fn payloads(tree: &MessageTree) -> Vec<Bytes> {
        tree.processing_order()
            .into_iter()
            .map(|id| tree.node(id).payload.clone())
            .collect()
    }

    /// snapshots supersede whatever came before, deltas are accumulated into the older node
    fn snapshot_and_delta_policy(newer: &MessageNode, older: &mut MessageNode) -> MergeAction {
        match (newer.kind, older.kind) {
            (SNAPSHOT, _) => MergeAction::DiscardOlder,
            (DELTA, DELTA) => {
                older.payload = [older.payload.as_ref(), newer.payload.as_ref()].concat().into();
                MergeAction::DiscardNewer
            }
            _ => MergeAction::KeepBothInOrder,
        }
    }

    #[test]
    fn test_keep_both_in_order() {
        let mut older = MessageTree::new(node(1, DELTA, b"a"));
        let older_root = older.root();
        older.add_child(older_root, node(10, DELTA, b"a1"));

        let newer = MessageTree::new(node(1, DELTA, b"b"));

        older.merge_newer(newer, &KeepAll).unwrap();
        assert_eq!(payloads(&older), vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"a1"),
            Bytes::from_static(b"b"),
        ]);
        assert_eq!(older.len(), 3);
    }

    #[rstest]
    #[case::keep_all(false)]
    #[case::discarding_policy(true)]
    fn test_different_targets_are_chained(#[case] use_discarding_policy: bool) {
        let mut older = MessageTree::new(node(1, SNAPSHOT, b"a"));
        let newer = MessageTree::new(node(2, SNAPSHOT, b"b"));

        let result = if use_discarding_policy {
            older.merge_newer(newer, &snapshot_and_delta_policy)
        }
        else {
            older.merge_newer(newer, &KeepAll)
        };
        result.unwrap();

        assert_eq!(payloads(&older), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(older.node(older.root()).target, target(2));
    }

    #[test]
    fn test_discard_older() {
        // older: pred (target 9), then root (target 1) with children 10, 11
        let mut older = MessageTree::new(node(9, DELTA, b"pred"));
        let older_root = older.push_update(node(1, DELTA, b"old"));
        older.add_child(older_root, node(10, DELTA, b"old-10"));
        older.add_child(older_root, node(11, DELTA, b"old-11"));

        // newer: root (target 1) with children 11, 12
        let mut newer = MessageTree::new(node(1, SNAPSHOT, b"new"));
        let newer_root = newer.root();
        newer.add_child(newer_root, node(11, SNAPSHOT, b"new-11"));
        newer.add_child(newer_root, node(12, DELTA, b"new-12"));

        older.merge_newer(newer, &snapshot_and_delta_policy).unwrap();

        // the older root's predecessor is now the newer root's oldest predecessor. The older
        //  children are merged into the newer ones: 12 differs from 11 and is chained, so the
        //  older 11 is kept before it
        assert_eq!(payloads(&older), vec![
            Bytes::from_static(b"pred"),
            Bytes::from_static(b"new"),
            Bytes::from_static(b"old-10"),
            Bytes::from_static(b"old-11"),
            Bytes::from_static(b"new-11"),
            Bytes::from_static(b"new-12"),
        ]);
        assert_eq!(older.len(), 6);

        let root = older.root();
        assert_eq!(older.node(root).kind, SNAPSHOT);
        for child in older.children(root) {
            assert_eq!(older.node(child).parent(), Some(root));
        }
    }

    #[test]
    fn test_discard_older_merges_children_recursively() {
        let mut older = MessageTree::new(node(1, DELTA, b"old"));
        let older_root = older.root();
        older.add_child(older_root, node(10, DELTA, b"old-10"));

        let mut newer = MessageTree::new(node(1, SNAPSHOT, b"new"));
        let newer_root = newer.root();
        newer.add_child(newer_root, node(10, SNAPSHOT, b"new-10"));

        older.merge_newer(newer, &snapshot_and_delta_policy).unwrap();

        assert_eq!(payloads(&older), vec![Bytes::from_static(b"new"), Bytes::from_static(b"new-10")]);
        assert_eq!(older.len(), 2);
    }

    #[test]
    fn test_discard_newer() {
        let mut older = MessageTree::new(node(1, DELTA, b"ab"));
        let older_root = older.root();
        older.add_child(older_root, node(10, DELTA, b"x"));
        let older_id = older.node(older_root).id();

        let mut newer = MessageTree::new(node(5, SNAPSHOT, b"other"));
        let newer_root = newer.push_update(node(1, DELTA, b"cd"));
        newer.add_child(newer_root, node(11, DELTA, b"z"));
        newer.add_child(newer_root, node(10, DELTA, b"y"));

        older.merge_newer(newer, &snapshot_and_delta_policy).unwrap();

        // the newer root's predecessor is processed before the accumulated node, and so is
        //  the newer child's predecessor
        assert_eq!(payloads(&older), vec![
            Bytes::from_static(b"other"),
            Bytes::from_static(b"abcd"),
            Bytes::from_static(b"z"),
            Bytes::from_static(b"xy"),
        ]);
        let root = older.root();
        assert_eq!(older.node(root).id(), older_id);
        for child in older.children(root) {
            assert_eq!(older.node(child).parent(), Some(root));
        }
        assert_eq!(older.len(), 4);
    }

    #[test]
    fn test_merge_nodes_with_different_parents() {
        let mut tree = MessageTree::new(node(1, DELTA, b"a"));
        let a = tree.root();
        let b = tree.push_update(node(2, DELTA, b"b"));
        let a1 = tree.add_child(a, node(10, DELTA, b"a1"));
        let b1 = tree.add_child(b, node(10, DELTA, b"b1"));

        match tree.merge_nodes(b1, a1, &KeepAll) {
            Err(TransportError::InvalidMerge(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_merge_node_with_itself() {
        let mut tree = MessageTree::new(node(1, DELTA, b"a"));
        let root = tree.root();
        match tree.merge_nodes(root, root, &KeepAll) {
            Err(TransportError::InvalidMerge(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }
}
