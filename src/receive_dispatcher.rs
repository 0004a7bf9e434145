use std::sync::Arc;
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};
use crate::error::{Result, TransportError};
use crate::message::{Group, MessageNode, MessageTree, NodeId, TargetId};
use crate::sequence::{MessageSeq, SessionId};
use crate::target_registry::TargetRegistry;

/// The local participant's view of group membership. Nodes addressed to a group are applied
///  only if the participant is a member.
#[derive(Debug, Clone, Default)]
pub struct Participant {
    groups: FxHashSet<Group>,
}

impl Participant {
    pub fn new() -> Participant {
        Participant::default()
    }

    pub fn join(&mut self, group: Group) {
        self.groups.insert(group);
    }

    pub fn leave(&mut self, group: &Group) {
        self.groups.remove(group);
    }

    pub fn is_member(&self, group: &Group) -> bool {
        self.groups.contains(group)
    }
}

/// What an update is applied in the context of
pub struct ReceiveContext<'a> {
    pub sender: SessionId,
    pub message_sequence: MessageSeq,
    pub participant: &'a Participant,
}

/// The application's side of dispatching: it interprets nodes and applies them to its model.
pub trait TargetUpdater: Send + Sync + 'static {
    type Target: Send + Sync + 'static;

    /// Applies a node to its target. `target` holds the registered target if there is a live
    ///  one, and implementations may create or replace it.
    ///
    /// Returns whether the registry entry should be refreshed with (the new value of)
    ///  `target`. Returning [TransportError::UnresolvableTarget] skips the node.
    fn update_target(&self, node: &MessageNode, target: &mut Option<Arc<Self::Target>>, ctx: &ReceiveContext) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DispatchStats {
    pub applied: usize,
    pub skipped_group: usize,
    pub unresolvable: usize,
    pub failed: usize,
}

/// Applies received message trees in processing order: a node's predecessors, then the node
///  itself, then its children.
pub struct ReceiveDispatcher<U: TargetUpdater> {
    updater: U,
    registry: TargetRegistry<U::Target>,
    participant: Participant,
}

impl<U: TargetUpdater> ReceiveDispatcher<U> {
    pub fn new(updater: U) -> ReceiveDispatcher<U> {
        ReceiveDispatcher {
            updater,
            registry: TargetRegistry::new(),
            participant: Participant::new(),
        }
    }

    pub fn on_receive(&mut self, tree: &MessageTree, sender: SessionId, message_sequence: MessageSeq) -> DispatchStats {
        let ctx = ReceiveContext {
            sender,
            message_sequence,
            participant: &self.participant,
        };

        let mut stats = DispatchStats::default();
        Self::dispatch_chain(&self.updater, &mut self.registry, &ctx, tree, tree.root(), &mut stats);
        trace!("dispatched message #{} from {}: {:?}", message_sequence, sender, stats);
        stats
    }

    fn dispatch_chain(updater: &U, registry: &mut TargetRegistry<U::Target>, ctx: &ReceiveContext, tree: &MessageTree, head: NodeId, stats: &mut DispatchStats) {
        for id in tree.chain(head) {
            let node = tree.node(id);

            // a skipped node's predecessors are addressed independently
            if let Some(group) = &node.group {
                if !ctx.participant.is_member(group) {
                    trace!("not a member of {} - skipping update of {} and its sub-updates", group, node.target);
                    stats.skipped_group += 1;
                    continue;
                }
            }

            Self::apply(updater, registry, ctx, node, stats);

            if let Some(child) = node.child() {
                Self::dispatch_chain(updater, registry, ctx, tree, child, stats);
            }
        }
    }

    fn apply(updater: &U, registry: &mut TargetRegistry<U::Target>, ctx: &ReceiveContext, node: &MessageNode, stats: &mut DispatchStats) {
        let mut target = registry.get(&node.target);

        match updater.update_target(node, &mut target, ctx) {
            Ok(refresh) => {
                stats.applied += 1;
                if refresh {
                    match &target {
                        Some(target) => registry.insert(node.target, target),
                        None => {
                            registry.remove(&node.target);
                        }
                    }
                }
            }
            Err(TransportError::UnresolvableTarget(id)) => {
                debug!("message #{} from {}: target {} is unknown - skipping node {}", ctx.message_sequence, ctx.sender, id, node.id());
                stats.unresolvable += 1;
            }
            Err(e) => {
                warn!("message #{} from {}: applying node {} failed: {}", ctx.message_sequence, ctx.sender, node.id(), e);
                stats.failed += 1;
            }
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn participant_mut(&mut self) -> &mut Participant {
        &mut self.participant
    }

    /// called when the application destroyed a target
    pub fn remove_target(&mut self, id: &TargetId) -> bool {
        self.registry.remove(id)
    }

    pub fn sweep_registry(&mut self) -> usize {
        self.registry.sweep()
    }

    pub fn num_registered_targets(&self) -> usize {
        self.registry.len()
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }
}
