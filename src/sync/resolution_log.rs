use crate::sync::action::{SyncActionKind, UnresolvedAction};
use crate::types::NodeId;
use std::collections::BTreeSet;

/// ResolutionLog holds the unresolved proposals of one mutation kind until a
/// quorum of group members has independently proposed the same action.
///
/// Two proposals merge only when they are structurally identical; proposals
/// that differ in any field accumulate endorsements separately and at most
/// one of them can ever resolve.
pub(crate) struct ResolutionLog {
    logger: slog::Logger,
    kind: SyncActionKind,
    quorum: usize,
    max_sync_attempts: u32,
    entries: Vec<UnresolvedEntry>,
}

struct UnresolvedEntry {
    action: UnresolvedAction,
    endorsers: BTreeSet<NodeId>,
    sync_attempts: u32,
}

impl ResolutionLog {
    pub(crate) fn new(logger: slog::Logger, kind: SyncActionKind, quorum: usize, max_sync_attempts: u32) -> Self {
        ResolutionLog {
            logger,
            kind,
            quorum,
            max_sync_attempts,
            entries: Vec::new(),
        }
    }

    /// Records `endorser`'s proposal of `action`. Adding the same endorser
    /// twice is a no-op. Returns the action exactly once, the instant its
    /// endorsement count reaches quorum; the entry is retired at that moment.
    pub(crate) fn add_unresolved_action(
        &mut self,
        action: UnresolvedAction,
        endorser: NodeId,
    ) -> Option<UnresolvedAction> {
        debug_assert_eq!(self.kind, action.action.kind());

        let position = self.entries.iter().position(|entry| entry.action == action);
        let index = match position {
            Some(index) => {
                self.entries[index].endorsers.insert(endorser);
                index
            }
            None => {
                let mut endorsers = BTreeSet::new();
                endorsers.insert(endorser);
                self.entries.push(UnresolvedEntry {
                    action,
                    endorsers,
                    sync_attempts: 0,
                });
                self.entries.len() - 1
            }
        };

        if self.entries[index].endorsers.len() >= self.quorum {
            let entry = self.entries.remove(index);
            slog::info!(
                self.logger,
                "{} action for {:?} reached quorum with {} endorsers",
                self.kind,
                entry.action.key,
                entry.endorsers.len(),
            );
            return Some(entry.action);
        }

        None
    }

    /// Periodic maintenance. Every still-unresolved entry has its attempt
    /// counter incremented; entries past the ceiling are dropped and surfaced
    /// as operational errors. Returns the entries this node itself endorsed,
    /// for re-broadcast — relaying a proposal we never endorsed under our own
    /// sender id would count as a fresh endorsement on the receiving side and
    /// could let two conflicting proposals both cross quorum.
    pub(crate) fn increment_attempts_and_resend(&mut self, self_id: &NodeId) -> Vec<UnresolvedAction> {
        let mut resend = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for mut entry in self.entries.drain(..) {
            entry.sync_attempts += 1;
            if entry.sync_attempts > self.max_sync_attempts {
                slog::error!(
                    self.logger,
                    "Dropping {} action for {:?} as permanently unresolvable after {} attempts ({} of {} endorsements)",
                    self.kind,
                    entry.action.key,
                    entry.sync_attempts,
                    entry.endorsers.len(),
                    self.quorum,
                );
                continue;
            }
            if entry.endorsers.contains(self_id) {
                resend.push(entry.action.clone());
            }
            kept.push(entry);
        }

        self.entries = kept;
        resend
    }

    #[cfg(test)]
    fn unresolved_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::action::{MetadataAction, RequestOrigin};
    use crate::types::{Identity, MessageId, ObjectKey, ObjectKind};

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn put_action(name: &str, size: u64) -> UnresolvedAction {
        UnresolvedAction {
            key: ObjectKey::new(ObjectKind::Immutable, Identity::new(name)),
            action: MetadataAction::Put {
                size,
                holders: vec![NodeId::new("h1"), NodeId::new("h2")].into_iter().collect(),
            },
            origin: Some(RequestOrigin {
                message_id: MessageId::new(1),
                requester: NodeId::new("maid-1"),
            }),
        }
    }

    fn log(quorum: usize) -> ResolutionLog {
        ResolutionLog::new(test_logger(), SyncActionKind::Put, quorum, 10)
    }

    #[test]
    fn resolves_exactly_at_quorum() {
        // Group of 5 => quorum of 3.
        let mut log = log(3);
        let action = put_action("chunk-1", 64);

        assert_eq!(None, log.add_unresolved_action(action.clone(), NodeId::new("n1")));
        assert_eq!(None, log.add_unresolved_action(action.clone(), NodeId::new("n2")));
        let resolved = log.add_unresolved_action(action.clone(), NodeId::new("n3"));
        assert_eq!(Some(action), resolved);
        assert_eq!(0, log.unresolved_count());
    }

    #[test]
    fn duplicate_endorser_is_a_no_op() {
        let mut log = log(3);
        let action = put_action("chunk-1", 64);

        assert_eq!(None, log.add_unresolved_action(action.clone(), NodeId::new("n1")));
        assert_eq!(None, log.add_unresolved_action(action.clone(), NodeId::new("n1")));
        assert_eq!(None, log.add_unresolved_action(action.clone(), NodeId::new("n1")));
        assert_eq!(1, log.unresolved_count());

        assert_eq!(None, log.add_unresolved_action(action.clone(), NodeId::new("n2")));
        assert!(log.add_unresolved_action(action, NodeId::new("n3")).is_some());
    }

    #[test]
    fn conflicting_proposals_never_both_resolve() {
        // Group of 5, quorum 3: two structurally different proposals for the
        // same object, each endorsed by a disjoint 2-peer set. Neither may
        // resolve.
        let mut log = log(3);
        let action_a = put_action("chunk-1", 64);
        let action_b = put_action("chunk-1", 128);

        assert_eq!(None, log.add_unresolved_action(action_a.clone(), NodeId::new("n1")));
        assert_eq!(None, log.add_unresolved_action(action_a.clone(), NodeId::new("n2")));
        assert_eq!(None, log.add_unresolved_action(action_b.clone(), NodeId::new("n3")));
        assert_eq!(None, log.add_unresolved_action(action_b.clone(), NodeId::new("n4")));
        assert_eq!(2, log.unresolved_count());

        // A fifth member picking one side resolves that side only.
        let resolved = log.add_unresolved_action(action_a.clone(), NodeId::new("n5"));
        assert_eq!(Some(action_a), resolved);
        assert_eq!(1, log.unresolved_count());
    }

    #[test]
    fn actions_for_different_objects_are_independent() {
        let mut log = log(2);

        assert_eq!(
            None,
            log.add_unresolved_action(put_action("chunk-1", 64), NodeId::new("n1"))
        );
        assert_eq!(
            None,
            log.add_unresolved_action(put_action("chunk-2", 64), NodeId::new("n2"))
        );
        assert_eq!(2, log.unresolved_count());
    }

    #[test]
    fn resend_returns_only_self_endorsed_entries() {
        let me = NodeId::new("me");
        let mut log = log(3);

        let mine = put_action("chunk-1", 64);
        let theirs = put_action("chunk-2", 64);
        log.add_unresolved_action(mine.clone(), me.clone());
        log.add_unresolved_action(theirs, NodeId::new("n2"));

        let resend = log.increment_attempts_and_resend(&me);
        assert_eq!(vec![mine], resend);
        assert_eq!(2, log.unresolved_count());
    }

    #[test]
    fn entries_are_dropped_after_attempt_ceiling() {
        let me = NodeId::new("me");
        let mut log = ResolutionLog::new(test_logger(), SyncActionKind::Put, 3, 2);
        log.add_unresolved_action(put_action("chunk-1", 64), me.clone());

        assert_eq!(1, log.increment_attempts_and_resend(&me).len());
        assert_eq!(1, log.increment_attempts_and_resend(&me).len());
        // Third pass exceeds the ceiling; the entry is dropped.
        assert_eq!(0, log.increment_attempts_and_resend(&me).len());
        assert_eq!(0, log.unresolved_count());
    }

    #[test]
    fn late_endorsement_after_resolution_starts_a_fresh_entry() {
        let mut log = log(2);
        let action = put_action("chunk-1", 64);

        log.add_unresolved_action(action.clone(), NodeId::new("n1"));
        assert!(log.add_unresolved_action(action.clone(), NodeId::new("n2")).is_some());

        // A straggler copy of the already-resolved action accumulates alone
        // and ages out; it must not resolve on its own.
        assert_eq!(None, log.add_unresolved_action(action, NodeId::new("n3")));
        assert_eq!(1, log.unresolved_count());
    }
}
