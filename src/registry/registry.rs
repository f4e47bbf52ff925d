use crate::registry::record::ReplicaRecord;
use crate::registry::store::MetadataStore;
use crate::sync::MetadataAction;
use crate::types::{NodeId, ObjectKey};
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("object is not tracked by this registry")]
    UnknownObject,

    #[error("removing holder would drop replica count below floor of {floor}")]
    BelowReplicationFloor { floor: usize },

    #[error("holder {0:?} is not in the expected source set")]
    HolderNotInExpectedSet(NodeId),

    #[error("record is incomplete and cannot be serialized")]
    IncompleteRecord,

    #[error("stored record failed to round-trip: {0}")]
    Wire(#[from] WireError),
}

/// The effect of one committed mutation.
#[derive(Debug, PartialEq)]
pub enum CommitOutcome {
    /// The record after the mutation.
    Updated(ReplicaRecord),
    /// The last subscriber was removed; the record has been dropped and the
    /// returned holders still need retraction requests.
    Retired(ReplicaRecord),
}

/// Registry applies quorum-resolved mutations to per-object replica records.
/// Mutations are atomic per object key: a refused mutation leaves the stored
/// record untouched.
pub struct Registry<S: MetadataStore> {
    logger: slog::Logger,
    store: S,
    replication_floor: usize,
}

impl<S: MetadataStore> Registry<S> {
    pub fn new(logger: slog::Logger, store: S, replication_floor: usize) -> Self {
        Registry {
            logger,
            store,
            replication_floor,
        }
    }

    pub fn commit(&mut self, key: &ObjectKey, action: &MetadataAction) -> Result<CommitOutcome, RegistryError> {
        match action {
            MetadataAction::Put { size, holders } => match self.store.get(key)? {
                None => {
                    let record = ReplicaRecord::new(*size, holders.clone());
                    self.store.put(key, &record)?;
                    slog::info!(
                        self.logger,
                        "Created record for {:?} with {} holders",
                        key,
                        record.online_holders().len()
                    );
                    Ok(CommitOutcome::Updated(record))
                }
                Some(mut record) => {
                    record.increment_subscribers();
                    self.store.put(key, &record)?;
                    Ok(CommitOutcome::Updated(record))
                }
            },

            MetadataAction::Delete => {
                let mut record = self.store.get(key)?.ok_or(RegistryError::UnknownObject)?;
                let remaining = record.decrement_subscribers();
                if remaining < 1 {
                    self.store.remove(key)?;
                    slog::info!(self.logger, "Last subscriber removed; retiring record for {:?}", key);
                    Ok(CommitOutcome::Retired(record))
                } else {
                    self.store.put(key, &record)?;
                    Ok(CommitOutcome::Updated(record))
                }
            }

            MetadataAction::AddHolder(holder) => {
                let mut record = self.store.get(key)?.ok_or(RegistryError::UnknownObject)?;
                record.add_holder(holder.clone());
                self.store.put(key, &record)?;
                Ok(CommitOutcome::Updated(record))
            }

            MetadataAction::RemoveHolder { holder, failed_store } => {
                let mut record = self.store.get(key)?.ok_or(RegistryError::UnknownObject)?;
                record.remove_holder(holder, *failed_store, self.replication_floor)?;
                self.store.put(key, &record)?;
                Ok(CommitOutcome::Updated(record))
            }

            MetadataAction::HolderUp(holder) => {
                let mut record = self.store.get(key)?.ok_or(RegistryError::UnknownObject)?;
                record.set_holder_online(holder)?;
                self.store.put(key, &record)?;
                Ok(CommitOutcome::Updated(record))
            }

            MetadataAction::HolderDown(holder) => {
                let mut record = self.store.get(key)?.ok_or(RegistryError::UnknownObject)?;
                record.set_holder_offline(holder)?;
                self.store.put(key, &record)?;
                Ok(CommitOutcome::Updated(record))
            }
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Result<Option<ReplicaRecord>, RegistryError> {
        self.store.get(key)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.store.keys()
    }

    /// Drops the local record without any group agreement. Used when churn
    /// moves responsibility for the object away from this node.
    pub fn retire(&mut self, key: &ObjectKey) -> Result<(), RegistryError> {
        self.store.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::store::InMemoryStore;
    use crate::types::{Identity, ObjectKind};
    use std::collections::BTreeSet;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn registry() -> Registry<InMemoryStore> {
        Registry::new(test_logger(), InMemoryStore::create().unwrap(), 4)
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(ObjectKind::Immutable, Identity::new(name))
    }

    fn holders(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    fn put(size: u64, names: &[&str]) -> MetadataAction {
        MetadataAction::Put {
            size,
            holders: holders(names),
        }
    }

    #[test]
    fn put_creates_then_increments_subscribers() {
        let mut registry = registry();
        let key = key("chunk-1");

        let outcome = registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();
        match outcome {
            CommitOutcome::Updated(record) => {
                assert_eq!(1, record.subscribers());
                assert_eq!(4, record.online_holders().len());
            }
            other => panic!("Expected Updated, got {:?}", other),
        }

        let outcome = registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();
        match outcome {
            CommitOutcome::Updated(record) => assert_eq!(2, record.subscribers()),
            other => panic!("Expected Updated, got {:?}", other),
        }
    }

    #[test]
    fn delete_of_last_subscriber_retires_the_record() {
        let mut registry = registry();
        let key = key("chunk-1");
        registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();

        let outcome = registry.commit(&key, &MetadataAction::Delete).unwrap();
        match outcome {
            CommitOutcome::Retired(record) => {
                assert_eq!(0, record.subscribers());
                assert_eq!(holders(&["h1", "h2", "h3", "h4"]), record.all_holders());
            }
            other => panic!("Expected Retired, got {:?}", other),
        }

        assert!(registry.get(&key).unwrap().is_none());
        match registry.commit(&key, &MetadataAction::Delete) {
            Err(RegistryError::UnknownObject) => {}
            other => panic!("Expected UnknownObject, got {:?}", other),
        }
    }

    #[test]
    fn delete_with_remaining_subscribers_keeps_the_record() {
        let mut registry = registry();
        let key = key("chunk-1");
        registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();
        registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();

        match registry.commit(&key, &MetadataAction::Delete).unwrap() {
            CommitOutcome::Updated(record) => assert_eq!(1, record.subscribers()),
            other => panic!("Expected Updated, got {:?}", other),
        }
        assert!(registry.get(&key).unwrap().is_some());
    }

    #[test]
    fn refused_remove_holder_leaves_stored_state_untouched() {
        let mut registry = registry();
        let key = key("chunk-1");
        registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();

        let action = MetadataAction::RemoveHolder {
            holder: NodeId::new("h1"),
            failed_store: false,
        };
        match registry.commit(&key, &action) {
            Err(RegistryError::BelowReplicationFloor { floor: 4 }) => {}
            other => panic!("Expected BelowReplicationFloor, got {:?}", other),
        }

        let record = registry.get(&key).unwrap().unwrap();
        assert!(record.holds(&NodeId::new("h1")));
        assert_eq!(4, record.all_holders().len());
    }

    #[test]
    fn holder_up_down_round_trip() {
        let mut registry = registry();
        let key = key("chunk-1");
        registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();

        registry
            .commit(&key, &MetadataAction::HolderDown(NodeId::new("h1")))
            .unwrap();
        let record = registry.get(&key).unwrap().unwrap();
        assert!(record.offline_holders().contains(&NodeId::new("h1")));

        // Duplicate down signal is refused without state change.
        match registry.commit(&key, &MetadataAction::HolderDown(NodeId::new("h1"))) {
            Err(RegistryError::HolderNotInExpectedSet(_)) => {}
            other => panic!("Expected HolderNotInExpectedSet, got {:?}", other),
        }

        registry
            .commit(&key, &MetadataAction::HolderUp(NodeId::new("h1")))
            .unwrap();
        let record = registry.get(&key).unwrap().unwrap();
        assert!(record.online_holders().contains(&NodeId::new("h1")));
    }

    #[test]
    fn retire_drops_the_record_locally() {
        let mut registry = registry();
        let key = key("chunk-1");
        registry.commit(&key, &put(64, &["h1", "h2", "h3", "h4"])).unwrap();

        registry.retire(&key).unwrap();
        assert!(registry.get(&key).unwrap().is_none());
        assert!(registry.keys().is_empty());
    }
}
