use crate::registry::RegistryError;
use crate::types::HolderId;
use crate::wire::ProtoReplicaRecord;
use prost::Message;
use std::collections::BTreeSet;

/// Per-object replica metadata. A holder is in exactly one of the two sets at
/// any time; a record never tracks zero holders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaRecord {
    subscribers: i64,
    size: u64,
    store_failures: u32,
    online_holders: BTreeSet<HolderId>,
    offline_holders: BTreeSet<HolderId>,
}

impl ReplicaRecord {
    /// Created on the first resolved Put; the proposing holder set starts online.
    pub(crate) fn new(size: u64, holders: BTreeSet<HolderId>) -> Self {
        ReplicaRecord {
            subscribers: 1,
            size,
            store_failures: 0,
            online_holders: holders,
            offline_holders: BTreeSet::new(),
        }
    }

    pub fn subscribers(&self) -> i64 {
        self.subscribers
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn store_failures(&self) -> u32 {
        self.store_failures
    }

    pub fn online_holders(&self) -> &BTreeSet<HolderId> {
        &self.online_holders
    }

    pub fn offline_holders(&self) -> &BTreeSet<HolderId> {
        &self.offline_holders
    }

    /// All holders, online and offline.
    pub fn all_holders(&self) -> BTreeSet<HolderId> {
        self.online_holders.union(&self.offline_holders).cloned().collect()
    }

    pub fn holds(&self, holder: &HolderId) -> bool {
        self.online_holders.contains(holder) || self.offline_holders.contains(holder)
    }

    pub(crate) fn increment_subscribers(&mut self) -> i64 {
        self.subscribers += 1;
        self.subscribers
    }

    pub(crate) fn decrement_subscribers(&mut self) -> i64 {
        self.subscribers -= 1;
        self.subscribers
    }

    pub(crate) fn add_holder(&mut self, holder: HolderId) {
        self.offline_holders.remove(&holder);
        self.online_holders.insert(holder);
    }

    /// Rejected when it would leave fewer holders than `floor`. A rejected
    /// removal leaves the record untouched.
    pub(crate) fn remove_holder(
        &mut self,
        holder: &HolderId,
        failed_store: bool,
        floor: usize,
    ) -> Result<(), RegistryError> {
        if self.online_holders.len() + self.offline_holders.len() < floor + 1 {
            return Err(RegistryError::BelowReplicationFloor { floor });
        }
        if !self.online_holders.remove(holder) && !self.offline_holders.remove(holder) {
            return Err(RegistryError::HolderNotInExpectedSet(holder.clone()));
        }
        if failed_store {
            self.store_failures += 1;
        }
        Ok(())
    }

    /// Rejected unless the holder is currently offline; stale or duplicate
    /// churn signals must not corrupt the sets.
    pub(crate) fn set_holder_online(&mut self, holder: &HolderId) -> Result<(), RegistryError> {
        if !self.offline_holders.remove(holder) {
            return Err(RegistryError::HolderNotInExpectedSet(holder.clone()));
        }
        self.online_holders.insert(holder.clone());
        Ok(())
    }

    /// Rejected unless the holder is currently online.
    pub(crate) fn set_holder_offline(&mut self, holder: &HolderId) -> Result<(), RegistryError> {
        if !self.online_holders.remove(holder) {
            return Err(RegistryError::HolderNotInExpectedSet(holder.clone()));
        }
        self.offline_holders.insert(holder.clone());
        Ok(())
    }

    /// Canonical bytes. Only a complete record serializes: at least one
    /// subscriber, a non-zero size, and at least one holder.
    pub fn serialise(&self) -> Result<Vec<u8>, RegistryError> {
        if self.subscribers < 1 || self.size == 0 {
            return Err(RegistryError::IncompleteRecord);
        }
        if self.online_holders.is_empty() && self.offline_holders.is_empty() {
            return Err(RegistryError::IncompleteRecord);
        }

        let proto = ProtoReplicaRecord {
            subscribers: self.subscribers,
            size: self.size,
            store_failures: self.store_failures,
            online_holders: self.online_holders.iter().map(|h| h.as_str().to_string()).collect(),
            offline_holders: self.offline_holders.iter().map(|h| h.as_str().to_string()).collect(),
        };

        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("encoding into a Vec cannot fail");
        Ok(buf)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RegistryError> {
        let proto = ProtoReplicaRecord::decode(bytes).map_err(crate::wire::WireError::from)?;

        if proto.subscribers < 1 || proto.size == 0 {
            return Err(RegistryError::IncompleteRecord);
        }
        if proto.online_holders.is_empty() && proto.offline_holders.is_empty() {
            return Err(RegistryError::IncompleteRecord);
        }

        Ok(ReplicaRecord {
            subscribers: proto.subscribers,
            size: proto.size,
            store_failures: proto.store_failures,
            online_holders: proto.online_holders.into_iter().map(HolderId::new).collect(),
            offline_holders: proto.offline_holders.into_iter().map(HolderId::new).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn holders(names: &[&str]) -> BTreeSet<HolderId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn serialise_parse_round_trip() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1", "h2", "h3"]));
        record.increment_subscribers();
        record.increment_subscribers();
        record.set_holder_offline(&NodeId::new("h3")).unwrap();

        assert_eq!(3, record.subscribers());
        assert_eq!(2, record.online_holders().len());
        assert_eq!(1, record.offline_holders().len());

        let parsed = ReplicaRecord::parse(&record.serialise().unwrap()).unwrap();
        assert_eq!(record, parsed);
    }

    #[test]
    fn record_without_subscribers_does_not_serialise() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1"]));
        record.decrement_subscribers();
        match record.serialise() {
            Err(RegistryError::IncompleteRecord) => {}
            other => panic!("Expected IncompleteRecord, got {:?}", other),
        }
    }

    #[test]
    fn remove_holder_at_floor_is_rejected() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1", "h2", "h3", "h4"]));
        let before = record.clone();

        match record.remove_holder(&NodeId::new("h1"), false, 4) {
            Err(RegistryError::BelowReplicationFloor { floor: 4 }) => {}
            other => panic!("Expected BelowReplicationFloor, got {:?}", other),
        }
        assert_eq!(before, record);
    }

    #[test]
    fn remove_holder_above_floor_succeeds() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1", "h2", "h3", "h4", "h5"]));
        record.remove_holder(&NodeId::new("h1"), false, 4).unwrap();
        assert_eq!(4, record.all_holders().len());
        assert!(!record.holds(&NodeId::new("h1")));
    }

    #[test]
    fn failed_store_removal_counts_against_the_record() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1", "h2", "h3", "h4", "h5"]));
        record.remove_holder(&NodeId::new("h5"), true, 4).unwrap();
        assert_eq!(1, record.store_failures());
    }

    #[test]
    fn holder_transitions_require_the_expected_source_set() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1", "h2"]));

        // h1 is online, not offline.
        match record.set_holder_online(&NodeId::new("h1")) {
            Err(RegistryError::HolderNotInExpectedSet(_)) => {}
            other => panic!("Expected HolderNotInExpectedSet, got {:?}", other),
        }

        record.set_holder_offline(&NodeId::new("h1")).unwrap();
        assert!(record.offline_holders().contains(&NodeId::new("h1")));

        // Duplicate down signal for the same holder.
        match record.set_holder_offline(&NodeId::new("h1")) {
            Err(RegistryError::HolderNotInExpectedSet(_)) => {}
            other => panic!("Expected HolderNotInExpectedSet, got {:?}", other),
        }

        record.set_holder_online(&NodeId::new("h1")).unwrap();
        assert!(record.online_holders().contains(&NodeId::new("h1")));
    }

    #[test]
    fn add_holder_moves_an_offline_holder_back_online() {
        let mut record = ReplicaRecord::new(4096, holders(&["h1", "h2"]));
        record.set_holder_offline(&NodeId::new("h2")).unwrap();

        record.add_holder(NodeId::new("h2"));
        assert!(record.online_holders().contains(&NodeId::new("h2")));
        assert!(record.offline_holders().is_empty());
    }
}
