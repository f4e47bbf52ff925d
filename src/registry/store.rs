use crate::registry::record::ReplicaRecord;
use crate::registry::RegistryError;
use crate::types::ObjectKey;
use std::collections::HashMap;

/// MetadataStore is the transactional key-value seam backing the registry.
/// Each call is atomic per object key; the registry never holds state of its
/// own outside this store.
pub trait MetadataStore: Send + 'static {
    fn get(&self, key: &ObjectKey) -> Result<Option<ReplicaRecord>, RegistryError>;
    fn put(&mut self, key: &ObjectKey, record: &ReplicaRecord) -> Result<(), RegistryError>;
    fn remove(&mut self, key: &ObjectKey) -> Result<(), RegistryError>;
    fn keys(&self) -> Vec<ObjectKey>;
}

// We don't *need* to convert records to bytes here. We could hold them in
// memory as-is, but we want to exercise the conversion logic the same way a
// disk-backed store would.
pub struct InMemoryStore {
    records: HashMap<ObjectKey, Vec<u8>>,
}

impl InMemoryStore {
    pub fn create() -> Result<Self, RegistryError> {
        Ok(InMemoryStore {
            records: HashMap::new(),
        })
    }
}

impl MetadataStore for InMemoryStore {
    fn get(&self, key: &ObjectKey) -> Result<Option<ReplicaRecord>, RegistryError> {
        match self.records.get(key) {
            Some(bytes) => Ok(Some(ReplicaRecord::parse(bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &ObjectKey, record: &ReplicaRecord) -> Result<(), RegistryError> {
        let bytes = record.serialise()?;
        self.records.insert(key.clone(), bytes);
        Ok(())
    }

    fn remove(&mut self, key: &ObjectKey) -> Result<(), RegistryError> {
        self.records.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.records.keys().cloned().collect()
    }
}
