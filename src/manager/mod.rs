mod manager;
mod messages;
mod timers;

pub use messages::ChunkRetrievedInput;
pub use messages::ChunkStoreFailedInput;
pub use messages::ChunkStoredInput;
pub use messages::GetExpiredInput;
pub use messages::RequestInput;
pub use messages::SyncInput;

pub(crate) use manager::sync_envelope;
pub(crate) use manager::ManagerConfig;
pub(crate) use manager::ManagerService;
pub(crate) use timers::SyncTimerHandle;
