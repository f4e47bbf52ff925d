mod accumulator;
mod actor;
mod api;
mod manager;
mod network;
mod registry;
mod sync;
mod types;
mod wire;

pub use accumulator::Accumulator;
pub use accumulator::HandledRequest;
pub use accumulator::PendingRequest;
pub use accumulator::PushOutcome;
pub use api::try_create_vault;
pub use api::Vault;
pub use api::VaultConfig;
pub use api::VaultCreationError;
pub use api::VaultOptions;
pub use manager::ChunkRetrievedInput;
pub use manager::ChunkStoreFailedInput;
pub use manager::ChunkStoredInput;
pub use manager::GetExpiredInput;
pub use manager::RequestInput;
pub use manager::SyncInput;
pub use network::BlobStore;
pub use network::BlobStoreError;
pub use network::ChurnEvent;
pub use network::PeerMessage;
pub use network::Routing;
pub use network::RoutingError;
pub use network::Target;
pub use registry::CommitOutcome;
pub use registry::InMemoryStore;
pub use registry::MetadataStore;
pub use registry::Registry;
pub use registry::RegistryError;
pub use registry::ReplicaRecord;
pub use sync::MetadataAction;
pub use sync::RequestOrigin;
pub use sync::SyncActionKind;
pub use sync::UnresolvedAction;
pub use types::FailureCode;
pub use types::HolderId;
pub use types::Identity;
pub use types::MessageId;
pub use types::NodeId;
pub use types::ObjectKey;
pub use types::ObjectKind;
pub use types::Reply;
pub use types::ReplyChannel;
pub use types::RequestAction;
pub use types::RequestKey;
pub use types::RequestMessage;
pub use wire::ProtoSync;
pub use wire::WireError;
