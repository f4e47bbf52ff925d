use crate::types::{Identity, MessageId, NodeId, ObjectKey};
use bytes::Bytes;

/// Messages this vault sends to other nodes. The routing layer owns envelope
/// encoding and delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerMessage {
    /// Ask a holder to store a chunk.
    StoreChunk {
        id: MessageId,
        key: ObjectKey,
        content: Bytes,
    },
    /// Ask a holder for a chunk.
    RetrieveChunk { id: MessageId, key: ObjectKey },
    /// Ask a holder to drop its replica.
    DeleteChunk { id: MessageId, key: ObjectKey },
    /// A proposed mutation for the group. See `ProtoSync`.
    Sync { envelope: Bytes },
}

/// Where a `PeerMessage` goes: a single node, or every member of the group
/// currently closest to an address.
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    Node(NodeId),
    Group(Identity),
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no route to target: {0}")]
    NoRoute(String),

    #[error("routing layer failure: {0}")]
    Internal(String),
}

/// Routing is the external transport and group-membership collaborator. It
/// delivers messages, answers connectivity and closeness queries, and feeds
/// churn notifications back through the vault's inbound surface.
#[async_trait::async_trait]
pub trait Routing: Send + Sync + 'static {
    async fn send(&self, target: Target, message: PeerMessage) -> Result<(), RoutingError>;

    fn is_connected(&self, node: &NodeId) -> bool;

    /// Whether `node` is likely a member of the group closest to `reference`.
    fn estimate_in_group(&self, node: &NodeId, reference: &Identity) -> bool;

    /// The nodes currently closest to `reference`, closest first. Every group
    /// member sharing this routing view computes the same answer.
    fn close_group(&self, reference: &Identity) -> Vec<NodeId>;
}

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("chunk not found")]
    NotFound,

    #[error("blob store failure: {0}")]
    Internal(String),
}

/// BlobStore is the external content-addressed chunk store collaborator. It
/// is bounded by its own configured capacity and owns its eviction policy.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn store(&self, key: &ObjectKey, content: Bytes) -> Result<(), BlobStoreError>;

    async fn get(&self, key: &ObjectKey) -> Result<Bytes, BlobStoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), BlobStoreError>;
}

/// A group-membership change affecting this node's range.
#[derive(Clone, Debug, PartialEq)]
pub struct ChurnEvent {
    /// Peers that left the network or our group view.
    pub lost_peers: Vec<NodeId>,
    /// Peers that joined or reconnected.
    pub gained_peers: Vec<NodeId>,
}
