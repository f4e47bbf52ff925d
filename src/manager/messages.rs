use crate::types::{HolderId, MessageId, NodeId, ObjectKey, RequestMessage};
use bytes::Bytes;

/// One relayed request copy, as delivered by the routing layer.
#[derive(Debug)]
pub struct RequestInput {
    /// The peer that relayed this copy to us (not the original requester).
    pub sender: NodeId,
    pub msg: RequestMessage,
}

/// A sync envelope from a group peer.
#[derive(Debug)]
pub struct SyncInput {
    pub sender: NodeId,
    pub envelope: Bytes,
}

/// A holder acknowledged storing a chunk.
#[derive(Debug)]
pub struct ChunkStoredInput {
    pub sender: NodeId,
    pub holder: HolderId,
    pub message_id: MessageId,
    pub key: ObjectKey,
    pub size: u64,
}

/// A holder reported that it failed to store a chunk.
#[derive(Debug)]
pub struct ChunkStoreFailedInput {
    pub sender: NodeId,
    pub holder: HolderId,
    pub message_id: MessageId,
    pub key: ObjectKey,
}

/// A chunk fetch completed. `holder` is None when the result came from the
/// local blob cache; `content` is None when the source did not have the chunk.
#[derive(Debug)]
pub struct ChunkRetrievedInput {
    pub message_id: MessageId,
    pub key: ObjectKey,
    pub holder: Option<HolderId>,
    pub content: Option<Bytes>,
}

/// The collation window for a Get closed without a usable response.
#[derive(Debug)]
pub struct GetExpiredInput {
    pub message_id: MessageId,
}
