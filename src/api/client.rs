use crate::actor::ActorClient;
use crate::manager::{
    ChunkRetrievedInput, ChunkStoreFailedInput, ChunkStoredInput, RequestInput, SyncInput, SyncTimerHandle,
};
use crate::network::ChurnEvent;
use crate::types::{NodeId, Reply};

/// Vault is the inbound surface of one running manager persona. The external
/// routing layer feeds received messages and churn notifications through
/// these methods; everything else happens inside the manager actor.
///
/// Dropping the Vault shuts the event loop and its timers down.
pub struct Vault {
    actor_client: ActorClient,
    _sync_timer: SyncTimerHandle,
}

impl Vault {
    pub(crate) fn new(actor_client: ActorClient, sync_timer: SyncTimerHandle) -> Self {
        Vault {
            actor_client,
            _sync_timer: sync_timer,
        }
    }

    /// Submits one relayed request copy and waits for its terminal reply.
    /// Exactly one reply per copy; a copy evicted under capacity pressure
    /// resolves as VaultUnavailable and the requester retries.
    pub async fn handle_request(&self, input: RequestInput) -> Reply {
        self.actor_client.request(input).await
    }

    /// Feeds a sync envelope received from a group peer.
    pub async fn handle_sync(&self, input: SyncInput) {
        self.actor_client.sync_received(input).await
    }

    /// Feeds a holder's store acknowledgement.
    pub async fn handle_chunk_stored(&self, input: ChunkStoredInput) {
        self.actor_client.chunk_stored(input).await
    }

    /// Feeds a holder's store failure report.
    pub async fn handle_chunk_store_failed(&self, input: ChunkStoreFailedInput) {
        self.actor_client.chunk_store_failed(input).await
    }

    /// Feeds a holder's response to a chunk retrieval.
    pub async fn handle_chunk_retrieved(&self, input: ChunkRetrievedInput) {
        self.actor_client.chunk_retrieved(input).await
    }

    /// Feeds a group-membership change notification for this node's range.
    pub async fn handle_churn(&self, event: ChurnEvent) {
        self.actor_client.churn(event).await
    }

    /// Serialized handled-request snapshot for `requester`, for account
    /// transfer to an incoming group member.
    pub async fn handled_request_snapshot(&self, requester: NodeId) -> Vec<u8> {
        self.actor_client.handled_snapshot(requester).await
    }
}
