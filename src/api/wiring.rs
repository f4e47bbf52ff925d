use crate::actor::{ActorClient, ManagerActor};
use crate::api::client::Vault;
use crate::api::options::{VaultOptions, VaultOptionsValidated};
use crate::manager::{ManagerConfig, ManagerService, SyncTimerHandle};
use crate::network::{BlobStore, Routing};
use crate::registry::{InMemoryStore, RegistryError};
use crate::types::NodeId;
use std::convert::TryFrom;
use std::sync::Arc;

pub struct VaultConfig {
    pub my_node_id: String,
    // A directory where the metadata store can create files and
    // sub-directories.
    pub storage_root: String,
    pub info_logger: slog::Logger,
    pub options: VaultOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum VaultCreationError {
    #[error("Illegal options for configuring vault: {0}")]
    IllegalOptions(String),
    #[error("Metadata store initialization failure: {0}")]
    StoreInitialization(RegistryError),
}

pub async fn try_create_vault(
    config: VaultConfig,
    routing: Arc<dyn Routing>,
    blob_store: Arc<dyn BlobStore>,
) -> Result<Vault, VaultCreationError> {
    let root_logger = config.info_logger;

    let options =
        VaultOptionsValidated::try_from(config.options).map_err(|e| VaultCreationError::IllegalOptions(e.to_string()))?;

    let metadata_store = InMemoryStore::create().map_err(VaultCreationError::StoreInitialization)?;

    let (actor_client, actor_queue_rx) = ActorClient::new(32);

    let manager = ManagerService::new(ManagerConfig {
        logger: root_logger.clone(),
        my_node_id: NodeId::new(config.my_node_id),
        routing,
        blob_store,
        metadata_store,
        actor_client: actor_client.weak(),
        max_pending_requests: options.max_pending_requests,
        max_handled_requests: options.max_handled_requests,
        group_size: options.group_size,
        replication_floor: options.replication_floor,
        max_sync_attempts: options.max_sync_attempts,
        get_collation_timeout: options.get_collation_timeout,
    });

    let manager_actor = ManagerActor::new(root_logger.clone(), actor_queue_rx, manager);
    tokio::spawn(manager_actor.run_event_loop());

    let sync_timer = SyncTimerHandle::spawn_timer_task(options.sync_period, actor_client.weak());

    Ok(Vault::new(actor_client, sync_timer))
}
