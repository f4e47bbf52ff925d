use crate::actor::WeakActorClient;
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// SyncTimerHandle drives the periodic sync maintenance tick. The task exits
/// on its own once the handle is dropped or the manager actor has gone away.
pub(crate) struct SyncTimerHandle {
    _shared: Arc<()>,
}

impl SyncTimerHandle {
    pub(crate) fn spawn_timer_task(period: Duration, actor_client: WeakActorClient) -> Self {
        let shared = Arc::new(());
        let weak_shared = Arc::downgrade(&shared);
        tokio::task::spawn(Self::run(period, weak_shared, actor_client));

        SyncTimerHandle { _shared: shared }
    }

    async fn run(period: Duration, weak_shared: Weak<()>, actor_client: WeakActorClient) {
        loop {
            tokio::time::sleep(period).await;

            if weak_shared.upgrade().is_none() {
                // The handle has dropped; the vault is shutting down.
                return;
            }
            if actor_client.sync_timer().await.is_err() {
                return;
            }
        }
    }
}
