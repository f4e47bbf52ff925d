use crate::manager::{
    ChunkRetrievedInput, ChunkStoreFailedInput, ChunkStoredInput, GetExpiredInput, ManagerService, RequestInput,
    SyncInput,
};
use crate::network::ChurnEvent;
use crate::registry::MetadataStore;
use crate::types::{FailureCode, NodeId, Reply, ReplyChannel};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Every message kind the manager handles. The event loop matches this
/// exhaustively, so adding a variant without a handler does not compile.
#[derive(Debug)]
enum Event {
    // A relayed request copy. The reply channel is parked in the accumulator
    // until the group agrees on an outcome (or the copy is evicted).
    Request(RequestInput, ReplyChannel),

    // A proposed mutation from a group peer.
    SyncReceived(SyncInput),

    // Holder store ack / failure reports.
    ChunkStored(ChunkStoredInput),
    ChunkStoreFailed(ChunkStoreFailedInput),

    // A chunk fetch completed (local cache or a holder).
    ChunkRetrieved(ChunkRetrievedInput),

    // A Get collation window closed.
    GetExpired(GetExpiredInput),

    // Group membership changed for our range.
    Churn(ChurnEvent),

    // Periodic sync maintenance tick.
    SyncTimer,

    // Serialized handled-request snapshot for account transfer.
    HandledSnapshot(NodeId, oneshot::Sender<Vec<u8>>),
}

/// Returned when the manager event loop has exited and can no longer be
/// reached.
pub(crate) struct ActorExited;

impl fmt::Debug for ActorExited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorExited")
    }
}

pub(crate) struct EventQueue(mpsc::Receiver<Event>);

/// ActorClient is the only way into the manager's state. Dropping every
/// strong client shuts the event loop down.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, EventQueue) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, EventQueue(rx))
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    /// Submits one request copy and waits for its terminal reply. A copy
    /// evicted under capacity pressure never resolves its channel; that
    /// surfaces here as VaultUnavailable and the requester retries.
    pub(crate) async fn request(&self, input: RequestInput) -> Reply {
        let (channel, rx) = ReplyChannel::new();
        if self.send(Event::Request(input, channel)).await.is_err() {
            return Reply::Failure(FailureCode::VaultUnavailable);
        }

        rx.await.unwrap_or(Reply::Failure(FailureCode::VaultUnavailable))
    }

    pub(crate) async fn sync_received(&self, input: SyncInput) {
        let _ = self.send(Event::SyncReceived(input)).await;
    }

    pub(crate) async fn chunk_stored(&self, input: ChunkStoredInput) {
        let _ = self.send(Event::ChunkStored(input)).await;
    }

    pub(crate) async fn chunk_store_failed(&self, input: ChunkStoreFailedInput) {
        let _ = self.send(Event::ChunkStoreFailed(input)).await;
    }

    pub(crate) async fn chunk_retrieved(&self, input: ChunkRetrievedInput) {
        let _ = self.send(Event::ChunkRetrieved(input)).await;
    }

    pub(crate) async fn churn(&self, event: ChurnEvent) {
        let _ = self.send(Event::Churn(event)).await;
    }

    pub(crate) async fn handled_snapshot(&self, requester: NodeId) -> Vec<u8> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::HandledSnapshot(requester, tx)).await.is_err() {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient is handed to the manager itself and to its spawned tasks,
/// so in-flight callbacks never keep the event loop alive on their own.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn chunk_retrieved(&self, input: ChunkRetrievedInput) -> Result<(), ActorExited> {
        self.send(Event::ChunkRetrieved(input)).await
    }

    pub(crate) async fn get_expired(&self, input: GetExpiredInput) -> Result<(), ActorExited> {
        self.send(Event::GetExpired(input)).await
    }

    pub(crate) async fn sync_timer(&self) -> Result<(), ActorExited> {
        self.send(Event::SyncTimer).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| ActorExited),
            None => Err(ActorExited),
        }
    }
}

/// ManagerActor runs the manager's event loop. It is the single
/// mutual-exclusion boundary around the accumulator, the resolution logs and
/// the registry; nothing else ever touches them.
pub(crate) struct ManagerActor<S: MetadataStore> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    manager: ManagerService<S>,
}

impl<S: MetadataStore> ManagerActor<S> {
    pub(crate) fn new(logger: slog::Logger, queue: EventQueue, manager: ManagerService<S>) -> Self {
        ManagerActor {
            logger,
            receiver: queue.0,
            manager,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Manager event loop has exited.");
    }

    // This must NOT be async. Any long running work must be spawned and come
    // back as a callback event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Request(input, reply_channel) => {
                self.manager.handle_request(input, reply_channel);
            }
            Event::SyncReceived(input) => {
                self.manager.handle_sync(input);
            }
            Event::ChunkStored(input) => {
                self.manager.handle_chunk_stored(input);
            }
            Event::ChunkStoreFailed(input) => {
                self.manager.handle_chunk_store_failed(input);
            }
            Event::ChunkRetrieved(input) => {
                self.manager.handle_chunk_retrieved(input);
            }
            Event::GetExpired(input) => {
                self.manager.handle_get_expired(input);
            }
            Event::Churn(event) => {
                self.manager.handle_churn(event);
            }
            Event::SyncTimer => {
                self.manager.handle_sync_timer();
            }
            Event::HandledSnapshot(requester, reply) => {
                let _ = reply.send(self.manager.handled_snapshot(&requester));
            }
        }
    }
}
