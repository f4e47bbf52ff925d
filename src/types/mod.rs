use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;

/// NodeId identifies a peer on the overlay network.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(String);

impl NodeId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        NodeId(id.into())
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address this node occupies in the shared identifier space.
    pub fn as_identity(&self) -> Identity {
        Identity::new(self.0.clone())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node storing a physical replica of an object. Same identifier space as NodeId.
pub type HolderId = NodeId;

/// Identity is an address in the identifier space shared by nodes and objects.
/// Closeness between identities decides which group is responsible for what.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Identity(String);

impl Identity {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Identity(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MessageId is assigned by the original requester and shared by every relayed
/// copy of the same logical request.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(id: u64) -> Self {
        MessageId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of object-identity kinds this vault tracks.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ObjectKind {
    Immutable,
    Mutable,
    Directory,
}

/// ObjectKey names one tracked object.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub name: Identity,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, name: Identity) -> Self {
        ObjectKey { kind, name }
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?})", self.kind, self.name)
    }
}

/// Actions a requester can ask of this vault.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum RequestAction {
    Put,
    Get,
    Delete,
}

/// RequestKey identifies a logical request regardless of which peer relayed it.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct RequestKey {
    pub message_id: MessageId,
    pub requester: NodeId,
    pub action: RequestAction,
}

/// One relayed copy of a request.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestMessage {
    pub id: MessageId,
    pub requester: NodeId,
    pub action: RequestAction,
    pub key: ObjectKey,
    /// Chunk payload for Put; empty otherwise.
    pub content: Bytes,
}

impl RequestMessage {
    pub fn request_key(&self) -> RequestKey {
        RequestKey {
            message_id: self.id,
            requester: self.requester.clone(),
            action: self.action,
        }
    }
}

/// The single terminal reply a pending request receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Success,
    Data(Bytes),
    Failure(FailureCode),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureCode {
    SenderNotEligible,
    Malformed,
    NoSuchObject,
    StoreFailure,
    FetchFailure,
    BelowReplicationFloor,
    VaultUnavailable,
}

/// ReplyChannel delivers the terminal reply for one relayed request copy.
/// Sending ignores a dropped receiver; the requester applies its own timeout
/// and retry.
#[derive(Debug)]
pub struct ReplyChannel(oneshot::Sender<Reply>);

impl ReplyChannel {
    pub fn new() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (ReplyChannel(tx), rx)
    }

    pub fn send(self, reply: Reply) {
        let _ = self.0.send(reply);
    }
}
