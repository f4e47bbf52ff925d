use crate::types::{HolderId, Identity, MessageId, NodeId, ObjectKey, ObjectKind};
use crate::wire::{ProtoActionKind, ProtoObjectKind, ProtoUnresolvedAction, WireError};
use prost::Message;
use std::collections::BTreeSet;
use std::fmt;

/// The closed set of registry mutations group members agree on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataAction {
    /// First occurrence creates the record; repeats add one subscriber.
    Put {
        size: u64,
        holders: BTreeSet<HolderId>,
    },
    /// Removes one subscriber; the record is retracted when none remain.
    Delete,
    AddHolder(HolderId),
    RemoveHolder {
        holder: HolderId,
        /// Set when the removal was triggered by a failed store report.
        failed_store: bool,
    },
    HolderUp(HolderId),
    HolderDown(HolderId),
}

impl MetadataAction {
    pub fn kind(&self) -> SyncActionKind {
        match self {
            MetadataAction::Put { .. } => SyncActionKind::Put,
            MetadataAction::Delete => SyncActionKind::Delete,
            MetadataAction::AddHolder(_) => SyncActionKind::AddHolder,
            MetadataAction::RemoveHolder { .. } => SyncActionKind::RemoveHolder,
            MetadataAction::HolderUp(_) => SyncActionKind::HolderUp,
            MetadataAction::HolderDown(_) => SyncActionKind::HolderDown,
        }
    }
}

/// Discriminant used to route a sync envelope to its resolution log.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum SyncActionKind {
    Put,
    Delete,
    AddHolder,
    RemoveHolder,
    HolderUp,
    HolderDown,
}

impl fmt::Display for SyncActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The request a proposed mutation answers once resolved. Present for
/// Put/Delete proposals; holder and churn proposals have no requester.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestOrigin {
    pub message_id: MessageId,
    pub requester: NodeId,
}

/// A proposed mutation as exchanged between group members. Structural
/// equality of two UnresolvedActions is what merges endorsements, so every
/// field must be derived from facts all honest members observe identically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedAction {
    pub key: ObjectKey,
    pub action: MetadataAction,
    pub origin: Option<RequestOrigin>,
}

impl UnresolvedAction {
    /// Canonical bytes; identical input values always produce identical output.
    pub fn serialise(&self) -> Vec<u8> {
        let mut proto = ProtoUnresolvedAction {
            object_kind: object_kind_to_proto(self.key.kind) as i32,
            object_name: self.key.name.as_str().to_string(),
            action_kind: ProtoActionKind::from(self.action.kind()) as i32,
            size: 0,
            holders: Vec::new(),
            holder: String::new(),
            failed_store: false,
            origin_message_id: 0,
            origin_requester: String::new(),
        };

        match &self.action {
            MetadataAction::Put { size, holders } => {
                proto.size = *size;
                // BTreeSet iteration keeps the encoding canonical.
                proto.holders = holders.iter().map(|h| h.as_str().to_string()).collect();
            }
            MetadataAction::Delete => {}
            MetadataAction::AddHolder(holder)
            | MetadataAction::HolderUp(holder)
            | MetadataAction::HolderDown(holder) => {
                proto.holder = holder.as_str().to_string();
            }
            MetadataAction::RemoveHolder { holder, failed_store } => {
                proto.holder = holder.as_str().to_string();
                proto.failed_store = *failed_store;
            }
        }

        if let Some(origin) = &self.origin {
            proto.origin_message_id = origin.message_id.as_u64();
            proto.origin_requester = origin.requester.as_str().to_string();
        }

        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("encoding into a Vec cannot fail");
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let proto = ProtoUnresolvedAction::decode(bytes)?;

        let kind = ProtoObjectKind::from_i32(proto.object_kind).ok_or(WireError::UnknownDiscriminant {
            field: "object_kind",
            value: proto.object_kind,
        })?;
        if proto.object_name.is_empty() {
            return Err(WireError::MissingField("object_name"));
        }
        let key = ObjectKey::new(object_kind_from_proto(kind), Identity::new(proto.object_name));

        let action_kind = ProtoActionKind::from_i32(proto.action_kind).ok_or(WireError::UnknownDiscriminant {
            field: "action_kind",
            value: proto.action_kind,
        })?;

        let holder = |name: String| -> Result<HolderId, WireError> {
            if name.is_empty() {
                return Err(WireError::MissingField("holder"));
            }
            Ok(NodeId::new(name))
        };

        let action = match action_kind {
            ProtoActionKind::Put => MetadataAction::Put {
                size: proto.size,
                holders: proto.holders.into_iter().map(NodeId::new).collect(),
            },
            ProtoActionKind::Delete => MetadataAction::Delete,
            ProtoActionKind::AddHolder => MetadataAction::AddHolder(holder(proto.holder)?),
            ProtoActionKind::RemoveHolder => MetadataAction::RemoveHolder {
                holder: holder(proto.holder)?,
                failed_store: proto.failed_store,
            },
            ProtoActionKind::HolderUp => MetadataAction::HolderUp(holder(proto.holder)?),
            ProtoActionKind::HolderDown => MetadataAction::HolderDown(holder(proto.holder)?),
        };

        let origin = if proto.origin_message_id == 0 && proto.origin_requester.is_empty() {
            None
        } else if proto.origin_requester.is_empty() {
            return Err(WireError::MissingField("origin_requester"));
        } else {
            Some(RequestOrigin {
                message_id: MessageId::new(proto.origin_message_id),
                requester: NodeId::new(proto.origin_requester),
            })
        };

        Ok(UnresolvedAction { key, action, origin })
    }
}

impl From<SyncActionKind> for ProtoActionKind {
    fn from(kind: SyncActionKind) -> Self {
        match kind {
            SyncActionKind::Put => ProtoActionKind::Put,
            SyncActionKind::Delete => ProtoActionKind::Delete,
            SyncActionKind::AddHolder => ProtoActionKind::AddHolder,
            SyncActionKind::RemoveHolder => ProtoActionKind::RemoveHolder,
            SyncActionKind::HolderUp => ProtoActionKind::HolderUp,
            SyncActionKind::HolderDown => ProtoActionKind::HolderDown,
        }
    }
}

pub(crate) fn sync_action_kind_from_proto(kind: ProtoActionKind) -> SyncActionKind {
    match kind {
        ProtoActionKind::Put => SyncActionKind::Put,
        ProtoActionKind::Delete => SyncActionKind::Delete,
        ProtoActionKind::AddHolder => SyncActionKind::AddHolder,
        ProtoActionKind::RemoveHolder => SyncActionKind::RemoveHolder,
        ProtoActionKind::HolderUp => SyncActionKind::HolderUp,
        ProtoActionKind::HolderDown => SyncActionKind::HolderDown,
    }
}

pub(crate) fn object_kind_to_proto(kind: ObjectKind) -> ProtoObjectKind {
    match kind {
        ObjectKind::Immutable => ProtoObjectKind::Immutable,
        ObjectKind::Mutable => ProtoObjectKind::Mutable,
        ObjectKind::Directory => ProtoObjectKind::Directory,
    }
}

pub(crate) fn object_kind_from_proto(kind: ProtoObjectKind) -> ObjectKind {
    match kind {
        ProtoObjectKind::Immutable => ObjectKind::Immutable,
        ProtoObjectKind::Mutable => ObjectKind::Mutable,
        ProtoObjectKind::Directory => ObjectKind::Directory,
    }
}
