use crate::types::{NodeId, ObjectKey, Reply, ReplyChannel, RequestKey, RequestMessage};
use crate::wire::{
    decode_reply, encode_reply, ProtoHandledRequest, ProtoHandledRequestList, ProtoObjectKind, ProtoRequestAction,
    WireError,
};
use crate::types::{Identity, MessageId, ObjectKind, RequestAction};
use prost::Message;
use std::collections::VecDeque;

/// Accumulator deduplicates relayed copies of logical requests and replays
/// answers for requests it has already seen resolved.
///
/// Both queues are bounded; eviction is oldest-first and silent. Losing a
/// pending request is tolerated because the requester retries on timeout, and
/// losing a handled request merely means a repeat copy gets reprocessed.
pub struct Accumulator {
    logger: slog::Logger,
    pending_requests: VecDeque<PendingRequest>,
    handled_requests: VecDeque<HandledRequest>,
    max_pending_requests: usize,
    max_handled_requests: usize,
}

/// One relayed request copy waiting for the group to agree on an outcome.
#[derive(Debug)]
pub struct PendingRequest {
    pub msg: RequestMessage,
    pub reply_channel: ReplyChannel,
    pub proposed_reply: Reply,
}

/// A resolved request, retained so repeats can be answered without
/// recomputation.
#[derive(Clone, Debug, PartialEq)]
pub struct HandledRequest {
    pub message_id: MessageId,
    pub requester: NodeId,
    pub action: RequestAction,
    pub key: ObjectKey,
    pub size: u64,
    pub reply: Reply,
}

impl HandledRequest {
    fn request_key(&self) -> RequestKey {
        RequestKey {
            message_id: self.message_id,
            requester: self.requester.clone(),
            action: self.action,
        }
    }
}

/// Outcome of recording one request copy.
#[derive(Debug)]
pub enum PushOutcome {
    /// The request was already resolved; answer the copy immediately.
    AlreadyHandled { reply: Reply, channel: ReplyChannel },
    /// The copy is now pending. Carries every reply proposed so far for the
    /// same key (this copy's included) so the caller can decide whether
    /// enough matching copies have arrived to act.
    Accepted { proposed_replies: Vec<Reply> },
}

impl Accumulator {
    pub fn new(logger: slog::Logger, max_pending_requests: usize, max_handled_requests: usize) -> Self {
        Accumulator {
            logger,
            pending_requests: VecDeque::with_capacity(max_pending_requests),
            handled_requests: VecDeque::with_capacity(max_handled_requests),
            max_pending_requests,
            max_handled_requests,
        }
    }

    /// Records a new sighting of the request. See `PushOutcome`.
    pub fn push_request(
        &mut self,
        msg: RequestMessage,
        reply_channel: ReplyChannel,
        proposed_reply: Reply,
    ) -> PushOutcome {
        let key = msg.request_key();

        if let Some(reply) = self.check_handled(&key) {
            slog::debug!(self.logger, "Replaying handled reply for {:?}", key);
            return PushOutcome::AlreadyHandled {
                reply,
                channel: reply_channel,
            };
        }

        while self.pending_requests.len() >= self.max_pending_requests {
            // Oldest first, across all keys. The dropped reply channel means
            // that copy never gets answered; its requester retries.
            self.pending_requests.pop_front();
        }

        self.pending_requests.push_back(PendingRequest {
            msg,
            reply_channel,
            proposed_reply,
        });

        let proposed_replies = self
            .pending_requests
            .iter()
            .filter(|pending| pending.msg.request_key() == key)
            .map(|pending| pending.proposed_reply.clone())
            .collect();

        PushOutcome::Accepted { proposed_replies }
    }

    /// Marks the request as resolved and returns every pending copy sharing
    /// its key, so the caller can answer each exactly once with `final_reply`.
    pub fn set_handled(
        &mut self,
        key: &RequestKey,
        object: &ObjectKey,
        size: u64,
        final_reply: &Reply,
    ) -> Vec<PendingRequest> {
        let mut released = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending_requests.len());
        for pending in self.pending_requests.drain(..) {
            if pending.msg.request_key() == *key {
                released.push(pending);
            } else {
                kept.push_back(pending);
            }
        }
        self.pending_requests = kept;

        while self.handled_requests.len() >= self.max_handled_requests {
            self.handled_requests.pop_front();
        }
        self.handled_requests.push_back(HandledRequest {
            message_id: key.message_id,
            requester: key.requester.clone(),
            action: key.action,
            key: object.clone(),
            size,
            reply: final_reply.clone(),
        });

        released
    }

    /// Read-only lookup; does not mutate.
    pub fn check_handled(&self, key: &RequestKey) -> Option<Reply> {
        self.handled_requests
            .iter()
            .find(|handled| handled.request_key() == *key)
            .map(|handled| handled.reply.clone())
    }

    /// All handled requests originated by `requester`.
    pub fn handled_for(&self, requester: &NodeId) -> Vec<&HandledRequest> {
        self.handled_requests
            .iter()
            .filter(|handled| handled.requester == *requester)
            .collect()
    }

    /// Serializes `requester`'s handled requests for account transfer.
    pub fn serialise(&self, requester: &NodeId) -> Vec<u8> {
        let proto = ProtoHandledRequestList {
            requests: self
                .handled_for(requester)
                .into_iter()
                .map(handled_to_proto)
                .collect(),
        };

        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("encoding into a Vec cannot fail");
        buf
    }

    /// Parses a serialized handled-request list received in account transfer.
    pub fn parse(bytes: &[u8]) -> Result<Vec<HandledRequest>, WireError> {
        let proto = ProtoHandledRequestList::decode(bytes)?;
        proto.requests.into_iter().map(handled_from_proto).collect()
    }
}

fn handled_to_proto(handled: &HandledRequest) -> ProtoHandledRequest {
    let (reply_code, reply_content) = encode_reply(&handled.reply);
    let action = match handled.action {
        RequestAction::Put => ProtoRequestAction::Put,
        RequestAction::Get => ProtoRequestAction::Get,
        RequestAction::Delete => ProtoRequestAction::Delete,
    };

    ProtoHandledRequest {
        message_id: handled.message_id.as_u64(),
        requester: handled.requester.as_str().to_string(),
        action: action as i32,
        object_kind: crate::sync::object_kind_to_proto(handled.key.kind) as i32,
        object_name: handled.key.name.as_str().to_string(),
        size: handled.size,
        reply_code: reply_code as i32,
        reply_content,
    }
}

fn handled_from_proto(proto: ProtoHandledRequest) -> Result<HandledRequest, WireError> {
    let action = ProtoRequestAction::from_i32(proto.action).ok_or(WireError::UnknownDiscriminant {
        field: "action",
        value: proto.action,
    })?;
    let action = match action {
        ProtoRequestAction::Put => RequestAction::Put,
        ProtoRequestAction::Get => RequestAction::Get,
        ProtoRequestAction::Delete => RequestAction::Delete,
    };

    let object_kind = ProtoObjectKind::from_i32(proto.object_kind).ok_or(WireError::UnknownDiscriminant {
        field: "object_kind",
        value: proto.object_kind,
    })?;
    if proto.object_name.is_empty() {
        return Err(WireError::MissingField("object_name"));
    }
    if proto.requester.is_empty() {
        return Err(WireError::MissingField("requester"));
    }

    Ok(HandledRequest {
        message_id: MessageId::new(proto.message_id),
        requester: NodeId::new(proto.requester),
        action,
        key: ObjectKey::new(
            crate::sync::object_kind_from_proto(object_kind),
            Identity::new(proto.object_name),
        ),
        size: proto.size,
        reply: decode_reply(proto.reply_code, proto.reply_content)?,
    })
}
