//! Hand-written protobuf messages for everything that leaves this node or
//! touches the metadata store. Encoding must be canonical: every repeated
//! identity field is populated from a sorted set, so two peers encoding the
//! same logical value produce byte-identical output.

use crate::types::{FailureCode, Reply};
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to decode protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("unknown {field} discriminant: {value}")]
    UnknownDiscriminant { field: &'static str, value: i32 },

    #[error("required field {0} is empty")]
    MissingField(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ProtoObjectKind {
    Immutable = 0,
    Mutable = 1,
    Directory = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ProtoActionKind {
    Put = 0,
    Delete = 1,
    AddHolder = 2,
    RemoveHolder = 3,
    HolderUp = 4,
    HolderDown = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ProtoRequestAction {
    Put = 0,
    Get = 1,
    Delete = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ProtoReplyCode {
    Success = 0,
    Data = 1,
    SenderNotEligible = 2,
    Malformed = 3,
    NoSuchObject = 4,
    StoreFailure = 5,
    FetchFailure = 6,
    BelowReplicationFloor = 7,
    VaultUnavailable = 8,
}

/// The sync envelope exchanged between group members.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoSync {
    #[prost(enumeration = "ProtoActionKind", tag = "1")]
    pub action_kind: i32,
    #[prost(bytes, tag = "2")]
    pub serialised_unresolved_action: Vec<u8>,
    #[prost(string, tag = "3")]
    pub sender_id: String,
}

/// One proposed mutation, minus the endorsement set (which is local state and
/// never exchanged).
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoUnresolvedAction {
    #[prost(enumeration = "ProtoObjectKind", tag = "1")]
    pub object_kind: i32,
    #[prost(string, tag = "2")]
    pub object_name: String,
    #[prost(enumeration = "ProtoActionKind", tag = "3")]
    pub action_kind: i32,
    /// Put only.
    #[prost(uint64, tag = "4")]
    pub size: u64,
    /// Put only; sorted.
    #[prost(string, repeated, tag = "5")]
    pub holders: Vec<String>,
    /// AddHolder / RemoveHolder / HolderUp / HolderDown only.
    #[prost(string, tag = "6")]
    pub holder: String,
    /// RemoveHolder only.
    #[prost(bool, tag = "7")]
    pub failed_store: bool,
    /// 0 when the action has no originating request.
    #[prost(uint64, tag = "8")]
    pub origin_message_id: u64,
    /// Empty when the action has no originating request.
    #[prost(string, tag = "9")]
    pub origin_requester: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoReplicaRecord {
    #[prost(int64, tag = "1")]
    pub subscribers: i64,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    #[prost(uint32, tag = "3")]
    pub store_failures: u32,
    /// Sorted.
    #[prost(string, repeated, tag = "4")]
    pub online_holders: Vec<String>,
    /// Sorted.
    #[prost(string, repeated, tag = "5")]
    pub offline_holders: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoHandledRequest {
    #[prost(uint64, tag = "1")]
    pub message_id: u64,
    #[prost(string, tag = "2")]
    pub requester: String,
    #[prost(enumeration = "ProtoRequestAction", tag = "3")]
    pub action: i32,
    #[prost(enumeration = "ProtoObjectKind", tag = "4")]
    pub object_kind: i32,
    #[prost(string, tag = "5")]
    pub object_name: String,
    #[prost(uint64, tag = "6")]
    pub size: u64,
    #[prost(enumeration = "ProtoReplyCode", tag = "7")]
    pub reply_code: i32,
    #[prost(bytes, tag = "8")]
    pub reply_content: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoHandledRequestList {
    #[prost(message, repeated, tag = "1")]
    pub requests: Vec<ProtoHandledRequest>,
}

pub fn encode_reply(reply: &Reply) -> (ProtoReplyCode, Vec<u8>) {
    match reply {
        Reply::Success => (ProtoReplyCode::Success, Vec::new()),
        Reply::Data(content) => (ProtoReplyCode::Data, content.to_vec()),
        Reply::Failure(FailureCode::SenderNotEligible) => (ProtoReplyCode::SenderNotEligible, Vec::new()),
        Reply::Failure(FailureCode::Malformed) => (ProtoReplyCode::Malformed, Vec::new()),
        Reply::Failure(FailureCode::NoSuchObject) => (ProtoReplyCode::NoSuchObject, Vec::new()),
        Reply::Failure(FailureCode::StoreFailure) => (ProtoReplyCode::StoreFailure, Vec::new()),
        Reply::Failure(FailureCode::FetchFailure) => (ProtoReplyCode::FetchFailure, Vec::new()),
        Reply::Failure(FailureCode::BelowReplicationFloor) => (ProtoReplyCode::BelowReplicationFloor, Vec::new()),
        Reply::Failure(FailureCode::VaultUnavailable) => (ProtoReplyCode::VaultUnavailable, Vec::new()),
    }
}

pub fn decode_reply(code: i32, content: Vec<u8>) -> Result<Reply, WireError> {
    let code = ProtoReplyCode::from_i32(code).ok_or(WireError::UnknownDiscriminant {
        field: "reply_code",
        value: code,
    })?;

    let reply = match code {
        ProtoReplyCode::Success => Reply::Success,
        ProtoReplyCode::Data => Reply::Data(Bytes::from(content)),
        ProtoReplyCode::SenderNotEligible => Reply::Failure(FailureCode::SenderNotEligible),
        ProtoReplyCode::Malformed => Reply::Failure(FailureCode::Malformed),
        ProtoReplyCode::NoSuchObject => Reply::Failure(FailureCode::NoSuchObject),
        ProtoReplyCode::StoreFailure => Reply::Failure(FailureCode::StoreFailure),
        ProtoReplyCode::FetchFailure => Reply::Failure(FailureCode::FetchFailure),
        ProtoReplyCode::BelowReplicationFloor => Reply::Failure(FailureCode::BelowReplicationFloor),
        ProtoReplyCode::VaultUnavailable => Reply::Failure(FailureCode::VaultUnavailable),
    };

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn reply_code_round_trip() {
        let replies = vec![
            Reply::Success,
            Reply::Data(Bytes::from_static(b"chunk")),
            Reply::Failure(FailureCode::SenderNotEligible),
            Reply::Failure(FailureCode::Malformed),
            Reply::Failure(FailureCode::NoSuchObject),
            Reply::Failure(FailureCode::StoreFailure),
            Reply::Failure(FailureCode::FetchFailure),
            Reply::Failure(FailureCode::BelowReplicationFloor),
            Reply::Failure(FailureCode::VaultUnavailable),
        ];

        for reply in replies {
            let (code, content) = encode_reply(&reply);
            assert_eq!(reply, decode_reply(code as i32, content).unwrap());
        }
    }

    #[test]
    fn unknown_reply_code_is_rejected() {
        match decode_reply(99, Vec::new()) {
            Err(WireError::UnknownDiscriminant { field, value }) => {
                assert_eq!(field, "reply_code");
                assert_eq!(value, 99);
            }
            other => panic!("Expected UnknownDiscriminant, got {:?}", other),
        }
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let garbage: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF];
        assert!(ProtoSync::decode(garbage).is_err());
    }
}
