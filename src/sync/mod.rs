mod action;
mod resolution_log;

pub use action::MetadataAction;
pub use action::RequestOrigin;
pub use action::SyncActionKind;
pub use action::UnresolvedAction;

pub(crate) use action::object_kind_from_proto;
pub(crate) use action::object_kind_to_proto;
pub(crate) use action::sync_action_kind_from_proto;
pub(crate) use resolution_log::ResolutionLog;
