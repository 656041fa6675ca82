//! Member table and state machine (component D)

mod store;
mod types;

pub use store::{IntentResult, MemberEventKind, MemberStore};
pub use types::{decode_tags, encode_node_meta, Member, MemberStatus, ProtocolVersions, META_MAX_BYTES};
