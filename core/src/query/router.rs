//! Internal-query router
//!
//! Reserved query names carry the prefix [`INTERNAL_PREFIX`]. Everything
//! else flows through to the user event channel unchanged — the router is
//! transparent for non-internal queries.

use crate::codec::ConflictResponseMessage;
use crate::keymanager::{KeyManager, NodeKeyResponse};
use crate::member::{Member, MemberStore};

/// Reserved-name prefix for internal queries.
pub const INTERNAL_PREFIX: &str = "_mesh_";

/// An internal query name, already stripped of [`INTERNAL_PREFIX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalQuery {
    Ping,
    Conflict,
    InstallKey,
    UseKey,
    RemoveKey,
    ListKeys,
}

impl InternalQuery {
    pub fn classify(name: &str) -> Option<Self> {
        let suffix = name.strip_prefix(INTERNAL_PREFIX)?;
        Some(match suffix {
            "ping" => Self::Ping,
            "conflict" => Self::Conflict,
            "install-key" => Self::InstallKey,
            "use-key" => Self::UseKey,
            "remove-key" => Self::RemoveKey,
            "list-keys" => Self::ListKeys,
            _ => return None,
        })
    }
}

/// What the caller should do with an internal query after routing it.
pub enum RouterOutcome {
    /// No response should be sent (ping, or a conflict query about an
    /// unknown/self name).
    NoResponse,
    /// Send this serialized body back to the origin.
    Respond(Vec<u8>),
}

/// Route an internal query. `self_name` is the local node's own name.
pub fn route(
    query: InternalQuery,
    payload: &[u8],
    self_name: &str,
    members: &MemberStore,
    keys: &KeyManager,
) -> RouterOutcome {
    match query {
        InternalQuery::Ping => RouterOutcome::NoResponse,
        InternalQuery::Conflict => route_conflict(payload, self_name, members),
        InternalQuery::InstallKey => {
            respond_key(keys.install(payload_as_key(payload)))
        }
        InternalQuery::UseKey => respond_key(keys.use_key(payload_as_key(payload))),
        InternalQuery::RemoveKey => respond_key(keys.remove(payload_as_key(payload))),
        InternalQuery::ListKeys => respond_key(keys.list()),
    }
}

fn payload_as_key(payload: &[u8]) -> &[u8] {
    payload
}

fn route_conflict(payload: &[u8], self_name: &str, members: &MemberStore) -> RouterOutcome {
    let name = match std::str::from_utf8(payload) {
        Ok(n) => n,
        Err(_) => return RouterOutcome::NoResponse,
    };
    if name == self_name {
        return RouterOutcome::NoResponse;
    }
    let Some(member) = members.get(name) else {
        return RouterOutcome::NoResponse;
    };
    let body = conflict_response_for(&member);
    match bincode::serialize(&body) {
        Ok(bytes) => RouterOutcome::Respond(bytes),
        Err(_) => RouterOutcome::NoResponse,
    }
}

fn conflict_response_for(member: &Member) -> ConflictResponseMessage {
    let ip = match member.addr.ip() {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    ConflictResponseMessage {
        name: member.name.clone(),
        addr_ip: ip,
        addr_port: member.addr.port(),
    }
}

fn respond_key(response: NodeKeyResponse) -> RouterOutcome {
    match bincode::serialize(&response) {
        Ok(bytes) => RouterOutcome::Respond(bytes),
        Err(_) => RouterOutcome::NoResponse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:7946".parse().unwrap()
    }

    #[test]
    fn classifies_reserved_names() {
        assert_eq!(
            InternalQuery::classify("_mesh_ping"),
            Some(InternalQuery::Ping)
        );
        assert_eq!(InternalQuery::classify("deploy"), None);
    }

    #[test]
    fn conflict_query_naming_self_gets_no_response() {
        let members = MemberStore::new("self", addr());
        let outcome = route_conflict(b"self", "self", &members);
        assert!(matches!(outcome, RouterOutcome::NoResponse));
    }

    #[test]
    fn conflict_query_for_unknown_name_gets_no_response() {
        let members = MemberStore::new("self", addr());
        let outcome = route_conflict(b"ghost", "self", &members);
        assert!(matches!(outcome, RouterOutcome::NoResponse));
    }

    #[test]
    fn conflict_query_for_known_name_responds_with_member_record() {
        let members = MemberStore::new("self", addr());
        members.handle_authoritative_join("peer", addr(), 0);
        let outcome = route_conflict(b"peer", "self", &members);
        assert!(matches!(outcome, RouterOutcome::Respond(_)));
    }
}
