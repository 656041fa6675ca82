//! Member record and status

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Tag meta is capped at this many bytes on the wire.
pub const META_MAX_BYTES: usize = 512;

/// Protocol version tuple: (min, max, cur) accepted/spoken by a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersions {
    pub min: u8,
    pub max: u8,
    pub cur: u8,
}

/// Legal member statuses in the membership state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
    None,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Leaving => "leaving",
            Self::Left => "left",
            Self::Failed => "failed",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named cluster participant.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    /// Opaque meta bytes as last received on the wire, capped at
    /// [`META_MAX_BYTES`].
    pub meta: Vec<u8>,
    pub status: MemberStatus,
    pub transport_version: ProtocolVersions,
    pub app_version: ProtocolVersions,
    /// Lamport time of the last status change.
    pub status_ltime: u64,
    /// Wall-clock instant the member became Leaving/Failed/Left; `None`
    /// while Alive.
    pub leave_time: Option<Instant>,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            meta: Vec::new(),
            status: MemberStatus::Alive,
            transport_version: ProtocolVersions { min: 2, max: 5, cur: 5 },
            app_version: ProtocolVersions { min: 0, max: 1, cur: 1 },
            status_ltime: 0,
            leave_time: None,
        }
    }

    /// Decode the `tags` map carried inside `meta`: protocol ≤ 2 is the raw
    /// `role` tag bytes only, protocol ≥ 3 is `0xFF` followed by a
    /// bincode-encoded tag map.
    pub fn tags(&self) -> HashMap<String, String> {
        decode_tags(&self.meta, self.transport_version.cur)
    }
}

/// Encode a tag table the way `NodeMeta(limit)` must for the given
/// transport protocol version. Returns [`MeshError::SizeLimitExceeded`] if
/// the encoded form would exceed `limit` rather than silently truncating.
pub fn encode_node_meta(
    tags: &HashMap<String, String>,
    protocol: u8,
    limit: usize,
) -> Result<Vec<u8>> {
    let encoded = if protocol <= 2 {
        tags.get("role").cloned().unwrap_or_default().into_bytes()
    } else {
        let mut buf = vec![0xFFu8];
        let body = bincode::serialize(tags).map_err(|e| MeshError::Encode(e.to_string()))?;
        buf.extend_from_slice(&body);
        buf
    };

    if encoded.len() > limit {
        return Err(MeshError::SizeLimitExceeded {
            what: "node meta",
            size: encoded.len(),
            limit,
        });
    }
    Ok(encoded)
}

/// Inverse of [`encode_node_meta`], tolerant of malformed/empty input (a
/// member with unreadable meta simply has no tags, it is never fatal to the
/// receiver).
pub fn decode_tags(meta: &[u8], protocol: u8) -> HashMap<String, String> {
    if meta.is_empty() {
        return HashMap::new();
    }
    if protocol <= 2 {
        let mut map = HashMap::new();
        if let Ok(role) = std::str::from_utf8(meta) {
            if !role.is_empty() {
                map.insert("role".to_string(), role.to_string());
            }
        }
        return map;
    }
    match meta.split_first() {
        Some((0xFF, body)) => bincode::deserialize(body).unwrap_or_default(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn round_trips_modern_protocol_tags() {
        let t = tags(&[("role", "db"), ("az", "us-east-1a")]);
        let encoded = encode_node_meta(&t, 5, META_MAX_BYTES).unwrap();
        assert_eq!(encoded[0], 0xFF);
        let decoded = decode_tags(&encoded, 5);
        assert_eq!(decoded, t);
    }

    #[test]
    fn legacy_protocol_only_carries_role() {
        let t = tags(&[("role", "web"), ("az", "us-east-1a")]);
        let encoded = encode_node_meta(&t, 2, META_MAX_BYTES).unwrap();
        assert_eq!(encoded, b"web");
        let decoded = decode_tags(&encoded, 2);
        assert_eq!(decoded.get("role"), Some(&"web".to_string()));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn exceeding_limit_is_fatal_not_truncated() {
        let mut t = HashMap::new();
        t.insert("blob".to_string(), "x".repeat(600));
        let err = encode_node_meta(&t, 5, META_MAX_BYTES).unwrap_err();
        assert!(matches!(err, MeshError::SizeLimitExceeded { .. }));
    }

    #[test]
    fn malformed_meta_decodes_to_empty_tags() {
        assert!(decode_tags(&[0x01, 0x02], 5).is_empty());
        assert!(decode_tags(&[], 5).is_empty());
    }
}
