//! Wire envelope and structured body serialization
//!
//! `NotifyMsg(bytes)` hands the core a byte buffer whose first byte is a
//! type tag; the remaining bytes are a bincode-encoded body specific to that
//! tag. `GetBroadcasts` produces the same framing in reverse.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Message type tag, the first byte of every `NotifyMsg` buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Leave = 0,
    Join = 1,
    PushPull = 2,
    UserEvent = 3,
    Query = 4,
    QueryResponse = 5,
    ConflictResponse = 6,
    KeyRequest = 7,
    KeyResponse = 8,
    Relay = 9,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Leave,
            1 => Self::Join,
            2 => Self::PushPull,
            3 => Self::UserEvent,
            4 => Self::Query,
            5 => Self::QueryResponse,
            6 => Self::ConflictResponse,
            7 => Self::KeyRequest,
            8 => Self::KeyResponse,
            9 => Self::Relay,
            other => {
                return Err(MeshError::Decode(format!("unknown message type tag {other}")))
            }
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A decoded `{type, body}` pair, prior to body deserialization.
pub struct Envelope {
    pub kind: MessageType,
    pub body: Vec<u8>,
}

/// Split the first byte off an inbound buffer and classify it.
pub fn decode_envelope(buf: &[u8]) -> Result<Envelope> {
    let (&tag, body) = buf
        .split_first()
        .ok_or_else(|| MeshError::Decode("empty message buffer".into()))?;
    Ok(Envelope {
        kind: MessageType::from_tag(tag)?,
        body: body.to_vec(),
    })
}

/// Serialize a typed body and prefix it with its type tag.
pub fn encode_envelope<T: Serialize>(kind: MessageType, body: &T) -> Result<Vec<u8>> {
    let mut buf = vec![kind.tag()];
    bincode::serialize_into(&mut buf, body).map_err(|e| MeshError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    bincode::deserialize(body).map_err(|e| MeshError::Decode(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveMessage {
    pub name: String,
    pub ltime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMessage {
    pub name: String,
    pub ltime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventMessage {
    pub name: String,
    pub payload: Vec<u8>,
    pub ltime: u64,
    pub coalesce: bool,
}

/// A query filter. Filter types: 0 = node-list, 1 = tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Filter {
    NodeList(Vec<String>),
    Tag { name: String, regex: String },
}

impl Filter {
    /// Whether a node with the given name and tags passes this filter: a
    /// query only runs against nodes whose name is in every node-list
    /// filter and whose tags match every tag filter. A malformed regex
    /// never matches rather than panicking.
    pub fn matches(&self, node_name: &str, tags: &std::collections::HashMap<String, String>) -> bool {
        match self {
            Filter::NodeList(names) => names.iter().any(|n| n == node_name),
            Filter::Tag { name, regex } => match (tags.get(name), regex::Regex::new(regex)) {
                (Some(value), Ok(re)) => re.is_match(value),
                _ => false,
            },
        }
    }
}

/// A node matches a query iff it passes every filter attached to it
/// (empty filter list always matches).
pub fn filters_match(filters: &[Filter], node_name: &str, tags: &std::collections::HashMap<String, String>) -> bool {
    filters.iter().all(|f| f.matches(node_name, tags))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMessage {
    pub id: u64,
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub deadline_unix_ms: u64,
    pub ack: bool,
    pub no_broadcast: bool,
    pub relay_factor: u8,
    pub filters: Vec<Filter>,
    pub from_ip: Vec<u8>,
    pub from_port: u16,
}

impl QueryMessage {
    pub fn from_addr(&self) -> Result<SocketAddr> {
        decode_addr(&self.from_ip, self.from_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponseMessage {
    pub id: u64,
    pub from_ip: Vec<u8>,
    pub from_port: u16,
    pub payload: Vec<u8>,
    pub ack: bool,
}

impl QueryResponseMessage {
    pub fn from_addr(&self) -> Result<SocketAddr> {
        decode_addr(&self.from_ip, self.from_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponseMessage {
    pub name: String,
    pub addr_ip: Vec<u8>,
    pub addr_port: u16,
}

impl ConflictResponseMessage {
    pub fn addr(&self) -> Result<SocketAddr> {
        decode_addr(&self.addr_ip, self.addr_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOperation {
    Install,
    Use,
    Remove,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestMessage {
    pub operation: KeyOperation,
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponseMessage {
    pub result: bool,
    pub message: String,
    pub keys: Option<Vec<String>>,
    pub primary_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullBody {
    pub status_ltime: u64,
    pub member_clocks: Vec<(String, u64)>,
    pub left_members: Vec<String>,
    pub event_ltime: u64,
    pub recent_events: Vec<UserEventMessage>,
    pub query_ltime: u64,
}

/// Header prefixed to a relayed query response: `{dest-addr, dest-name}`
/// followed by the inner envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHeader {
    pub dest_ip: Vec<u8>,
    pub dest_port: u16,
    pub dest_name: String,
}

/// Wrap an already-encoded envelope in a relay header addressed to `dest`.
pub fn encode_relay(dest: SocketAddr, dest_name: &str, inner: Vec<u8>) -> Result<Vec<u8>> {
    let header = RelayHeader {
        dest_ip: encode_ip(dest.ip()),
        dest_port: dest.port(),
        dest_name: dest_name.to_string(),
    };
    let mut buf = vec![MessageType::Relay.tag()];
    bincode::serialize_into(&mut buf, &header).map_err(|e| MeshError::Encode(e.to_string()))?;
    buf.extend_from_slice(&inner);
    Ok(buf)
}

/// Split a decoded relay body into its header and the still-encoded inner
/// envelope. The caller re-decodes the inner envelope with
/// [`decode_envelope`].
pub fn decode_relay(body: &[u8]) -> Result<(RelayHeader, Vec<u8>)> {
    let mut cursor = std::io::Cursor::new(body);
    let header: RelayHeader =
        bincode::deserialize_from(&mut cursor).map_err(|e| MeshError::Decode(e.to_string()))?;
    let used = cursor.position() as usize;
    Ok((header, body[used..].to_vec()))
}

pub(crate) fn encode_ip(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn decode_addr(ip: &[u8], port: u16) -> Result<SocketAddr> {
    let ip = match ip.len() {
        4 => IpAddr::from(<[u8; 4]>::try_from(ip).unwrap()),
        16 => IpAddr::from(<[u8; 16]>::try_from(ip).unwrap()),
        other => {
            return Err(MeshError::Decode(format!(
                "invalid address length {other}"
            )))
        }
    };
    Ok(SocketAddr::new(ip, port))
}

impl RelayHeader {
    pub fn dest_addr(&self) -> Result<SocketAddr> {
        decode_addr(&self.dest_ip, self.dest_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_leave_message() {
        let msg = LeaveMessage {
            name: "node-1".into(),
            ltime: 42,
        };
        let encoded = encode_envelope(MessageType::Leave, &msg).unwrap();
        assert_eq!(encoded[0], MessageType::Leave.tag());
        let envelope = decode_envelope(&encoded).unwrap();
        assert_eq!(envelope.kind, MessageType::Leave);
        let decoded: LeaveMessage = decode_body(&envelope.body).unwrap();
        assert_eq!(decoded.name, "node-1");
        assert_eq!(decoded.ltime, 42);
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let buf = vec![200u8, 1, 2, 3];
        let err = decode_envelope(&buf).unwrap_err();
        assert!(matches!(err, MeshError::Decode(_)));
    }

    #[test]
    fn empty_buffer_is_a_decode_error() {
        assert!(decode_envelope(&[]).is_err());
    }

    #[test]
    fn relay_envelope_round_trips_header_and_inner() {
        let inner = encode_envelope(
            MessageType::QueryResponse,
            &QueryResponseMessage {
                id: 7,
                from_ip: vec![127, 0, 0, 1],
                from_port: 7946,
                payload: b"pong".to_vec(),
                ack: false,
            },
        )
        .unwrap();
        let dest: SocketAddr = "10.0.0.5:7946".parse().unwrap();
        let relayed = encode_relay(dest, "origin", inner.clone()).unwrap();
        let envelope = decode_envelope(&relayed).unwrap();
        assert_eq!(envelope.kind, MessageType::Relay);
        let (header, remaining) = decode_relay(&envelope.body).unwrap();
        assert_eq!(header.dest_addr().unwrap(), dest);
        assert_eq!(header.dest_name, "origin");
        assert_eq!(remaining, inner);
    }

    #[test]
    fn node_list_filter_matches_only_listed_names() {
        let filter = Filter::NodeList(vec!["web-1".into(), "web-2".into()]);
        let tags = std::collections::HashMap::new();
        assert!(filter.matches("web-1", &tags));
        assert!(!filter.matches("db-1", &tags));
    }

    #[test]
    fn tag_filter_matches_by_regex_against_named_tag() {
        let filter = Filter::Tag {
            name: "role".into(),
            regex: "^db".into(),
        };
        let mut tags = std::collections::HashMap::new();
        tags.insert("role".to_string(), "db-primary".to_string());
        assert!(filter.matches("n1", &tags));

        tags.insert("role".to_string(), "web".to_string());
        assert!(!filter.matches("n1", &tags));
    }

    #[test]
    fn missing_tag_never_matches() {
        let filter = Filter::Tag {
            name: "role".into(),
            regex: ".*".into(),
        };
        assert!(!filter.matches("n1", &std::collections::HashMap::new()));
    }

    #[test]
    fn empty_filter_list_always_matches() {
        assert!(filters_match(&[], "anything", &std::collections::HashMap::new()));
    }
}
