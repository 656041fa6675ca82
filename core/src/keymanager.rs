//! Cluster keyring management via internal queries
//!
//! The internal-query router sends `install-key`/`use-key`/`remove-key`/
//! `list-keys` here. Key operations over an un-encrypted cluster return
//! `NodeKeyResponse{result: false, ...}` per node, never an error.

use serde::{Deserialize, Serialize};

use parking_lot::RwLock;

/// Reply shape for every key-manager operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeKeyResponse {
    pub result: bool,
    pub message: String,
    pub keys: Option<Vec<String>>,
    pub primary_key: Option<String>,
}

impl NodeKeyResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            result: true,
            message: message.into(),
            keys: None,
            primary_key: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
            keys: None,
            primary_key: None,
        }
    }
}

struct Keyring {
    keys: Vec<Vec<u8>>,
}

impl Keyring {
    fn primary(&self) -> Option<&Vec<u8>> {
        self.keys.first()
    }
}

/// Per-node keyring. `None` means the cluster was started without
/// encryption enabled; every operation then short-circuits with
/// `result=false, message="encryption not enabled"`.
pub struct KeyManager {
    keyring: Option<RwLock<Keyring>>,
}

impl KeyManager {
    /// A node started without a primary encryption key.
    pub fn disabled() -> Self {
        Self { keyring: None }
    }

    /// A node started with encryption enabled, keyed by `primary_key`.
    pub fn enabled(primary_key: Vec<u8>) -> Self {
        Self {
            keyring: Some(RwLock::new(Keyring {
                keys: vec![primary_key],
            })),
        }
    }

    fn disabled_response() -> NodeKeyResponse {
        NodeKeyResponse::err("encryption not enabled")
    }

    pub fn install(&self, key: &[u8]) -> NodeKeyResponse {
        let Some(ring) = &self.keyring else {
            return Self::disabled_response();
        };
        let mut ring = ring.write();
        if ring.keys.iter().any(|k| k == key) {
            return NodeKeyResponse::ok("key already installed");
        }
        ring.keys.push(key.to_vec());
        NodeKeyResponse::ok("key installed")
    }

    pub fn use_key(&self, key: &[u8]) -> NodeKeyResponse {
        let Some(ring) = &self.keyring else {
            return Self::disabled_response();
        };
        let mut ring = ring.write();
        let Some(pos) = ring.keys.iter().position(|k| k == key) else {
            return NodeKeyResponse::err("key not in keyring");
        };
        ring.keys.swap(0, pos);
        NodeKeyResponse::ok("primary key changed")
    }

    pub fn remove(&self, key: &[u8]) -> NodeKeyResponse {
        let Some(ring) = &self.keyring else {
            return Self::disabled_response();
        };
        let mut ring = ring.write();
        if ring.primary().map(|p| p.as_slice()) == Some(key) {
            return NodeKeyResponse::err("cannot remove the primary key");
        }
        let before = ring.keys.len();
        ring.keys.retain(|k| k != key);
        if ring.keys.len() == before {
            return NodeKeyResponse::err("key not in keyring");
        }
        NodeKeyResponse::ok("key removed")
    }

    pub fn list(&self) -> NodeKeyResponse {
        let Some(ring) = &self.keyring else {
            return Self::disabled_response();
        };
        let ring = ring.read();
        let keys = ring
            .keys
            .iter()
            .map(|k| hex_encode(k))
            .collect::<Vec<_>>();
        let primary_key = ring.primary().map(|p| hex_encode(p));
        NodeKeyResponse {
            result: true,
            message: String::new(),
            keys: Some(keys),
            primary_key,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_keyring_always_returns_false() {
        let km = KeyManager::disabled();
        let resp = km.install(b"key");
        assert!(!resp.result);
        assert_eq!(resp.message, "encryption not enabled");
    }

    #[test]
    fn install_then_use_changes_primary() {
        let km = KeyManager::enabled(b"primary".to_vec());
        assert!(km.install(b"secondary").result);
        assert!(km.use_key(b"secondary").result);
        let listed = km.list();
        assert_eq!(listed.primary_key, Some(hex_encode(b"secondary")));
    }

    #[test]
    fn cannot_remove_primary_key() {
        let km = KeyManager::enabled(b"primary".to_vec());
        let resp = km.remove(b"primary");
        assert!(!resp.result);
    }
}
