//! Content hashes for configuration maps.

use sha2::{Digest, Sha256};

use crate::protocol::{AgentConfigMap, AgentRemoteConfig, EffectiveConfig};

/// SHA-256 over a canonical encoding of the map.
///
/// Files are visited in name order; each contributes its name, content type
/// and length-prefixed body so that no two distinct maps share an encoding.
#[must_use]
pub fn config_map_hash(map: &AgentConfigMap) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for (name, file) in &map.config_map {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((file.content_type.len() as u64).to_be_bytes());
        hasher.update(file.content_type.as_bytes());
        hasher.update((file.body.len() as u64).to_be_bytes());
        hasher.update(&file.body);
    }
    hasher.finalize().to_vec()
}

impl EffectiveConfig {
    /// Wrap a config map, deriving its hash.
    #[must_use]
    pub fn new(config_map: AgentConfigMap) -> Self {
        let hash = config_map_hash(&config_map);
        Self { config_map, hash }
    }

    /// Recompute the hash from the content, discarding whatever was there.
    pub fn rehash(&mut self) {
        self.hash = config_map_hash(&self.config_map);
    }

    /// Hex rendering of the hash, for logs.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl AgentRemoteConfig {
    /// Build a remote config whose hash is derived from its content.
    #[must_use]
    pub fn new(config: AgentConfigMap) -> Self {
        let config_hash = config_map_hash(&config);
        Self {
            config,
            config_hash,
        }
    }
}
