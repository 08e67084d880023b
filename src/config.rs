//! Meshnet configuration types.
//!
//! JSON enters the engine only through [`MeshnetConfig::from_json`]; from that
//! point on controllers work with typed structs. Validation is strictly
//! separated from application: a config that fails here has touched no peer.

use crate::error::{EngineError, EngineResult};
use crate::keys::PeerPublicKey;
use crate::transport::PeerSpec;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// One peer entry in the desired meshnet membership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// The peer's public key; unique within one config.
    pub public_key: PeerPublicKey,

    /// Human-readable alias for status output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Remote endpoint, when known ahead of discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,

    /// Networks this peer is allowed to source traffic from.
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,

    /// Whether the peer may initiate traffic to this device. When false the
    /// connection is kept but no inbound networks are admitted.
    #[serde(default = "default_allow_incoming")]
    pub allow_incoming_connections: bool,

    /// Keepalive interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u32>,
}

fn default_allow_incoming() -> bool {
    true
}

/// Desired meshnet membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MeshnetConfig {
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl MeshnetConfig {
    /// Parse a config from its JSON wire form.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::bad_config_with_source("Malformed meshnet config", e))
    }

    /// Validate the config and lower it to per-peer tunnel specs.
    ///
    /// Checks the whole config before returning anything, so a failure here
    /// guarantees no partial application.
    pub fn validate(&self, own_public: &PeerPublicKey) -> EngineResult<Vec<PeerSpec>> {
        let mut seen: HashSet<PeerPublicKey> = HashSet::with_capacity(self.peers.len());
        let mut specs = Vec::with_capacity(self.peers.len());

        for peer in &self.peers {
            if peer.public_key == *own_public {
                return Err(EngineError::bad_config(format!(
                    "Config contains this device's own key: {}",
                    peer.public_key
                )));
            }
            if !seen.insert(peer.public_key) {
                return Err(EngineError::bad_config(format!(
                    "Duplicate peer key: {}",
                    peer.public_key
                )));
            }

            let allowed_ips = if peer.allow_incoming_connections {
                peer.allowed_ips.clone()
            } else {
                Vec::new()
            };
            specs.push(PeerSpec {
                public_key: peer.public_key,
                endpoint: peer.endpoint,
                allowed_ips,
                preshared_key: None,
                persistent_keepalive: peer.persistent_keepalive,
            });
        }

        Ok(specs)
    }

    /// Alias lookup for status output.
    pub fn alias_of(&self, key: &PeerPublicKey) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.public_key == *key)
            .and_then(|p| p.alias.as_deref())
    }
}
