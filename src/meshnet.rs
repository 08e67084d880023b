//! Meshnet membership control.
//!
//! Applies desired-state configs against the live peer set: peers absent from
//! the new config are disconnected first, new peers are connected, surviving
//! peers are reconfigured in place without dropping their session. Each live
//! peer gets a driver task that derives its connectivity state from transport
//! handshake age and reports transitions through the event bus.

use crate::config::MeshnetConfig;
use crate::error::EngineResult;
use crate::events::{Event, EventBus, LogLevel};
use crate::keys::PeerPublicKey;
use crate::transport::{PeerSpec, PeerState, Tunnel};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often a peer driver re-derives connectivity from transport stats.
const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Point-in-time status of one meshnet peer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PeerStatus {
    pub public_key: PeerPublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub state: PeerState,
    /// Milliseconds since the last completed handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_handshake_ms: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

struct PeerConnection {
    spec: PeerSpec,
    alias: Option<String>,
    state: PeerState,
    driver: Option<JoinHandle<()>>,
}

/// Read-only view of the live peer set.
///
/// Shared with controllers that touch the same transport peer namespace, so
/// they can tell a meshnet peer's transport entry from one of their own.
#[derive(Clone, Default)]
pub struct MeshnetRegistry {
    peers: Arc<DashMap<PeerPublicKey, PeerConnection>>,
}

impl MeshnetRegistry {
    /// The configured spec for a peer, if it is part of the meshnet.
    pub fn spec_of(&self, key: &PeerPublicKey) -> Option<PeerSpec> {
        self.peers.get(key).map(|entry| entry.spec.clone())
    }
}

/// Owns the live peer-connection set for one engine instance.
pub struct MeshnetController {
    tunnel: Arc<dyn Tunnel>,
    bus: EventBus,
    rt: tokio::runtime::Handle,
    peers: Arc<DashMap<PeerPublicKey, PeerConnection>>,
}

impl MeshnetController {
    pub fn new(tunnel: Arc<dyn Tunnel>, bus: EventBus, rt: tokio::runtime::Handle) -> Self {
        Self {
            tunnel,
            bus,
            rt,
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Whether any meshnet peers are currently configured.
    pub fn is_active(&self) -> bool {
        !self.peers.is_empty()
    }

    /// A shared read-only view of the live peer set.
    pub fn registry(&self) -> MeshnetRegistry {
        MeshnetRegistry {
            peers: self.peers.clone(),
        }
    }

    /// Apply a validated config against the current peer set.
    ///
    /// `specs` must come from [`MeshnetConfig::validate`] on the same config,
    /// so every failure mode left is a transport failure. On transport failure
    /// the already-applied steps are rolled back so the prior membership stays
    /// active.
    pub fn apply(&self, config: &MeshnetConfig, specs: Vec<PeerSpec>) -> EngineResult<()> {
        let new_keys: HashSet<PeerPublicKey> = specs.iter().map(|s| s.public_key).collect();
        let removed: Vec<PeerPublicKey> = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| !new_keys.contains(key))
            .collect();

        // Removals first, so a peer being replaced never coexists with its
        // successor in any observable snapshot.
        let mut removed_specs: Vec<(PeerSpec, Option<String>)> = Vec::new();
        for key in &removed {
            if let Some(conn) = self.teardown_peer(key)? {
                removed_specs.push(conn);
            }
        }

        let mut added: Vec<PeerPublicKey> = Vec::new();
        let mut replaced: Vec<(PeerSpec, Option<String>)> = Vec::new();
        for spec in specs {
            let alias = config.alias_of(&spec.public_key).map(str::to_owned);
            let result = match self.peers.get(&spec.public_key) {
                Some(existing) => {
                    // In-place reconfiguration keeps the session alive
                    let prior = (existing.spec.clone(), existing.alias.clone());
                    drop(existing);
                    match self.tunnel.upsert_peer(spec.clone()) {
                        Ok(()) => {
                            if let Some(mut entry) = self.peers.get_mut(&spec.public_key) {
                                entry.spec = spec.clone();
                                entry.alias = alias;
                            }
                            replaced.push(prior);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                None => match self.connect_peer(spec.clone(), alias) {
                    Ok(()) => {
                        added.push(spec.public_key);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };

            if let Err(e) = result {
                self.rollback(&added, &replaced, &removed_specs);
                return Err(e);
            }
        }

        log::info!(
            "Meshnet config applied: {} peers ({} removed)",
            new_keys.len(),
            removed.len()
        );
        Ok(())
    }

    /// Disconnect all peers. Idempotent.
    pub fn disconnect_all(&self) -> EngineResult<()> {
        let keys: Vec<PeerPublicKey> = self.peers.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.teardown_peer(&key)?;
        }
        Ok(())
    }

    /// Force every peer back through a handshake, e.g. after a key rotation
    /// or host network change, and announce the transition.
    pub fn reannounce(&self) {
        for mut entry in self.peers.iter_mut() {
            if entry.state != PeerState::Connecting {
                entry.state = PeerState::Connecting;
                self.bus.publish(Event::Peer {
                    public_key: *entry.key(),
                    state: PeerState::Connecting,
                });
            }
        }
    }

    /// Point-in-time statuses for all configured peers, sorted by key.
    pub fn statuses(&self) -> Vec<PeerStatus> {
        let mut statuses: Vec<PeerStatus> = self
            .peers
            .iter()
            .map(|entry| {
                let stats = self.tunnel.peer_stats(entry.key()).unwrap_or_default();
                PeerStatus {
                    public_key: *entry.key(),
                    alias: entry.alias.clone(),
                    state: entry.state,
                    last_handshake_ms: stats
                        .time_since_last_handshake
                        .map(|d| d.as_millis() as u64),
                    rx_bytes: stats.rx_bytes,
                    tx_bytes: stats.tx_bytes,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        statuses
    }

    fn connect_peer(&self, spec: PeerSpec, alias: Option<String>) -> EngineResult<()> {
        self.tunnel.upsert_peer(spec.clone())?;
        let key = spec.public_key;
        self.peers.insert(
            key,
            PeerConnection {
                spec,
                alias,
                state: PeerState::Connecting,
                driver: None,
            },
        );
        self.bus.publish(Event::Peer {
            public_key: key,
            state: PeerState::Connecting,
        });

        let driver = self.spawn_driver(key);
        if let Some(mut entry) = self.peers.get_mut(&key) {
            entry.driver = Some(driver);
        } else {
            // Peer was torn down between insert and driver registration
            driver.abort();
        }
        Ok(())
    }

    fn teardown_peer(
        &self,
        key: &PeerPublicKey,
    ) -> EngineResult<Option<(PeerSpec, Option<String>)>> {
        let Some((_, conn)) = self.peers.remove(key) else {
            return Ok(None);
        };
        if let Some(driver) = conn.driver {
            driver.abort();
        }
        self.tunnel.remove_peer(key)?;
        self.bus.publish(Event::Peer {
            public_key: *key,
            state: PeerState::Disconnected,
        });
        Ok(Some((conn.spec, conn.alias)))
    }

    /// Best-effort undo after a transport failure mid-apply, restoring the
    /// membership that was active before [`MeshnetController::apply`].
    fn rollback(
        &self,
        added: &[PeerPublicKey],
        replaced: &[(PeerSpec, Option<String>)],
        removed: &[(PeerSpec, Option<String>)],
    ) {
        self.bus.log(
            LogLevel::Warn,
            "Meshnet apply failed; restoring previous membership",
        );
        for key in added {
            if self.teardown_peer(key).is_err() {
                log::warn!("Rollback failed to remove peer {}", key);
            }
        }
        for (spec, alias) in replaced {
            if self.tunnel.upsert_peer(spec.clone()).is_ok() {
                // The map entry must match the reverted transport state
                if let Some(mut entry) = self.peers.get_mut(&spec.public_key) {
                    entry.spec = spec.clone();
                    entry.alias = alias.clone();
                }
            } else {
                log::warn!("Rollback failed to restore peer {}", spec.public_key);
            }
        }
        for (spec, alias) in removed {
            if self.connect_peer(spec.clone(), alias.clone()).is_err() {
                log::warn!("Rollback failed to reconnect peer {}", spec.public_key);
            }
        }
    }

    fn spawn_driver(&self, key: PeerPublicKey) -> JoinHandle<()> {
        let tunnel = self.tunnel.clone();
        let bus = self.bus.clone();
        let peers = self.peers.clone();
        self.rt.spawn(async move {
            loop {
                let Some(next) = tunnel.peer_stats(&key).map(|stats| stats.state()) else {
                    break;
                };
                let changed = match peers.get_mut(&key) {
                    Some(mut entry) => {
                        if entry.state != next {
                            entry.state = next;
                            true
                        } else {
                            false
                        }
                    }
                    None => break,
                };
                if changed {
                    bus.publish(Event::Peer {
                        public_key: key,
                        state: next,
                    });
                }
                tokio::time::sleep(DRIVER_POLL_INTERVAL).await;
            }
        })
    }
}

impl Drop for MeshnetController {
    fn drop(&mut self) {
        for mut entry in self.peers.iter_mut() {
            if let Some(driver) = entry.driver.take() {
                driver.abort();
            }
        }
    }
}
