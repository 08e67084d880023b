//! Exit-node (full tunnel) control.
//!
//! At most one exit node is active per engine. Connecting while one is active
//! first tears the old one down, and the disconnect event is published before
//! the new connect event, so observers never see two concurrent tunnels.

use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::keys::PeerPublicKey;
use crate::meshnet::MeshnetRegistry;
use crate::transport::{PeerSpec, PeerState, Tunnel};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often the exit driver re-derives connectivity from transport stats.
const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Point-in-time status of the active exit node.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExitNodeStatus {
    pub public_key: PeerPublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    pub state: PeerState,
}

struct ExitConnection {
    spec: PeerSpec,
    state: PeerState,
    driver: Option<JoinHandle<()>>,
}

/// Owns the single exit-node slot.
///
/// Shares the transport peer namespace with the meshnet: an exit node may
/// also be a configured meshnet peer, in which case teardown restores the
/// peer's meshnet spec instead of removing the transport entry.
pub struct ExitNodeController {
    tunnel: Arc<dyn Tunnel>,
    bus: EventBus,
    rt: tokio::runtime::Handle,
    meshnet: MeshnetRegistry,
    active: Arc<Mutex<Option<ExitConnection>>>,
}

impl ExitNodeController {
    pub fn new(
        tunnel: Arc<dyn Tunnel>,
        bus: EventBus,
        rt: tokio::runtime::Handle,
        meshnet: MeshnetRegistry,
    ) -> Self {
        Self {
            tunnel,
            bus,
            rt,
            meshnet,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Route all traffic through the given peer.
    ///
    /// Any previously active exit node is disconnected first; its disconnect
    /// event is ordered before the new node's connect event.
    pub fn connect(
        &self,
        public_key: PeerPublicKey,
        endpoint: Option<SocketAddr>,
        preshared_key: Option<[u8; 32]>,
    ) -> EngineResult<()> {
        let mut active = self.lock()?;
        if let Some(previous) = active.take() {
            self.teardown(previous)?;
        }

        let spec = PeerSpec {
            public_key,
            endpoint,
            // Full tunnel: the exit node may source any traffic
            allowed_ips: vec![
                "0.0.0.0/0".parse().unwrap_or_else(|_| unreachable!()),
                "::/0".parse().unwrap_or_else(|_| unreachable!()),
            ],
            preshared_key,
            persistent_keepalive: Some(25),
        };
        self.tunnel.upsert_peer(spec.clone())?;
        *active = Some(ExitConnection {
            spec,
            state: PeerState::Connecting,
            driver: None,
        });
        self.bus.publish(Event::ExitNode {
            public_key,
            state: PeerState::Connecting,
        });

        let driver = self.spawn_driver(public_key);
        if let Some(conn) = active.as_mut() {
            conn.driver = Some(driver);
        }
        log::info!("Exit node {} connecting", public_key);
        Ok(())
    }

    /// Disconnect the active exit node identified by `public_key`.
    ///
    /// Fails when the key does not match the active node: the caller's view
    /// of the slot is stale and deserves a report rather than silence.
    pub fn disconnect(&self, public_key: &PeerPublicKey) -> EngineResult<()> {
        let mut active = self.lock()?;
        match active.as_ref() {
            Some(conn) if conn.spec.public_key == *public_key => {
                let conn = active.take().unwrap_or_else(|| unreachable!());
                self.teardown(conn)
            }
            Some(conn) => Err(EngineError::ExitNode(format!(
                "Active exit node is {}, not {}",
                conn.spec.public_key, public_key
            ))),
            None => Err(EngineError::ExitNode(format!(
                "No active exit node to disconnect: {}",
                public_key
            ))),
        }
    }

    /// Disconnect whatever exit node is active. Idempotent; used on shutdown.
    pub fn disconnect_all(&self) -> EngineResult<()> {
        let mut active = self.lock()?;
        if let Some(conn) = active.take() {
            self.teardown(conn)?;
        }
        Ok(())
    }

    /// Status of the active exit node, if any.
    pub fn status(&self) -> Option<ExitNodeStatus> {
        let active = self.active.lock().ok()?;
        active.as_ref().map(|conn| ExitNodeStatus {
            public_key: conn.spec.public_key,
            endpoint: conn.spec.endpoint,
            state: conn.state,
        })
    }

    /// Mark the active exit node as reconnecting, e.g. after a key rotation
    /// or host network change.
    pub fn reannounce(&self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(conn) = active.as_mut() {
                if conn.state != PeerState::Connecting {
                    conn.state = PeerState::Connecting;
                    self.bus.publish(Event::ExitNode {
                        public_key: conn.spec.public_key,
                        state: PeerState::Connecting,
                    });
                }
            }
        }
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, Option<ExitConnection>>> {
        self.active.lock().map_err(|_| EngineError::Lock)
    }

    fn teardown(&self, conn: ExitConnection) -> EngineResult<()> {
        if let Some(driver) = conn.driver {
            driver.abort();
        }
        let key = conn.spec.public_key;
        match self.meshnet.spec_of(&key) {
            // Shared key: the transport entry belongs to the meshnet peer,
            // so hand it back instead of removing it
            Some(spec) => self.tunnel.upsert_peer(spec)?,
            None => self.tunnel.remove_peer(&key)?,
        }
        self.bus.publish(Event::ExitNode {
            public_key: key,
            state: PeerState::Disconnected,
        });
        log::info!("Exit node {} disconnected", key);
        Ok(())
    }

    fn spawn_driver(&self, key: PeerPublicKey) -> JoinHandle<()> {
        let tunnel = self.tunnel.clone();
        let bus = self.bus.clone();
        let active = self.active.clone();
        self.rt.spawn(async move {
            loop {
                let Some(next) = tunnel.peer_stats(&key).map(|stats| stats.state()) else {
                    break;
                };
                let changed = match active.lock() {
                    Ok(mut guard) => match guard.as_mut() {
                        Some(conn) if conn.spec.public_key == key => {
                            if conn.state != next {
                                conn.state = next;
                                true
                            } else {
                                false
                            }
                        }
                        _ => break,
                    },
                    Err(_) => break,
                };
                if changed {
                    bus.publish(Event::ExitNode {
                        public_key: key,
                        state: next,
                    });
                }
                tokio::time::sleep(DRIVER_POLL_INTERVAL).await;
            }
        })
    }
}

impl Drop for ExitNodeController {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(conn) = active.as_mut() {
                if let Some(driver) = conn.driver.take() {
                    driver.abort();
                }
            }
        }
    }
}
