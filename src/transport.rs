//! Tunnel transport seam.
//!
//! Packet-level cryptography and forwarding are delegated to a [`Tunnel`]
//! implementation; the engine only manages the device configuration and the
//! declarative peer set, mirroring the WireGuard cross-platform device model
//! (private key + peer list keyed by public key, connectivity judged from
//! handshake age).

use crate::error::{EngineError, EngineResult};
use crate::keys::PeerPublicKey;
use crate::protect::{ProtectedUdp, SocketPool};
use dashmap::DashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// WireGuard paper 6.1: a session is rejected once no handshake has completed
// for Reject-After-Time. Canonical implementations add a third of a second of
// rekey jitter, so the connected/connecting judgement uses the padded bound.
const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
const REKEY_TIMEOUT_JITTER: Duration = Duration::from_millis(334);

/// Connectivity state of a tunnel peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Device-level tunnel configuration.
#[derive(Clone)]
pub struct DeviceConfig {
    /// The device's x25519 secret key.
    pub private_key: [u8; 32],
    /// UDP listen port, or None for an ephemeral port.
    pub listen_port: Option<u16>,
    /// Firewall mark for control traffic (0 when unused).
    pub fwmark: u32,
}

/// Desired state for one tunnel peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    /// The peer's primary identifier.
    pub public_key: PeerPublicKey,
    /// Remote endpoint, when known.
    pub endpoint: Option<SocketAddr>,
    /// Traffic the peer is allowed to source.
    pub allowed_ips: Vec<IpNet>,
    /// Optional pre-shared key mixed into the handshake.
    pub preshared_key: Option<[u8; 32]>,
    /// Keepalive interval in seconds.
    pub persistent_keepalive: Option<u32>,
}

/// Runtime counters for one tunnel peer.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Time since the last completed handshake; None before the first one.
    pub time_since_last_handshake: Option<Duration>,
}

impl PeerStats {
    /// Whether the peer currently holds a live session.
    pub fn connected(&self) -> bool {
        self.time_since_last_handshake
            .map_or(false, |d| d < REJECT_AFTER_TIME + REKEY_TIMEOUT_JITTER)
    }

    /// Derive the reported peer state from the session age.
    pub fn state(&self) -> PeerState {
        if self.connected() {
            PeerState::Connected
        } else {
            PeerState::Connecting
        }
    }
}

/// The transport the engine drives.
///
/// All methods are short state mutations; long-running handshake work happens
/// inside the implementation, observable through [`Tunnel::peer_stats`].
pub trait Tunnel: Send + Sync {
    /// Apply device configuration (key, port). Replaces any previous one and
    /// forces all peers to re-handshake under the new identity.
    fn set_device(&self, config: DeviceConfig) -> EngineResult<()>;

    /// Tear down the device and all peers.
    fn clear_device(&self) -> EngineResult<()>;

    /// Add a peer or reconfigure an existing one in place.
    fn upsert_peer(&self, spec: PeerSpec) -> EngineResult<()>;

    /// Remove a peer. Removing an absent peer is a no-op.
    fn remove_peer(&self, key: &PeerPublicKey) -> EngineResult<()>;

    /// Runtime counters for a peer, or None when unknown.
    fn peer_stats(&self, key: &PeerPublicKey) -> Option<PeerStats>;

    /// Re-evaluate reachability after a host network change: rebind the
    /// control socket and trigger re-handshakes.
    fn refresh(&self) -> EngineResult<()>;
}

struct TunnelPeer {
    spec: PeerSpec,
    last_handshake: Instant,
}

/// In-process transport used by tests and as the default collaborator.
///
/// Sessions "handshake" instantly; connectivity judgement still goes through
/// the same handshake-age rule real transports are held to.
pub struct InMemoryTunnel {
    pool: SocketPool,
    device: Mutex<Option<(DeviceConfig, ProtectedUdp)>>,
    peers: DashMap<PeerPublicKey, TunnelPeer>,
}

impl InMemoryTunnel {
    pub fn new(pool: SocketPool) -> Self {
        Self {
            pool,
            device: Mutex::new(None),
            peers: DashMap::new(),
        }
    }

    fn device_lock(
        &self,
    ) -> EngineResult<std::sync::MutexGuard<'_, Option<(DeviceConfig, ProtectedUdp)>>> {
        self.device
            .lock()
            .map_err(|_| EngineError::transport("Tunnel device state poisoned"))
    }
}

impl Tunnel for InMemoryTunnel {
    fn set_device(&self, config: DeviceConfig) -> EngineResult<()> {
        let socket = self
            .pool
            .new_external_udp()
            .map_err(|e| EngineError::transport(format!("Failed to bind control socket: {}", e)))?;
        let mut device = self.device_lock()?;
        let rekey = device.is_some();
        *device = Some((config, socket));
        drop(device);

        if rekey {
            // New identity invalidates existing sessions
            let now = Instant::now();
            for mut peer in self.peers.iter_mut() {
                peer.last_handshake = now;
            }
        }
        Ok(())
    }

    fn clear_device(&self) -> EngineResult<()> {
        *self.device_lock()? = None;
        self.peers.clear();
        Ok(())
    }

    fn upsert_peer(&self, spec: PeerSpec) -> EngineResult<()> {
        if self.device_lock()?.is_none() {
            return Err(EngineError::transport("Device not configured"));
        }
        match self.peers.get_mut(&spec.public_key) {
            Some(mut existing) => {
                // Attribute-only change keeps the session alive
                existing.spec = spec;
            }
            None => {
                self.peers.insert(
                    spec.public_key,
                    TunnelPeer {
                        spec,
                        last_handshake: Instant::now(),
                    },
                );
            }
        }
        Ok(())
    }

    fn remove_peer(&self, key: &PeerPublicKey) -> EngineResult<()> {
        self.peers.remove(key);
        Ok(())
    }

    fn peer_stats(&self, key: &PeerPublicKey) -> Option<PeerStats> {
        self.peers.get(key).map(|peer| PeerStats {
            rx_bytes: 0,
            tx_bytes: 0,
            time_since_last_handshake: Some(peer.last_handshake.elapsed()),
        })
    }

    fn refresh(&self) -> EngineResult<()> {
        let socket = self
            .pool
            .new_external_udp()
            .map_err(|e| EngineError::transport(format!("Failed to rebind control socket: {}", e)))?;
        let mut device = self.device_lock()?;
        if let Some((config, old_socket)) = device.take() {
            *device = Some((config, socket));
            drop(old_socket);
        }
        drop(device);

        let now = Instant::now();
        for mut peer in self.peers.iter_mut() {
            peer.last_handshake = now;
        }
        Ok(())
    }
}
