//! The node engine: one logical device, orchestrating adapter, identity,
//! meshnet, exit node, and DNS under a single serialization point.
//!
//! Mutating operations acquire the engine write lock with `try_write` and
//! reject on contention (reported as a retryable lock error); `stop` is the
//! exception and blocks until any in-flight operation reaches a terminal
//! outcome, so teardown never observes a half-constructed adapter. Status
//! reads take the read lock and stay concurrent with each other.

use crate::adapter::{AdapterFactory, AdapterKind, AdapterManager, InProcessAdapterFactory};
use crate::config::MeshnetConfig;
use crate::dns::{DnsController, DnsStatus};
use crate::error::{EngineError, EngineResult};
use crate::events::{AdapterState, Event, EventBus, EventCallback, LogCallback, LogLevel};
use crate::exit_node::{ExitNodeController, ExitNodeStatus};
use crate::keys::{KeyPair, PeerPublicKey};
use crate::meshnet::{MeshnetController, PeerStatus};
use crate::protect::{NoopProtector, Protector, SocketPool};
use crate::transport::{DeviceConfig, InMemoryTunnel, Tunnel};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Uninitialized,
    Started,
    Stopped,
}

/// Adapter fields exposed in status output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdapterStatus {
    pub kind: AdapterKind,
    pub name: String,
    pub luid: u64,
}

/// Point-in-time aggregate of the whole engine.
///
/// Rebuilt from authoritative controller state on every read; never mutated
/// independently.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PeerPublicKey>,
    pub peers: Vec<PeerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_node: Option<ExitNodeStatus>,
    pub dns: DnsStatus,
}

struct EngineState {
    run: RunState,
    identity: Option<KeyPair>,
    adapter: AdapterManager,
    meshnet: MeshnetController,
    exit: ExitNodeController,
    dns: DnsController,
}

/// The control engine behind the external binding surface.
pub struct NodeEngine {
    rt: tokio::runtime::Runtime,
    bus: EventBus,
    tunnel: Arc<dyn Tunnel>,
    state: RwLock<EngineState>,
}

/// Builder for [`NodeEngine`], following the collaborator-injection seams:
/// observer, logger, protector, adapter factory, and tunnel transport.
pub struct NodeEngineBuilder {
    observer: Option<Arc<dyn EventCallback>>,
    logger: Option<Arc<dyn LogCallback>>,
    protector: Arc<dyn Protector>,
    factory: Arc<dyn AdapterFactory>,
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl NodeEngineBuilder {
    pub fn new() -> Self {
        Self {
            observer: None,
            logger: None,
            protector: Arc::new(NoopProtector),
            factory: Arc::new(InProcessAdapterFactory),
            tunnel: None,
        }
    }

    /// Set the lifecycle event observer.
    pub fn observer(mut self, observer: Arc<dyn EventCallback>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Set the logger callback.
    pub fn logger(mut self, logger: Arc<dyn LogCallback>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Set the socket protector.
    pub fn protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.protector = protector;
        self
    }

    /// Set the adapter factory.
    pub fn adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Set the tunnel transport.
    pub fn tunnel(mut self, tunnel: Arc<dyn Tunnel>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Build the engine and start its internal runtime.
    pub fn build(self) -> EngineResult<NodeEngine> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("meshvpn-engine")
            .enable_all()
            .build()?;

        let bus = EventBus::spawn(rt.handle());
        if let Some(observer) = self.observer {
            bus.subscribe(observer);
        }
        if let Some(logger) = self.logger {
            bus.subscribe_logger(logger);
        }

        let pool = SocketPool::new(self.protector);
        let tunnel: Arc<dyn Tunnel> = match self.tunnel {
            Some(tunnel) => tunnel,
            None => Arc::new(InMemoryTunnel::new(pool)),
        };

        let meshnet = MeshnetController::new(tunnel.clone(), bus.clone(), rt.handle().clone());
        let exit = ExitNodeController::new(
            tunnel.clone(),
            bus.clone(),
            rt.handle().clone(),
            meshnet.registry(),
        );
        let state = EngineState {
            run: RunState::Uninitialized,
            identity: None,
            adapter: AdapterManager::new(self.factory),
            meshnet,
            exit,
            dns: DnsController::new(bus.clone()),
        };

        Ok(NodeEngine {
            rt,
            bus,
            tunnel,
            state: RwLock::new(state),
        })
    }
}

impl Default for NodeEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum StartMode<'a> {
    Named(Option<&'a str>),
    Tun(i32),
}

impl NodeEngine {
    pub fn builder() -> NodeEngineBuilder {
        NodeEngineBuilder::new()
    }

    /// The event bus; exposed so the owner can replace callbacks.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Bring the device up with a system-assigned adapter name.
    pub fn start(&self, identity: KeyPair, kind: AdapterKind) -> EngineResult<()> {
        self.start_inner(identity, kind, StartMode::Named(None))
    }

    /// Bring the device up with an explicit adapter name.
    pub fn start_named(&self, identity: KeyPair, kind: AdapterKind, name: &str) -> EngineResult<()> {
        self.start_inner(identity, kind, StartMode::Named(Some(name)))
    }

    /// Bring the device up on a tun descriptor the host already opened.
    pub fn start_with_tun(
        &self,
        identity: KeyPair,
        kind: AdapterKind,
        tun_fd: i32,
    ) -> EngineResult<()> {
        self.start_inner(identity, kind, StartMode::Tun(tun_fd))
    }

    fn start_inner(&self, identity: KeyPair, kind: AdapterKind, mode: StartMode) -> EngineResult<()> {
        let mut state = self.write()?;
        if state.run == RunState::Started {
            return Err(EngineError::AlreadyStarted);
        }

        let handle = match mode {
            StartMode::Named(name) => state.adapter.create(kind, name)?.clone(),
            StartMode::Tun(fd) => state.adapter.adopt(kind, fd)?.clone(),
        };

        if let Err(e) = self.tunnel.set_device(DeviceConfig {
            private_key: identity.secret_bytes(),
            listen_port: None,
            fwmark: 0,
        }) {
            // Never leave a half-configured device behind
            if let Err(destroy_err) = state.adapter.destroy() {
                log::warn!("Adapter cleanup after failed start: {}", destroy_err);
            }
            return Err(e);
        }

        state.identity = Some(identity);
        state.run = RunState::Started;
        self.bus.publish(Event::Adapter {
            state: AdapterState::Up,
            name: handle.name.clone(),
            luid: handle.luid,
        });
        self.bus
            .log(LogLevel::Info, format!("Device started on {}", handle.name));
        Ok(())
    }

    /// Tear the device down.
    ///
    /// Blocks behind any in-flight mutating operation instead of rejecting,
    /// then tears down exit node, meshnet, DNS, transport, and adapter in
    /// reverse construction order. Every step is best-effort: a failure is
    /// logged and teardown continues, since partial cleanup beats none.
    /// Stopping a never-started or already-stopped engine is a no-op.
    pub fn stop(&self) -> EngineResult<()> {
        {
            let mut state = self.state.write().map_err(|_| EngineError::Lock)?;
            if state.run != RunState::Started {
                return Ok(());
            }

            if let Err(e) = state.exit.disconnect_all() {
                log::warn!("Exit-node teardown during stop: {}", e);
            }
            if let Err(e) = state.meshnet.disconnect_all() {
                log::warn!("Meshnet teardown during stop: {}", e);
            }
            if let Err(e) = state.dns.disable() {
                log::warn!("DNS teardown during stop: {}", e);
            }
            if let Err(e) = self.tunnel.clear_device() {
                log::warn!("Transport teardown during stop: {}", e);
            }
            match state.adapter.destroy() {
                Ok(Some(handle)) => self.bus.publish(Event::Adapter {
                    state: AdapterState::Down,
                    name: handle.name,
                    luid: handle.luid,
                }),
                Ok(None) => {}
                Err(e) => log::warn!("Adapter teardown during stop: {}", e),
            }
            state.run = RunState::Stopped;
        }

        // Deliver everything queued so far before reporting the stop done
        self.rt.block_on(self.bus.flush());
        Ok(())
    }

    /// LUID of the active adapter; zero when no adapter is active.
    pub fn adapter_luid(&self) -> EngineResult<u64> {
        let state = self.read()?;
        Ok(state.adapter.luid().unwrap_or(0))
    }

    /// Rotate the device identity.
    ///
    /// The identity is superseded atomically; peers and the exit node are
    /// re-announced so their sessions rebuild under the new key.
    pub fn set_private_key(&self, identity: KeyPair) -> EngineResult<()> {
        let mut state = self.write()?;
        if state.run != RunState::Started {
            return Err(EngineError::NotStarted);
        }
        self.tunnel.set_device(DeviceConfig {
            private_key: identity.secret_bytes(),
            listen_port: None,
            fwmark: 0,
        })?;
        state.identity = Some(identity);
        state.meshnet.reannounce();
        state.exit.reannounce();
        Ok(())
    }

    /// The current identity, if one has been set.
    pub fn private_key(&self) -> EngineResult<Option<KeyPair>> {
        Ok(self.read()?.identity.clone())
    }

    /// Apply a meshnet membership config. Validate-then-apply: a validation
    /// failure leaves the prior membership untouched.
    pub fn set_meshnet(&self, config: MeshnetConfig) -> EngineResult<()> {
        let state = self.write()?;
        if state.run != RunState::Started {
            return Err(EngineError::NotStarted);
        }
        let own = state
            .identity
            .as_ref()
            .map(|identity| PeerPublicKey::from(identity.public()))
            .ok_or(EngineError::NotStarted)?;
        let specs = config.validate(&own)?;
        state.meshnet.apply(&config, specs)
    }

    /// Disconnect all meshnet peers. Idempotent, valid in any state.
    pub fn set_meshnet_off(&self) -> EngineResult<()> {
        let state = self.write()?;
        state.meshnet.disconnect_all()
    }

    /// Peer statuses for the current meshnet membership.
    pub fn peer_statuses(&self) -> EngineResult<Vec<PeerStatus>> {
        Ok(self.read()?.meshnet.statuses())
    }

    /// Route all traffic through the given exit node.
    pub fn connect_exit_node(
        &self,
        public_key: PeerPublicKey,
        endpoint: Option<SocketAddr>,
        preshared_key: Option<[u8; 32]>,
    ) -> EngineResult<()> {
        let state = self.write()?;
        if state.run != RunState::Started {
            return Err(EngineError::NotStarted);
        }
        state.exit.connect(public_key, endpoint, preshared_key)
    }

    /// Disconnect the named exit node; errors on a stale key.
    pub fn disconnect_exit_node(&self, public_key: &PeerPublicKey) -> EngineResult<()> {
        let state = self.write()?;
        if state.run != RunState::Started {
            return Err(EngineError::NotStarted);
        }
        state.exit.disconnect(public_key)
    }

    /// Disconnect whatever exit node is active. Idempotent, valid in any state.
    pub fn disconnect_exit_nodes(&self) -> EngineResult<()> {
        let state = self.write()?;
        state.exit.disconnect_all()
    }

    /// Enable magic DNS with the given forward servers.
    pub fn enable_magic_dns(&self, forward_servers: Vec<IpAddr>) -> EngineResult<()> {
        let mut state = self.write()?;
        if state.run != RunState::Started {
            return Err(EngineError::NotStarted);
        }
        state.dns.enable(forward_servers)
    }

    /// Disable magic DNS. Idempotent, valid in any state.
    pub fn disable_magic_dns(&self) -> EngineResult<()> {
        let mut state = self.write()?;
        state.dns.disable()
    }

    /// Re-evaluate adapter and peer reachability after a host network change,
    /// without a stop/start cycle.
    pub fn notify_network_change(&self, info: &str) -> EngineResult<()> {
        let state = self.write()?;
        if state.run != RunState::Started {
            return Err(EngineError::NotStarted);
        }
        self.bus
            .log(LogLevel::Info, format!("Network change: {}", info));
        self.tunnel.refresh()?;
        state.meshnet.reannounce();
        state.exit.reannounce();
        Ok(())
    }

    /// Build a point-in-time snapshot of the whole engine.
    pub fn status(&self) -> EngineResult<StatusSnapshot> {
        let state = self.read()?;
        let started = state.run == RunState::Started;
        Ok(StatusSnapshot {
            state: state.run,
            adapter: state.adapter.handle().map(|handle| AdapterStatus {
                kind: handle.kind,
                name: handle.name.clone(),
                luid: handle.luid,
            }),
            public_key: state
                .identity
                .as_ref()
                .map(|identity| PeerPublicKey::from(identity.public())),
            peers: if started {
                state.meshnet.statuses()
            } else {
                Vec::new()
            },
            exit_node: if started { state.exit.status() } else { None },
            dns: state.dns.status(),
        })
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, EngineState>> {
        // Reject on contention; callers treat the lock error as retryable
        self.state.try_write().map_err(|_| EngineError::Lock)
    }

    fn read(&self) -> EngineResult<RwLockReadGuard<'_, EngineState>> {
        self.state.try_read().map_err(|_| EngineError::Lock)
    }
}

impl Drop for NodeEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Engine teardown on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::transport::PeerState;
    use pretty_assertions::assert_eq;

    fn engine() -> NodeEngine {
        NodeEngine::builder().build().expect("engine should build")
    }

    fn peer_config(key: PeerPublicKey) -> PeerConfig {
        PeerConfig {
            public_key: key,
            alias: Some("laptop".into()),
            endpoint: Some("192.0.2.5:51820".parse().unwrap()),
            allowed_ips: vec!["10.64.0.5/32".parse().unwrap()],
            allow_incoming_connections: true,
            persistent_keepalive: Some(25),
        }
    }

    fn peer_key() -> PeerPublicKey {
        PeerPublicKey::from(KeyPair::generate().public())
    }

    #[test]
    fn test_double_start_fails() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        assert!(matches!(
            engine.start(KeyPair::generate(), AdapterKind::default()),
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_stop_never_started_is_noop() {
        let engine = engine();
        engine.stop().unwrap();
        assert_eq!(engine.status().unwrap().state, RunState::Uninitialized);
    }

    #[test]
    fn test_restart_after_stop() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        engine.stop().unwrap();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        assert_eq!(engine.status().unwrap().state, RunState::Started);
    }

    #[test]
    fn test_luid_nonzero_when_started_zero_when_stopped() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        assert_ne!(engine.adapter_luid().unwrap(), 0);
        engine.stop().unwrap();
        assert_eq!(engine.adapter_luid().unwrap(), 0);
    }

    #[test]
    fn test_meshnet_requires_started() {
        let engine = engine();
        assert!(matches!(
            engine.set_meshnet(MeshnetConfig::default()),
            Err(EngineError::NotStarted)
        ));
    }

    #[test]
    fn test_bad_config_leaves_membership_unchanged() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();

        let good = peer_key();
        engine
            .set_meshnet(MeshnetConfig {
                peers: vec![peer_config(good)],
            })
            .unwrap();

        let dup = peer_key();
        let bad = MeshnetConfig {
            peers: vec![peer_config(dup), peer_config(dup)],
        };
        assert!(matches!(
            engine.set_meshnet(bad),
            Err(EngineError::BadConfig(_))
        ));

        let statuses = engine.peer_statuses().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].public_key, good);
    }

    #[test]
    fn test_key_rotation_is_atomic_in_snapshot() {
        let engine = engine();
        let first = KeyPair::generate();
        engine.start(first.clone(), AdapterKind::default()).unwrap();
        assert_eq!(
            engine.status().unwrap().public_key,
            Some(PeerPublicKey::from(first.public()))
        );

        let second = KeyPair::generate();
        engine.set_private_key(second.clone()).unwrap();
        let snapshot = engine.status().unwrap();
        assert_eq!(
            snapshot.public_key,
            Some(PeerPublicKey::from(second.public()))
        );
        assert_eq!(
            engine.private_key().unwrap().unwrap().public_bytes(),
            second.public_bytes()
        );
    }

    #[test]
    fn test_stop_clears_peers_and_exit_node() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        engine
            .set_meshnet(MeshnetConfig {
                peers: vec![peer_config(peer_key())],
            })
            .unwrap();
        engine.connect_exit_node(peer_key(), None, None).unwrap();

        engine.stop().unwrap();
        let snapshot = engine.status().unwrap();
        assert_eq!(snapshot.state, RunState::Stopped);
        assert!(snapshot.adapter.is_none());
        assert!(snapshot.peers.is_empty());
        assert!(snapshot.exit_node.is_none());
    }

    #[test]
    fn test_exit_node_slot_holds_latest() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        let (a, b) = (peer_key(), peer_key());
        engine.connect_exit_node(a, None, None).unwrap();
        engine.connect_exit_node(b, None, None).unwrap();

        let snapshot = engine.status().unwrap();
        assert_eq!(snapshot.exit_node.unwrap().public_key, b);
    }

    #[test]
    fn test_exit_disconnect_preserves_shared_meshnet_peer() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();

        let shared = peer_key();
        engine
            .set_meshnet(MeshnetConfig {
                peers: vec![peer_config(shared)],
            })
            .unwrap();

        engine.connect_exit_node(shared, None, None).unwrap();
        engine.disconnect_exit_nodes().unwrap();

        // The peer keeps a live transport session, not a frozen status entry
        let statuses = engine.peer_statuses().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].public_key, shared);
        assert!(statuses[0].last_handshake_ms.is_some());
        assert_ne!(statuses[0].state, PeerState::Disconnected);
    }

    #[test]
    fn test_network_change_reannounces_peers() {
        let engine = engine();
        engine
            .start(KeyPair::generate(), AdapterKind::default())
            .unwrap();
        engine
            .set_meshnet(MeshnetConfig {
                peers: vec![peer_config(peer_key())],
            })
            .unwrap();

        engine.notify_network_change("wifi->lte").unwrap();
        let statuses = engine.peer_statuses().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_ne!(statuses[0].state, PeerState::Disconnected);
    }

    #[test]
    fn test_start_with_tun_records_descriptor() {
        let engine = engine();
        engine
            .start_with_tun(KeyPair::generate(), AdapterKind::default(), 7)
            .unwrap();
        let snapshot = engine.status().unwrap();
        assert!(snapshot.adapter.is_some());
        assert_ne!(engine.adapter_luid().unwrap(), 0);
    }
}
