//! String-and-JSON control surface over [`NodeEngine`].
//!
//! Every mutating call resolves to exactly one [`ResultCode`]; free-form
//! diagnostics travel only through [`MeshVpn::last_error`]. Typed structs stop
//! at this boundary: JSON is parsed on the way in and rendered on the way out,
//! never inside controller logic.

use crate::adapter::AdapterKind;
use crate::config::MeshnetConfig;
use crate::device::{NodeEngine, NodeEngineBuilder};
use crate::error::{EngineError, EngineResult, ResultCode};
use crate::keys::{decode_key32, KeyPair, PeerPublicKey};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

/// Generate a fresh secret key, base64-encoded.
pub fn generate_secret_key() -> String {
    KeyPair::generate().secret_base64()
}

/// Derive the base64 public key for a base64 secret key.
pub fn generate_public_key(secret: &str) -> EngineResult<String> {
    Ok(KeyPair::from_secret_base64(secret)?.public_base64())
}

/// The externally-callable engine object.
///
/// Shareable across caller threads; the engine serializes mutating operations
/// internally and contention surfaces as [`ResultCode::LockError`].
pub struct MeshVpn {
    engine: NodeEngine,
    last_error: Mutex<String>,
}

impl MeshVpn {
    /// Build with default collaborators; use [`NodeEngine::builder`] plus
    /// [`MeshVpn::from_engine`] to inject observers, loggers, or a protector.
    pub fn new() -> EngineResult<Self> {
        Self::with_builder(NodeEngine::builder())
    }

    pub fn with_builder(builder: NodeEngineBuilder) -> EngineResult<Self> {
        Ok(Self::from_engine(builder.build()?))
    }

    pub fn from_engine(engine: NodeEngine) -> Self {
        Self {
            engine,
            last_error: Mutex::new(String::new()),
        }
    }

    /// The engine behind this surface, for typed access.
    pub fn engine(&self) -> &NodeEngine {
        &self.engine
    }

    pub fn start(&self, private_key: &str, adapter_kind: &str) -> ResultCode {
        self.complete("start", self.start_args(private_key, adapter_kind).and_then(
            |(identity, kind)| self.engine.start(identity, kind),
        ))
    }

    pub fn start_named(&self, private_key: &str, adapter_kind: &str, name: &str) -> ResultCode {
        self.complete(
            "start_named",
            self.start_args(private_key, adapter_kind)
                .and_then(|(identity, kind)| self.engine.start_named(identity, kind, name)),
        )
    }

    pub fn start_with_tun(&self, private_key: &str, adapter_kind: &str, tun_fd: i32) -> ResultCode {
        self.complete(
            "start_with_tun",
            self.start_args(private_key, adapter_kind)
                .and_then(|(identity, kind)| self.engine.start_with_tun(identity, kind, tun_fd)),
        )
    }

    pub fn stop(&self) -> ResultCode {
        self.complete("stop", self.engine.stop())
    }

    /// LUID of the active adapter; zero when none is active or on error.
    pub fn get_adapter_luid(&self) -> u64 {
        match self.engine.adapter_luid() {
            Ok(luid) => luid,
            Err(e) => {
                self.record("get_adapter_luid", &e);
                0
            }
        }
    }

    pub fn set_private_key(&self, private_key: &str) -> ResultCode {
        self.complete(
            "set_private_key",
            KeyPair::from_secret_base64(private_key)
                .and_then(|identity| self.engine.set_private_key(identity)),
        )
    }

    /// The current base64 secret key; empty when no identity is set.
    pub fn get_private_key(&self) -> String {
        match self.engine.private_key() {
            Ok(Some(identity)) => identity.secret_base64(),
            Ok(None) => String::new(),
            Err(e) => {
                self.record("get_private_key", &e);
                String::new()
            }
        }
    }

    /// `forward_servers` is a JSON array of IP address strings.
    pub fn enable_magic_dns(&self, forward_servers: &str) -> ResultCode {
        self.complete(
            "enable_magic_dns",
            parse_dns_servers(forward_servers)
                .and_then(|servers| self.engine.enable_magic_dns(servers)),
        )
    }

    pub fn disable_magic_dns(&self) -> ResultCode {
        self.complete("disable_magic_dns", self.engine.disable_magic_dns())
    }

    pub fn notify_network_change(&self, info: &str) -> ResultCode {
        self.complete(
            "notify_network_change",
            self.engine.notify_network_change(info),
        )
    }

    /// `endpoint` and `preshared_key` may be empty when unknown.
    pub fn connect_to_exit_node(
        &self,
        public_key: &str,
        endpoint: &str,
        preshared_key: &str,
    ) -> ResultCode {
        let result = (|| {
            let key = PeerPublicKey::from_base64(public_key)?;
            let endpoint = parse_optional_endpoint(endpoint)?;
            let preshared = if preshared_key.is_empty() {
                None
            } else {
                Some(decode_key32(preshared_key)?)
            };
            self.engine.connect_exit_node(key, endpoint, preshared)
        })();
        self.complete("connect_to_exit_node", result)
    }

    pub fn disconnect_from_exit_node(&self, public_key: &str) -> ResultCode {
        self.complete(
            "disconnect_from_exit_node",
            PeerPublicKey::from_base64(public_key)
                .and_then(|key| self.engine.disconnect_exit_node(&key)),
        )
    }

    pub fn disconnect_from_exit_nodes(&self) -> ResultCode {
        self.complete(
            "disconnect_from_exit_nodes",
            self.engine.disconnect_exit_nodes(),
        )
    }

    pub fn set_meshnet(&self, config_json: &str) -> ResultCode {
        self.complete(
            "set_meshnet",
            MeshnetConfig::from_json(config_json).and_then(|config| self.engine.set_meshnet(config)),
        )
    }

    pub fn set_meshnet_off(&self) -> ResultCode {
        self.complete("set_meshnet_off", self.engine.set_meshnet_off())
    }

    /// JSON rendering of the full engine status; `{}` on error.
    pub fn get_status_map(&self) -> String {
        let snapshot = match self.engine.status() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record("get_status_map", &e);
                return "{}".to_string();
            }
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                self.record(
                    "get_status_map",
                    &EngineError::bad_config_with_source("Status serialization failed", e),
                );
                "{}".to_string()
            }
        }
    }

    /// Free-form diagnostic text for the most recent failure.
    pub fn get_last_error(&self) -> String {
        self.last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Name of the platform-default adapter backend.
    pub fn get_default_adapter(&self) -> String {
        AdapterKind::default().as_str().to_string()
    }

    pub fn get_version_tag(&self) -> String {
        crate::version::version_tag().to_string()
    }

    pub fn get_commit_sha(&self) -> String {
        crate::version::commit_sha().to_string()
    }

    fn start_args(
        &self,
        private_key: &str,
        adapter_kind: &str,
    ) -> EngineResult<(KeyPair, AdapterKind)> {
        let identity = KeyPair::from_secret_base64(private_key)?;
        let kind = parse_adapter_kind(adapter_kind)?;
        Ok((identity, kind))
    }

    fn complete(&self, op: &str, result: EngineResult<()>) -> ResultCode {
        match result {
            Ok(()) => ResultCode::Ok,
            Err(e) => {
                self.record(op, &e);
                ResultCode::from(&e)
            }
        }
    }

    fn record(&self, op: &str, e: &EngineError) {
        log::warn!("{} failed: {}", op, e);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = format!("{}: {}", op, e);
        }
    }
}

/// Empty input selects the platform default backend.
fn parse_adapter_kind(kind: &str) -> EngineResult<AdapterKind> {
    match kind {
        "" | "default" => Ok(AdapterKind::default()),
        "boringtun" => Ok(AdapterKind::BoringTun),
        "linux-native-wg" => Ok(AdapterKind::LinuxNativeWg),
        "wireguard-go" => Ok(AdapterKind::WireguardGo),
        "wireguard-nt" => Ok(AdapterKind::WireguardNt),
        other => Err(EngineError::InvalidString(format!(
            "Unknown adapter kind: {}",
            other
        ))),
    }
}

fn parse_optional_endpoint(endpoint: &str) -> EngineResult<Option<SocketAddr>> {
    if endpoint.is_empty() {
        return Ok(None);
    }
    endpoint
        .parse()
        .map(Some)
        .map_err(|_| EngineError::InvalidString(format!("Invalid endpoint: {}", endpoint)))
}

fn parse_dns_servers(json: &str) -> EngineResult<Vec<IpAddr>> {
    let raw: Vec<String> = serde_json::from_str(json)
        .map_err(|_| EngineError::InvalidString(format!("Invalid server list: {}", json)))?;
    raw.iter()
        .map(|s| {
            s.parse().map_err(|_| {
                EngineError::bad_config(format!("Invalid forward server address: {}", s))
            })
        })
        .collect()
}
