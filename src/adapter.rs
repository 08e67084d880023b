//! Virtual network adapter lifecycle.
//!
//! The engine owns at most one adapter at a time. Platform driver work lives
//! behind [`AdapterFactory`]; the manager only enforces the single-adapter
//! invariant, idempotent teardown, and LUID bookkeeping.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Default interface name when the caller does not supply one.
pub const DEFAULT_ADAPTER_NAME: &str = "mesh0";

/// Closed set of supported adapter backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// Userspace WireGuard (boringtun).
    #[serde(rename = "boringtun")]
    BoringTun,
    /// Kernel WireGuard on Linux.
    LinuxNativeWg,
    /// wireguard-go userspace implementation.
    WireguardGo,
    /// WireGuardNT kernel driver on Windows.
    WireguardNt,
}

impl AdapterKind {
    /// Stable kebab-case name, matching the serde wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::BoringTun => "boringtun",
            AdapterKind::LinuxNativeWg => "linux-native-wg",
            AdapterKind::WireguardGo => "wireguard-go",
            AdapterKind::WireguardNt => "wireguard-nt",
        }
    }
}

impl Default for AdapterKind {
    fn default() -> Self {
        #[cfg(windows)]
        {
            AdapterKind::WireguardNt
        }
        #[cfg(not(windows))]
        {
            AdapterKind::BoringTun
        }
    }
}

/// Opaque reference to an active virtual interface.
///
/// Valid only while the engine is started; owned exclusively by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    /// Which backend created this adapter.
    pub kind: AdapterKind,
    /// Interface name.
    pub name: String,
    /// Platform locally-unique identifier; never zero for a live adapter.
    pub luid: u64,
    /// Pre-opened tun descriptor when the host supplied one.
    pub tun_fd: Option<i32>,
}

/// Platform collaborator that creates and destroys adapters.
pub trait AdapterFactory: Send + Sync {
    /// Create a fresh adapter.
    fn open(&self, kind: AdapterKind, name: &str) -> EngineResult<AdapterHandle>;

    /// Wrap a tun descriptor the host already opened (mobile platforms).
    fn adopt(&self, kind: AdapterKind, tun_fd: i32) -> EngineResult<AdapterHandle>;

    /// Destroy an adapter. Must tolerate an already-gone interface.
    fn close(&self, handle: &AdapterHandle) -> EngineResult<()>;
}

/// In-process factory that synthesizes handles without touching a driver.
pub struct InProcessAdapterFactory;

impl InProcessAdapterFactory {
    fn luid_for(name: &str) -> u64 {
        // FNV-1a over the interface name; forced non-zero so a live adapter
        // is always distinguishable from "no adapter".
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        if hash == 0 {
            1
        } else {
            hash
        }
    }
}

impl AdapterFactory for InProcessAdapterFactory {
    fn open(&self, kind: AdapterKind, name: &str) -> EngineResult<AdapterHandle> {
        if name.is_empty() {
            return Err(EngineError::adapter("Adapter name must not be empty"));
        }
        Ok(AdapterHandle {
            kind,
            name: name.to_string(),
            luid: Self::luid_for(name),
            tun_fd: None,
        })
    }

    fn adopt(&self, kind: AdapterKind, tun_fd: i32) -> EngineResult<AdapterHandle> {
        if tun_fd < 0 {
            return Err(EngineError::adapter(format!(
                "Invalid tun descriptor: {}",
                tun_fd
            )));
        }
        let name = format!("tun-fd{}", tun_fd);
        Ok(AdapterHandle {
            kind,
            luid: Self::luid_for(&name),
            name,
            tun_fd: Some(tun_fd),
        })
    }

    fn close(&self, _handle: &AdapterHandle) -> EngineResult<()> {
        Ok(())
    }
}

/// Tracks the single active adapter for one engine instance.
pub struct AdapterManager {
    factory: std::sync::Arc<dyn AdapterFactory>,
    active: Option<AdapterHandle>,
}

impl AdapterManager {
    pub fn new(factory: std::sync::Arc<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            active: None,
        }
    }

    /// Create an adapter; fails with `AlreadyStarted` if one is active.
    pub fn create(&mut self, kind: AdapterKind, name: Option<&str>) -> EngineResult<&AdapterHandle> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let handle = self
            .factory
            .open(kind, name.unwrap_or(DEFAULT_ADAPTER_NAME))?;
        log::info!("Created adapter {} (luid {:#x})", handle.name, handle.luid);
        self.active = Some(handle);
        Ok(self.active.as_ref().unwrap_or_else(|| unreachable!()))
    }

    /// Adopt a host-opened tun descriptor instead of creating an interface.
    pub fn adopt(&mut self, kind: AdapterKind, tun_fd: i32) -> EngineResult<&AdapterHandle> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let handle = self.factory.adopt(kind, tun_fd)?;
        log::info!("Adopted tun descriptor {} as {}", tun_fd, handle.name);
        self.active = Some(handle);
        Ok(self.active.as_ref().unwrap_or_else(|| unreachable!()))
    }

    /// Destroy the active adapter.
    ///
    /// Idempotent: destroying when nothing is active is a no-op, since the
    /// stop path may race with driver-initiated teardown. Returns the handle
    /// that was destroyed, if any.
    pub fn destroy(&mut self) -> EngineResult<Option<AdapterHandle>> {
        let Some(handle) = self.active.take() else {
            return Ok(None);
        };
        self.factory.close(&handle)?;
        log::info!("Destroyed adapter {}", handle.name);
        Ok(Some(handle))
    }

    /// The active adapter, if started.
    pub fn handle(&self) -> Option<&AdapterHandle> {
        self.active.as_ref()
    }

    /// LUID of the active adapter, if started.
    pub fn luid(&self) -> Option<u64> {
        self.active.as_ref().map(|h| h.luid)
    }
}
