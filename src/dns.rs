//! Magic DNS override control.
//!
//! Tracks whether the engine-managed resolver is active and which upstream
//! servers it forwards to. Resolver internals are a transport concern; this
//! controller owns the desired state and announces changes.

use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use serde::Serialize;
use std::net::IpAddr;

/// Point-in-time DNS state for status output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DnsStatus {
    pub enabled: bool,
    pub forward_servers: Vec<IpAddr>,
}

/// Owns the magic-DNS desired state for one engine instance.
pub struct DnsController {
    bus: EventBus,
    enabled: bool,
    forward_servers: Vec<IpAddr>,
}

impl DnsController {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            enabled: false,
            forward_servers: Vec::new(),
        }
    }

    /// Enable the resolver with the given upstreams. Re-enabling with a new
    /// list reconfigures in place.
    pub fn enable(&mut self, forward_servers: Vec<IpAddr>) -> EngineResult<()> {
        if forward_servers.is_empty() {
            return Err(EngineError::bad_config(
                "Magic DNS requires at least one forward server",
            ));
        }
        self.enabled = true;
        self.forward_servers = forward_servers;
        self.bus.publish(Event::Dns {
            enabled: true,
            forward_servers: self.forward_servers.clone(),
        });
        log::info!(
            "Magic DNS enabled with {} forward server(s)",
            self.forward_servers.len()
        );
        Ok(())
    }

    /// Disable the resolver. Idempotent; disabling an inactive resolver still
    /// reports success without emitting an event.
    pub fn disable(&mut self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.enabled = false;
        self.forward_servers.clear();
        self.bus.publish(Event::Dns {
            enabled: false,
            forward_servers: Vec::new(),
        });
        log::info!("Magic DNS disabled");
        Ok(())
    }

    pub fn status(&self) -> DnsStatus {
        DnsStatus {
            enabled: self.enabled,
            forward_servers: self.forward_servers.clone(),
        }
    }
}
