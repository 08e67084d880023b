//! meshvpn library
//!
//! Mesh-networking VPN control engine: one logical device per engine,
//! meshnet peer membership, a single exit-node slot, and a string/JSON
//! control surface for host bindings.

pub mod adapter;
pub mod api;
pub mod config;
pub mod device;
pub mod dns;
pub mod error;
pub mod events;
pub mod exit_node;
pub mod keys;
pub mod meshnet;
pub mod protect;
pub mod transport;
pub mod version;

pub use api::{generate_public_key, generate_secret_key, MeshVpn};
pub use device::{NodeEngine, NodeEngineBuilder, RunState, StatusSnapshot};
pub use error::{EngineError, EngineResult, ResultCode};
