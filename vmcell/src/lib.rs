//! vmcell — a runtime core that executes OCI containers inside
//! lightweight hardware-virtualised sandboxes.
//!
//! A sandbox is one micro-VM hosting one or more containers. The runtime
//! mediates container lifecycle operations between an OCI-compatible
//! caller and a guest-side agent reachable over a virtio-vsock transport.
//!
//! The crate is organised leaves-first:
//!
//! - [`layout`] — deterministic per-sandbox path derivation
//! - [`persist`] — atomic JSON persistence of recoverable state
//! - [`device`] — ref-counted device registry and bridge/slot allocation
//! - [`hypervisor`] — the polymorphic VMM capability surface and engines
//! - [`sharefs`] — the host↔guest filesystem-share engine and the
//!   projected-volume watcher
//! - [`network`] — netns endpoint discovery and attachment
//! - [`agent`] — the vsock RPC client for the in-guest agent
//! - [`container`] — the per-container state machine
//! - [`sandbox`] — the orchestrator composing everything above
//!
//! Library-only: there is no CLI here. Callers construct a
//! [`sandbox::SandboxRuntime`], create sandboxes from a
//! [`sandbox::SandboxConfig`] and drive them through the [`sandbox::Sandbox`]
//! handle.

pub mod agent;
pub mod container;
pub mod device;
pub mod hypervisor;
pub mod layout;
pub mod network;
pub mod persist;
pub mod sandbox;
pub mod sharefs;
pub mod types;

pub(crate) mod util;

#[cfg(test)]
pub(crate) mod mock;

pub use sandbox::{Sandbox, SandboxConfig, SandboxRuntime, SandboxStatus};
pub use types::LifecycleState;
pub use vmcell_shared::{Error, Result, Transport};
