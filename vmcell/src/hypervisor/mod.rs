//! The polymorphic hypervisor capability surface.
//!
//! Every engine drives one micro-VM through the same operation set; the
//! divergent feature sets (fs sharing, hot-plug, pause, confidential
//! guests) are advertised through [`Capabilities`] and the engines refuse
//! what they cannot do with `Unsupported`.
//!
//! Engine state machine, one per sandbox:
//!
//! ```text
//! Unconfigured → Configured → Ready → Running ⇄ Paused
//!                                     ↓
//!                                   Stopped (terminal)
//! ```
//!
//! Cold `add_device` is only valid before boot (devices queue until the VM
//! is configured); hot-plug is only valid in `Running`.

pub mod config;
pub mod firecracker;
pub mod qemu;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::device::DeviceConfig;
use crate::layout::RuntimeLayout;
use crate::persist::state::HypervisorState;
use vmcell_shared::{Error, Result, Transport};

pub use config::{HypervisorConfig, KernelParam, ProtectionKind};
pub use firecracker::FirecrackerHypervisor;
pub use qemu::QemuHypervisor;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const BLOCK_HOTPLUG      = 1 << 0;
        const NET_HOTPLUG        = 1 << 1;
        const FS_SHARING         = 1 << 2;
        const MULTI_QUEUE        = 1 << 3;
        const MEMORY_HOTPLUG     = 1 << 4;
        const CONFIDENTIAL_GUEST = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmState {
    Unconfigured,
    Configured,
    Ready,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleKind {
    Unix,
    Pty,
}

impl ConsoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleKind::Unix => "unix",
            ConsoleKind::Pty => "pty",
        }
    }
}

/// Result of a memory resize that inserted a hot-pluggable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDevice {
    pub slot: u32,
    pub size_mib: u32,
    /// The guest must probe the new memory (no ACPI notification).
    pub probe: bool,
}

/// vCPU index → host thread id, best effort.
#[derive(Debug, Clone, Default)]
pub struct VcpuThreadIds {
    pub vcpus: HashMap<u32, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorKind {
    Qemu,
    Firecracker,
    /// Darwin Virtualization.framework class; only constructible on macOS.
    Vz,
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HypervisorKind::Qemu => "qemu",
            HypervisorKind::Firecracker => "firecracker",
            HypervisorKind::Vz => "vz",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for HypervisorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qemu" => Ok(HypervisorKind::Qemu),
            "firecracker" => Ok(HypervisorKind::Firecracker),
            "vz" => Ok(HypervisorKind::Vz),
            other => Err(Error::ConfigInvalid(format!(
                "unknown hypervisor kind {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Validate and record the machine configuration. No process spawns.
    async fn create_vm(
        &self,
        id: &str,
        netns: Option<String>,
        config: &HypervisorConfig,
    ) -> Result<()>;

    /// Spawn the VMM and wait until its monitor answers, bounded by
    /// `timeout_secs`. On timeout the caller owns the forced stop.
    async fn start_vm(&self, timeout_secs: u32) -> Result<()>;

    /// Tear the VM down. With `wait_only` the VMM is expected to exit on
    /// its own (the guest was asked to shut down); otherwise a graceful
    /// shutdown is sent and escalated to SIGTERM/SIGKILL.
    async fn stop_vm(&self, wait_only: bool) -> Result<()>;

    async fn pause_vm(&self) -> Result<()>;
    async fn resume_vm(&self) -> Result<()>;

    /// Cold-plug path; queues the device until the VM is configured.
    async fn add_device(&self, device: DeviceConfig) -> Result<()>;

    /// Live hot-plug; only valid in `Running`. Returns the descriptor with
    /// guest addressing filled in.
    async fn hotplug_add_device(&self, device: DeviceConfig) -> Result<DeviceConfig>;

    /// Mirror of [`Self::hotplug_add_device`].
    async fn hotplug_remove_device(&self, device: DeviceConfig) -> Result<DeviceConfig>;

    /// Resize guest memory towards `target_mib`. Returns the achieved size
    /// and, on the slot-insertion path, the device the agent must online.
    async fn resize_memory(
        &self,
        target_mib: u32,
        block_size_mib: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryDevice>)>;

    /// Returns `(previous, current)` vCPU counts. Hot-unplug may silently
    /// no-op on engines that cannot do it.
    async fn resize_vcpus(&self, target: u32) -> Result<(u32, u32)>;

    async fn capabilities(&self) -> Result<Capabilities>;

    async fn get_console(&self) -> Result<(ConsoleKind, String)>;

    /// Best effort; used for cgroup placement of vCPU threads.
    async fn get_thread_ids(&self) -> Result<VcpuThreadIds>;

    /// How to reach the guest agent once the VM runs.
    async fn get_agent_transport(&self) -> Result<Transport>;

    async fn vmm_state(&self) -> VmmState;

    async fn get_vmm_pid(&self) -> Result<u32>;

    /// Resolve when the VMM process exits; returns its exit status. Safe to
    /// call from a monitor task while other operations proceed.
    async fn wait_vmm(&self) -> Result<i32>;

    /// Remove on-disk residue (jail, sockets, VM directory). Idempotent.
    async fn cleanup(&self) -> Result<()>;

    async fn save_state(&self) -> Result<HypervisorState>;
}

/// Build the engine for `kind`. The layout provides socket and VM-dir
/// paths; per-engine configuration arrives later through `create_vm`.
pub fn new_hypervisor(kind: HypervisorKind, layout: RuntimeLayout) -> Result<Arc<dyn Hypervisor>> {
    match kind {
        HypervisorKind::Qemu => Ok(Arc::new(QemuHypervisor::new(layout))),
        HypervisorKind::Firecracker => Ok(Arc::new(FirecrackerHypervisor::new(layout))),
        HypervisorKind::Vz => {
            if cfg!(target_os = "macos") {
                Err(Error::Unsupported(
                    "vz engine is not built into this binary".to_string(),
                ))
            } else {
                Err(Error::ConfigInvalid(
                    "vz hypervisor requires a macOS host".to_string(),
                ))
            }
        }
    }
}
