//! Domain types shared across the runtime core.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vmcell_shared::protocol::Storage;

/// Lifecycle of a sandbox or a container.
///
/// ```text
/// Ready --start--> Running --pause--> Paused
/// Running <--resume-- Paused
/// Running --stop--> Stopped   (terminal)
/// Paused  --stop--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Ready,
    Running,
    Paused,
    Stopped,
}

impl LifecycleState {
    /// Whether the documented state machine permits `self -> next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Ready, Stopped)
                | (Running, Stopped)
                | (Paused, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Stopped
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A host-side mount to be projected into the guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Mount {
            source: source.into(),
            destination: destination.into(),
            fs_type: "bind".to_string(),
            options: vec!["rbind".to_string()],
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// What the filesystem-share engine hands back for one shared mount.
#[derive(Debug, Clone, Default)]
pub struct SharedFile {
    /// Path the guest should use for this mount.
    pub guest_path: String,
    /// Storage records the agent needs to bring the mount online, when the
    /// share is not a plain virtiofs projection.
    pub storages: Vec<Storage>,
    /// Host-side projection path, kept for the unshare path.
    pub host_path: Option<PathBuf>,
    /// Source directory registered with the projected-volume watcher, if any.
    pub watched_source: Option<PathBuf>,
}

/// Rootfs descriptor of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rootfs {
    pub source: PathBuf,
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Set when the rootfs is backed by a block device already registered
    /// with the device manager.
    #[serde(default)]
    pub block_device_id: Option<String>,
}

/// Initial (or exec) process of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

fn default_cwd() -> String {
    "/".to_string()
}

impl ProcessSpec {
    pub fn new(args: Vec<String>) -> Self {
        ProcessSpec {
            args,
            cwd: "/".to_string(),
            ..Default::default()
        }
    }
}

/// Caller-facing configuration of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub id: String,
    pub rootfs: Rootfs,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    pub process: ProcessSpec,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Image reference, required for guest-pulled rootfs.
    #[serde(default)]
    pub image: Option<String>,
}

impl ContainerConfig {
    pub fn validate(&self) -> vmcell_shared::Result<()> {
        if self.id.is_empty() {
            return Err(vmcell_shared::Error::ConfigInvalid(
                "container id must not be empty".to_string(),
            ));
        }
        if self.process.args.is_empty() {
            return Err(vmcell_shared::Error::ConfigInvalid(format!(
                "container {} has no process args",
                self.id
            )));
        }
        Ok(())
    }
}
