//! Deterministic per-sandbox path derivation.
//!
//! Every path the runtime touches for a sandbox comes from here: state
//! directories, the host↔guest shared directory, the mount-staging
//! directory, and the unix sockets for console, agent and hypervisor
//! monitor. Socket paths are checked against the `sun_path` limit; when a
//! long sandbox id would overflow it, the id embedded in the socket path is
//! truncated to its first 32 characters.
//!
//! Rootless callers get everything rooted under `$XDG_RUNTIME_DIR`.

use std::path::{Path, PathBuf};

use vmcell_shared::{Error, Result};

/// Default root for rootful operation.
pub const DEFAULT_RUN_ROOT: &str = "/run/vmcell";

/// `sockaddr_un.sun_path` holds 108 bytes including the trailing NUL.
const MAX_SOCKET_PATH_LEN: usize = 107;

/// Ids embedded in socket paths are cut to this many characters when the
/// full path would not fit.
const TRUNCATED_ID_LEN: usize = 32;

/// Guest-side path constants referenced by storage records.
pub mod guest {
    /// Where virtiofs-shared container directories appear in the guest.
    pub const SHARED_CONTAINERS_DIR: &str = "/run/vmcell/shared/containers";
    /// Where pulled image layers appear in the guest.
    pub const SHARED_IMAGES_DIR: &str = "/run/vmcell/shared/images";
    /// Rootfs location for non-virtiofs paths (guest-pull, block).
    pub const SANDBOX_RUN_DIR: &str = "/run/vmcell";
    pub const ROOTFS: &str = "rootfs";

    /// Guest path of a container's shared directory.
    pub fn container_shared_dir(cid: &str) -> String {
        format!("{}/{}", SHARED_CONTAINERS_DIR, cid)
    }

    /// Guest rootfs path for a virtiofs-projected container.
    pub fn container_rootfs(cid: &str) -> String {
        format!("{}/{}/{}", SHARED_CONTAINERS_DIR, cid, ROOTFS)
    }
}

/// Root of all host-side runtime paths.
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    run_root: PathBuf,
}

impl RuntimeLayout {
    /// Resolve the layout from the environment: rootless callers (non-zero
    /// euid with `XDG_RUNTIME_DIR` set) are rooted under their per-user
    /// runtime directory, everyone else under [`DEFAULT_RUN_ROOT`].
    pub fn from_env() -> Self {
        let rootless = !nix::unistd::Uid::effective().is_root();
        let run_root = match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if rootless && !dir.is_empty() => PathBuf::from(dir).join("vmcell"),
            _ => PathBuf::from(DEFAULT_RUN_ROOT),
        };
        Self { run_root }
    }

    /// Layout rooted at an explicit directory. Used by tests and by callers
    /// that manage their own namespacing.
    pub fn with_run_root(run_root: impl Into<PathBuf>) -> Self {
        Self {
            run_root: run_root.into(),
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Persistent state directory (JSON files) for one sandbox.
    pub fn sandbox_state_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_root.join("vc").join("sbs").join(sandbox_id)
    }

    /// VM runtime directory: pid file, log file, sockets.
    pub fn sandbox_run_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_root.join("vc").join("vm").join(sandbox_id)
    }

    /// Storage directory for sandbox-lifetime scratch data.
    pub fn sandbox_storage_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_root.join("storage").join(sandbox_id)
    }

    /// Host directory exported into the guest (virtio-fs / 9p source).
    pub fn shared_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_root.join("shared").join(sandbox_id)
    }

    /// Host-side staging directory bound onto [`Self::shared_dir`] with
    /// slave propagation.
    pub fn mount_dir(&self, sandbox_id: &str) -> PathBuf {
        self.run_root.join("mounts").join(sandbox_id)
    }

    /// Subdirectory of the shared dir holding sandbox-wide bind mounts.
    pub fn sandbox_mounts_dir(&self, sandbox_id: &str) -> PathBuf {
        self.shared_dir(sandbox_id).join("sandbox-mounts")
    }

    pub fn console_socket(&self, sandbox_id: &str) -> Result<PathBuf> {
        self.socket_path(sandbox_id, "console.sock")
    }

    pub fn agent_socket(&self, sandbox_id: &str) -> Result<PathBuf> {
        self.socket_path(sandbox_id, "agent.sock")
    }

    pub fn hypervisor_api_socket(&self, sandbox_id: &str) -> Result<PathBuf> {
        self.socket_path(sandbox_id, "api.sock")
    }

    pub fn virtiofsd_socket(&self, sandbox_id: &str) -> Result<PathBuf> {
        self.socket_path(sandbox_id, "virtiofsd.sock")
    }

    /// Build `<run_dir>/<name>`, falling back to a truncated sandbox id
    /// when the result would overflow `sun_path`.
    fn socket_path(&self, sandbox_id: &str, name: &str) -> Result<PathBuf> {
        let full = self.sandbox_run_dir(sandbox_id).join(name);
        if path_len(&full) <= MAX_SOCKET_PATH_LEN {
            return Ok(full);
        }

        let short_id: String = sandbox_id.chars().take(TRUNCATED_ID_LEN).collect();
        let truncated = self.sandbox_run_dir(&short_id).join(name);
        if path_len(&truncated) <= MAX_SOCKET_PATH_LEN {
            tracing::debug!(
                sandbox_id = %sandbox_id,
                socket = %truncated.display(),
                "socket path truncated to fit sun_path"
            );
            return Ok(truncated);
        }

        Err(Error::ConfigInvalid(format!(
            "socket path {} exceeds the {} byte unix socket limit",
            truncated.display(),
            MAX_SOCKET_PATH_LEN
        )))
    }
}

fn path_len(path: &Path) -> usize {
    path.as_os_str().len()
}
