//! Host↔guest filesystem-share engine.
//!
//! One instance per sandbox. `prepare` stages the two host directories and
//! their propagation relationship:
//!
//! ```text
//! <mount_dir>  --bind,shared-->  <shared_dir>  (slave side, exported to guest)
//! ```
//!
//! Mounts performed later under `mount_dir` become visible in `shared_dir`
//! and therefore in the guest through virtio-fs. `share_file` projects one
//! container mount; `share_rootfs` (see [`rootfs`]) projects the rootfs.
//! K8s projected volumes additionally register with the
//! [`watcher::VolumeWatcher`] so atomic kubelet updates reach the guest.
//!
//! Without CAP_SYS_ADMIN the engine degrades to directory staging only
//! (no bind mounts), which keeps rootless test environments working; the
//! propagation setup is skipped, not failed.

pub mod rootfs;
pub mod virtual_volume;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use parking_lot::Mutex;

use crate::agent::Agent;
use crate::layout::{guest, RuntimeLayout};
use crate::types::{Mount, SharedFile};
use crate::util;
use vmcell_shared::{Error, Result};

pub use watcher::VolumeWatcher;

/// Kubelet-managed volume directories whose contents change through atomic
/// symlink swaps.
const PROJECTED_VOLUME_MARKERS: &[&str] = &[
    "kubernetes.io~configmap",
    "kubernetes.io~secret",
    "kubernetes.io~projected",
    "kubernetes.io~downward-api",
];

pub struct ShareFs {
    sandbox_id: String,
    shared_dir: PathBuf,
    mount_dir: PathBuf,
    sandbox_mounts_dir: PathBuf,
    sandbox_bind_mounts: Vec<PathBuf>,
    prepared: AtomicBool,
    can_mount: bool,
    /// Host paths currently bind-mounted under `mount_dir`, for cleanup.
    active_shares: Mutex<HashMap<PathBuf, bool>>,
    watcher: Arc<VolumeWatcher>,
}

impl ShareFs {
    pub fn new(
        layout: &RuntimeLayout,
        sandbox_id: &str,
        sandbox_bind_mounts: Vec<PathBuf>,
        agent: Arc<dyn Agent>,
        copy_chunk_size: usize,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            shared_dir: layout.shared_dir(sandbox_id),
            mount_dir: layout.mount_dir(sandbox_id),
            sandbox_mounts_dir: layout.sandbox_mounts_dir(sandbox_id),
            sandbox_bind_mounts,
            prepared: AtomicBool::new(false),
            can_mount: nix::unistd::Uid::effective().is_root(),
            active_shares: Mutex::new(HashMap::new()),
            watcher: Arc::new(VolumeWatcher::new(agent, copy_chunk_size)),
        }
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    pub fn watcher(&self) -> Arc<VolumeWatcher> {
        Arc::clone(&self.watcher)
    }

    /// Stage the share directories. Idempotent: a second call is a no-op.
    pub async fn prepare(&self) -> Result<()> {
        if self.prepared.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        std::fs::create_dir_all(&self.shared_dir)?;
        std::fs::create_dir_all(&self.mount_dir)?;

        if self.can_mount {
            // Self-bind so mount_dir is a mount point, make it a shared
            // peer group, bind it onto shared_dir, then demote shared_dir
            // to a slave so guest-visible mounts follow host mounts but
            // never the reverse.
            bind_mount(&self.mount_dir, &self.mount_dir)?;
            set_propagation(&self.mount_dir, MsFlags::MS_SHARED)?;
            bind_mount(&self.mount_dir, &self.shared_dir)?;
            set_propagation(&self.shared_dir, MsFlags::MS_SLAVE)?;
        }

        std::fs::create_dir_all(&self.sandbox_mounts_dir)?;
        for source in &self.sandbox_bind_mounts {
            let name = source
                .file_name()
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!(
                        "sandbox bind mount {} has no final component",
                        source.display()
                    ))
                })?
                .to_string_lossy()
                .into_owned();
            let dest = self.sandbox_mounts_dir.join(&name);
            std::fs::create_dir_all(&dest)?;
            if self.can_mount {
                bind_mount(source, &dest)?;
                remount_read_only(&dest)?;
            }
            self.active_shares.lock().insert(dest, true);
        }

        self.watcher.start()?;

        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            shared_dir = %self.shared_dir.display(),
            "filesystem share prepared"
        );
        Ok(())
    }

    /// Undo everything `prepare` and the share operations did. Idempotent
    /// and tolerant of partial prior state.
    pub async fn cleanup(&self) -> Result<()> {
        self.watcher.shutdown().await;

        let shares: Vec<PathBuf> = self.active_shares.lock().drain().map(|(p, _)| p).collect();
        for path in shares {
            if self.can_mount {
                detach_mount(&path);
            }
            remove_path(&path);
        }

        if self.can_mount {
            detach_mount(&self.shared_dir);
            detach_mount(&self.mount_dir);
        }
        for dir in [&self.shared_dir, &self.mount_dir] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to remove share directory");
                }
            }
        }

        self.prepared.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Project one container mount into the share. Read-only sources go
    /// through a private staging bind first because a bind-remount of the
    /// final destination would not propagate across the mount subtrees.
    pub async fn share_file(&self, container_id: &str, m: &Mount) -> Result<SharedFile> {
        let token = util::random_token();
        let base_name = m
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mount".to_string());
        let file_name = format!("{}-{}-{}", container_id, token, base_name);

        let host_dest = self.mount_dir.join(&file_name);
        let guest_path = format!("{}/{}", guest::SHARED_CONTAINERS_DIR, file_name);

        let source_is_dir = m.source.is_dir();
        if source_is_dir {
            std::fs::create_dir_all(&host_dest)?;
        } else {
            if let Some(parent) = host_dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(&host_dest)?;
        }

        if self.can_mount {
            if m.read_only {
                let staging = self.mount_dir.join(format!(".staging-{}", file_name));
                if source_is_dir {
                    std::fs::create_dir_all(&staging)?;
                } else {
                    std::fs::File::create(&staging)?;
                }
                // The staging mount only exists for the remount; it goes
                // away on every exit path.
                let staging_guard = scopeguard::guard(staging, |staging| {
                    detach_mount(&staging);
                    remove_path(&staging);
                });
                let result = (|| {
                    bind_mount(&m.source, &staging_guard)?;
                    remount_read_only(&staging_guard)?;
                    bind_mount(&staging_guard, &host_dest)?;
                    Ok(())
                })();
                drop(staging_guard);
                result.map_err(|e: Error| {
                    remove_path(&host_dest);
                    e
                })?;
            } else {
                bind_mount(&m.source, &host_dest).map_err(|e| {
                    remove_path(&host_dest);
                    e
                })?;
            }
            set_propagation(&host_dest, MsFlags::MS_PRIVATE)?;
        }

        self.active_shares.lock().insert(host_dest.clone(), true);

        // Projected volumes need the watch+copy pipeline to track the
        // kubelet's atomic symlink swaps.
        let mut watched_source = None;
        if let Some(volume_dir) = projected_volume_dir(&m.source) {
            self.watcher
                .add_volume(&volume_dir, &guest_path)
                .await?;
            watched_source = Some(volume_dir);
        }

        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            container_id,
            source = %m.source.display(),
            guest_path = %guest_path,
            "shared mount"
        );

        Ok(SharedFile {
            guest_path,
            storages: Vec::new(),
            host_path: Some(host_dest),
            watched_source,
        })
    }

    /// Reverse of [`Self::share_file`].
    pub async fn unshare_file(&self, shared: &SharedFile) -> Result<()> {
        if let Some(ref source) = shared.watched_source {
            self.watcher
                .remove_volume(source, &shared.guest_path)
                .await;
        }
        if let Some(ref host_path) = shared.host_path {
            if self.can_mount {
                detach_mount(host_path);
            }
            remove_path(host_path);
            self.active_shares.lock().remove(host_path);
        }
        Ok(())
    }

    /// Host-side directory backing a container's rootfs projection.
    pub(crate) fn container_mount_dir(&self, container_id: &str) -> PathBuf {
        self.mount_dir.join(container_id)
    }

    pub(crate) fn can_mount(&self) -> bool {
        self.can_mount
    }

    pub(crate) fn register_share(&self, path: PathBuf) {
        self.active_shares.lock().insert(path, true);
    }

    pub(crate) fn forget_share(&self, path: &Path) {
        self.active_shares.lock().remove(path);
    }
}

/// The kubelet volume directory a mount source belongs to, when it is one.
fn projected_volume_dir(source: &Path) -> Option<PathBuf> {
    let mut current = source;
    loop {
        let parent = current.parent()?;
        if parent
            .file_name()
            .map(|n| {
                let name = n.to_string_lossy();
                PROJECTED_VOLUME_MARKERS.iter().any(|m| name == *m)
            })
            .unwrap_or(false)
        {
            return Some(current.to_path_buf());
        }
        current = parent;
    }
}

fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::Io(std::io::Error::from_raw_os_error(e as i32)).context_mount(source, target)
    })
}

fn set_propagation(target: &Path, flag: MsFlags) -> Result<()> {
    mount(None::<&str>, target, None::<&str>, flag, None::<&str>).map_err(|e| {
        Error::Internal(format!(
            "failed to set propagation on {}: {}",
            target.display(),
            e
        ))
    })
}

fn remount_read_only(target: &Path) -> Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| {
        let _ = umount2(target, MntFlags::MNT_DETACH);
        Error::Internal(format!(
            "failed to remount {} read-only: {}",
            target.display(),
            e
        ))
    })
}

fn detach_mount(target: &Path) {
    let _ = umount2(target, MntFlags::MNT_DETACH);
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove share path");
        }
    }
}

trait MountErrorContext {
    fn context_mount(self, source: &Path, target: &Path) -> Self;
}

impl MountErrorContext for Error {
    fn context_mount(self, source: &Path, target: &Path) -> Self {
        Error::Internal(format!(
            "failed to bind {} onto {}: {}",
            source.display(),
            target.display(),
            self
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use tempfile::tempdir;

    fn share_fs(root: &Path) -> ShareFs {
        let layout = RuntimeLayout::with_run_root(root);
        ShareFs::new(
            &layout,
            "sb1",
            Vec::new(),
            Arc::new(MockAgent::new()),
            4096,
        )
    }

    #[test]
    fn test_projected_volume_detection() {
        let dir = projected_volume_dir(Path::new(
            "/var/lib/kubelet/pods/uid/volumes/kubernetes.io~configmap/config/..data/key",
        ))
        .unwrap();
        assert_eq!(
            dir,
            Path::new("/var/lib/kubelet/pods/uid/volumes/kubernetes.io~configmap/config")
        );

        assert!(projected_volume_dir(Path::new("/home/user/data")).is_none());
        assert!(projected_volume_dir(Path::new(
            "/var/lib/kubelet/pods/uid/volumes/kubernetes.io~secret/token"
        ))
        .is_some());
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let dir = tempdir().unwrap();
        let fs = share_fs(dir.path());

        fs.prepare().await.unwrap();
        let shared = fs.shared_dir().to_path_buf();
        assert!(shared.is_dir());
        assert!(fs.mount_dir().is_dir());

        // Second prepare observes the same state.
        fs.prepare().await.unwrap();
        assert!(shared.is_dir());

        fs.cleanup().await.unwrap();
        assert!(!shared.exists());
        // Cleanup tolerates being called again.
        fs.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_share_and_unshare_file() {
        let dir = tempdir().unwrap();
        let fs = share_fs(dir.path());
        fs.prepare().await.unwrap();

        let source = dir.path().join("config");
        std::fs::create_dir_all(&source).unwrap();
        let m = Mount::bind(&source, "/etc/config").read_only();

        let shared = fs.share_file("c1", &m).await.unwrap();
        assert!(shared.guest_path.starts_with(guest::SHARED_CONTAINERS_DIR));
        assert!(shared.guest_path.contains("c1-"));
        assert!(shared.guest_path.ends_with("-config"));
        let host = shared.host_path.clone().unwrap();
        assert!(host.exists());

        fs.unshare_file(&shared).await.unwrap();
        assert!(!host.exists());

        fs.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_share_file_names_are_unique_per_call() {
        let dir = tempdir().unwrap();
        let fs = share_fs(dir.path());
        fs.prepare().await.unwrap();

        let source = dir.path().join("data");
        std::fs::create_dir_all(&source).unwrap();
        let m = Mount::bind(&source, "/data");

        let a = fs.share_file("c1", &m).await.unwrap();
        let b = fs.share_file("c1", &m).await.unwrap();
        assert_ne!(a.guest_path, b.guest_path);

        fs.cleanup().await.unwrap();
    }
}
