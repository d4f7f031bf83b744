//! Rootfs projection: how a container's root filesystem reaches the guest.
//!
//! Dispatch order mirrors how specific the descriptor is: an explicit
//! guest-pull or overlay descriptor wins, then a registered block device,
//! and only a plain host directory falls back to the shared-filesystem
//! bind.

use vmcell_shared::protocol::{storage_driver, Storage};
use vmcell_shared::{Error, Result};

use crate::device::{BlockConfig, BlockDriver};
use crate::layout::guest;
use crate::types::ContainerConfig;

use super::virtual_volume::{volume_type, VirtualVolume};
use super::ShareFs;

/// What the share engine hands back for a rootfs.
#[derive(Debug, Clone, Default)]
pub struct SharedRootfs {
    pub guest_path: String,
    pub storages: Vec<Storage>,
}

impl ShareFs {
    pub async fn share_rootfs(
        &self,
        container: &ContainerConfig,
        force_guest_pull: bool,
        block: Option<&BlockConfig>,
    ) -> Result<SharedRootfs> {
        let cid = &container.id;
        let volume = VirtualVolume::from_options(&container.rootfs.options)?;

        if force_guest_pull
            || volume
                .as_ref()
                .map(|v| v.volume_type == volume_type::IMAGE_GUEST_PULL)
                .unwrap_or(false)
        {
            return guest_pull_rootfs(cid, container, volume.as_ref());
        }

        if let Some(ref volume) = volume {
            if volume.volume_type == volume_type::OVERLAY_FS {
                return overlay_rootfs(cid, volume);
            }
            return Err(Error::ConfigInvalid(format!(
                "unsupported virtual volume type {:?} for a rootfs",
                volume.volume_type
            )));
        }

        if container.rootfs.block_device_id.is_some() {
            let block = block.ok_or_else(|| {
                Error::NotFound(format!(
                    "block device {} for container {}",
                    container.rootfs.block_device_id.as_deref().unwrap_or(""),
                    cid
                ))
            })?;
            return block_rootfs(cid, container, block);
        }

        self.bind_rootfs(container).await
    }

    /// Default path: bind the host rootfs into the shared directory.
    async fn bind_rootfs(&self, container: &ContainerConfig) -> Result<SharedRootfs> {
        let cid = &container.id;
        if container.rootfs.source.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "container {} has no rootfs source",
                cid
            )));
        }

        let host_dest = self.container_mount_dir(cid).join(guest::ROOTFS);
        std::fs::create_dir_all(&host_dest)?;
        if self.can_mount() {
            nix::mount::mount(
                Some(&container.rootfs.source),
                &host_dest,
                None::<&str>,
                nix::mount::MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| {
                Error::Internal(format!(
                    "failed to bind rootfs {} onto {}: {}",
                    container.rootfs.source.display(),
                    host_dest.display(),
                    e
                ))
            })?;
        }
        self.register_share(host_dest);

        Ok(SharedRootfs {
            guest_path: guest::container_rootfs(cid),
            storages: Vec::new(),
        })
    }

    pub async fn unshare_rootfs(&self, container_id: &str) -> Result<()> {
        let container_dir = self.container_mount_dir(container_id);
        let rootfs_dir = container_dir.join(guest::ROOTFS);
        if self.can_mount() {
            let _ = nix::mount::umount2(&rootfs_dir, nix::mount::MntFlags::MNT_DETACH);
        }
        self.forget_share(&rootfs_dir);
        match std::fs::remove_dir_all(&container_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rootfs pulled inside the guest: a single storage record, no host I/O.
fn guest_pull_rootfs(
    cid: &str,
    container: &ContainerConfig,
    volume: Option<&VirtualVolume>,
) -> Result<SharedRootfs> {
    let image = volume
        .and_then(|v| v.image_pull.as_ref())
        .map(|p| p.image.clone())
        .or_else(|| container.image.clone())
        .ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "guest-pull rootfs for container {} needs an image reference",
                cid
            ))
        })?;

    let mut driver_options = Vec::new();
    if let Some(pull) = volume.and_then(|v| v.image_pull.as_ref()) {
        for (k, v) in &pull.metadata {
            driver_options.push(format!("{}={}", k, v));
        }
        driver_options.sort();
    }

    let mount_point = format!("{}/{}/{}", guest::SANDBOX_RUN_DIR, cid, guest::ROOTFS);
    Ok(SharedRootfs {
        guest_path: mount_point.clone(),
        storages: vec![Storage {
            driver: storage_driver::IMAGE_GUEST_PULL.to_string(),
            driver_options,
            source: image,
            fs_type: "overlay".to_string(),
            options: Vec::new(),
            mount_point,
        }],
    })
}

/// Pre-assembled layer set mounted as an overlay by the guest.
fn overlay_rootfs(cid: &str, volume: &VirtualVolume) -> Result<SharedRootfs> {
    let overlay = volume.overlay.as_ref().ok_or_else(|| {
        Error::ConfigInvalid(format!(
            "overlay rootfs for container {} has no layer description",
            cid
        ))
    })?;
    if overlay.lower_dirs.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "overlay rootfs for container {} has no lower layers",
            cid
        )));
    }

    let mount_point = format!("{}/{}/{}", guest::SANDBOX_RUN_DIR, cid, guest::ROOTFS);
    let mut options = vec![format!("lowerdir={}", overlay.lower_dirs.join(":"))];
    if !overlay.upper_dir.is_empty() {
        options.push(format!("upperdir={}", overlay.upper_dir));
        options.push(format!("workdir={}", overlay.work_dir));
    }
    options.extend(volume.options.iter().cloned());

    Ok(SharedRootfs {
        guest_path: mount_point.clone(),
        storages: vec![Storage {
            driver: storage_driver::OVERLAY_FS.to_string(),
            driver_options: Vec::new(),
            source: "overlay".to_string(),
            fs_type: "overlay".to_string(),
            options,
            mount_point,
        }],
    })
}

/// Rootfs on a block device already attached through the device manager.
/// The storage source form follows the transport the hypervisor uses.
fn block_rootfs(cid: &str, container: &ContainerConfig, block: &BlockConfig) -> Result<SharedRootfs> {
    let source = match block.driver {
        BlockDriver::VirtioBlock => block
            .pci_path
            .as_ref()
            .map(|p| p.to_string())
            .ok_or_else(|| {
                Error::Internal(format!("block device {} has no pci path", block.id))
            })?,
        BlockDriver::VirtioBlockCcw => block.devno.clone().ok_or_else(|| {
            Error::Internal(format!("block device {} has no ccw address", block.id))
        })?,
        BlockDriver::VirtioMmio => block.virt_path.clone().ok_or_else(|| {
            Error::Internal(format!("block device {} has no virt path", block.id))
        })?,
        BlockDriver::VirtioScsi => block.scsi_addr.clone().ok_or_else(|| {
            Error::Internal(format!("block device {} has no scsi address", block.id))
        })?,
    };

    let mut options = container.rootfs.options.clone();
    ensure_nouuid(&container.rootfs.fs_type, &mut options);

    let mount_point = format!("{}/{}/{}", guest::SANDBOX_RUN_DIR, cid, guest::ROOTFS);
    Ok(SharedRootfs {
        guest_path: mount_point.clone(),
        storages: vec![Storage {
            driver: block.driver.agent_driver().to_string(),
            driver_options: Vec::new(),
            source,
            fs_type: container.rootfs.fs_type.clone(),
            options,
            mount_point,
        }],
    })
}

/// xfs refuses to mount two filesystems with the same UUID, which is
/// exactly what block-backed snapshots produce. Appending is idempotent.
fn ensure_nouuid(fs_type: &str, options: &mut Vec<String>) {
    if fs_type == "xfs" && !options.iter().any(|o| o == "nouuid") {
        options.push("nouuid".to_string());
    }
}
