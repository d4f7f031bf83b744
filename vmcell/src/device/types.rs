//! Device descriptions: the untyped caller-facing `DeviceInfo` and the
//! typed configurations handed to a hypervisor.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::bridge::PciPath;

/// Untyped device description supplied by the caller (usually lifted from
/// an OCI spec's linux devices list).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub host_path: PathBuf,
    pub container_path: String,
    /// `"b"` for block, `"c"` for character.
    pub dev_type: String,
    pub major: i64,
    pub minor: i64,
    #[serde(default)]
    pub file_mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub driver_options: HashMap<String, String>,
}

/// Typed realisation classes a `DeviceInfo` can promote to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Block,
    VhostUserBlk,
    VhostUserNet,
    VhostUserScsi,
    VhostUserFs,
    Vfio,
    Generic,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Block => "block",
            DeviceKind::VhostUserBlk => "vhost-user-blk",
            DeviceKind::VhostUserNet => "vhost-user-net",
            DeviceKind::VhostUserScsi => "vhost-user-scsi",
            DeviceKind::VhostUserFs => "vhost-user-fs",
            DeviceKind::Vfio => "vfio",
            DeviceKind::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// Which virtio transport carries block devices into the guest. Selected
/// by the hypervisor configuration; drives the storage driver the agent
/// sees and which address form identifies the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockDriver {
    #[default]
    VirtioBlock,
    VirtioBlockCcw,
    VirtioMmio,
    VirtioScsi,
}

impl BlockDriver {
    /// Storage driver name the guest agent understands.
    pub fn agent_driver(&self) -> &'static str {
        use vmcell_shared::protocol::storage_driver;
        match self {
            BlockDriver::VirtioBlock => storage_driver::VIRTIO_BLK,
            BlockDriver::VirtioBlockCcw => storage_driver::VIRTIO_BLK_CCW,
            BlockDriver::VirtioMmio => storage_driver::VIRTIO_MMIO,
            BlockDriver::VirtioScsi => storage_driver::VIRTIO_SCSI,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub id: String,
    pub path_on_host: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub driver: BlockDriver,
    /// Ordinal used to derive the `/dev/vdX` name.
    #[serde(default)]
    pub index: u64,
    /// Guest PCI path, filled in after attach.
    #[serde(default)]
    pub pci_path: Option<PciPath>,
    /// Predicted guest device node (`/dev/vda`…) for mmio/virtio-blk.
    #[serde(default)]
    pub virt_path: Option<String>,
    /// SCSI address (`0:0:<index>:0`) when driver is virtio-scsi.
    #[serde(default)]
    pub scsi_addr: Option<String>,
    /// CCW devno (`fe.0.xxxx`) when driver is virtio-blk-ccw.
    #[serde(default)]
    pub devno: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VfioConfig {
    pub id: String,
    /// Host `DDDD:BB:DD.F` address of the passed-through function.
    pub bdf: String,
    /// IOMMU group path under /dev/vfio.
    pub group_path: PathBuf,
    #[serde(default)]
    pub pci_path: Option<PciPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VhostUserConfig {
    pub id: String,
    pub socket_path: PathBuf,
    pub kind: VhostUserKind,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub pci_path: Option<PciPath>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VhostUserKind {
    #[default]
    Blk,
    Net,
    Scsi,
    Fs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: String,
    /// Host-side device handed to the VMM (tap or macvtap).
    pub host_dev_name: String,
    pub guest_mac: String,
    #[serde(default)]
    pub queues: u32,
    #[serde(default)]
    pub pci_path: Option<PciPath>,
    /// Bandwidth caps in bits per second, when the VMM shapes traffic
    /// itself instead of host qdiscs.
    #[serde(default)]
    pub rx_rate_limit_bps: Option<u64>,
    #[serde(default)]
    pub tx_rate_limit_bps: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareFsConfig {
    /// Mount tag the guest uses to identify the share.
    pub tag: String,
    /// Host directory exported into the guest.
    pub source: PathBuf,
    /// vhost-user socket of the virtiofs daemon.
    pub socket_path: PathBuf,
    #[serde(default)]
    pub queues: u32,
    #[serde(default)]
    pub queue_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VsockConfig {
    pub guest_cid: u32,
    /// Host unix socket for hybrid-vsock VMMs; None for vhost-vsock.
    #[serde(default)]
    pub uds_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericConfig {
    pub id: String,
    pub host_path: PathBuf,
    pub container_path: String,
    pub major: i64,
    pub minor: i64,
}

/// Typed device descriptor handed to `Hypervisor::add_device` /
/// `hotplug_add_device`. Hot-plug calls return the same value with guest
/// addressing (pci path, devno, virt path) filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum DeviceConfig {
    Block(BlockConfig),
    Vfio(VfioConfig),
    VhostUser(VhostUserConfig),
    Network(NetworkConfig),
    ShareFs(ShareFsConfig),
    Vsock(VsockConfig),
    Generic(GenericConfig),
}

impl DeviceConfig {
    pub fn id(&self) -> &str {
        match self {
            DeviceConfig::Block(c) => &c.id,
            DeviceConfig::Vfio(c) => &c.id,
            DeviceConfig::VhostUser(c) => &c.id,
            DeviceConfig::Network(c) => &c.id,
            DeviceConfig::ShareFs(c) => &c.tag,
            DeviceConfig::Vsock(_) => "vsock",
            DeviceConfig::Generic(c) => &c.id,
        }
    }
}

/// A registered, ref-counted device.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub info: DeviceInfo,
    pub config: DeviceConfig,
    /// Containers currently referencing the device.
    pub attach_count: u32,
    /// 1 while the device is plugged into the VMM, 0 otherwise.
    pub bound_count: u32,
}

impl Device {
    pub fn is_bound(&self) -> bool {
        self.bound_count > 0
    }
}

/// Derive the predicted guest block-device name for the nth virtio disk.
pub fn disk_name_for_index(index: u64) -> String {
    // vda..vdz, then vdaa..: same scheme the kernel uses for vd* nodes.
    let mut name = Vec::new();
    let mut i = index as i64;
    loop {
        name.push(b'a' + (i % 26) as u8);
        i = i / 26 - 1;
        if i < 0 {
            break;
        }
    }
    name.reverse();
    format!("/dev/vd{}", String::from_utf8(name).expect("ascii"))
}
