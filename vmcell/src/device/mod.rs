//! Ref-counted catalogue of devices attached to a sandbox.
//!
//! The manager owns the promotion of untyped [`DeviceInfo`] descriptions
//! into typed devices, the bridge/slot topology, and the decision whether
//! an attach becomes a cold-plug or a live hot-plug. Reference-count
//! mutation happens under the same lock as the hypervisor call it
//! triggers, so the VMM observes operations in registry order.
//!
//! Counting rules:
//! - `attach` from the first container binds the device to the VMM
//!   (`bound_count` 0 → 1) and allocates a bridge slot where the transport
//!   needs one;
//! - further attaches only bump `attach_count`;
//! - the last `detach` unbinds (hot-unplug when the VM runs) and frees the
//!   slot;
//! - `remove` refuses with `InUse` until both counters are zero.
//!
//! With no hypervisor present (registry-only mode, e.g. during teardown
//! after VMM exit) attach/detach are pure bookkeeping.

pub mod bridge;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::hypervisor::{Hypervisor, VmmState};
use crate::persist::state::BridgeState;
use vmcell_shared::{Error, Result};

pub use bridge::{BridgeAllocator, BridgeKind, PciPath, SlotAssignment};
pub use types::{
    disk_name_for_index, BlockConfig, BlockDriver, Device, DeviceConfig, DeviceInfo, DeviceKind,
    GenericConfig, NetworkConfig, ShareFsConfig, VfioConfig, VhostUserConfig, VhostUserKind,
    VsockConfig,
};

/// Path prefix marking VFIO group device nodes.
const VFIO_DEV_PREFIX: &str = "/dev/vfio/";
/// Directory component marking vhost-user backend sockets.
const VHOST_USER_DIR: &str = "vhost-user";

struct Entry {
    device: Device,
    attachers: HashSet<String>,
    assignment: Option<SlotAssignment>,
}

pub struct DeviceManager {
    sandbox_id: String,
    entries: HashMap<String, Entry>,
    host_index: HashMap<PathBuf, String>,
    bridges: BridgeAllocator,
    block_driver: BlockDriver,
    next_block_index: u64,
    hypervisor: Option<Arc<dyn Hypervisor>>,
}

impl DeviceManager {
    pub fn new(
        sandbox_id: &str,
        block_driver: BlockDriver,
        hypervisor: Option<Arc<dyn Hypervisor>>,
        bridge_kind: BridgeKind,
        bridge_count: u32,
    ) -> Self {
        let mut bridges = BridgeAllocator::new();
        for i in 0..bridge_count {
            // Root-bus slots 0 and 1 are host bridge and platform devices.
            bridges.add_bridge(bridge_kind, 2 + i);
        }
        Self {
            sandbox_id: sandbox_id.to_string(),
            entries: HashMap::new(),
            host_index: HashMap::new(),
            bridges,
            block_driver,
            next_block_index: 0,
            hypervisor,
        }
    }

    /// Drop the hypervisor handle; subsequent detaches become pure registry
    /// operations.
    pub fn clear_hypervisor(&mut self) {
        self.hypervisor = None;
    }

    pub fn bridge_state(&self) -> Vec<BridgeState> {
        self.bridges.to_state()
    }

    pub fn restore_bridges(&mut self, state: &[BridgeState]) -> Result<()> {
        self.bridges = BridgeAllocator::from_state(state)?;
        Ok(())
    }

    /// Promote a `DeviceInfo` into a registered device, reusing an existing
    /// registration when the host path matches.
    pub fn new_device(&mut self, info: &DeviceInfo) -> Result<String> {
        if let Some(existing) = self.host_index.get(&info.host_path) {
            return Ok(existing.clone());
        }

        let kind = classify(info);
        let id = format!("{}-{}", kind, short_uid());
        let config = self.build_config(&id, kind, info)?;

        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            device_id = %id,
            kind = %kind,
            host_path = %info.host_path.display(),
            "registered device"
        );

        self.host_index.insert(info.host_path.clone(), id.clone());
        self.entries.insert(
            id.clone(),
            Entry {
                device: Device {
                    id: id.clone(),
                    kind,
                    info: info.clone(),
                    config,
                    attach_count: 0,
                    bound_count: 0,
                },
                attachers: HashSet::new(),
                assignment: None,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.entries.get(id).map(|e| e.device.clone())
    }

    pub fn get_by_host_path(&self, host_path: &Path) -> Option<Device> {
        self.host_index
            .get(host_path)
            .and_then(|id| self.get(id))
    }

    pub fn block_driver(&self) -> BlockDriver {
        self.block_driver
    }

    /// Attach the device on behalf of `receiver` (a container id). The
    /// first attacher triggers the plug path.
    pub async fn attach(&mut self, id: &str, receiver: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;

        if !entry.attachers.insert(receiver.to_string()) {
            // Same container attaching twice is a no-op.
            return Ok(());
        }
        entry.device.attach_count += 1;
        if entry.device.attach_count > 1 {
            return Ok(());
        }

        // First reference: allocate addressing and plug into the VMM.
        let assignment = match allocate_slot(&mut self.bridges, &mut self.entries, id) {
            Ok(a) => a,
            Err(e) => {
                let entry = self.entries.get_mut(id).expect("still present");
                entry.attachers.remove(receiver);
                entry.device.attach_count -= 1;
                return Err(e);
            }
        };

        let entry = self.entries.get_mut(id).expect("still present");
        if let Some(ref a) = assignment {
            apply_assignment(&mut entry.device.config, a);
            entry.assignment = assignment.clone();
        }

        let plug_result = match self.hypervisor.as_ref() {
            None => Ok(None),
            Some(h) => {
                let config = entry.device.config.clone();
                if h.vmm_state().await == VmmState::Running {
                    h.hotplug_add_device(config).await.map(Some)
                } else {
                    h.add_device(config).await.map(|_| None)
                }
            }
        };

        let entry = self.entries.get_mut(id).expect("still present");
        match plug_result {
            Ok(updated) => {
                if let Some(updated) = updated {
                    entry.device.config = updated;
                }
                if self.hypervisor.is_some() {
                    entry.device.bound_count = 1;
                }
                Ok(())
            }
            Err(e) => {
                entry.attachers.remove(receiver);
                entry.device.attach_count -= 1;
                if entry.assignment.take().is_some() {
                    let _ = self.bridges.remove_device(id);
                }
                Err(e)
            }
        }
    }

    /// Release `receiver`'s reference. The last detach unplugs the device.
    pub async fn detach(&mut self, id: &str, receiver: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;

        if !entry.attachers.remove(receiver) {
            return Ok(());
        }
        entry.device.attach_count = entry.device.attach_count.saturating_sub(1);
        if entry.device.attach_count > 0 {
            return Ok(());
        }

        if entry.device.bound_count > 0 {
            if let Some(h) = self.hypervisor.as_ref() {
                if h.vmm_state().await == VmmState::Running {
                    let config = entry.device.config.clone();
                    h.hotplug_remove_device(config).await?;
                }
            }
            // With the hypervisor gone, unbinding is a registry operation.
            let entry = self.entries.get_mut(id).expect("still present");
            entry.device.bound_count = 0;
        }

        let entry = self.entries.get_mut(id).expect("still present");
        if entry.assignment.take().is_some() {
            self.bridges.remove_device(id)?;
        }
        Ok(())
    }

    /// Drop the registration entirely. Refused while referenced.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;
        if entry.device.attach_count > 0 || entry.device.bound_count > 0 {
            return Err(Error::InUse(format!("device {}", id)));
        }
        let entry = self.entries.remove(id).expect("checked above");
        self.host_index.remove(&entry.device.info.host_path);
        Ok(())
    }

    fn build_config(&mut self, id: &str, kind: DeviceKind, info: &DeviceInfo) -> Result<DeviceConfig> {
        let config = match kind {
            DeviceKind::Block => {
                let index = self.next_block_index;
                self.next_block_index += 1;
                DeviceConfig::Block(BlockConfig {
                    id: id.to_string(),
                    path_on_host: info.host_path.clone(),
                    read_only: info.driver_options.get("readonly").map(|v| v == "true").unwrap_or(false),
                    driver: self.block_driver,
                    index,
                    virt_path: Some(disk_name_for_index(index)),
                    scsi_addr: match self.block_driver {
                        BlockDriver::VirtioScsi => Some(format!("0:0:{}:0", index)),
                        _ => None,
                    },
                    ..Default::default()
                })
            }
            DeviceKind::Vfio => DeviceConfig::Vfio(VfioConfig {
                id: id.to_string(),
                bdf: info.driver_options.get("bdf").cloned().unwrap_or_default(),
                group_path: info.host_path.clone(),
                pci_path: None,
            }),
            DeviceKind::VhostUserBlk
            | DeviceKind::VhostUserNet
            | DeviceKind::VhostUserScsi
            | DeviceKind::VhostUserFs => DeviceConfig::VhostUser(VhostUserConfig {
                id: id.to_string(),
                socket_path: info.host_path.clone(),
                kind: match kind {
                    DeviceKind::VhostUserBlk => VhostUserKind::Blk,
                    DeviceKind::VhostUserNet => VhostUserKind::Net,
                    DeviceKind::VhostUserScsi => VhostUserKind::Scsi,
                    _ => VhostUserKind::Fs,
                },
                mac_address: info.driver_options.get("mac").cloned(),
                pci_path: None,
            }),
            DeviceKind::Generic => DeviceConfig::Generic(GenericConfig {
                id: id.to_string(),
                host_path: info.host_path.clone(),
                container_path: info.container_path.clone(),
                major: info.major,
                minor: info.minor,
            }),
        };
        Ok(config)
    }
}

/// Whether this device class occupies a bridge slot, and on which bus.
fn bridge_kind_for(config: &DeviceConfig) -> Option<BridgeKind> {
    match config {
        DeviceConfig::Block(c) => match c.driver {
            BlockDriver::VirtioBlock => Some(BridgeKind::Pci),
            BlockDriver::VirtioBlockCcw => Some(BridgeKind::Ccw),
            BlockDriver::VirtioMmio | BlockDriver::VirtioScsi => None,
        },
        DeviceConfig::Vfio(_) => Some(BridgeKind::Pci),
        DeviceConfig::VhostUser(_) => Some(BridgeKind::Pci),
        DeviceConfig::Network(_) => Some(BridgeKind::Pci),
        DeviceConfig::ShareFs(_) | DeviceConfig::Vsock(_) | DeviceConfig::Generic(_) => None,
    }
}

fn allocate_slot(
    bridges: &mut BridgeAllocator,
    entries: &mut HashMap<String, Entry>,
    id: &str,
) -> Result<Option<SlotAssignment>> {
    let entry = entries.get(id).expect("caller checked");
    match bridge_kind_for(&entry.device.config) {
        None => Ok(None),
        Some(kind) => bridges.add_device(id, kind).map(Some),
    }
}

fn apply_assignment(config: &mut DeviceConfig, assignment: &SlotAssignment) {
    match config {
        DeviceConfig::Block(c) => {
            c.pci_path = Some(assignment.pci_path());
            if c.driver == BlockDriver::VirtioBlockCcw {
                c.devno = Some(assignment.ccw_addr());
            }
        }
        DeviceConfig::Vfio(c) => c.pci_path = Some(assignment.pci_path()),
        DeviceConfig::VhostUser(c) => c.pci_path = Some(assignment.pci_path()),
        DeviceConfig::Network(c) => c.pci_path = Some(assignment.pci_path()),
        _ => {}
    }
}

fn classify(info: &DeviceInfo) -> DeviceKind {
    let path = info.host_path.to_string_lossy();
    if path.starts_with(VFIO_DEV_PREFIX) {
        return DeviceKind::Vfio;
    }
    if path.contains(VHOST_USER_DIR) {
        // Socket layout is <store>/vhost-user/<subtype>/<name>.sock; the
        // subtype may also arrive as an explicit driver option.
        let subtype = info
            .driver_options
            .get("type")
            .cloned()
            .or_else(|| {
                info.host_path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        return match subtype.as_str() {
            "net" => DeviceKind::VhostUserNet,
            "scsi" => DeviceKind::VhostUserScsi,
            "fs" => DeviceKind::VhostUserFs,
            _ => DeviceKind::VhostUserBlk,
        };
    }
    if info.dev_type == "b" {
        return DeviceKind::Block;
    }
    DeviceKind::Generic
}

fn short_uid() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHypervisor;

    fn block_info(path: &str) -> DeviceInfo {
        DeviceInfo {
            host_path: path.into(),
            container_path: "/dev/xda".into(),
            dev_type: "b".into(),
            major: 259,
            minor: 0,
            ..Default::default()
        }
    }

    fn manager_with_mock() -> (DeviceManager, Arc<MockHypervisor>) {
        let hypervisor = Arc::new(MockHypervisor::new());
        let mgr = DeviceManager::new(
            "sb1",
            BlockDriver::VirtioBlock,
            Some(hypervisor.clone()),
            BridgeKind::Pci,
            1,
        );
        (mgr, hypervisor)
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&block_info("/dev/loop3")), DeviceKind::Block);
        assert_eq!(
            classify(&DeviceInfo {
                host_path: "/dev/vfio/12".into(),
                ..Default::default()
            }),
            DeviceKind::Vfio
        );
        assert_eq!(
            classify(&DeviceInfo {
                host_path: "/run/store/vhost-user/net/eth0.sock".into(),
                ..Default::default()
            }),
            DeviceKind::VhostUserNet
        );
        assert_eq!(
            classify(&DeviceInfo {
                host_path: "/dev/null".into(),
                dev_type: "c".into(),
                ..Default::default()
            }),
            DeviceKind::Generic
        );
    }

    #[test]
    fn test_new_device_dedup_by_host_path() {
        let (mut mgr, _) = manager_with_mock();
        let a = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        let b = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_ref_counting_two_containers() {
        let (mut mgr, hypervisor) = manager_with_mock();
        hypervisor.set_state(VmmState::Running).await;

        let id = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        mgr.attach(&id, "c1").await.unwrap();
        mgr.attach(&id, "c2").await.unwrap();

        let dev = mgr.get(&id).unwrap();
        assert_eq!(dev.attach_count, 2);
        assert_eq!(dev.bound_count, 1);
        assert_eq!(hypervisor.hotplug_added().await.len(), 1);

        // First detach keeps the device plugged.
        mgr.detach(&id, "c1").await.unwrap();
        let dev = mgr.get(&id).unwrap();
        assert_eq!(dev.attach_count, 1);
        assert_eq!(dev.bound_count, 1);
        assert!(hypervisor.hotplug_removed().await.is_empty());

        // Last detach unplugs.
        mgr.detach(&id, "c2").await.unwrap();
        let dev = mgr.get(&id).unwrap();
        assert_eq!(dev.attach_count, 0);
        assert_eq!(dev.bound_count, 0);
        assert_eq!(hypervisor.hotplug_removed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_in_use() {
        let (mut mgr, hypervisor) = manager_with_mock();
        hypervisor.set_state(VmmState::Running).await;

        let id = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        mgr.attach(&id, "c1").await.unwrap();
        assert!(matches!(mgr.remove(&id), Err(Error::InUse(_))));

        mgr.detach(&id, "c1").await.unwrap();
        mgr.remove(&id).unwrap();
        assert!(mgr.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_cold_plug_before_running() {
        let (mut mgr, hypervisor) = manager_with_mock();
        hypervisor.set_state(VmmState::Configured).await;

        let id = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        mgr.attach(&id, "c1").await.unwrap();

        assert_eq!(hypervisor.cold_added().await.len(), 1);
        assert!(hypervisor.hotplug_added().await.is_empty());
    }

    #[tokio::test]
    async fn test_detach_without_hypervisor_is_registry_only() {
        let mut mgr = DeviceManager::new("sb1", BlockDriver::VirtioBlock, None, BridgeKind::Pci, 1);
        let id = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        mgr.attach(&id, "c1").await.unwrap();

        let dev = mgr.get(&id).unwrap();
        assert_eq!(dev.attach_count, 1);
        assert_eq!(dev.bound_count, 0);

        mgr.detach(&id, "c1").await.unwrap();
        mgr.remove(&id).unwrap();
    }

    #[tokio::test]
    async fn test_same_container_attach_is_idempotent() {
        let (mut mgr, hypervisor) = manager_with_mock();
        hypervisor.set_state(VmmState::Running).await;

        let id = mgr.new_device(&block_info("/dev/loop3")).unwrap();
        mgr.attach(&id, "c1").await.unwrap();
        mgr.attach(&id, "c1").await.unwrap();
        assert_eq!(mgr.get(&id).unwrap().attach_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_hotplugs_are_serialised() {
        let hypervisor = Arc::new(MockHypervisor::new());
        hypervisor.set_state(VmmState::Running).await;
        let mgr = Arc::new(tokio::sync::Mutex::new(DeviceManager::new(
            "sb1",
            BlockDriver::VirtioBlock,
            Some(hypervisor.clone()),
            BridgeKind::Pci,
            1,
        )));

        let id_a = mgr.lock().await.new_device(&block_info("/dev/loop1")).unwrap();
        let id_b = mgr.lock().await.new_device(&block_info("/dev/loop2")).unwrap();

        let mut tasks = Vec::new();
        for (device_id, cid) in [(id_a.clone(), "c1"), (id_b.clone(), "c2")] {
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                mgr.lock().await.attach(&device_id, cid).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Both plugs reached the monitor exactly once, in one total order
        // (never interleaved: the registry lock is held across each call).
        let added = hypervisor.hotplug_added().await;
        let mut ids: Vec<String> = added.iter().map(|d| d.id().to_string()).collect();
        ids.sort();
        let mut expected = vec![id_a, id_b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_scsi_address_assigned() {
        let hypervisor = Arc::new(MockHypervisor::new());
        let mut mgr = DeviceManager::new(
            "sb1",
            BlockDriver::VirtioScsi,
            Some(hypervisor),
            BridgeKind::Pci,
            1,
        );
        let id = mgr.new_device(&block_info("/dev/loop9")).unwrap();
        match mgr.get(&id).unwrap().config {
            DeviceConfig::Block(c) => assert_eq!(c.scsi_addr.as_deref(), Some("0:0:0:0")),
            other => panic!("unexpected config {:?}", other),
        }
    }
}
