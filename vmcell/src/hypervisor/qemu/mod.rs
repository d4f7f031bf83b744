//! QEMU-class engine: QMP monitor, full hot-plug, virtio-fs sharing.

mod cmdline;
mod qmp;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, RwLock};

use crate::device::{BlockDriver, DeviceConfig};
use crate::layout::RuntimeLayout;
use crate::persist::state::HypervisorState;
use crate::util;
use vmcell_shared::{Error, Result, Transport};

use super::config::HypervisorConfig;
use super::{Capabilities, ConsoleKind, Hypervisor, MemoryDevice, VcpuThreadIds, VmmState};
use cmdline::QemuCmdLine;
use qmp::QmpClient;

/// Grace given to a guest shutdown before signalling the VMM.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace given to SIGTERM before SIGKILL.
const SIGTERM_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the monitor socket.
const MONITOR_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct QemuHypervisor {
    inner: Arc<RwLock<QemuInner>>,
}

struct QemuInner {
    layout: RuntimeLayout,
    id: String,
    uuid: String,
    netns: Option<String>,
    config: Option<HypervisorConfig>,
    state: VmmState,
    pending_devices: Vec<DeviceConfig>,
    qmp: Option<QmpClient>,
    child_pid: Option<u32>,
    virtiofsd_pid: Option<u32>,
    exit_rx: Option<watch::Receiver<Option<i32>>>,
    current_vcpus: u32,
    current_memory_mib: u32,
    hotplugged_vcpus: Vec<u32>,
    hotplugged_memory_mib: u32,
    next_memory_slot: u32,
}

impl QemuHypervisor {
    pub fn new(layout: RuntimeLayout) -> Self {
        Self {
            inner: Arc::new(RwLock::new(QemuInner {
                layout,
                id: String::new(),
                uuid: String::new(),
                netns: None,
                config: None,
                state: VmmState::Unconfigured,
                pending_devices: Vec::new(),
                qmp: None,
                child_pid: None,
                virtiofsd_pid: None,
                exit_rx: None,
                current_vcpus: 0,
                current_memory_mib: 0,
                hotplugged_vcpus: Vec::new(),
                hotplugged_memory_mib: 0,
                next_memory_slot: 0,
            })),
        }
    }
}

impl QemuInner {
    fn config(&self) -> Result<&HypervisorConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::InvalidState("vm has not been created".to_string()))
    }

    fn require_state(&self, allowed: &[VmmState], what: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} not permitted in vmm state {:?}",
                what, self.state
            )))
        }
    }

    fn qmp(&mut self) -> Result<&mut QmpClient> {
        self.qmp
            .as_mut()
            .ok_or_else(|| Error::MonitorTransport("monitor not connected".to_string()))
    }

    /// Bus/addr arguments for a hot-plugged PCI device, derived from the
    /// path the bridge allocator assigned.
    fn plug_location(device: &DeviceConfig) -> (Option<String>, Option<String>) {
        let pci_path = match device {
            DeviceConfig::Block(c) => c.pci_path.as_ref(),
            DeviceConfig::Vfio(c) => c.pci_path.as_ref(),
            DeviceConfig::VhostUser(c) => c.pci_path.as_ref(),
            DeviceConfig::Network(c) => c.pci_path.as_ref(),
            _ => None,
        };
        match pci_path.map(|p| p.slots()) {
            Some([bridge_addr, slot, ..]) => (
                Some(format!("pci-bridge-{}", bridge_addr.saturating_sub(2))),
                Some(format!("{:#04x}", slot)),
            ),
            _ => (None, None),
        }
    }

    async fn hotplug_add(&mut self, device: DeviceConfig) -> Result<DeviceConfig> {
        let (bus, addr) = Self::plug_location(&device);
        match &device {
            DeviceConfig::Block(block) => {
                let node = block.id.clone();
                self.qmp()?
                    .execute(
                        "blockdev-add",
                        Some(json!({
                            "driver": "raw",
                            "node-name": node,
                            "read-only": block.read_only,
                            "file": {
                                "driver": "file",
                                "filename": block.path_on_host.display().to_string(),
                            },
                        })),
                    )
                    .await?;

                let mut args = json!({
                    "id": format!("frontend-{}", block.id),
                    "drive": block.id,
                });
                match block.driver {
                    BlockDriver::VirtioBlockCcw => {
                        args["driver"] = json!("virtio-blk-ccw");
                        if let Some(ref devno) = block.devno {
                            args["devno"] = json!(devno);
                        }
                    }
                    BlockDriver::VirtioScsi => {
                        args["driver"] = json!("scsi-hd");
                    }
                    _ => {
                        args["driver"] = json!("virtio-blk-pci");
                        if let Some(bus) = bus {
                            args["bus"] = json!(bus);
                        }
                        if let Some(addr) = addr {
                            args["addr"] = json!(addr);
                        }
                    }
                }
                self.qmp()?.execute("device_add", Some(args)).await?;
            }
            DeviceConfig::Network(net) => {
                self.qmp()?
                    .execute(
                        "netdev_add",
                        Some(json!({
                            "type": "tap",
                            "id": format!("net-{}", net.id),
                            "ifname": net.host_dev_name,
                        })),
                    )
                    .await?;
                let mut args = json!({
                    "driver": "virtio-net-pci",
                    "id": net.id,
                    "netdev": format!("net-{}", net.id),
                    "mac": net.guest_mac,
                });
                if let Some(bus) = bus {
                    args["bus"] = json!(bus);
                }
                if let Some(addr) = addr {
                    args["addr"] = json!(addr);
                }
                self.qmp()?.execute("device_add", Some(args)).await?;
            }
            DeviceConfig::Vfio(vfio) => {
                let mut args = json!({
                    "driver": "vfio-pci",
                    "id": vfio.id,
                    "host": vfio.bdf,
                });
                if let Some(bus) = bus {
                    args["bus"] = json!(bus);
                }
                self.qmp()?.execute("device_add", Some(args)).await?;
            }
            DeviceConfig::VhostUser(vu) => {
                self.qmp()?
                    .execute(
                        "chardev-add",
                        Some(json!({
                            "id": format!("char-{}", vu.id),
                            "backend": {
                                "type": "socket",
                                "data": {
                                    "addr": {
                                        "type": "unix",
                                        "data": { "path": vu.socket_path.display().to_string() }
                                    },
                                    "server": false,
                                }
                            }
                        })),
                    )
                    .await?;
                self.qmp()?
                    .execute(
                        "device_add",
                        Some(json!({
                            "driver": "vhost-user-blk-pci",
                            "id": vu.id,
                            "chardev": format!("char-{}", vu.id),
                        })),
                    )
                    .await?;
            }
            DeviceConfig::ShareFs(_) | DeviceConfig::Vsock(_) | DeviceConfig::Generic(_) => {
                return Err(Error::Unsupported(format!(
                    "hot-plug of {:?} devices",
                    device.id()
                )));
            }
        }
        Ok(device)
    }

    async fn hotplug_remove(&mut self, device: DeviceConfig) -> Result<DeviceConfig> {
        match &device {
            DeviceConfig::Block(block) => {
                self.qmp()?
                    .execute(
                        "device_del",
                        Some(json!({ "id": format!("frontend-{}", block.id) })),
                    )
                    .await?;
                self.qmp()?
                    .execute("blockdev-del", Some(json!({ "node-name": block.id })))
                    .await?;
            }
            DeviceConfig::Network(net) => {
                self.qmp()?
                    .execute("device_del", Some(json!({ "id": net.id })))
                    .await?;
                self.qmp()?
                    .execute("netdev_del", Some(json!({ "id": format!("net-{}", net.id) })))
                    .await?;
            }
            DeviceConfig::Vfio(vfio) => {
                self.qmp()?
                    .execute("device_del", Some(json!({ "id": vfio.id })))
                    .await?;
            }
            DeviceConfig::VhostUser(vu) => {
                self.qmp()?
                    .execute("device_del", Some(json!({ "id": vu.id })))
                    .await?;
                self.qmp()?
                    .execute(
                        "chardev-remove",
                        Some(json!({ "id": format!("char-{}", vu.id) })),
                    )
                    .await?;
            }
            _ => {
                return Err(Error::Unsupported(format!(
                    "hot-unplug of {:?} devices",
                    device.id()
                )));
            }
        }
        Ok(device)
    }

    async fn wait_exit(&self, timeout: Duration) -> Option<i32> {
        let mut rx = self.exit_rx.clone()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = *rx.borrow() {
                return Some(status);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped: the reaper is gone, treat as exited.
                Ok(Err(_)) => return Some(0),
                Err(_) => return None,
            }
        }
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    async fn create_vm(
        &self,
        id: &str,
        netns: Option<String>,
        config: &HypervisorConfig,
    ) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Unconfigured], "create_vm")?;

        std::fs::create_dir_all(inner.layout.sandbox_run_dir(id))?;
        inner.id = id.to_string();
        inner.uuid = uuid::Uuid::new_v4().to_string();
        inner.netns = netns;
        inner.current_vcpus = config.default_vcpus;
        inner.current_memory_mib = config.default_memory_mib;
        inner.config = Some(config.clone());
        inner.state = VmmState::Configured;
        Ok(())
    }

    async fn start_vm(&self, timeout_secs: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Configured], "start_vm")?;
        let config = inner.config()?.clone();

        let qmp_socket = inner.layout.hypervisor_api_socket(&inner.id)?;
        let console_socket = inner.layout.console_socket(&inner.id)?;
        let virtiofsd_socket = inner.layout.virtiofsd_socket(&inner.id)?;

        // The virtiofs daemon must be listening before QEMU connects to it.
        let mut virtiofsd_socket_arg = None;
        if let Some(share) = inner.pending_devices.iter().find_map(|d| match d {
            DeviceConfig::ShareFs(fs) => Some(fs.clone()),
            _ => None,
        }) {
            let virtiofsd = config.virtiofsd_path.clone().ok_or_else(|| {
                Error::ConfigInvalid("share device queued without a virtiofsd path".to_string())
            })?;
            let child = tokio::process::Command::new(&virtiofsd)
                .arg(format!("--socket-path={}", virtiofsd_socket.display()))
                .arg("--shared-dir")
                .arg(&share.source)
                .arg("--cache")
                .arg("auto")
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::ProcessSpawn(format!("{}: {}", virtiofsd.display(), e)))?;
            inner.virtiofsd_pid = child.id();
            tokio::spawn(async move {
                let mut child = child;
                let _ = child.wait().await;
            });
            virtiofsd_socket_arg = Some(virtiofsd_socket.clone());
        }

        let args = QemuCmdLine::new(&inner.id, &inner.uuid, &config).build(
            &qmp_socket,
            &console_socket,
            virtiofsd_socket_arg.as_deref(),
            &inner.pending_devices,
        )?;

        tracing::info!(
            sandbox_id = %inner.id,
            vmm = %config.vmm_path.display(),
            "starting vmm"
        );
        tracing::debug!(sandbox_id = %inner.id, args = ?args, "vmm command line");

        let mut command = tokio::process::Command::new(&config.vmm_path);
        command.args(&args);
        if let Some(ref netns) = inner.netns {
            util::enter_netns_on_exec(&mut command, netns)?;
        }
        let mut child = command
            .spawn()
            .map_err(|e| Error::ProcessSpawn(format!("{}: {}", config.vmm_path.display(), e)))?;

        inner.child_pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        inner.exit_rx = Some(exit_rx);
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
            let _ = exit_tx.send(Some(code));
        });
        inner.state = VmmState::Ready;

        // Monitor handshake bounded by the caller's timeout.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs as u64);
        let qmp = loop {
            match QmpClient::connect(&qmp_socket).await {
                Ok(client) => break client,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    if let Some(code) = inner.wait_exit(Duration::from_millis(1)).await {
                        return Err(Error::ProcessSpawn(format!(
                            "vmm exited with status {} before the monitor came up",
                            code
                        )));
                    }
                    tokio::time::sleep(MONITOR_RETRY_DELAY).await;
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        what: "vmm monitor handshake".to_string(),
                        seconds: timeout_secs as u64,
                    });
                }
            }
        };

        inner.qmp = Some(qmp);
        inner.state = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, wait_only: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state == VmmState::Stopped {
            return Ok(());
        }
        if inner.state == VmmState::Configured || inner.state == VmmState::Unconfigured {
            inner.state = VmmState::Stopped;
            return Ok(());
        }

        // Ordered teardown: drop the monitor first so a wedged QMP cannot
        // stall the escalation below.
        let mut qmp = inner.qmp.take();
        if !wait_only {
            if let Some(ref mut client) = qmp {
                let _ = client.execute("quit", None).await;
            }
        }
        drop(qmp);

        let exited = inner.wait_exit(GRACEFUL_EXIT_TIMEOUT).await.is_some();
        if !exited {
            if let Some(pid) = inner.child_pid {
                tracing::warn!(sandbox_id = %inner.id, pid, "vmm ignored shutdown, sending SIGTERM");
                util::send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                if inner.wait_exit(SIGTERM_EXIT_TIMEOUT).await.is_none() {
                    tracing::warn!(sandbox_id = %inner.id, pid, "vmm ignored SIGTERM, sending SIGKILL");
                    util::send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                    let _ = inner.wait_exit(SIGTERM_EXIT_TIMEOUT).await;
                }
            }
        }

        if let Some(pid) = inner.virtiofsd_pid.take() {
            util::send_signal(pid, nix::sys::signal::Signal::SIGTERM);
        }

        inner.child_pid = None;
        inner.state = VmmState::Stopped;

        let run_dir = inner.layout.sandbox_run_dir(&inner.id);
        if let Err(e) = std::fs::remove_dir_all(&run_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %run_dir.display(), error = %e, "failed to remove vm directory");
            }
        }
        Ok(())
    }

    async fn pause_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "pause_vm")?;
        inner.qmp()?.execute("stop", None).await?;
        inner.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Paused], "resume_vm")?;
        inner.qmp()?.execute("cont", None).await?;
        inner.state = VmmState::Running;
        Ok(())
    }

    async fn add_device(&self, device: DeviceConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Configured], "add_device")?;
        inner.pending_devices.push(device);
        Ok(())
    }

    async fn hotplug_add_device(&self, device: DeviceConfig) -> Result<DeviceConfig> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "hotplug_add_device")?;
        inner.hotplug_add(device).await
    }

    async fn hotplug_remove_device(&self, device: DeviceConfig) -> Result<DeviceConfig> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "hotplug_remove_device")?;
        inner.hotplug_remove(device).await
    }

    async fn resize_memory(
        &self,
        target_mib: u32,
        _block_size_mib: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryDevice>)> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "resize_memory")?;
        let config = inner.config()?.clone();

        if !config.memory_hotplug_allowed() {
            return Err(Error::Unsupported(
                "memory hot-plug with confidential protection".to_string(),
            ));
        }

        let current = inner.current_memory_mib;
        if target_mib == current {
            return Ok((current, None));
        }
        if target_mib < current {
            // Backing VMMs report zero bytes removed without an error;
            // treat shrink as a no-op success.
            tracing::warn!(
                sandbox_id = %inner.id,
                current_mib = current,
                target_mib,
                "memory hot-unplug not performed"
            );
            return Ok((current, None));
        }
        let target = target_mib.min(config.max_memory_mib());

        if config.enable_virtio_mem {
            let requested_bytes = (target as u64 - config.default_memory_mib as u64) << 20;
            inner
                .qmp()?
                .execute(
                    "qom-set",
                    Some(json!({
                        "path": "/machine/peripheral/virtiomem0",
                        "property": "requested-size",
                        "value": requested_bytes,
                    })),
                )
                .await?;
            inner.current_memory_mib = target;
            return Ok((target, None));
        }

        let size_mib = target - current;
        let slot = inner.next_memory_slot;
        inner.next_memory_slot += 1;
        inner
            .qmp()?
            .execute(
                "object-add",
                Some(json!({
                    "qom-type": "memory-backend-ram",
                    "id": format!("memslot{}", slot),
                    "size": (size_mib as u64) << 20,
                })),
            )
            .await?;
        inner
            .qmp()?
            .execute(
                "device_add",
                Some(json!({
                    "driver": "pc-dimm",
                    "id": format!("dimm{}", slot),
                    "memdev": format!("memslot{}", slot),
                })),
            )
            .await?;

        inner.current_memory_mib = target;
        inner.hotplugged_memory_mib += size_mib;
        Ok((
            target,
            Some(MemoryDevice {
                slot,
                size_mib,
                probe,
            }),
        ))
    }

    async fn resize_vcpus(&self, target: u32) -> Result<(u32, u32)> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "resize_vcpus")?;
        let config = inner.config()?.clone();

        let old = inner.current_vcpus;
        let target = target.clamp(1, config.max_vcpus());
        if target == old {
            return Ok((old, old));
        }

        if target > old {
            for index in old..target {
                inner
                    .qmp()?
                    .execute(
                        "device_add",
                        Some(json!({
                            "driver": "host-x86_64-cpu",
                            "id": format!("cpu-{}", index),
                            "socket-id": 0,
                            "core-id": index,
                            "thread-id": 0,
                        })),
                    )
                    .await?;
                inner.hotplugged_vcpus.push(index);
            }
            inner.current_vcpus = target;
            return Ok((old, target));
        }

        // Hot-unplug: best effort, silently stops where the arch refuses.
        let mut current = old;
        while current > target {
            let index = current - 1;
            let result = inner
                .qmp()?
                .execute("device_del", Some(json!({ "id": format!("cpu-{}", index) })))
                .await;
            if result.is_err() {
                tracing::warn!(sandbox_id = %inner.id, index, "vcpu hot-unplug refused, keeping current count");
                break;
            }
            inner.hotplugged_vcpus.retain(|&v| v != index);
            current -= 1;
        }
        inner.current_vcpus = current;
        Ok((old, current))
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        let inner = self.inner.read().await;
        let mut caps = Capabilities::BLOCK_HOTPLUG
            | Capabilities::NET_HOTPLUG
            | Capabilities::FS_SHARING
            | Capabilities::MULTI_QUEUE;
        match inner.config.as_ref() {
            Some(config) => {
                if config.memory_hotplug_allowed() {
                    caps |= Capabilities::MEMORY_HOTPLUG;
                }
                if config.protection.is_confidential() {
                    caps |= Capabilities::CONFIDENTIAL_GUEST;
                }
            }
            None => caps |= Capabilities::MEMORY_HOTPLUG,
        }
        Ok(caps)
    }

    async fn get_console(&self) -> Result<(ConsoleKind, String)> {
        let inner = self.inner.read().await;
        let path = inner.layout.console_socket(&inner.id)?;
        Ok((ConsoleKind::Unix, path.display().to_string()))
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running, VmmState::Paused], "get_thread_ids")?;
        let cpus = inner.qmp()?.execute("query-cpus-fast", None).await?;

        let mut ids = VcpuThreadIds::default();
        if let Some(list) = cpus.as_array() {
            for cpu in list {
                let index = cpu.get("cpu-index").and_then(|v| v.as_u64());
                let tid = cpu.get("thread-id").and_then(|v| v.as_u64());
                if let (Some(index), Some(tid)) = (index, tid) {
                    ids.vcpus.insert(index as u32, tid as u32);
                }
            }
        }
        Ok(ids)
    }

    async fn get_agent_transport(&self) -> Result<Transport> {
        let inner = self.inner.read().await;
        let cid = inner.config()?.guest_cid.unwrap_or(3);
        Ok(Transport::vsock(cid, crate::agent::AGENT_VSOCK_PORT))
    }

    async fn vmm_state(&self) -> VmmState {
        self.inner.read().await.state
    }

    async fn get_vmm_pid(&self) -> Result<u32> {
        self.inner
            .read()
            .await
            .child_pid
            .ok_or_else(|| Error::InvalidState("vmm is not running".to_string()))
    }

    async fn wait_vmm(&self) -> Result<i32> {
        let rx = {
            let inner = self.inner.read().await;
            inner
                .exit_rx
                .clone()
                .ok_or_else(|| Error::InvalidState("vmm was never started".to_string()))?
        };
        let mut rx = rx;
        loop {
            if let Some(status) = *rx.borrow() {
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                return Ok(0);
            }
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let inner = self.inner.read().await;
        if inner.id.is_empty() {
            return Ok(());
        }
        let run_dir = inner.layout.sandbox_run_dir(&inner.id);
        match std::fs::remove_dir_all(&run_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_state(&self) -> Result<HypervisorState> {
        let inner = self.inner.read().await;
        Ok(HypervisorState {
            kind: "qemu".to_string(),
            pid: inner.child_pid.map(|p| p as i32),
            uuid: inner.uuid.clone(),
            bridges: Vec::new(),
            hotplugged_vcpus: inner.hotplugged_vcpus.clone(),
            hotplugged_memory_mib: inner.hotplugged_memory_mib,
            virtiofsd_pid: inner.virtiofsd_pid.map(|p| p as i32),
            pcie_root_port: inner.config.as_ref().map(|c| c.pcie_root_ports).unwrap_or(0),
        })
    }
}
