//! Firecracker-class engine: HTTP API over a unix socket, hybrid vsock,
//! no filesystem sharing, block hot-plug via pre-provisioned stub drives.

mod api;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, RwLock};

use crate::device::DeviceConfig;
use crate::hypervisor::config::{join_kernel_params, HypervisorConfig, ProtectionKind};
use crate::layout::RuntimeLayout;
use crate::persist::state::HypervisorState;
use crate::util;
use vmcell_shared::{Error, Result, Transport};

use super::{Capabilities, ConsoleKind, Hypervisor, MemoryDevice, VcpuThreadIds, VmmState};
use api::FcApiClient;

/// Drives provisioned at boot so block devices can be patched in later.
const STUB_DRIVE_COUNT: usize = 8;
/// Size of a stub drive backing file.
const STUB_DRIVE_SIZE: u64 = 1 << 20;

const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const SIGTERM_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const API_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct FirecrackerHypervisor {
    inner: Arc<RwLock<FcInner>>,
}

struct FcInner {
    layout: RuntimeLayout,
    id: String,
    uuid: String,
    netns: Option<String>,
    config: Option<HypervisorConfig>,
    state: VmmState,
    pending_devices: Vec<DeviceConfig>,
    api: Option<FcApiClient>,
    child_pid: Option<u32>,
    exit_rx: Option<watch::Receiver<Option<i32>>>,
    vsock_uds: Option<PathBuf>,
    /// Stub drive ids still available for hot-plug.
    free_stubs: Vec<String>,
    /// device id → (stub id, placeholder path) for unplug.
    plugged: HashMap<String, (String, PathBuf)>,
}

impl FirecrackerHypervisor {
    pub fn new(layout: RuntimeLayout) -> Self {
        Self {
            inner: Arc::new(RwLock::new(FcInner {
                layout,
                id: String::new(),
                uuid: String::new(),
                netns: None,
                config: None,
                state: VmmState::Unconfigured,
                pending_devices: Vec::new(),
                api: None,
                child_pid: None,
                exit_rx: None,
                vsock_uds: None,
                free_stubs: Vec::new(),
                plugged: HashMap::new(),
            })),
        }
    }
}

impl FcInner {
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

    fn api(&self) -> Result<&FcApiClient> {
        self.api
            .as_ref()
            .ok_or_else(|| Error::MonitorTransport("api socket not connected".to_string()))
    }

    fn stub_placeholder(&self, stub_id: &str) -> PathBuf {
        self.layout
            .sandbox_run_dir(&self.id)
            .join(format!("{}.img", stub_id))
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
                Ok(Err(_)) => return Some(0),
                Err(_) => return None,
            }
        }
    }

    async fn configure_boot(&mut self) -> Result<()> {
        let config = self.config()?.clone();
        let api = self.api()?.clone();

        api.put(
            "/machine-config",
            &json!({
                "vcpu_count": config.default_vcpus,
                "mem_size_mib": config.default_memory_mib,
                "smt": false,
            }),
        )
        .await?;

        let mut boot = json!({
            "kernel_image_path": config.kernel_path.display().to_string(),
            "boot_args": join_kernel_params(&config.kernel_params),
        });
        if let Some(ref initrd) = config.initrd_path {
            boot["initrd_path"] = json!(initrd.display().to_string());
        }
        api.put("/boot-source", &boot).await?;

        if let Some(ref image) = config.image_path {
            api.put(
                "/drives/image0",
                &json!({
                    "drive_id": "image0",
                    "path_on_host": image.display().to_string(),
                    "is_root_device": false,
                    "is_read_only": true,
                }),
            )
            .await?;
        }

        // Cold-plugged devices.
        let mut saw_vsock = false;
        for device in self.pending_devices.clone() {
            match device {
                DeviceConfig::Block(block) => {
                    api.put(
                        &format!("/drives/{}", block.id),
                        &json!({
                            "drive_id": block.id,
                            "path_on_host": block.path_on_host.display().to_string(),
                            "is_root_device": false,
                            "is_read_only": block.read_only,
                        }),
                    )
                    .await?;
                }
                DeviceConfig::Network(net) => {
                    api.put(
                        &format!("/network-interfaces/{}", net.id),
                        &json!({
                            "iface_id": net.id,
                            "host_dev_name": net.host_dev_name,
                            "guest_mac": net.guest_mac,
                        }),
                    )
                    .await?;
                }
                DeviceConfig::Vsock(vsock) => {
                    let uds = vsock.uds_path.clone().unwrap_or_else(|| {
                        self.layout
                            .sandbox_run_dir(&self.id)
                            .join("vsock.sock")
                    });
                    api.put(
                        "/vsock",
                        &json!({
                            "guest_cid": vsock.guest_cid,
                            "uds_path": uds.display().to_string(),
                        }),
                    )
                    .await?;
                    self.vsock_uds = Some(uds);
                    saw_vsock = true;
                }
                other => {
                    return Err(Error::Unsupported(format!(
                        "cold-plug of {:?} on this engine",
                        other.id()
                    )));
                }
            }
        }

        // The agent link always needs a vsock device.
        if !saw_vsock {
            let uds = self.layout.sandbox_run_dir(&self.id).join("vsock.sock");
            api.put(
                "/vsock",
                &json!({
                    "guest_cid": config.guest_cid.unwrap_or(3),
                    "uds_path": uds.display().to_string(),
                }),
            )
            .await?;
            self.vsock_uds = Some(uds);
        }

        // Stub drives for later hot-plug.
        for i in 0..STUB_DRIVE_COUNT {
            let stub_id = format!("stub{}", i);
            let placeholder = self.stub_placeholder(&stub_id);
            let file = std::fs::File::create(&placeholder)?;
            file.set_len(STUB_DRIVE_SIZE)?;
            api.put(
                &format!("/drives/{}", stub_id),
                &json!({
                    "drive_id": stub_id,
                    "path_on_host": placeholder.display().to_string(),
                    "is_root_device": false,
                    "is_read_only": false,
                }),
            )
            .await?;
            self.free_stubs.push(stub_id);
        }

        Ok(())
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn create_vm(
        &self,
        id: &str,
        netns: Option<String>,
        config: &HypervisorConfig,
    ) -> Result<()> {
        config.validate()?;
        if config.shared_fs {
            return Err(Error::Unsupported(
                "filesystem sharing on this engine".to_string(),
            ));
        }
        match config.protection {
            ProtectionKind::Disabled | ProtectionKind::Snp => {}
            other => {
                return Err(Error::Unsupported(format!(
                    "{} protection on this engine",
                    other
                )));
            }
        }

        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Unconfigured], "create_vm")?;
        std::fs::create_dir_all(inner.layout.sandbox_run_dir(id))?;
        inner.id = id.to_string();
        inner.uuid = uuid::Uuid::new_v4().to_string();
        inner.netns = netns;
        inner.config = Some(config.clone());
        inner.state = VmmState::Configured;
        Ok(())
    }

    async fn start_vm(&self, timeout_secs: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Configured], "start_vm")?;
        let config = inner.config()?.clone();
        let api_socket = inner.layout.hypervisor_api_socket(&inner.id)?;

        let mut command = tokio::process::Command::new(&config.vmm_path);
        command
            .arg("--api-sock")
            .arg(&api_socket)
            .arg("--id")
            .arg(&inner.id);
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

        // Wait for the API socket, bounded by the caller's timeout.
        let api = FcApiClient::new(&api_socket);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs as u64);
        loop {
            match api.get("/").await {
                Ok(_) => break,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    if let Some(code) = inner.wait_exit(Duration::from_millis(1)).await {
                        return Err(Error::ProcessSpawn(format!(
                            "vmm exited with status {} before the api socket came up",
                            code
                        )));
                    }
                    tokio::time::sleep(API_RETRY_DELAY).await;
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        what: "vmm api socket".to_string(),
                        seconds: timeout_secs as u64,
                    });
                }
            }
        }

        inner.api = Some(api);
        inner.configure_boot().await?;
        inner
            .api()?
            .put("/actions", &json!({ "action_type": "InstanceStart" }))
            .await?;
        inner.state = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, wait_only: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state == VmmState::Stopped {
            return Ok(());
        }
        if matches!(inner.state, VmmState::Unconfigured | VmmState::Configured) {
            inner.state = VmmState::Stopped;
            return Ok(());
        }

        let api = inner.api.take();
        if !wait_only {
            if let Some(ref api) = api {
                let _ = api
                    .put("/actions", &json!({ "action_type": "SendCtrlAltDel" }))
                    .await;
            }
        }
        drop(api);

        if inner.wait_exit(GRACEFUL_EXIT_TIMEOUT).await.is_none() {
            if let Some(pid) = inner.child_pid {
                tracing::warn!(sandbox_id = %inner.id, pid, "vmm ignored shutdown, sending SIGTERM");
                util::send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                if inner.wait_exit(SIGTERM_EXIT_TIMEOUT).await.is_none() {
                    util::send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                    let _ = inner.wait_exit(SIGTERM_EXIT_TIMEOUT).await;
                }
            }
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
        inner.api()?.patch("/vm", &json!({ "state": "Paused" })).await?;
        inner.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Paused], "resume_vm")?;
        inner
            .api()?
            .patch("/vm", &json!({ "state": "Resumed" }))
            .await?;
        inner.state = VmmState::Running;
        Ok(())
    }

    async fn add_device(&self, device: DeviceConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Configured], "add_device")?;
        if matches!(device, DeviceConfig::ShareFs(_)) {
            return Err(Error::Unsupported(
                "filesystem sharing on this engine".to_string(),
            ));
        }
        inner.pending_devices.push(device);
        Ok(())
    }

    async fn hotplug_add_device(&self, device: DeviceConfig) -> Result<DeviceConfig> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "hotplug_add_device")?;

        match &device {
            DeviceConfig::Block(block) => {
                let stub_id = inner.free_stubs.pop().ok_or_else(|| {
                    Error::NoFreeSlot("firecracker stub drive".to_string())
                })?;
                let placeholder = inner.stub_placeholder(&stub_id);
                let result = inner
                    .api()?
                    .patch(
                        &format!("/drives/{}", stub_id),
                        &json!({
                            "drive_id": stub_id,
                            "path_on_host": block.path_on_host.display().to_string(),
                        }),
                    )
                    .await;
                match result {
                    Ok(()) => {
                        inner
                            .plugged
                            .insert(block.id.clone(), (stub_id, placeholder));
                        Ok(device)
                    }
                    Err(e) => {
                        inner.free_stubs.push(stub_id);
                        Err(e)
                    }
                }
            }
            _ => Err(Error::Unsupported(format!(
                "hot-plug of {:?} on this engine",
                device.id()
            ))),
        }
    }

    async fn hotplug_remove_device(&self, device: DeviceConfig) -> Result<DeviceConfig> {
        let mut inner = self.inner.write().await;
        inner.require_state(&[VmmState::Running], "hotplug_remove_device")?;

        match &device {
            DeviceConfig::Block(block) => {
                let (stub_id, placeholder) =
                    inner.plugged.remove(&block.id).ok_or_else(|| {
                        Error::NotFound(format!("hot-plugged drive {}", block.id))
                    })?;
                // Point the stub back at its placeholder to unmap the file.
                inner
                    .api()?
                    .patch(
                        &format!("/drives/{}", stub_id),
                        &json!({
                            "drive_id": stub_id,
                            "path_on_host": placeholder.display().to_string(),
                        }),
                    )
                    .await?;
                inner.free_stubs.push(stub_id);
                Ok(device)
            }
            _ => Err(Error::Unsupported(format!(
                "hot-unplug of {:?} on this engine",
                device.id()
            ))),
        }
    }

    async fn resize_memory(
        &self,
        target_mib: u32,
        _block_size_mib: u32,
        _probe: bool,
    ) -> Result<(u32, Option<MemoryDevice>)> {
        let inner = self.inner.read().await;
        let current = inner.config()?.default_memory_mib;
        if target_mib == current {
            return Ok((current, None));
        }
        if target_mib < current {
            tracing::warn!(
                sandbox_id = %inner.id,
                current_mib = current,
                target_mib,
                "memory hot-unplug not performed"
            );
            return Ok((current, None));
        }
        Err(Error::Unsupported("memory hot-plug on this engine".to_string()))
    }

    async fn resize_vcpus(&self, target: u32) -> Result<(u32, u32)> {
        let inner = self.inner.read().await;
        let current = inner.config()?.default_vcpus;
        if target == current {
            return Ok((current, current));
        }
        Err(Error::Unsupported("vcpu hot-plug on this engine".to_string()))
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        let inner = self.inner.read().await;
        let mut caps = Capabilities::BLOCK_HOTPLUG;
        if let Some(config) = inner.config.as_ref() {
            if config.protection.is_confidential() {
                caps |= Capabilities::CONFIDENTIAL_GUEST;
            }
        }
        Ok(caps)
    }

    async fn get_console(&self) -> Result<(ConsoleKind, String)> {
        Err(Error::Unsupported("console access on this engine".to_string()))
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        // Best effort: this engine does not expose vcpu thread ids.
        Ok(VcpuThreadIds::default())
    }

    async fn get_agent_transport(&self) -> Result<Transport> {
        let inner = self.inner.read().await;
        let uds = inner
            .vsock_uds
            .clone()
            .unwrap_or_else(|| inner.layout.sandbox_run_dir(&inner.id).join("vsock.sock"));
        Ok(Transport::hybrid_vsock(uds, crate::agent::AGENT_VSOCK_PORT))
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
            kind: "firecracker".to_string(),
            pid: inner.child_pid.map(|p| p as i32),
            uuid: inner.uuid.clone(),
            bridges: Vec::new(),
            hotplugged_vcpus: Vec::new(),
            hotplugged_memory_mib: 0,
            virtiofsd_pid: None,
            pcie_root_port: 0,
        })
    }
}
