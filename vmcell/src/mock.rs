//! Test doubles: an engine and an agent that record what the runtime asks
//! of them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};

use crate::device::DeviceConfig;
use crate::hypervisor::{
    Capabilities, ConsoleKind, Hypervisor, HypervisorConfig, MemoryDevice, VcpuThreadIds, VmmState,
};
use crate::persist::state::HypervisorState;
use vmcell_shared::protocol::*;
use vmcell_shared::{Error, Result, Transport};

/// Route test logs through `RUST_LOG` when a test needs them.
#[allow(dead_code)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ============================================================================
// Hypervisor double
// ============================================================================

pub struct MockHypervisor {
    state: RwLock<VmmState>,
    cold: Mutex<Vec<DeviceConfig>>,
    hot_added: Mutex<Vec<DeviceConfig>>,
    hot_removed: Mutex<Vec<DeviceConfig>>,
    /// When set, `start_vm` burns its whole timeout and fails.
    wedge_start: AtomicBool,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            state: RwLock::new(VmmState::Unconfigured),
            cold: Mutex::new(Vec::new()),
            hot_added: Mutex::new(Vec::new()),
            hot_removed: Mutex::new(Vec::new()),
            wedge_start: AtomicBool::new(false),
            exit_tx,
            exit_rx,
        }
    }

    pub async fn set_state(&self, state: VmmState) {
        *self.state.write().await = state;
    }

    pub fn wedge_start(&self) {
        self.wedge_start.store(true, Ordering::SeqCst);
    }

    /// Simulate the VMM dying underneath the sandbox.
    pub fn trigger_exit(&self, status: i32) {
        let _ = self.exit_tx.send(Some(status));
    }

    pub async fn cold_added(&self) -> Vec<DeviceConfig> {
        self.cold.lock().await.clone()
    }

    pub async fn hotplug_added(&self) -> Vec<DeviceConfig> {
        self.hot_added.lock().await.clone()
    }

    pub async fn hotplug_removed(&self) -> Vec<DeviceConfig> {
        self.hot_removed.lock().await.clone()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create_vm(
        &self,
        _id: &str,
        _netns: Option<String>,
        config: &HypervisorConfig,
    ) -> Result<()> {
        config.validate()?;
        *self.state.write().await = VmmState::Configured;
        Ok(())
    }

    async fn start_vm(&self, timeout_secs: u32) -> Result<()> {
        if self.wedge_start.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(timeout_secs as u64)).await;
            return Err(Error::Timeout {
                what: "vmm monitor handshake".to_string(),
                seconds: timeout_secs as u64,
            });
        }
        *self.state.write().await = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, _wait_only: bool) -> Result<()> {
        *self.state.write().await = VmmState::Stopped;
        let _ = self.exit_tx.send(Some(0));
        Ok(())
    }

    async fn pause_vm(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != VmmState::Running {
            return Err(Error::InvalidState(format!(
                "pause_vm not permitted in vmm state {:?}",
                *state
            )));
        }
        *state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != VmmState::Paused {
            return Err(Error::InvalidState(format!(
                "resume_vm not permitted in vmm state {:?}",
                *state
            )));
        }
        *state = VmmState::Running;
        Ok(())
    }

    async fn add_device(&self, device: DeviceConfig) -> Result<()> {
        self.cold.lock().await.push(device);
        Ok(())
    }

    async fn hotplug_add_device(&self, device: DeviceConfig) -> Result<DeviceConfig> {
        if *self.state.read().await != VmmState::Running {
            return Err(Error::InvalidState(
                "hotplug_add_device requires a running vm".to_string(),
            ));
        }
        self.hot_added.lock().await.push(device.clone());
        Ok(device)
    }

    async fn hotplug_remove_device(&self, device: DeviceConfig) -> Result<DeviceConfig> {
        if *self.state.read().await != VmmState::Running {
            return Err(Error::InvalidState(
                "hotplug_remove_device requires a running vm".to_string(),
            ));
        }
        self.hot_removed.lock().await.push(device.clone());
        Ok(device)
    }

    async fn resize_memory(
        &self,
        target_mib: u32,
        _block_size_mib: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryDevice>)> {
        Ok((
            target_mib,
            Some(MemoryDevice {
                slot: 0,
                size_mib: target_mib,
                probe,
            }),
        ))
    }

    async fn resize_vcpus(&self, target: u32) -> Result<(u32, u32)> {
        Ok((target, target))
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities::BLOCK_HOTPLUG
            | Capabilities::NET_HOTPLUG
            | Capabilities::FS_SHARING
            | Capabilities::MEMORY_HOTPLUG)
    }

    async fn get_console(&self) -> Result<(ConsoleKind, String)> {
        Ok((ConsoleKind::Unix, "/tmp/mock-console.sock".to_string()))
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        Ok(VcpuThreadIds::default())
    }

    async fn get_agent_transport(&self) -> Result<Transport> {
        Ok(Transport::unix("/tmp/mock-agent.sock"))
    }

    async fn vmm_state(&self) -> VmmState {
        *self.state.read().await
    }

    async fn get_vmm_pid(&self) -> Result<u32> {
        Ok(4242)
    }

    async fn wait_vmm(&self) -> Result<i32> {
        let mut rx = self.exit_rx.clone();
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
        Ok(())
    }

    async fn save_state(&self) -> Result<HypervisorState> {
        Ok(HypervisorState {
            kind: "mock".to_string(),
            pid: Some(4242),
            uuid: "mock-uuid".to_string(),
            ..Default::default()
        })
    }
}

// ============================================================================
// Agent double
// ============================================================================

pub struct MockAgent {
    ops: Mutex<Vec<String>>,
    copied: Mutex<Vec<CopyFileRequest>>,
    created_containers: Mutex<Vec<CreateContainerRequest>>,
    /// Operations that should fail with a guest refusal.
    fail_ops: Mutex<HashSet<String>>,
    connected: AtomicBool,
    /// Exit status `WaitProcess` reports.
    pub wait_status: std::sync::atomic::AtomicI32,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            copied: Mutex::new(Vec::new()),
            created_containers: Mutex::new(Vec::new()),
            fail_ops: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            wait_status: std::sync::atomic::AtomicI32::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn fail_op(&self, op: &str) {
        self.fail_ops.lock().await.insert(op.to_string());
    }

    pub async fn ops(&self) -> Vec<String> {
        self.ops.lock().await.clone()
    }

    pub async fn copied_files(&self) -> Vec<CopyFileRequest> {
        self.copied.lock().await.clone()
    }

    pub async fn created_containers(&self) -> Vec<CreateContainerRequest> {
        self.created_containers.lock().await.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn record(&self, op: &str) -> Result<()> {
        self.ops.lock().await.push(op.to_string());
        if self.fail_ops.lock().await.contains(op) {
            return Err(Error::AgentRpc(format!("guest refused {}", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl crate::agent::Agent for MockAgent {
    async fn connect(&self, _timeout_secs: u32) -> Result<()> {
        self.record("Connect").await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_sandbox(&self, _req: CreateSandboxRequest) -> Result<()> {
        self.record("CreateSandbox").await
    }

    async fn destroy_sandbox(&self) -> Result<()> {
        self.record("DestroySandbox").await
    }

    async fn create_container(&self, req: CreateContainerRequest) -> Result<()> {
        self.record("CreateContainer").await?;
        self.created_containers.lock().await.push(req);
        Ok(())
    }

    async fn start_container(&self, _container_id: &str) -> Result<()> {
        self.record("StartContainer").await
    }

    async fn remove_container(&self, _req: RemoveContainerRequest) -> Result<()> {
        self.record("RemoveContainer").await
    }

    async fn pause_container(&self, _container_id: &str) -> Result<()> {
        self.record("PauseContainer").await
    }

    async fn resume_container(&self, _container_id: &str) -> Result<()> {
        self.record("ResumeContainer").await
    }

    async fn update_container(&self, _req: UpdateContainerRequest) -> Result<()> {
        self.record("UpdateContainer").await
    }

    async fn stats_container(&self, _container_id: &str) -> Result<StatsContainerResponse> {
        self.record("StatsContainer").await?;
        Ok(StatsContainerResponse {
            memory_usage_bytes: 1 << 20,
            memory_limit_bytes: 1 << 30,
            cpu_usage_nanos: 1_000_000,
            pids_current: 1,
        })
    }

    async fn exec_process(&self, _req: ExecProcessRequest) -> Result<()> {
        self.record("ExecProcess").await
    }

    async fn signal_process(&self, _req: SignalProcessRequest) -> Result<()> {
        self.record("SignalProcess").await
    }

    async fn wait_process(&self, _req: WaitProcessRequest) -> Result<WaitProcessResponse> {
        self.record("WaitProcess").await?;
        Ok(WaitProcessResponse {
            status: self.wait_status.load(Ordering::SeqCst),
        })
    }

    async fn list_processes(&self, _container_id: &str) -> Result<ListProcessesResponse> {
        self.record("ListProcesses").await?;
        Ok(ListProcessesResponse::default())
    }

    async fn write_stdin(&self, req: WriteStreamRequest) -> Result<WriteStreamResponse> {
        self.record("WriteStdin").await?;
        Ok(WriteStreamResponse {
            len: req.data.len() as u32,
        })
    }

    async fn read_stdout(&self, _req: ReadStreamRequest) -> Result<ReadStreamResponse> {
        self.record("ReadStdout").await?;
        Ok(ReadStreamResponse::default())
    }

    async fn read_stderr(&self, _req: ReadStreamRequest) -> Result<ReadStreamResponse> {
        self.record("ReadStderr").await?;
        Ok(ReadStreamResponse::default())
    }

    async fn close_stdin(&self, _req: CloseStdinRequest) -> Result<()> {
        self.record("CloseStdin").await
    }

    async fn tty_win_resize(&self, _req: TtyWinResizeRequest) -> Result<()> {
        self.record("TtyWinResize").await
    }

    async fn update_interface(&self, req: UpdateInterfaceRequest) -> Result<Interface> {
        self.record("UpdateInterface").await?;
        Ok(req.interface)
    }

    async fn list_interfaces(&self) -> Result<ListInterfacesResponse> {
        self.record("ListInterfaces").await?;
        Ok(ListInterfacesResponse::default())
    }

    async fn update_routes(&self, req: UpdateRoutesRequest) -> Result<ListRoutesResponse> {
        self.record("UpdateRoutes").await?;
        Ok(ListRoutesResponse { routes: req.routes })
    }

    async fn list_routes(&self) -> Result<ListRoutesResponse> {
        self.record("ListRoutes").await?;
        Ok(ListRoutesResponse::default())
    }

    async fn add_arp_neighbors(&self, _req: AddArpNeighborsRequest) -> Result<()> {
        self.record("AddARPNeighbors").await
    }

    async fn online_cpu_mem(&self, _req: OnlineCpuMemRequest) -> Result<()> {
        self.record("OnlineCPUMem").await
    }

    async fn mem_hotplug_by_probe(&self, _req: MemHotplugByProbeRequest) -> Result<()> {
        self.record("MemHotplugByProbe").await
    }

    async fn reseed_random_dev(&self, _req: ReseedRandomDevRequest) -> Result<()> {
        self.record("ReseedRandomDev").await
    }

    async fn get_guest_details(&self, _req: GetGuestDetailsRequest) -> Result<GuestDetailsResponse> {
        self.record("GetGuestDetails").await?;
        Ok(GuestDetailsResponse {
            mem_block_size_bytes: 128 << 20,
            support_mem_hotplug_probe: false,
            agent_version: "mock".to_string(),
        })
    }

    async fn set_guest_date_time(&self, _req: SetGuestDateTimeRequest) -> Result<()> {
        self.record("SetGuestDateTime").await
    }

    async fn copy_file(&self, req: CopyFileRequest) -> Result<()> {
        self.record("CopyFile").await?;
        self.copied.lock().await.push(req);
        Ok(())
    }

    async fn start_tracing(&self) -> Result<()> {
        self.record("StartTracing").await
    }

    async fn stop_tracing(&self) -> Result<()> {
        self.record("StopTracing").await
    }

    async fn check(&self) -> Result<CheckResponse> {
        self.record("Check").await?;
        Ok(CheckResponse {
            status: HealthStatus::Ready,
        })
    }

    async fn version(&self) -> Result<VersionResponse> {
        self.record("Version").await?;
        Ok(VersionResponse {
            agent_version: "mock".to_string(),
            protocol_version: 1,
        })
    }

    async fn get_oom_event(&self) -> Result<OomEventResponse> {
        self.record("GetOOMEvent").await?;
        Ok(OomEventResponse {
            container_id: "c1".to_string(),
        })
    }
}
