//! Public sandbox surface: the runtime factory and the per-sandbox handle.

mod cleanup;
mod inner;
mod monitor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent::{Agent, AgentClient, AgentConfig};
use crate::container::IoStream;
use crate::device::{BridgeKind, BlockDriver, DeviceConfig, DeviceInfo, ShareFsConfig};
use crate::hypervisor::{new_hypervisor, Hypervisor, HypervisorConfig, HypervisorKind};
use crate::layout::RuntimeLayout;
use crate::network::{NetInterworkingModel, NetworkEngine};
use crate::persist::StateStore;
use crate::sharefs::ShareFs;
use crate::types::{ContainerConfig, LifecycleState, ProcessSpec};
use vmcell_shared::protocol::{ContainerResources, Interface, Route, StatsContainerResponse};
use vmcell_shared::{Error, Result};

use inner::SandboxInner;

/// Everything needed to build one sandbox.
#[derive(Clone)]
pub struct SandboxConfig {
    /// Stable id; generated when absent.
    pub id: Option<String>,
    pub hypervisor_kind: HypervisorKind,
    pub hypervisor: HypervisorConfig,
    /// Network namespace holding the sandbox's endpoints.
    pub netns: Option<String>,
    pub network_model: NetInterworkingModel,
    /// Host directories projected read-only into `sandbox-mounts/`.
    pub sandbox_bind_mounts: Vec<PathBuf>,
    /// Containers created as part of `start()`.
    pub containers: Vec<ContainerConfig>,
    pub agent: AgentConfig,
    pub hostname: String,
    pub dns: Vec<String>,
    /// Route every rootfs through the guest-pull path.
    pub force_guest_pull: bool,
    pub start_vm_timeout_secs: u32,
    pub agent_connect_timeout_secs: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            id: None,
            hypervisor_kind: HypervisorKind::Qemu,
            hypervisor: HypervisorConfig::default(),
            netns: None,
            network_model: NetInterworkingModel::default(),
            sandbox_bind_mounts: Vec::new(),
            containers: Vec::new(),
            agent: AgentConfig::default(),
            hostname: String::new(),
            dns: Vec::new(),
            force_guest_pull: false,
            start_vm_timeout_secs: 10,
            agent_connect_timeout_secs: 30,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        self.hypervisor.validate()?;
        if self.start_vm_timeout_secs == 0 {
            return Err(Error::ConfigInvalid(
                "start_vm_timeout_secs must be positive".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for container in &self.containers {
            container.validate()?;
            if !seen.insert(container.id.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate container id {}",
                    container.id
                )));
            }
        }
        Ok(())
    }
}

/// Point-in-time view of a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxStatus {
    pub id: String,
    pub state: LifecycleState,
    pub containers: HashMap<String, LifecycleState>,
}

/// Factory for sandboxes; owns only the path layout.
pub struct SandboxRuntime {
    layout: RuntimeLayout,
}

impl SandboxRuntime {
    pub fn new() -> Self {
        Self {
            layout: RuntimeLayout::from_env(),
        }
    }

    pub fn with_layout(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// Build a sandbox with the engine selected by the configuration.
    pub async fn create_sandbox(&self, config: SandboxConfig) -> Result<Sandbox> {
        config.validate()?;
        let hypervisor = new_hypervisor(config.hypervisor_kind, self.layout.clone())?;
        let id = sandbox_id(&config);
        hypervisor
            .create_vm(&id, config.netns.clone(), &config.hypervisor)
            .await?;
        let transport = hypervisor.get_agent_transport().await?;
        let agent: Arc<dyn Agent> = Arc::new(AgentClient::new(transport, config.agent.clone()));
        self.assemble(id, config, hypervisor, agent).await
    }

    /// Build a sandbox around caller-provided components. This is how
    /// embedders plug in custom engines, and how the test suite drives the
    /// orchestrator without privileges.
    pub async fn create_sandbox_with(
        &self,
        config: SandboxConfig,
        hypervisor: Arc<dyn Hypervisor>,
        agent: Arc<dyn Agent>,
    ) -> Result<Sandbox> {
        config.validate()?;
        let id = sandbox_id(&config);
        hypervisor
            .create_vm(&id, config.netns.clone(), &config.hypervisor)
            .await?;
        self.assemble(id, config, hypervisor, agent).await
    }

    async fn assemble(
        &self,
        id: String,
        config: SandboxConfig,
        hypervisor: Arc<dyn Hypervisor>,
        agent: Arc<dyn Agent>,
    ) -> Result<Sandbox> {
        let store = StateStore::open(self.layout.sandbox_state_dir(&id));
        if store.exists() {
            return Err(Error::InUse(format!("sandbox id {}", id)));
        }

        let share_fs = Arc::new(ShareFs::new(
            &self.layout,
            &id,
            config.sandbox_bind_mounts.clone(),
            Arc::clone(&agent),
            config.agent.copy_chunk_size,
        ));

        // The shared directory travels as a cold-plugged virtio-fs device
        // on engines that can share.
        if config.hypervisor.shared_fs {
            hypervisor
                .add_device(DeviceConfig::ShareFs(ShareFsConfig {
                    tag: "shared".to_string(),
                    source: share_fs.shared_dir().to_path_buf(),
                    socket_path: self.layout.virtiofsd_socket(&id)?,
                    queues: 1,
                    queue_size: 1024,
                }))
                .await?;
        }

        let bridge_kind = match config.hypervisor.block_driver {
            BlockDriver::VirtioBlockCcw => BridgeKind::Ccw,
            _ => BridgeKind::Pci,
        };
        let devices = crate::device::DeviceManager::new(
            &id,
            config.hypervisor.block_driver,
            Some(Arc::clone(&hypervisor)),
            bridge_kind,
            config.hypervisor.default_bridges,
        );

        let network = NetworkEngine::new(
            config.netns.clone().map(PathBuf::from),
            config.network_model,
        );

        tracing::info!(sandbox_id = %id, "sandbox created");
        let inner = SandboxInner::new(
            id.clone(),
            config,
            self.layout.clone(),
            hypervisor,
            agent,
            devices,
            share_fs,
            network,
            store,
        );
        Ok(Sandbox { id, inner })
    }
}

impl Default for SandboxRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn sandbox_id(config: &SandboxConfig) -> String {
    config
        .id
        .clone()
        .unwrap_or_else(|| hex::encode(rand::random::<[u8; 8]>()))
}

/// Handle to one sandbox. Cloneable; all clones drive the same state
/// machine through the shared inner.
#[derive(Clone)]
pub struct Sandbox {
    id: String,
    inner: Arc<SandboxInner>,
}

impl Sandbox {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub async fn status(&self) -> SandboxStatus {
        SandboxStatus {
            id: self.id.clone(),
            state: self.inner.state(),
            containers: self.inner.container_states().await,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    pub async fn stop(&self, force: bool) -> Result<()> {
        self.inner.stop(force).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.inner.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner.resume().await
    }

    pub async fn delete(&self) -> Result<()> {
        self.inner.delete().await
    }

    /// A channel that yields exactly one error if the VMM exits
    /// unexpectedly.
    pub fn monitor(&self) -> mpsc::Receiver<Error> {
        self.inner.monitor_channel()
    }

    pub async fn create_container(&self, config: ContainerConfig) -> Result<()> {
        self.inner.create_container(config).await
    }

    pub async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.inner.delete_container(container_id).await
    }

    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        self.inner.start_container(container_id).await
    }

    pub async fn stop_container(&self, container_id: &str, force: bool) -> Result<()> {
        self.inner.stop_container(container_id, force).await
    }

    pub async fn kill_container(&self, container_id: &str, signal: u32, all: bool) -> Result<()> {
        self.inner.kill_container(container_id, signal, all).await
    }

    pub async fn pause_container(&self, container_id: &str) -> Result<()> {
        self.inner.pause_container(container_id).await
    }

    pub async fn resume_container(&self, container_id: &str) -> Result<()> {
        self.inner.resume_container(container_id).await
    }

    pub async fn stats_container(&self, container_id: &str) -> Result<StatsContainerResponse> {
        self.inner.stats_container(container_id).await
    }

    pub async fn update_container(
        &self,
        container_id: &str,
        resources: ContainerResources,
    ) -> Result<()> {
        self.inner.update_container(container_id, resources).await
    }

    /// Run an extra process in a running container; returns the exec id
    /// and its I/O streams.
    pub async fn enter_container(
        &self,
        container_id: &str,
        process: ProcessSpec,
    ) -> Result<(String, IoStream)> {
        self.inner.enter_container(container_id, process).await
    }

    pub async fn wait_process(&self, container_id: &str, process_id: &str) -> Result<i32> {
        self.inner.wait_process(container_id, process_id).await
    }

    pub async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        self.inner
            .signal_process(container_id, process_id, signal, all)
            .await
    }

    pub async fn winsize_process(
        &self,
        container_id: &str,
        process_id: &str,
        rows: u16,
        columns: u16,
    ) -> Result<()> {
        self.inner
            .winsize_process(container_id, process_id, rows, columns)
            .await
    }

    pub async fn io_stream(&self, container_id: &str, process_id: &str) -> Result<IoStream> {
        self.inner.io_stream(container_id, process_id).await
    }

    /// Register and attach a device described by the caller; returns the
    /// device-manager id.
    pub async fn add_device(&self, info: DeviceInfo) -> Result<String> {
        self.inner.add_device(info).await
    }

    pub async fn add_interface(&self, interface: Interface) -> Result<Interface> {
        self.inner.add_interface(interface).await
    }

    pub async fn remove_interface(&self, interface: Interface) -> Result<()> {
        self.inner.remove_interface(interface).await
    }

    pub async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        self.inner.list_interfaces().await
    }

    pub async fn update_routes(&self, routes: Vec<Route>) -> Result<Vec<Route>> {
        self.inner.update_routes(routes).await
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>> {
        self.inner.list_routes().await
    }

    pub async fn resize_vcpus(&self, target: u32) -> Result<(u32, u32)> {
        self.inner.resize_vcpus(target).await
    }

    pub async fn resize_memory(&self, target_mib: u32) -> Result<u32> {
        self.inner.resize_memory(target_mib).await
    }

    /// Blocks until the guest reports an OOM; returns the container id.
    pub async fn get_oom_event(&self) -> Result<String> {
        self.inner.oom_event().await
    }

    pub async fn get_agent_url(&self) -> Result<String> {
        self.inner.agent_url().await
    }

    pub async fn get_hypervisor_pid(&self) -> Result<u32> {
        self.inner.hypervisor_pid().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAgent, MockHypervisor};
    use crate::types::Rootfs;
    use tempfile::tempdir;

    fn hypervisor_config() -> HypervisorConfig {
        HypervisorConfig {
            vmm_path: "/usr/bin/qemu-system-x86_64".into(),
            kernel_path: "/usr/share/vmcell/vmlinux".into(),
            ..Default::default()
        }
    }

    fn container_config(id: &str, dir: &std::path::Path) -> ContainerConfig {
        let rootfs_src = dir.join(format!("{}-rootfs", id));
        std::fs::create_dir_all(&rootfs_src).unwrap();
        ContainerConfig {
            id: id.to_string(),
            rootfs: Rootfs {
                source: rootfs_src,
                fs_type: "bind".to_string(),
                ..Default::default()
            },
            process: ProcessSpec::new(vec!["/bin/sh".to_string()]),
            ..Default::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: SandboxRuntime,
        hypervisor: Arc<MockHypervisor>,
        agent: Arc<MockAgent>,
    }

    impl Fixture {
        fn new() -> Self {
            crate::mock::init_test_logging();
            let dir = tempdir().unwrap();
            let runtime = SandboxRuntime::with_layout(RuntimeLayout::with_run_root(dir.path()));
            Self {
                _dir: dir,
                runtime,
                hypervisor: Arc::new(MockHypervisor::new()),
                agent: Arc::new(MockAgent::new()),
            }
        }

        async fn sandbox(&self, config: SandboxConfig) -> Result<Sandbox> {
            self.runtime
                .create_sandbox_with(config, self.hypervisor.clone(), self.agent.clone())
                .await
        }
    }

    #[tokio::test]
    async fn test_create_start_exec_kill_stop() {
        let fx = Fixture::new();
        let dir = fx._dir.path().to_path_buf();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            containers: vec![container_config("c1", &dir)],
            ..Default::default()
        };

        let sandbox = fx.sandbox(config).await.unwrap();
        assert_eq!(sandbox.state(), LifecycleState::Ready);

        sandbox.start().await.unwrap();
        assert_eq!(sandbox.state(), LifecycleState::Running);

        // Container create happened before the sandbox-level RPC.
        let ops = fx.agent.ops().await;
        let create_container = ops.iter().position(|o| o == "CreateContainer").unwrap();
        let create_sandbox = ops.iter().position(|o| o == "CreateSandbox").unwrap();
        assert!(create_container < create_sandbox);

        sandbox.start_container("c1").await.unwrap();
        let status = sandbox.status().await;
        assert_eq!(status.containers["c1"], LifecycleState::Running);

        let (exec_id, _io) = sandbox
            .enter_container(
                "c1",
                ProcessSpec::new(vec!["/bin/echo".to_string(), "hi".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(sandbox.wait_process("c1", &exec_id).await.unwrap(), 0);

        sandbox
            .kill_container("c1", libc::SIGTERM as u32, true)
            .await
            .unwrap();
        sandbox.stop_container("c1", false).await.unwrap();
        sandbox.stop(false).await.unwrap();
        assert_eq!(sandbox.state(), LifecycleState::Stopped);
        assert!(fx.agent.ops().await.contains(&"DestroySandbox".to_string()));

        // Idempotent: stopping a stopped sandbox is a no-op.
        sandbox.stop(false).await.unwrap();

        // Start is rejected once terminal.
        assert!(matches!(
            sandbox.start().await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_when_running() {
        let fx = Fixture::new();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();
        sandbox.start().await.unwrap();
        let ops_after_first = fx.agent.ops().await.len();
        sandbox.start().await.unwrap();
        assert_eq!(fx.agent.ops().await.len(), ops_after_first);
    }

    #[tokio::test]
    async fn test_start_timeout_leaves_no_residue() {
        let fx = Fixture::new();
        fx.hypervisor.wedge_start();
        let dir = fx._dir.path().to_path_buf();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            containers: vec![container_config("c1", &dir)],
            start_vm_timeout_secs: 1,
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();

        let started = std::time::Instant::now();
        let err = sandbox.start().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(3));

        // No shared-dir entries, no persistence record, VMM forced down,
        // sandbox back where create() left it.
        let layout = fx.runtime.layout();
        assert!(!layout.shared_dir("sb1").exists());
        assert!(!layout.sandbox_state_dir("sb1").join("sandbox.json").exists());
        assert_eq!(
            fx.hypervisor.vmm_state().await,
            crate::hypervisor::VmmState::Stopped
        );
        assert_eq!(sandbox.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_start_failure_mid_container_rolls_back() {
        let fx = Fixture::new();
        fx.agent.fail_op("CreateContainer").await;
        let dir = fx._dir.path().to_path_buf();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            containers: vec![container_config("c1", &dir)],
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();

        assert!(matches!(
            sandbox.start().await,
            Err(Error::AgentRpc(_))
        ));
        let layout = fx.runtime.layout();
        assert!(!layout.shared_dir("sb1").exists());
        assert!(!layout.mount_dir("sb1").exists());
        assert!(sandbox.status().await.containers.is_empty());
        assert_eq!(sandbox.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let fx = Fixture::new();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();

        // Pausing a Ready sandbox is invalid.
        assert!(matches!(sandbox.pause().await, Err(Error::InvalidState(_))));

        sandbox.start().await.unwrap();
        sandbox.pause().await.unwrap();
        assert_eq!(sandbox.state(), LifecycleState::Paused);
        // Idempotent.
        sandbox.pause().await.unwrap();

        sandbox.resume().await.unwrap();
        assert_eq!(sandbox.state(), LifecycleState::Running);
        // The guest clock was resynchronised.
        assert!(fx
            .agent
            .ops()
            .await
            .contains(&"SetGuestDateTime".to_string()));

        sandbox.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_fires_once_and_stops_sandbox() {
        let fx = Fixture::new();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();
        sandbox.start().await.unwrap();

        let mut watcher = sandbox.monitor();
        fx.hypervisor.trigger_exit(137);

        let event = watcher.recv().await.expect("monitor event");
        assert!(matches!(event, Error::GuestPanic(_)));
        assert!(watcher.recv().await.is_none());

        // The monitor task transitions the sandbox to Stopped.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while sandbox.state() != LifecycleState::Stopped {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_deliberate_stop_does_not_fire_monitor() {
        let fx = Fixture::new();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();
        sandbox.start().await.unwrap();

        let mut watcher = sandbox.monitor();
        sandbox.stop(false).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            watcher.try_recv(),
            Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_delete_requires_stopped() {
        let fx = Fixture::new();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();
        sandbox.start().await.unwrap();

        assert!(matches!(sandbox.delete().await, Err(Error::InvalidState(_))));

        sandbox.stop(false).await.unwrap();
        sandbox.delete().await.unwrap();
        assert!(!fx
            .runtime
            .layout()
            .sandbox_state_dir("sb1")
            .join("sandbox.json")
            .exists());
    }

    #[tokio::test]
    async fn test_block_rootfs_ref_counting_across_containers() {
        let fx = Fixture::new();
        fx.hypervisor
            .set_state(crate::hypervisor::VmmState::Configured)
            .await;
        let dir = fx._dir.path().to_path_buf();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();
        sandbox.start().await.unwrap();

        // Register the backing drive the way a caller would.
        let device_id = sandbox
            .add_device(DeviceInfo {
                host_path: dir.join("disk.img"),
                container_path: "/dev/vda".to_string(),
                dev_type: "b".to_string(),
                major: 253,
                minor: 0,
                ..Default::default()
            })
            .await
            .unwrap();

        for cid in ["c1", "c2"] {
            let mut cfg = container_config(cid, &dir);
            cfg.rootfs = Rootfs {
                source: PathBuf::new(),
                fs_type: "ext4".to_string(),
                options: Vec::new(),
                block_device_id: Some(device_id.clone()),
            };
            sandbox.create_container(cfg).await.unwrap();
        }

        {
            let devices = sandbox.inner.devices.lock().await;
            let device = devices.get(&device_id).unwrap();
            // Two containers plus the sandbox-level reference.
            assert_eq!(device.attach_count, 3);
            assert_eq!(device.bound_count, 1);
        }

        sandbox.stop_container("c1", false).await.unwrap();
        sandbox.delete_container("c1").await.unwrap();
        {
            let devices = sandbox.inner.devices.lock().await;
            let device = devices.get(&device_id).unwrap();
            assert_eq!(device.attach_count, 2);
            assert_eq!(device.bound_count, 1);
        }

        sandbox.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_sandbox_id_rejected() {
        let fx = Fixture::new();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            ..Default::default()
        };
        let sandbox = fx.sandbox(config.clone()).await.unwrap();
        sandbox.start().await.unwrap();

        let other_hv = Arc::new(MockHypervisor::new());
        let other_agent = Arc::new(MockAgent::new());
        let result = fx
            .runtime
            .create_sandbox_with(config, other_hv, other_agent)
            .await;
        assert!(matches!(result, Err(Error::InUse(_))));

        sandbox.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_on_stopped_sandbox_tolerates_sigkill_only() {
        let fx = Fixture::new();
        let dir = fx._dir.path().to_path_buf();
        let config = SandboxConfig {
            id: Some("sb1".to_string()),
            hypervisor: hypervisor_config(),
            containers: vec![container_config("c1", &dir)],
            ..Default::default()
        };
        let sandbox = fx.sandbox(config).await.unwrap();
        sandbox.start().await.unwrap();
        sandbox.stop(true).await.unwrap();

        // SIGKILL after sandbox stop is a tolerated no-op…
        sandbox
            .kill_container("c1", libc::SIGKILL as u32, true)
            .await
            .unwrap();
        // …anything else is an invalid state.
        assert!(matches!(
            sandbox.kill_container("c1", libc::SIGTERM as u32, true).await,
            Err(Error::InvalidState(_))
        ));
    }
}
