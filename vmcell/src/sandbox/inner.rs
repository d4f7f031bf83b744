//! Sandbox orchestration: composes hypervisor, agent, devices, share
//! engine and network into the lifecycle the public API promises.
//!
//! One internal mutex serialises state-changing operations per sandbox;
//! read-only accessors go straight to immutable configuration. Cleanup
//! ordering is the reverse of start, driven by a [`CleanupStack`] so a
//! failed start leaves no mounts, no VMM process and no persistence
//! record behind.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex, RwLock as AsyncRwLock};

use crate::agent::Agent;
use crate::container::{guest_process, Container, IoStream};
use crate::device::{DeviceConfig, DeviceInfo, DeviceManager};
use crate::hypervisor::Hypervisor;
use crate::layout::RuntimeLayout;
use crate::network::NetworkEngine;
use crate::persist::state::SandboxState;
use crate::persist::{ContainerState, StateStore};
use crate::sharefs::ShareFs;
use crate::types::{ContainerConfig, LifecycleState, ProcessSpec};
use vmcell_shared::protocol::{
    ContainerResources, CreateSandboxRequest, GuestMount, Interface, OnlineCpuMemRequest, Route,
    SetGuestDateTimeRequest, SignalProcessRequest, StatsContainerResponse, UpdateContainerRequest,
    UpdateInterfaceRequest, UpdateRoutesRequest,
};
use vmcell_shared::{Error, Result};

use super::cleanup::CleanupStack;
use super::monitor::SandboxMonitor;
use super::SandboxConfig;

pub(crate) struct SandboxInner {
    pub(crate) id: String,
    pub(crate) config: SandboxConfig,
    #[allow(dead_code)]
    pub(crate) layout: RuntimeLayout,
    weak: Weak<SandboxInner>,
    state: parking_lot::RwLock<LifecycleState>,
    op_lock: Mutex<()>,
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) agent: Arc<dyn Agent>,
    pub(crate) devices: Mutex<DeviceManager>,
    pub(crate) share_fs: Arc<ShareFs>,
    network: Mutex<NetworkEngine>,
    store: StateStore,
    containers: AsyncRwLock<HashMap<String, Arc<Container>>>,
    monitor: SandboxMonitor,
}

impl SandboxInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        config: SandboxConfig,
        layout: RuntimeLayout,
        hypervisor: Arc<dyn Hypervisor>,
        agent: Arc<dyn Agent>,
        devices: DeviceManager,
        share_fs: Arc<ShareFs>,
        network: NetworkEngine,
        store: StateStore,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            config,
            layout,
            weak: weak.clone(),
            state: parking_lot::RwLock::new(LifecycleState::Ready),
            op_lock: Mutex::new(()),
            hypervisor,
            agent,
            devices: Mutex::new(devices),
            share_fs,
            network: Mutex::new(network),
            store,
            containers: AsyncRwLock::new(HashMap::new()),
            monitor: SandboxMonitor::new(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("inner is alive while called")
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    // ========================================================================
    // Sandbox lifecycle
    // ========================================================================

    pub(crate) async fn start(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        match self.state() {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Ready => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "start sandbox {} in state {}",
                    self.id, other
                )));
            }
        }

        let mut cleanups = CleanupStack::new();
        match self.start_steps(&mut cleanups).await {
            Ok(()) => {
                cleanups.disarm();
                tracing::info!(sandbox_id = %self.id, "sandbox running");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.id, error = %e, "start failed, rolling back");
                let failures = cleanups.run().await;
                for failure in failures {
                    tracing::warn!(sandbox_id = %self.id, failure = %failure, "start rollback issue");
                }
                // Fully rolled back: the sandbox is back where create()
                // left it.
                *self.state.write() = LifecycleState::Ready;
                Err(e)
            }
        }
    }

    async fn start_steps(&self, cleanups: &mut CleanupStack) -> Result<()> {
        // Network first: endpoints cold-plug into the boot configuration.
        if self.config.netns.is_some() {
            let mut network = self.network.lock().await;
            network.scan().await?;
            network.add_endpoints(&self.hypervisor, false).await?;
            let inner = self.arc();
            cleanups.push("network endpoints", move || async move {
                inner
                    .network
                    .lock()
                    .await
                    .remove_endpoints(None, false)
                    .await
            });
        }

        // Registered before the attempt: a timed-out start still forces
        // the VMM down and removes its directory.
        let inner = self.arc();
        cleanups.push("vmm", move || async move {
            inner.monitor.expect_exit();
            inner.hypervisor.stop_vm(false).await?;
            inner.hypervisor.cleanup().await
        });
        self.hypervisor
            .start_vm(self.config.start_vm_timeout_secs)
            .await?;
        self.spawn_monitor_task();

        self.agent
            .connect(self.config.agent_connect_timeout_secs)
            .await?;
        let inner = self.arc();
        cleanups.push("agent connection", move || async move {
            inner.agent.disconnect().await
        });

        self.share_fs.prepare().await?;
        let inner = self.arc();
        cleanups.push("filesystem share", move || async move {
            inner.share_fs.cleanup().await
        });

        // Containers staged before the loop so a partial failure still
        // unwinds the ones that made it.
        let inner = self.arc();
        cleanups.push("containers", move || async move {
            inner.unwind_containers().await;
            Ok(())
        });
        for config in self.config.containers.clone() {
            self.create_container_locked(config).await?;
        }

        self.agent
            .create_sandbox(CreateSandboxRequest {
                sandbox_id: self.id.clone(),
                hostname: self.config.hostname.clone(),
                dns: self.config.dns.clone(),
                storages: Vec::new(),
                sandbox_pidns: false,
            })
            .await?;

        let inner = self.arc();
        cleanups.push("persistence record", move || async move {
            inner.store.delete()
        });
        *self.state.write() = LifecycleState::Running;
        self.persist().await?;
        Ok(())
    }

    pub(crate) async fn stop(&self, force: bool) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let state = self.state();
        if state == LifecycleState::Stopped {
            return Ok(());
        }

        let mut failures = Vec::new();

        let containers: Vec<Arc<Container>> =
            self.containers.read().await.values().cloned().collect();
        for container in containers {
            if let Err(e) = container.stop(state, force).await {
                if !force {
                    return Err(e);
                }
                failures.push(format!("container {}: {}", container.id(), e));
            }
        }

        if state == LifecycleState::Running || state == LifecycleState::Paused {
            if let Err(e) = self.agent.destroy_sandbox().await {
                if !force {
                    return Err(e);
                }
                failures.push(format!("destroy sandbox: {}", e));
            }
        }
        let _ = self.agent.disconnect().await;

        self.monitor.expect_exit();
        if let Err(e) = self.hypervisor.stop_vm(!force).await {
            if !force {
                return Err(e);
            }
            failures.push(format!("stop vmm: {}", e));
        }

        // Host-side teardown continues best-effort from here; errors are
        // aggregated rather than masking one another.
        if let Err(e) = self.share_fs.cleanup().await {
            failures.push(format!("filesystem share: {}", e));
        }
        if let Err(e) = self
            .network
            .lock()
            .await
            .remove_endpoints(None, false)
            .await
        {
            failures.push(format!("network: {}", e));
        }
        self.devices.lock().await.clear_hypervisor();

        *self.state.write() = LifecycleState::Stopped;
        if let Err(e) = self.persist().await {
            failures.push(format!("persist final state: {}", e));
        }

        tracing::info!(sandbox_id = %self.id, "sandbox stopped");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }

    pub(crate) async fn pause(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        match self.state() {
            LifecycleState::Paused => return Ok(()),
            LifecycleState::Running => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "pause sandbox {} in state {}",
                    self.id, other
                )));
            }
        }
        self.hypervisor.pause_vm().await?;
        *self.state.write() = LifecycleState::Paused;
        self.persist().await
    }

    pub(crate) async fn resume(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        match self.state() {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Paused => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "resume sandbox {} in state {}",
                    self.id, other
                )));
            }
        }
        self.hypervisor.resume_vm().await?;
        *self.state.write() = LifecycleState::Running;

        // The guest clock stood still while paused.
        if let Ok(now) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            let resync = self
                .agent
                .set_guest_date_time(SetGuestDateTimeRequest {
                    sec: now.as_secs() as i64,
                    usec: now.subsec_micros() as i64,
                })
                .await;
            if let Err(e) = resync {
                tracing::warn!(sandbox_id = %self.id, error = %e, "guest clock resync failed");
            }
        }
        self.persist().await
    }

    pub(crate) async fn delete(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Stopped {
            return Err(Error::InvalidState(format!(
                "delete sandbox {} in state {}",
                self.id,
                self.state()
            )));
        }
        self.store.delete()?;
        self.hypervisor.cleanup().await
    }

    pub(crate) fn monitor_channel(&self) -> mpsc::Receiver<Error> {
        self.monitor.new_watcher()
    }

    fn spawn_monitor_task(&self) {
        let inner = self.arc();
        tokio::spawn(async move {
            let mut health = tokio::time::interval(std::time::Duration::from_secs(30));
            health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            health.tick().await;
            loop {
                tokio::select! {
                    status = inner.hypervisor.wait_vmm() => {
                        if inner.monitor.exit_expected() {
                            return;
                        }
                        let status = status.unwrap_or(-1);
                        tracing::error!(sandbox_id = %inner.id, status, "vmm exited unexpectedly");
                        inner.monitor.fire(status);
                        let _ = inner.teardown_after_vmm_exit().await;
                        return;
                    }
                    _ = health.tick() => {
                        // Paused guests legitimately stop answering.
                        if inner.state() != LifecycleState::Running {
                            continue;
                        }
                        if let Err(e) = inner.agent.check().await {
                            if inner.monitor.exit_expected() {
                                return;
                            }
                            tracing::error!(sandbox_id = %inner.id, error = %e, "guest health check failed");
                            inner.monitor.fire_with(|| {
                                Error::GuestPanic(format!("guest agent stopped answering: {}", e))
                            });
                            let _ = inner.teardown_after_vmm_exit().await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Best-effort cleanup after the VMM died underneath us.
    async fn teardown_after_vmm_exit(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.state() == LifecycleState::Stopped {
            return Ok(());
        }
        let _ = self.agent.disconnect().await;
        let _ = self.share_fs.cleanup().await;
        let _ = self
            .network
            .lock()
            .await
            .remove_endpoints(None, false)
            .await;
        self.devices.lock().await.clear_hypervisor();
        for container in self.containers.read().await.values() {
            container.set_state(LifecycleState::Stopped);
        }
        *self.state.write() = LifecycleState::Stopped;
        self.persist().await
    }

    async fn unwind_containers(&self) {
        let drained: Vec<Arc<Container>> =
            self.containers.write().await.drain().map(|(_, c)| c).collect();
        for container in drained {
            let _ = container.stop(self.state(), true).await;
            for shared in container.take_shared_files() {
                let _ = self.share_fs.unshare_file(&shared).await;
            }
            let _ = self.share_fs.unshare_rootfs(container.id()).await;
            let mut devices = self.devices.lock().await;
            for device_id in container.devices() {
                let _ = devices.detach(&device_id, container.id()).await;
            }
        }
    }

    // ========================================================================
    // Container lifecycle
    // ========================================================================

    pub(crate) async fn create_container(&self, config: ContainerConfig) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "create container in sandbox state {}",
                self.state()
            )));
        }
        self.create_container_locked(config).await?;
        self.persist().await
    }

    async fn create_container_locked(&self, config: ContainerConfig) -> Result<()> {
        config.validate()?;
        if self.containers.read().await.contains_key(&config.id) {
            return Err(Error::InUse(format!("container id {}", config.id)));
        }

        let container = Arc::new(Container::new(
            &self.id,
            config.clone(),
            Arc::clone(&self.agent),
        ));

        let mut rollback = CleanupStack::new();
        let result = self
            .create_container_steps(&container, &config, &mut rollback)
            .await;
        match result {
            Ok(()) => {
                rollback.disarm();
                self.containers
                    .write()
                    .await
                    .insert(config.id.clone(), container);
                Ok(())
            }
            Err(e) => {
                for failure in rollback.run().await {
                    tracing::warn!(container_id = %config.id, failure = %failure, "container rollback issue");
                }
                Err(e)
            }
        }
    }

    async fn create_container_steps(
        &self,
        container: &Arc<Container>,
        config: &ContainerConfig,
        rollback: &mut CleanupStack,
    ) -> Result<()> {
        // Block-backed rootfs: take a reference on the registered device.
        let mut block_config = None;
        if let Some(device_id) = config.rootfs.block_device_id.clone() {
            let mut devices = self.devices.lock().await;
            devices.attach(&device_id, &config.id).await?;
            container.record_device(device_id.clone());
            block_config = devices.get(&device_id).and_then(|d| match d.config {
                DeviceConfig::Block(block) => Some(block),
                _ => None,
            });

            let inner = self.arc();
            let cid = config.id.clone();
            rollback.push("block device reference", move || async move {
                inner.devices.lock().await.detach(&device_id, &cid).await
            });
        }

        let rootfs = self
            .share_fs
            .share_rootfs(config, self.config.force_guest_pull, block_config.as_ref())
            .await?;
        let inner = self.arc();
        let cid = config.id.clone();
        rollback.push("rootfs share", move || async move {
            inner.share_fs.unshare_rootfs(&cid).await
        });

        let mut storages = rootfs.storages.clone();
        let mut guest_mounts = Vec::new();
        let mut shared_files = Vec::new();
        for m in &config.mounts {
            let shared = self.share_fs.share_file(&config.id, m).await?;
            storages.extend(shared.storages.clone());
            guest_mounts.push(GuestMount {
                source: shared.guest_path.clone(),
                destination: m.destination.display().to_string(),
                fs_type: "bind".to_string(),
                options: if m.read_only {
                    vec!["rbind".to_string(), "ro".to_string()]
                } else {
                    vec!["rbind".to_string()]
                },
            });
            let inner = self.arc();
            let record = shared.clone();
            rollback.push("mount share", move || async move {
                inner.share_fs.unshare_file(&record).await
            });
            shared_files.push(shared);
        }

        self.agent
            .create_container(vmcell_shared::protocol::CreateContainerRequest {
                container_id: config.id.clone(),
                storages,
                devices: Vec::new(),
                mounts: guest_mounts,
                process: guest_process(&config.process),
                annotations: config.annotations.clone(),
            })
            .await?;

        container.record_shares(rootfs, shared_files);
        tracing::info!(
            sandbox_id = %self.id,
            container_id = %config.id,
            "container created"
        );
        Ok(())
    }

    pub(crate) async fn container(&self, container_id: &str) -> Result<Arc<Container>> {
        self.containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {}", container_id)))
    }

    pub(crate) async fn start_container(&self, container_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let container = self.container(container_id).await?;
        container.start(self.state()).await?;
        self.persist().await
    }

    pub(crate) async fn stop_container(&self, container_id: &str, force: bool) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let container = self.container(container_id).await?;
        container.stop(self.state(), force).await?;
        self.persist().await
    }

    pub(crate) async fn delete_container(&self, container_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let container = self.container(container_id).await?;
        if container.state() != LifecycleState::Stopped {
            return Err(Error::InvalidState(format!(
                "delete container {} in state {}",
                container_id,
                container.state()
            )));
        }

        for shared in container.take_shared_files() {
            let _ = self.share_fs.unshare_file(&shared).await;
        }
        let _ = self.share_fs.unshare_rootfs(container_id).await;

        let mut devices = self.devices.lock().await;
        for device_id in container.devices() {
            devices.detach(&device_id, container_id).await?;
        }
        drop(devices);

        self.containers.write().await.remove(container_id);
        self.store.delete_container(container_id)?;
        Ok(())
    }

    pub(crate) async fn kill_container(
        &self,
        container_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        let container = self.container(container_id).await?;
        let state = self.state();
        // Forced SIGKILL against a stopped sandbox is the one tolerated
        // no-op: the guest is gone, there is nothing left to signal.
        if state == LifecycleState::Stopped && signal == libc::SIGKILL as u32 {
            return Ok(());
        }
        container.kill(state, signal, all).await
    }

    pub(crate) async fn pause_container(&self, container_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let container = self.container(container_id).await?;
        container.pause(self.state()).await
    }

    pub(crate) async fn resume_container(&self, container_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let container = self.container(container_id).await?;
        container.resume(self.state()).await
    }

    pub(crate) async fn enter_container(
        &self,
        container_id: &str,
        process: ProcessSpec,
    ) -> Result<(String, IoStream)> {
        let container = self.container(container_id).await?;
        let exec_id = container.enter(self.state(), process).await?;
        let io = container.io_stream(&exec_id)?;
        Ok((exec_id, io))
    }

    pub(crate) async fn wait_process(&self, container_id: &str, process_id: &str) -> Result<i32> {
        let container = self.container(container_id).await?;
        container.wait(self.state(), process_id).await
    }

    pub(crate) async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        let container = self.container(container_id).await?;
        if all {
            container.kill(self.state(), signal, true).await
        } else {
            if self.state() != LifecycleState::Running {
                return Err(Error::InvalidState(format!(
                    "signal process in sandbox state {}",
                    self.state()
                )));
            }
            self.agent
                .signal_process(SignalProcessRequest {
                    container_id: container_id.to_string(),
                    exec_id: process_id.to_string(),
                    signal,
                })
                .await
        }
    }

    pub(crate) async fn winsize_process(
        &self,
        container_id: &str,
        process_id: &str,
        rows: u16,
        columns: u16,
    ) -> Result<()> {
        let container = self.container(container_id).await?;
        container
            .winsize(self.state(), process_id, rows, columns)
            .await
    }

    pub(crate) async fn io_stream(
        &self,
        container_id: &str,
        process_id: &str,
    ) -> Result<IoStream> {
        let container = self.container(container_id).await?;
        container.io_stream(process_id)
    }

    pub(crate) async fn stats_container(
        &self,
        container_id: &str,
    ) -> Result<StatsContainerResponse> {
        let container = self.container(container_id).await?;
        container.stats(self.state()).await
    }

    pub(crate) async fn update_container(
        &self,
        container_id: &str,
        resources: ContainerResources,
    ) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "update container in sandbox state {}",
                self.state()
            )));
        }
        self.container(container_id).await?;
        self.agent
            .update_container(UpdateContainerRequest {
                container_id: container_id.to_string(),
                resources,
            })
            .await
    }

    // ========================================================================
    // Resources, devices, network
    // ========================================================================

    pub(crate) async fn add_device(&self, info: DeviceInfo) -> Result<String> {
        let _guard = self.op_lock.lock().await;
        let mut devices = self.devices.lock().await;
        let device_id = devices.new_device(&info)?;
        devices.attach(&device_id, "sandbox").await?;
        Ok(device_id)
    }

    pub(crate) async fn resize_vcpus(&self, target: u32) -> Result<(u32, u32)> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "resize vcpus in sandbox state {}",
                self.state()
            )));
        }
        let (old, new) = self.hypervisor.resize_vcpus(target).await?;
        if new > old {
            self.agent
                .online_cpu_mem(OnlineCpuMemRequest {
                    wait: false,
                    nb_cpus: new - old,
                    cpu_only: true,
                })
                .await?;
        }
        Ok((old, new))
    }

    pub(crate) async fn resize_memory(&self, target_mib: u32) -> Result<u32> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "resize memory in sandbox state {}",
                self.state()
            )));
        }
        let (new_mib, device) = self.hypervisor.resize_memory(target_mib, 128, false).await?;
        if device.is_some() {
            self.agent
                .online_cpu_mem(OnlineCpuMemRequest {
                    wait: false,
                    nb_cpus: 0,
                    cpu_only: false,
                })
                .await?;
        }
        Ok(new_mib)
    }

    pub(crate) async fn add_interface(&self, interface: Interface) -> Result<Interface> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "add interface in sandbox state {}",
                self.state()
            )));
        }
        let endpoint = crate::network::Endpoint::new(
            crate::network::EndpointKind::Tap,
            interface.name.clone(),
            interface.hw_addr.clone(),
        );
        self.network
            .lock()
            .await
            .hot_attach_endpoint(endpoint, &self.hypervisor)
            .await?;
        self.agent
            .update_interface(UpdateInterfaceRequest { interface })
            .await
    }

    pub(crate) async fn remove_interface(&self, interface: Interface) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.state() != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "remove interface in sandbox state {}",
                self.state()
            )));
        }
        self.network
            .lock()
            .await
            .hot_detach_endpoint(&interface.name, &self.hypervisor)
            .await
    }

    pub(crate) async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        Ok(self.agent.list_interfaces().await?.interfaces)
    }

    pub(crate) async fn update_routes(&self, routes: Vec<Route>) -> Result<Vec<Route>> {
        Ok(self
            .agent
            .update_routes(UpdateRoutesRequest { routes })
            .await?
            .routes)
    }

    pub(crate) async fn list_routes(&self) -> Result<Vec<Route>> {
        Ok(self.agent.list_routes().await?.routes)
    }

    pub(crate) async fn oom_event(&self) -> Result<String> {
        Ok(self.agent.get_oom_event().await?.container_id)
    }

    pub(crate) async fn agent_url(&self) -> Result<String> {
        Ok(self.hypervisor.get_agent_transport().await?.to_uri())
    }

    pub(crate) async fn hypervisor_pid(&self) -> Result<u32> {
        self.hypervisor.get_vmm_pid().await
    }

    pub(crate) async fn container_states(&self) -> HashMap<String, LifecycleState> {
        self.containers
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.state()))
            .collect()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn persist(&self) -> Result<()> {
        let mut hypervisor_state = self.hypervisor.save_state().await?;
        hypervisor_state.bridges = self.devices.lock().await.bridge_state();
        let network_state = self.network.lock().await.save();

        self.store.save_sandbox(&SandboxState {
            id: self.id.clone(),
            state: self.state(),
            hypervisor: hypervisor_state,
            network: network_state,
        })?;

        for (id, container) in self.containers.read().await.iter() {
            let config = container.config();
            self.store.save_container(
                id,
                &ContainerState {
                    id: id.clone(),
                    state: container.state(),
                    fs_type: if config.rootfs.fs_type.is_empty() {
                        None
                    } else {
                        Some(config.rootfs.fs_type.clone())
                    },
                    block_device_id: config.rootfs.block_device_id.clone(),
                    process: config.process.clone(),
                },
            )?;
        }
        Ok(())
    }
}
