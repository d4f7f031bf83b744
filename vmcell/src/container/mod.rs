//! Per-container state machine.
//!
//! A container advances only while its sandbox runs; every guard here
//! returns `InvalidState` without side effect when the combination of
//! sandbox and container state forbids the operation. Errors from the
//! guest travel through unchanged.

pub mod io;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::agent::Agent;
use crate::sharefs::rootfs::SharedRootfs;
use crate::types::{ContainerConfig, LifecycleState, ProcessSpec, SharedFile};
use vmcell_shared::protocol::{
    ExecProcessRequest, GuestProcess, GuestUser, RemoveContainerRequest, SignalProcessRequest,
    StatsContainerResponse, TtyWinResizeRequest, WaitProcessRequest,
};
use vmcell_shared::{Error, Result};

pub use io::IoStream;

/// Grace the guest gets to tear a container down.
const REMOVE_TIMEOUT_SECS: u32 = 10;

pub struct Container {
    config: ContainerConfig,
    sandbox_id: String,
    agent: Arc<dyn Agent>,
    state: RwLock<LifecycleState>,
    /// Device-manager ids this container references (non-owning).
    devices: Mutex<Vec<String>>,
    /// Live exec processes; the init process uses the container id.
    execs: Mutex<HashSet<String>>,
    /// Share-engine records kept for the unshare path.
    shared_rootfs: Mutex<Option<SharedRootfs>>,
    shared_files: Mutex<Vec<SharedFile>>,
}

impl Container {
    pub fn new(sandbox_id: &str, config: ContainerConfig, agent: Arc<dyn Agent>) -> Self {
        Self {
            config,
            sandbox_id: sandbox_id.to_string(),
            agent,
            state: RwLock::new(LifecycleState::Ready),
            devices: Mutex::new(Vec::new()),
            execs: Mutex::new(HashSet::new()),
            shared_rootfs: Mutex::new(None),
            shared_files: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
    }

    pub(crate) fn record_device(&self, device_id: String) {
        self.devices.lock().push(device_id);
    }

    pub(crate) fn devices(&self) -> Vec<String> {
        self.devices.lock().clone()
    }

    pub(crate) fn record_shares(&self, rootfs: SharedRootfs, files: Vec<SharedFile>) {
        *self.shared_rootfs.lock() = Some(rootfs);
        *self.shared_files.lock() = files;
    }

    pub(crate) fn take_shared_files(&self) -> Vec<SharedFile> {
        std::mem::take(&mut *self.shared_files.lock())
    }

    fn require_sandbox_running(&self, sandbox_state: LifecycleState, what: &str) -> Result<()> {
        if sandbox_state != LifecycleState::Running {
            return Err(Error::InvalidState(format!(
                "{} on container {}: sandbox is {}",
                what, self.config.id, sandbox_state
            )));
        }
        Ok(())
    }

    fn require_state(&self, allowed: &[LifecycleState], what: &str) -> Result<LifecycleState> {
        let state = *self.state.read();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(Error::InvalidState(format!(
                "{} on container {} in state {}",
                what, self.config.id, state
            )))
        }
    }

    pub async fn start(&self, sandbox_state: LifecycleState) -> Result<()> {
        self.require_sandbox_running(sandbox_state, "start")?;
        if self.state() == LifecycleState::Running {
            return Ok(());
        }
        self.require_state(&[LifecycleState::Ready], "start")?;

        self.agent.start_container(&self.config.id).await?;
        self.execs.lock().insert(self.config.id.clone());
        self.set_state(LifecycleState::Running);
        tracing::info!(
            sandbox_id = %self.sandbox_id,
            container_id = %self.config.id,
            "container started"
        );
        Ok(())
    }

    /// Stop the container. Under `force` guest refusals are logged and the
    /// state machine advances anyway.
    pub async fn stop(&self, sandbox_state: LifecycleState, force: bool) -> Result<()> {
        if self.state() == LifecycleState::Stopped {
            return Ok(());
        }
        self.require_state(
            &[LifecycleState::Ready, LifecycleState::Running, LifecycleState::Paused],
            "stop",
        )?;

        // Only a running sandbox can deliver the teardown RPCs; without it
        // (forced cleanup) the bookkeeping still advances.
        if sandbox_state == LifecycleState::Running {
            let kill = self
                .agent
                .signal_process(SignalProcessRequest {
                    container_id: self.config.id.clone(),
                    exec_id: String::new(),
                    signal: libc::SIGKILL as u32,
                })
                .await;
            if let Err(e) = kill {
                if !force {
                    return Err(e);
                }
                tracing::warn!(container_id = %self.config.id, error = %e, "ignoring kill failure");
            }

            let removed = self
                .agent
                .remove_container(RemoveContainerRequest {
                    container_id: self.config.id.clone(),
                    timeout: REMOVE_TIMEOUT_SECS,
                })
                .await;
            if let Err(e) = removed {
                if !force {
                    return Err(e);
                }
                tracing::warn!(container_id = %self.config.id, error = %e, "ignoring remove failure");
            }
        }

        self.execs.lock().clear();
        self.set_state(LifecycleState::Stopped);
        Ok(())
    }

    pub async fn pause(&self, sandbox_state: LifecycleState) -> Result<()> {
        self.require_sandbox_running(sandbox_state, "pause")?;
        self.require_state(&[LifecycleState::Running], "pause")?;
        self.agent.pause_container(&self.config.id).await?;
        self.set_state(LifecycleState::Paused);
        Ok(())
    }

    pub async fn resume(&self, sandbox_state: LifecycleState) -> Result<()> {
        self.require_sandbox_running(sandbox_state, "resume")?;
        self.require_state(&[LifecycleState::Paused], "resume")?;
        self.agent.resume_container(&self.config.id).await?;
        self.set_state(LifecycleState::Running);
        Ok(())
    }

    /// Run an additional process inside the container.
    pub async fn enter(
        &self,
        sandbox_state: LifecycleState,
        process: ProcessSpec,
    ) -> Result<String> {
        self.require_sandbox_running(sandbox_state, "enter")?;
        self.require_state(&[LifecycleState::Running], "enter")?;

        let exec_id = format!("{}-exec-{}", self.config.id, crate::util::random_token());
        self.agent
            .exec_process(ExecProcessRequest {
                container_id: self.config.id.clone(),
                exec_id: exec_id.clone(),
                process: guest_process(&process),
            })
            .await?;
        self.execs.lock().insert(exec_id.clone());
        Ok(exec_id)
    }

    /// Wait for a process and return its exit code.
    pub async fn wait(&self, sandbox_state: LifecycleState, process_id: &str) -> Result<i32> {
        self.require_sandbox_running(sandbox_state, "wait")?;
        self.require_state(&[LifecycleState::Running, LifecycleState::Stopped], "wait")?;

        let response = self
            .agent
            .wait_process(WaitProcessRequest {
                container_id: self.config.id.clone(),
                exec_id: process_id.to_string(),
            })
            .await?;
        self.execs.lock().remove(process_id);
        Ok(response.status)
    }

    /// Signal the init process (`all = false`) or every process.
    pub async fn kill(&self, sandbox_state: LifecycleState, signal: u32, all: bool) -> Result<()> {
        self.require_sandbox_running(sandbox_state, "kill")?;
        self.require_state(
            &[LifecycleState::Ready, LifecycleState::Running, LifecycleState::Paused],
            "kill",
        )?;

        self.agent
            .signal_process(SignalProcessRequest {
                container_id: self.config.id.clone(),
                exec_id: if all {
                    String::new()
                } else {
                    self.config.id.clone()
                },
                signal,
            })
            .await
    }

    pub async fn winsize(
        &self,
        sandbox_state: LifecycleState,
        process_id: &str,
        rows: u16,
        columns: u16,
    ) -> Result<()> {
        self.require_sandbox_running(sandbox_state, "winsize")?;
        self.require_state(&[LifecycleState::Running], "winsize")?;
        self.agent
            .tty_win_resize(TtyWinResizeRequest {
                container_id: self.config.id.clone(),
                exec_id: process_id.to_string(),
                row: rows,
                column: columns,
            })
            .await
    }

    pub fn io_stream(&self, process_id: &str) -> Result<IoStream> {
        self.require_state(&[LifecycleState::Running], "io_stream")?;
        Ok(IoStream::new(
            Arc::clone(&self.agent),
            &self.config.id,
            process_id,
        ))
    }

    pub async fn stats(&self, sandbox_state: LifecycleState) -> Result<StatsContainerResponse> {
        self.require_sandbox_running(sandbox_state, "stats")?;
        self.agent.stats_container(&self.config.id).await
    }
}

pub(crate) fn guest_process(spec: &ProcessSpec) -> GuestProcess {
    GuestProcess {
        args: spec.args.clone(),
        env: spec.env.clone(),
        cwd: spec.cwd.clone(),
        terminal: spec.terminal,
        user: GuestUser {
            uid: spec.uid,
            gid: spec.gid,
            additional_gids: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use LifecycleState::*;

    fn container(agent: Arc<MockAgent>) -> Container {
        Container::new(
            "sb1",
            ContainerConfig {
                id: "c1".into(),
                process: ProcessSpec::new(vec!["/bin/sh".into()]),
                ..Default::default()
            },
            agent,
        )
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let agent = Arc::new(MockAgent::new());
        let c = container(agent.clone());
        assert_eq!(c.state(), Ready);

        c.start(Running).await.unwrap();
        assert_eq!(c.state(), Running);

        c.pause(Running).await.unwrap();
        assert_eq!(c.state(), Paused);
        c.resume(Running).await.unwrap();
        assert_eq!(c.state(), Running);

        c.stop(Running, false).await.unwrap();
        assert_eq!(c.state(), Stopped);

        let ops = agent.ops().await;
        assert_eq!(
            ops,
            vec![
                "StartContainer",
                "PauseContainer",
                "ResumeContainer",
                "SignalProcess",
                "RemoveContainer"
            ]
        );
    }

    #[tokio::test]
    async fn test_guards_reject_without_side_effect() {
        let agent = Arc::new(MockAgent::new());
        let c = container(agent.clone());

        // Sandbox not running: nothing may advance.
        for sandbox_state in [Ready, Paused, Stopped] {
            assert!(matches!(
                c.start(sandbox_state).await,
                Err(Error::InvalidState(_))
            ));
            assert!(matches!(
                c.enter(sandbox_state, ProcessSpec::new(vec!["/bin/true".into()]))
                    .await,
                Err(Error::InvalidState(_))
            ));
            assert!(matches!(
                c.kill(sandbox_state, libc::SIGTERM as u32, true).await,
                Err(Error::InvalidState(_))
            ));
        }
        assert_eq!(c.state(), Ready);
        assert!(agent.ops().await.is_empty());

        // Exec and winsize require a running container.
        assert!(matches!(
            c.enter(Running, ProcessSpec::new(vec!["/bin/true".into()]))
                .await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            c.winsize(Running, "c1", 24, 80).await,
            Err(Error::InvalidState(_))
        ));

        // Pause is reachable from Running only.
        assert!(matches!(c.pause(Running).await, Err(Error::InvalidState(_))));
        assert!(matches!(c.resume(Running).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_stopped_is_terminal() {
        let agent = Arc::new(MockAgent::new());
        let c = container(agent.clone());
        c.start(Running).await.unwrap();
        c.stop(Running, false).await.unwrap();

        assert!(matches!(c.start(Running).await, Err(Error::InvalidState(_))));
        assert!(matches!(
            c.kill(Running, libc::SIGKILL as u32, true).await,
            Err(Error::InvalidState(_))
        ));
        // Second stop is a no-op, not an error.
        c.stop(Running, false).await.unwrap();
        // Wait is still legal on a stopped container.
        assert_eq!(c.wait(Running, "c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exec_and_wait() {
        let agent = Arc::new(MockAgent::new());
        let c = container(agent.clone());
        c.start(Running).await.unwrap();

        let exec_id = c
            .enter(Running, ProcessSpec::new(vec!["/bin/echo".into(), "hi".into()]))
            .await
            .unwrap();
        assert!(exec_id.starts_with("c1-exec-"));

        agent.wait_status.store(3, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(c.wait(Running, &exec_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_guest_refusal_travels_verbatim() {
        let agent = Arc::new(MockAgent::new());
        agent.fail_op("StartContainer").await;
        let c = container(agent);
        match c.start(Running).await {
            Err(Error::AgentRpc(message)) => {
                assert_eq!(message, "guest refused StartContainer")
            }
            other => panic!("expected AgentRpc, got {:?}", other),
        }
        // Failed start leaves the container Ready.
        assert_eq!(c.state(), Ready);
    }

    #[tokio::test]
    async fn test_force_stop_swallows_guest_errors() {
        let agent = Arc::new(MockAgent::new());
        agent.fail_op("SignalProcess").await;
        agent.fail_op("RemoveContainer").await;
        let c = container(agent);
        c.start(Running).await.unwrap();

        assert!(c.stop(Running, false).await.is_err());
        assert_eq!(c.state(), Running);

        c.stop(Running, true).await.unwrap();
        assert_eq!(c.state(), Stopped);
    }

    #[tokio::test]
    async fn test_kill_all_vs_init() {
        let agent = Arc::new(MockAgent::new());
        let c = container(agent.clone());
        c.start(Running).await.unwrap();
        c.kill(Running, libc::SIGTERM as u32, true).await.unwrap();
        c.kill(Running, libc::SIGTERM as u32, false).await.unwrap();
        // Both went through; the mock records the op names.
        let signal_ops = agent
            .ops()
            .await
            .iter()
            .filter(|o| *o == "SignalProcess")
            .count();
        assert_eq!(signal_ops, 2);
    }
}
