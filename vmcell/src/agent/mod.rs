//! Client side of the host↔guest agent protocol.
//!
//! The [`Agent`] trait is the operation surface the orchestrator and the
//! container state machine program against; [`AgentClient`] realises it
//! over a framed vsock connection. Tests substitute a mock.

mod client;

use std::path::Path;

use async_trait::async_trait;

use vmcell_shared::protocol::*;
use vmcell_shared::{Error, Result};

pub use client::{AgentClient, AgentConfig};

/// Guest port the agent listens on.
pub const AGENT_VSOCK_PORT: u32 = 1024;

#[async_trait]
pub trait Agent: Send + Sync {
    /// Establish the connection, retrying with backoff until `timeout_secs`.
    async fn connect(&self, timeout_secs: u32) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<()>;
    async fn destroy_sandbox(&self) -> Result<()>;

    async fn create_container(&self, req: CreateContainerRequest) -> Result<()>;
    async fn start_container(&self, container_id: &str) -> Result<()>;
    async fn remove_container(&self, req: RemoveContainerRequest) -> Result<()>;
    async fn pause_container(&self, container_id: &str) -> Result<()>;
    async fn resume_container(&self, container_id: &str) -> Result<()>;
    async fn update_container(&self, req: UpdateContainerRequest) -> Result<()>;
    async fn stats_container(&self, container_id: &str) -> Result<StatsContainerResponse>;

    async fn exec_process(&self, req: ExecProcessRequest) -> Result<()>;
    async fn signal_process(&self, req: SignalProcessRequest) -> Result<()>;
    async fn wait_process(&self, req: WaitProcessRequest) -> Result<WaitProcessResponse>;
    async fn list_processes(&self, container_id: &str) -> Result<ListProcessesResponse>;

    async fn write_stdin(&self, req: WriteStreamRequest) -> Result<WriteStreamResponse>;
    async fn read_stdout(&self, req: ReadStreamRequest) -> Result<ReadStreamResponse>;
    async fn read_stderr(&self, req: ReadStreamRequest) -> Result<ReadStreamResponse>;
    async fn close_stdin(&self, req: CloseStdinRequest) -> Result<()>;
    async fn tty_win_resize(&self, req: TtyWinResizeRequest) -> Result<()>;

    async fn update_interface(&self, req: UpdateInterfaceRequest) -> Result<Interface>;
    async fn list_interfaces(&self) -> Result<ListInterfacesResponse>;
    async fn update_routes(&self, req: UpdateRoutesRequest) -> Result<ListRoutesResponse>;
    async fn list_routes(&self) -> Result<ListRoutesResponse>;
    async fn add_arp_neighbors(&self, req: AddArpNeighborsRequest) -> Result<()>;

    async fn online_cpu_mem(&self, req: OnlineCpuMemRequest) -> Result<()>;
    async fn mem_hotplug_by_probe(&self, req: MemHotplugByProbeRequest) -> Result<()>;
    async fn reseed_random_dev(&self, req: ReseedRandomDevRequest) -> Result<()>;
    async fn get_guest_details(&self, req: GetGuestDetailsRequest) -> Result<GuestDetailsResponse>;
    async fn set_guest_date_time(&self, req: SetGuestDateTimeRequest) -> Result<()>;

    async fn copy_file(&self, req: CopyFileRequest) -> Result<()>;

    async fn start_tracing(&self) -> Result<()>;
    async fn stop_tracing(&self) -> Result<()>;
    async fn check(&self) -> Result<CheckResponse>;
    async fn version(&self) -> Result<VersionResponse>;
    async fn get_oom_event(&self) -> Result<OomEventResponse>;
}

/// Stream a host file (or symlink) into the guest at `guest_path`,
/// chunked so no single frame exceeds the agent's payload limit. The guest
/// writes chunks sequentially; `offset`/`file_size` let it validate
/// completeness.
pub async fn copy_file_to_guest(
    agent: &dyn Agent,
    host_path: &Path,
    guest_path: &str,
    chunk_size: usize,
) -> Result<()> {
    let metadata = std::fs::symlink_metadata(host_path)?;
    let uid = std::os::unix::fs::MetadataExt::uid(&metadata) as i32;
    let gid = std::os::unix::fs::MetadataExt::gid(&metadata) as i32;
    let mode = std::os::unix::fs::MetadataExt::mode(&metadata);

    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(host_path)?;
        let data = target.as_os_str().as_encoded_bytes().to_vec();
        return agent
            .copy_file(CopyFileRequest {
                path: guest_path.to_string(),
                file_size: data.len() as i64,
                file_mode: mode,
                dir_mode: 0o755,
                uid,
                gid,
                offset: 0,
                data,
            })
            .await;
    }

    if !metadata.is_file() {
        return Err(Error::ConfigInvalid(format!(
            "{} is neither a regular file nor a symlink",
            host_path.display()
        )));
    }

    let data = std::fs::read(host_path)?;
    let file_size = data.len() as i64;
    let chunk_size = chunk_size.max(1);

    if data.is_empty() {
        return agent
            .copy_file(CopyFileRequest {
                path: guest_path.to_string(),
                file_size: 0,
                file_mode: mode,
                dir_mode: 0o755,
                uid,
                gid,
                offset: 0,
                data: Vec::new(),
            })
            .await;
    }

    let mut offset = 0usize;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        agent
            .copy_file(CopyFileRequest {
                path: guest_path.to_string(),
                file_size,
                file_mode: mode,
                dir_mode: 0o755,
                uid,
                gid,
                offset: offset as i64,
                data: data[offset..end].to_vec(),
            })
            .await?;
        offset = end;
    }
    Ok(())
}
