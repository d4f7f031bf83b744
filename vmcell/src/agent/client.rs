//! Framed RPC client for the guest agent.
//!
//! One connection per sandbox; requests are serialised on it (the
//! orchestrator already serialises state-changing operations, and stream
//! reads are short round-trips). A request that times out poisons the
//! connection so the next caller reconnects instead of reading a stale
//! frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use vmcell_shared::protocol::*;
use vmcell_shared::{Error, Result, Transport};

use super::Agent;

/// Tuning knobs for the client.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Per-request deadline.
    pub request_timeout_secs: u64,
    /// Chunk size used by file streaming.
    pub copy_chunk_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
        }
    }
}

trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

pub struct AgentClient {
    transport: Transport,
    config: AgentConfig,
    connection: Mutex<Option<Box<dyn AgentStream>>>,
    next_id: AtomicU64,
}

impl AgentClient {
    pub fn new(transport: Transport, config: AgentConfig) -> Self {
        Self {
            transport,
            config,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn copy_chunk_size(&self) -> usize {
        self.config.copy_chunk_size
    }

    async fn dial(&self) -> Result<Box<dyn AgentStream>> {
        match &self.transport {
            Transport::Unix { path } => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::AgentRpc(format!("connect {}: {}", path.display(), e)))?;
                Ok(Box::new(stream))
            }
            Transport::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                let stream = tokio_vsock::VsockStream::connect(addr)
                    .await
                    .map_err(|e| Error::AgentRpc(format!("connect vsock {}:{}: {}", cid, port, e)))?;
                Ok(Box::new(stream))
            }
            Transport::HybridVsock { uds_path, port } => {
                let stream = UnixStream::connect(uds_path).await.map_err(|e| {
                    Error::AgentRpc(format!("connect {}: {}", uds_path.display(), e))
                })?;
                // The VMM multiplexes guest ports over the socket; a
                // CONNECT line selects the port and is acknowledged with
                // "OK <assigned>".
                let mut stream = BufReader::new(stream);
                stream
                    .get_mut()
                    .write_all(format!("CONNECT {}\n", port).as_bytes())
                    .await
                    .map_err(|e| Error::AgentRpc(format!("hybrid vsock handshake: {}", e)))?;
                let mut line = String::new();
                tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line)
                    .await
                    .map_err(|e| Error::AgentRpc(format!("hybrid vsock handshake: {}", e)))?;
                if !line.starts_with("OK ") {
                    return Err(Error::AgentRpc(format!(
                        "hybrid vsock handshake rejected: {}",
                        line.trim_end()
                    )));
                }
                Ok(Box::new(stream))
            }
        }
    }

    async fn call<Req, Resp>(&self, op: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Send + Sync,
        Resp: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_value(req)
            .map_err(|e| Error::Internal(format!("encode {} request: {}", op, e)))?;
        let frame = serde_json::to_vec(&RequestEnvelope {
            id,
            op: op.to_string(),
            body,
        })
        .map_err(|e| Error::Internal(format!("encode {} frame: {}", op, e)))?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::AgentRpc(format!(
                "{} request of {} bytes exceeds the frame limit",
                op,
                frame.len()
            )));
        }

        let mut guard = self.connection.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::AgentRpc("agent is not connected".to_string()))?;

        let exchange = async {
            stream.write_u32(frame.len() as u32).await?;
            stream.write_all(&frame).await?;
            stream.flush().await?;

            let len = stream.read_u32().await? as usize;
            if len > MAX_FRAME_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} byte response exceeds the frame limit", len),
                ));
            }
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let buf = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                *guard = None;
                return Err(Error::AgentRpc(format!("{}: {}", op, e)));
            }
            Err(_) => {
                // A half-finished exchange leaves the stream unusable.
                *guard = None;
                return Err(Error::Timeout {
                    what: format!("agent rpc {}", op),
                    seconds: self.config.request_timeout_secs,
                });
            }
        };

        let envelope: ResponseEnvelope = serde_json::from_slice(&buf)
            .map_err(|e| Error::AgentRpc(format!("decode {} response: {}", op, e)))?;
        match envelope {
            ResponseEnvelope::Ok { id: rid, body } => {
                if rid != id {
                    *guard = None;
                    return Err(Error::AgentRpc(format!(
                        "{}: response id {} does not match request {}",
                        op, rid, id
                    )));
                }
                serde_json::from_value(body)
                    .map_err(|e| Error::AgentRpc(format!("decode {} body: {}", op, e)))
            }
            // The guest's message travels verbatim.
            ResponseEnvelope::Error { message, .. } => Err(Error::AgentRpc(message)),
        }
    }

    async fn call_unit<Req>(&self, op: &str, req: &Req) -> Result<()>
    where
        Req: Serialize + Send + Sync,
    {
        self.call::<_, Empty>(op, req).await.map(|_| ())
    }
}

#[async_trait]
impl Agent for AgentClient {
    async fn connect(&self, timeout_secs: u32) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs as u64);
        let mut delay = Duration::from_millis(10);
        loop {
            match self.dial().await {
                Ok(stream) => {
                    *self.connection.lock().await = Some(stream);
                    tracing::debug!(transport = %self.transport, "agent connected");
                    return Ok(());
                }
                Err(e) => {
                    if tokio::time::Instant::now() + delay >= deadline {
                        tracing::warn!(transport = %self.transport, error = %e, "agent connect timed out");
                        return Err(Error::Timeout {
                            what: format!("agent connect to {}", self.transport),
                            seconds: timeout_secs as u64,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        *self.connection.lock().await = None;
        Ok(())
    }

    async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<()> {
        self.call_unit("CreateSandbox", &req).await
    }

    async fn destroy_sandbox(&self) -> Result<()> {
        self.call_unit("DestroySandbox", &DestroySandboxRequest {})
            .await
    }

    async fn create_container(&self, req: CreateContainerRequest) -> Result<()> {
        self.call_unit("CreateContainer", &req).await
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.call_unit(
            "StartContainer",
            &StartContainerRequest {
                container_id: container_id.to_string(),
            },
        )
        .await
    }

    async fn remove_container(&self, req: RemoveContainerRequest) -> Result<()> {
        self.call_unit("RemoveContainer", &req).await
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        self.call_unit(
            "PauseContainer",
            &PauseContainerRequest {
                container_id: container_id.to_string(),
            },
        )
        .await
    }

    async fn resume_container(&self, container_id: &str) -> Result<()> {
        self.call_unit(
            "ResumeContainer",
            &ResumeContainerRequest {
                container_id: container_id.to_string(),
            },
        )
        .await
    }

    async fn update_container(&self, req: UpdateContainerRequest) -> Result<()> {
        self.call_unit("UpdateContainer", &req).await
    }

    async fn stats_container(&self, container_id: &str) -> Result<StatsContainerResponse> {
        self.call(
            "StatsContainer",
            &StatsContainerRequest {
                container_id: container_id.to_string(),
            },
        )
        .await
    }

    async fn exec_process(&self, req: ExecProcessRequest) -> Result<()> {
        self.call_unit("ExecProcess", &req).await
    }

    async fn signal_process(&self, req: SignalProcessRequest) -> Result<()> {
        self.call_unit("SignalProcess", &req).await
    }

    async fn wait_process(&self, req: WaitProcessRequest) -> Result<WaitProcessResponse> {
        self.call("WaitProcess", &req).await
    }

    async fn list_processes(&self, container_id: &str) -> Result<ListProcessesResponse> {
        self.call(
            "ListProcesses",
            &ListProcessesRequest {
                container_id: container_id.to_string(),
            },
        )
        .await
    }

    async fn write_stdin(&self, req: WriteStreamRequest) -> Result<WriteStreamResponse> {
        self.call("WriteStdin", &req).await
    }

    async fn read_stdout(&self, req: ReadStreamRequest) -> Result<ReadStreamResponse> {
        self.call("ReadStdout", &req).await
    }

    async fn read_stderr(&self, req: ReadStreamRequest) -> Result<ReadStreamResponse> {
        self.call("ReadStderr", &req).await
    }

    async fn close_stdin(&self, req: CloseStdinRequest) -> Result<()> {
        self.call_unit("CloseStdin", &req).await
    }

    async fn tty_win_resize(&self, req: TtyWinResizeRequest) -> Result<()> {
        self.call_unit("TtyWinResize", &req).await
    }

    async fn update_interface(&self, req: UpdateInterfaceRequest) -> Result<Interface> {
        self.call("UpdateInterface", &req).await
    }

    async fn list_interfaces(&self) -> Result<ListInterfacesResponse> {
        self.call("ListInterfaces", &Empty {}).await
    }

    async fn update_routes(&self, req: UpdateRoutesRequest) -> Result<ListRoutesResponse> {
        self.call("UpdateRoutes", &req).await
    }

    async fn list_routes(&self) -> Result<ListRoutesResponse> {
        self.call("ListRoutes", &Empty {}).await
    }

    async fn add_arp_neighbors(&self, req: AddArpNeighborsRequest) -> Result<()> {
        self.call_unit("AddARPNeighbors", &req).await
    }

    async fn online_cpu_mem(&self, req: OnlineCpuMemRequest) -> Result<()> {
        self.call_unit("OnlineCPUMem", &req).await
    }

    async fn mem_hotplug_by_probe(&self, req: MemHotplugByProbeRequest) -> Result<()> {
        self.call_unit("MemHotplugByProbe", &req).await
    }

    async fn reseed_random_dev(&self, req: ReseedRandomDevRequest) -> Result<()> {
        self.call_unit("ReseedRandomDev", &req).await
    }

    async fn get_guest_details(&self, req: GetGuestDetailsRequest) -> Result<GuestDetailsResponse> {
        self.call("GetGuestDetails", &req).await
    }

    async fn set_guest_date_time(&self, req: SetGuestDateTimeRequest) -> Result<()> {
        self.call_unit("SetGuestDateTime", &req).await
    }

    async fn copy_file(&self, req: CopyFileRequest) -> Result<()> {
        self.call_unit("CopyFile", &req).await
    }

    async fn start_tracing(&self) -> Result<()> {
        self.call_unit("StartTracing", &Empty {}).await
    }

    async fn stop_tracing(&self) -> Result<()> {
        self.call_unit("StopTracing", &Empty {}).await
    }

    async fn check(&self) -> Result<CheckResponse> {
        self.call("Check", &Empty {}).await
    }

    async fn version(&self) -> Result<VersionResponse> {
        self.call("Version", &Empty {}).await
    }

    async fn get_oom_event(&self) -> Result<OomEventResponse> {
        self.call("GetOOMEvent", &Empty {}).await
    }
}
