//! Exec-process I/O over the agent connection.
//!
//! Streams are realised as explicit read/write RPCs; the pump variants
//! bridge them onto bounded channels so a slow consumer back-pressures
//! the reads instead of buffering without limit.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent::Agent;
use vmcell_shared::protocol::{
    CloseStdinRequest, ReadStreamRequest, WriteStreamRequest,
};
use vmcell_shared::Result;

/// How many bytes one read RPC asks for.
const READ_CHUNK: u32 = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

pub struct StdinWriter {
    agent: Arc<dyn Agent>,
    container_id: String,
    exec_id: String,
}

impl StdinWriter {
    pub(crate) fn new(agent: Arc<dyn Agent>, container_id: &str, exec_id: &str) -> Self {
        Self {
            agent,
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let response = self
            .agent
            .write_stdin(WriteStreamRequest {
                container_id: self.container_id.clone(),
                exec_id: self.exec_id.clone(),
                data: data.to_vec(),
            })
            .await?;
        Ok(response.len as usize)
    }

    pub async fn close(&self) -> Result<()> {
        self.agent
            .close_stdin(CloseStdinRequest {
                container_id: self.container_id.clone(),
                exec_id: self.exec_id.clone(),
            })
            .await
    }
}

pub struct StreamReader {
    agent: Arc<dyn Agent>,
    container_id: String,
    exec_id: String,
    kind: StreamKind,
}

impl StreamReader {
    pub(crate) fn new(
        agent: Arc<dyn Agent>,
        container_id: &str,
        exec_id: &str,
        kind: StreamKind,
    ) -> Self {
        Self {
            agent,
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            kind,
        }
    }

    /// One read round-trip; an empty result means end of stream.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let request = ReadStreamRequest {
            container_id: self.container_id.clone(),
            exec_id: self.exec_id.clone(),
            len: READ_CHUNK,
        };
        let response = match self.kind {
            StreamKind::Stdout => self.agent.read_stdout(request).await?,
            StreamKind::Stderr => self.agent.read_stderr(request).await?,
        };
        Ok(response.data)
    }

    /// Pump the stream into a bounded channel until EOF or error. The
    /// bounded capacity is the back-pressure: reads stop while the
    /// consumer lags.
    pub fn into_channel(self, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            loop {
                match self.read().await {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => {
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            container_id = %self.container_id,
                            exec_id = %self.exec_id,
                            error = %e,
                            "stream read ended"
                        );
                        break;
                    }
                }
            }
        });
        rx
    }
}

/// The three standard streams of one process.
pub struct IoStream {
    pub stdin: StdinWriter,
    pub stdout: StreamReader,
    pub stderr: StreamReader,
}

impl IoStream {
    pub(crate) fn new(agent: Arc<dyn Agent>, container_id: &str, exec_id: &str) -> Self {
        Self {
            stdin: StdinWriter::new(Arc::clone(&agent), container_id, exec_id),
            stdout: StreamReader::new(Arc::clone(&agent), container_id, exec_id, StreamKind::Stdout),
            stderr: StreamReader::new(agent, container_id, exec_id, StreamKind::Stderr),
        }
    }
}
