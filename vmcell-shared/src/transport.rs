//! Transport addresses for reaching a sandbox's guest agent.
//!
//! Three address families cover the hypervisor engines: a plain unix
//! socket (tests and non-VM paths), a real AF_VSOCK address (QEMU-class
//! vhost-vsock), and the Firecracker-style "hybrid" vsock where the VMM
//! multiplexes guest ports over one host unix socket and the client opens
//! it with a `CONNECT <port>` handshake line.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum Transport {
    Unix { path: PathBuf },
    Vsock { cid: u32, port: u32 },
    HybridVsock { uds_path: PathBuf, port: u32 },
}

impl Transport {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Transport::Unix { path: path.into() }
    }

    pub fn vsock(cid: u32, port: u32) -> Self {
        Transport::Vsock { cid, port }
    }

    pub fn hybrid_vsock(uds_path: impl Into<PathBuf>, port: u32) -> Self {
        Transport::HybridVsock {
            uds_path: uds_path.into(),
            port,
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            Transport::Unix { path } => format!("unix://{}", path.display()),
            Transport::Vsock { cid, port } => format!("vsock://{}:{}", cid, port),
            Transport::HybridVsock { uds_path, port } => {
                format!("hvsock://{}:{}", uds_path.display(), port)
            }
        }
    }

    /// Host-side socket path, when the address has one.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Transport::Unix { path } => Some(path),
            Transport::HybridVsock { uds_path, .. } => Some(uds_path),
            Transport::Vsock { .. } => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}
