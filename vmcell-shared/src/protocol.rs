//! Wire shapes of the host↔guest agent protocol.
//!
//! Every request travels as a length-prefixed JSON frame:
//!
//! ```text
//! [u32 big-endian frame length][RequestEnvelope as JSON]
//! ```
//!
//! and is answered by one `ResponseEnvelope` frame carrying either the
//! operation's typed body or the guest's error message verbatim. The
//! operation name in the envelope selects the body type; both sides
//! deserialize with the structs below.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Frames larger than this are rejected by both sides.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Default chunk size for `CopyFile` streaming. Callers may lower it when
/// the guest advertises a smaller maximum payload.
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub op: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseEnvelope {
    Ok { id: u64, body: serde_json::Value },
    Error { id: u64, message: String },
}

/// Empty request/response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

// ============================================================================
// Storage, devices and mounts
// ============================================================================

/// A storage object tells the guest how to bring a volume online before
/// container start: which driver realises it, where it comes from and
/// where to mount it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub driver: String,
    #[serde(default)]
    pub driver_options: Vec<String>,
    pub source: String,
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub mount_point: String,
}

/// Storage driver names understood by the guest.
pub mod storage_driver {
    pub const VIRTIO_BLK: &str = "blk";
    pub const VIRTIO_BLK_CCW: &str = "blk-ccw";
    pub const VIRTIO_MMIO: &str = "mmioblk";
    pub const VIRTIO_SCSI: &str = "scsi";
    pub const VIRTIO_FS: &str = "virtio-fs";
    pub const OVERLAY_FS: &str = "overlayfs";
    pub const LOCAL: &str = "local";
    pub const IMAGE_GUEST_PULL: &str = "image_guest_pull";
}

/// Device handed to the guest at container creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDevice {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub vm_path: String,
    pub container_path: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Guest-side bind mount requested for a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestMount {
    pub source: String,
    pub destination: String,
    pub fs_type: String,
    #[serde(default)]
    pub options: Vec<String>,
}

// ============================================================================
// Processes
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestUser {
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestProcess {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: GuestUser,
}

// ============================================================================
// Sandbox lifecycle
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub sandbox_id: String,
    pub hostname: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub storages: Vec<Storage>,
    #[serde(default)]
    pub sandbox_pidns: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestroySandboxRequest {}

// ============================================================================
// Container lifecycle
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub container_id: String,
    #[serde(default)]
    pub storages: Vec<Storage>,
    #[serde(default)]
    pub devices: Vec<AgentDevice>,
    #[serde(default)]
    pub mounts: Vec<GuestMount>,
    pub process: GuestProcess,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveContainerRequest {
    pub container_id: String,
    /// Seconds the guest may spend tearing the container down.
    pub timeout: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeContainerRequest {
    pub container_id: String,
}

/// Resource knobs forwarded to the guest on `UpdateContainer`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub cpu_period: Option<u64>,
    #[serde(default)]
    pub cpuset_cpus: Option<String>,
    #[serde(default)]
    pub memory_limit_bytes: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateContainerRequest {
    pub container_id: String,
    pub resources: ContainerResources,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsContainerResponse {
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_usage_nanos: u64,
    pub pids_current: u64,
}

// ============================================================================
// Processes inside containers
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    pub container_id: String,
    pub exec_id: String,
    pub process: GuestProcess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalProcessRequest {
    pub container_id: String,
    /// Empty exec id signals every process in the container.
    pub exec_id: String,
    pub signal: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitProcessRequest {
    pub container_id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitProcessResponse {
    pub status: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProcessesRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProcessesResponse {
    pub processes: Vec<ProcessInfo>,
}

// ============================================================================
// Process I/O
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteStreamRequest {
    pub container_id: String,
    pub exec_id: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteStreamResponse {
    pub len: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadStreamRequest {
    pub container_id: String,
    pub exec_id: String,
    pub len: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadStreamResponse {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseStdinRequest {
    pub container_id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtyWinResizeRequest {
    pub container_id: String,
    pub exec_id: String,
    pub row: u16,
    pub column: u16,
}

// ============================================================================
// Guest networking
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
    pub mask: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub device: String,
    pub name: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    pub mtu: u32,
    pub hw_addr: String,
    /// Guest PCI path assigned after hot-plug, when known.
    #[serde(default)]
    pub pci_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dest: String,
    pub gateway: String,
    pub device: String,
    pub source: String,
    pub scope: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArpNeighbor {
    pub to_ip: String,
    pub device: String,
    pub ll_addr: String,
    pub state: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInterfaceRequest {
    pub interface: Interface,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListInterfacesResponse {
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRoutesRequest {
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRoutesResponse {
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddArpNeighborsRequest {
    pub neighbors: Vec<ArpNeighbor>,
}

// ============================================================================
// Guest resources and details
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnlineCpuMemRequest {
    pub wait: bool,
    pub nb_cpus: u32,
    pub cpu_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemHotplugByProbeRequest {
    pub mem_hotplug_probe_addr: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReseedRandomDevRequest {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetGuestDetailsRequest {
    pub mem_block_size: bool,
    pub mem_hotplug_probe: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestDetailsResponse {
    pub mem_block_size_bytes: u64,
    pub support_mem_hotplug_probe: bool,
    pub agent_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetGuestDateTimeRequest {
    pub sec: i64,
    pub usec: i64,
}

// ============================================================================
// File streaming
// ============================================================================

/// One chunk of a streamed file copy. The guest writes chunks
/// sequentially; `offset` is where this chunk starts and `file_size` the
/// total the guest should expect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyFileRequest {
    pub path: String,
    pub file_size: i64,
    pub file_mode: u32,
    pub dir_mode: u32,
    pub uid: i32,
    pub gid: i32,
    pub offset: i64,
    pub data: Vec<u8>,
}

// ============================================================================
// Health, tracing, events
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionResponse {
    pub agent_version: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OomEventResponse {
    pub container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let req = RequestEnvelope {
            id: 7,
            op: "CreateContainer".into(),
            body: serde_json::to_value(CreateContainerRequest {
                container_id: "c1".into(),
                process: GuestProcess {
                    args: vec!["/bin/true".into()],
                    cwd: "/".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap(),
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: RequestEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.op, "CreateContainer");
        let body: CreateContainerRequest = serde_json::from_value(back.body).unwrap();
        assert_eq!(body.container_id, "c1");
    }

    #[test]
    fn test_response_envelope_tags() {
        let ok = ResponseEnvelope::Ok {
            id: 1,
            body: serde_json::Value::Null,
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"status\":\"ok\""));

        let err: ResponseEnvelope =
            serde_json::from_str(r#"{"status":"error","id":2,"message":"no such container"}"#)
                .unwrap();
        match err {
            ResponseEnvelope::Error { id, message } => {
                assert_eq!(id, 2);
                assert_eq!(message, "no such container");
            }
            _ => panic!("expected error envelope"),
        }
    }

    #[test]
    fn test_storage_defaults() {
        let s: Storage = serde_json::from_str(
            r#"{"driver":"blk","source":"/dev/vda","fs_type":"ext4","mount_point":"/r"}"#,
        )
        .unwrap();
        assert!(s.options.is_empty());
        assert!(s.driver_options.is_empty());
    }
}
