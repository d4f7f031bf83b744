//! Serde shapes of everything a sandbox persists.
//!
//! The on-disk format is one JSON object per sandbox plus one per
//! container. Endpoint entries are tagged unions keyed by `type`; loading a
//! state with an unrecognised tag fails instead of dropping the entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{LifecycleState, ProcessSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxState {
    pub id: String,
    pub state: LifecycleState,
    pub hypervisor: HypervisorState,
    pub network: NetworkState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HypervisorState {
    pub kind: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub bridges: Vec<BridgeState>,
    #[serde(default)]
    pub hotplugged_vcpus: Vec<u32>,
    #[serde(default)]
    pub hotplugged_memory_mib: u32,
    #[serde(default)]
    pub virtiofsd_pid: Option<i32>,
    #[serde(default)]
    pub pcie_root_port: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeState {
    pub kind: String,
    pub id: String,
    pub addr: u32,
    #[serde(default)]
    pub slots: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(default)]
    pub netns_path: Option<String>,
    #[serde(default)]
    pub netns_created: bool,
    #[serde(default)]
    pub endpoints: Vec<EndpointState>,
}

/// Common attributes every endpoint variant persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointCore {
    pub name: String,
    pub hw_addr: String,
    #[serde(default)]
    pub pci_path: Option<String>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointState {
    Veth(EndpointCore),
    Macvlan(EndpointCore),
    Macvtap(EndpointCore),
    Ipvlan(EndpointCore),
    Tap(EndpointCore),
    Tuntap(EndpointCore),
    VhostUser(EndpointCore),
    Physical(EndpointCore),
    Vfio(EndpointCore),
}

impl EndpointState {
    pub fn core(&self) -> &EndpointCore {
        match self {
            EndpointState::Veth(c)
            | EndpointState::Macvlan(c)
            | EndpointState::Macvtap(c)
            | EndpointState::Ipvlan(c)
            | EndpointState::Tap(c)
            | EndpointState::Tuntap(c)
            | EndpointState::VhostUser(c)
            | EndpointState::Physical(c)
            | EndpointState::Vfio(c) => c,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub state: LifecycleState,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub block_device_id: Option<String>,
    pub process: ProcessSpec,
}
