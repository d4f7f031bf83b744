//! Network endpoint model.

use serde::{Deserialize, Serialize};

use crate::device::{NetworkConfig, PciPath};
use crate::persist::state::{EndpointCore, EndpointState};
use vmcell_shared::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Veth,
    Macvlan,
    Macvtap,
    Ipvlan,
    Tap,
    Tuntap,
    VhostUser,
    Physical,
    Vfio,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Veth => "veth",
            EndpointKind::Macvlan => "macvlan",
            EndpointKind::Macvtap => "macvtap",
            EndpointKind::Ipvlan => "ipvlan",
            EndpointKind::Tap => "tap",
            EndpointKind::Tuntap => "tuntap",
            EndpointKind::VhostUser => "vhost_user",
            EndpointKind::Physical => "physical",
            EndpointKind::Vfio => "vfio",
        }
    }
}

/// Link attributes captured at scan time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointProperties {
    pub mtu: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub flags: u32,
}

/// Bandwidth caps in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rx_bps: u64,
    pub tx_bps: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub name: String,
    pub hw_addr: String,
    /// Guest PCI path, known after attach.
    pub pci_path: Option<PciPath>,
    pub properties: EndpointProperties,
    pub rate_limit: Option<RateLimit>,
    /// Host device actually handed to the VMM (tap name for TC-filter
    /// pairs, the link itself otherwise). Set during attach.
    pub vm_dev_name: Option<String>,
}

impl Endpoint {
    pub fn new(kind: EndpointKind, name: impl Into<String>, hw_addr: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            hw_addr: hw_addr.into(),
            pci_path: None,
            properties: EndpointProperties::default(),
            rate_limit: None,
            vm_dev_name: None,
        }
    }

    /// The device descriptor handed to the hypervisor for this endpoint.
    pub fn device_config(&self, index: usize) -> NetworkConfig {
        NetworkConfig {
            id: format!("ep{}-{}", index, self.name),
            host_dev_name: self
                .vm_dev_name
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            guest_mac: self.hw_addr.clone(),
            queues: 0,
            pci_path: self.pci_path.clone(),
            rx_rate_limit_bps: self.rate_limit.map(|r| r.rx_bps),
            tx_rate_limit_bps: self.rate_limit.map(|r| r.tx_bps),
        }
    }

    pub fn to_state(&self) -> EndpointState {
        let core = EndpointCore {
            name: self.name.clone(),
            hw_addr: self.hw_addr.clone(),
            pci_path: self.pci_path.as_ref().map(|p| p.to_string()),
            mtu: self.properties.mtu,
            addresses: self.properties.addresses.clone(),
        };
        match self.kind {
            EndpointKind::Veth => EndpointState::Veth(core),
            EndpointKind::Macvlan => EndpointState::Macvlan(core),
            EndpointKind::Macvtap => EndpointState::Macvtap(core),
            EndpointKind::Ipvlan => EndpointState::Ipvlan(core),
            EndpointKind::Tap => EndpointState::Tap(core),
            EndpointKind::Tuntap => EndpointState::Tuntap(core),
            EndpointKind::VhostUser => EndpointState::VhostUser(core),
            EndpointKind::Physical => EndpointState::Physical(core),
            EndpointKind::Vfio => EndpointState::Vfio(core),
        }
    }

    pub fn from_state(state: &EndpointState) -> Result<Self> {
        let kind = match state {
            EndpointState::Veth(_) => EndpointKind::Veth,
            EndpointState::Macvlan(_) => EndpointKind::Macvlan,
            EndpointState::Macvtap(_) => EndpointKind::Macvtap,
            EndpointState::Ipvlan(_) => EndpointKind::Ipvlan,
            EndpointState::Tap(_) => EndpointKind::Tap,
            EndpointState::Tuntap(_) => EndpointKind::Tuntap,
            EndpointState::VhostUser(_) => EndpointKind::VhostUser,
            EndpointState::Physical(_) => EndpointKind::Physical,
            EndpointState::Vfio(_) => EndpointKind::Vfio,
        };
        let core = state.core();
        if core.name.is_empty() {
            return Err(Error::Corrupt("endpoint with empty name".to_string()));
        }
        Ok(Self {
            kind,
            name: core.name.clone(),
            hw_addr: core.hw_addr.clone(),
            pci_path: None,
            properties: EndpointProperties {
                mtu: core.mtu,
                addresses: core.addresses.clone(),
                flags: 0,
            },
            rate_limit: None,
            vm_dev_name: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        let mut ep = Endpoint::new(EndpointKind::Macvtap, "eth0", "02:42:ac:11:00:02");
        ep.properties.mtu = 9000;
        ep.properties.addresses = vec!["10.4.0.7/24".to_string()];

        let state = ep.to_state();
        let back = Endpoint::from_state(&state).unwrap();
        assert_eq!(back.kind, EndpointKind::Macvtap);
        assert_eq!(back.name, "eth0");
        assert_eq!(back.properties.mtu, 9000);
    }

    #[test]
    fn test_device_config_prefers_vm_dev() {
        let mut ep = Endpoint::new(EndpointKind::Veth, "eth0", "02:42:ac:11:00:02");
        assert_eq!(ep.device_config(0).host_dev_name, "eth0");

        ep.vm_dev_name = Some("tap0_vc".to_string());
        let config = ep.device_config(0);
        assert_eq!(config.host_dev_name, "tap0_vc");
        assert_eq!(config.guest_mac, "02:42:ac:11:00:02");
    }
}
