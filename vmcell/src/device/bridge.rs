//! Bridge/slot allocation for guest buses.
//!
//! Bridges are scanned in insertion order; a device lands on the first
//! bridge of the matching type with a free slot, lowest slot first. The
//! recorded topology is what guest PCI paths are derived from and what the
//! persistence layer snapshots.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::persist::state::BridgeState;
use vmcell_shared::{Error, Result};

/// Default usable slots on a PCI bridge (slot 0 is the bridge itself on
/// some machine types, so the capacity is conservative).
pub const PCI_BRIDGE_CAPACITY: u32 = 30;
/// PCIe root ports carry exactly one device.
pub const PCIE_ROOT_PORT_CAPACITY: u32 = 1;
/// CCW buses address devices with a 16-bit devno.
pub const CCW_BRIDGE_CAPACITY: u32 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeKind {
    Pci,
    Pcie,
    Ccw,
}

impl BridgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeKind::Pci => "pci",
            BridgeKind::Pcie => "pcie",
            BridgeKind::Ccw => "ccw",
        }
    }

    pub fn default_capacity(&self) -> u32 {
        match self {
            BridgeKind::Pci => PCI_BRIDGE_CAPACITY,
            BridgeKind::Pcie => PCIE_ROOT_PORT_CAPACITY,
            BridgeKind::Ccw => CCW_BRIDGE_CAPACITY,
        }
    }
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BridgeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pci" => Ok(BridgeKind::Pci),
            "pcie" => Ok(BridgeKind::Pcie),
            "ccw" => Ok(BridgeKind::Ccw),
            other => Err(Error::Corrupt(format!("unknown bridge kind {:?}", other))),
        }
    }
}

/// Guest PCI path of a device: the slot chain from the root bus down to
/// the device, each element rendered as two hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciPath {
    slots: Vec<u32>,
}

impl PciPath {
    pub fn new(slots: Vec<u32>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[u32] {
        &self.slots
    }
}

impl fmt::Display for PciPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.slots.iter().map(|s| format!("{:02x}", s)).collect();
        f.write_str(&parts.join("/"))
    }
}

#[derive(Debug, Clone)]
pub struct Bridge {
    pub kind: BridgeKind,
    pub id: String,
    /// Slot the bridge itself occupies on the root bus.
    pub addr: u32,
    pub capacity: u32,
    slots: BTreeMap<u32, String>,
}

impl Bridge {
    fn first_free_slot(&self) -> Option<u32> {
        (0..self.capacity).find(|slot| !self.slots.contains_key(slot))
    }
}

/// Where a device ended up after bridge allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub bridge_id: String,
    pub bridge_addr: u32,
    pub kind: BridgeKind,
    pub slot: u32,
}

impl SlotAssignment {
    /// Bus-specific address string for the VMM command line or monitor.
    /// CCW devices use a 4-hex-digit devno; PCI-class devices use the slot
    /// value itself.
    pub fn address(&self) -> String {
        match self.kind {
            BridgeKind::Ccw => format!("{:04x}", self.slot),
            BridgeKind::Pci | BridgeKind::Pcie => format!("{:02x}", self.slot),
        }
    }

    /// Guest PCI path: bridge slot on the root bus, then the device slot.
    pub fn pci_path(&self) -> PciPath {
        PciPath::new(vec![self.bridge_addr, self.slot])
    }

    /// CCW bus address (`fe.0.<devno>`); only meaningful on CCW bridges.
    pub fn ccw_addr(&self) -> String {
        format!("fe.0.{:04x}", self.slot)
    }
}

/// Tracks every bridge of a sandbox and which device occupies which slot.
#[derive(Debug, Default)]
pub struct BridgeAllocator {
    bridges: Vec<Bridge>,
}

impl BridgeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bridge(&mut self, kind: BridgeKind, addr: u32) -> &Bridge {
        let id = format!("{}-bridge-{}", kind.as_str(), self.bridges.len());
        self.bridges.push(Bridge {
            kind,
            id,
            addr,
            capacity: kind.default_capacity(),
            slots: BTreeMap::new(),
        });
        self.bridges.last().expect("just pushed")
    }

    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    /// Place `device_id` on the first matching bridge with a free slot.
    pub fn add_device(&mut self, device_id: &str, kind: BridgeKind) -> Result<SlotAssignment> {
        for bridge in self.bridges.iter_mut() {
            if bridge.kind != kind {
                continue;
            }
            if let Some(slot) = bridge.first_free_slot() {
                bridge.slots.insert(slot, device_id.to_string());
                return Ok(SlotAssignment {
                    bridge_id: bridge.id.clone(),
                    bridge_addr: bridge.addr,
                    kind: bridge.kind,
                    slot,
                });
            }
        }
        Err(Error::NoFreeSlot(kind.as_str().to_string()))
    }

    pub fn remove_device(&mut self, device_id: &str) -> Result<()> {
        for bridge in self.bridges.iter_mut() {
            let occupied: Option<u32> = bridge
                .slots
                .iter()
                .find(|(_, id)| id.as_str() == device_id)
                .map(|(slot, _)| *slot);
            if let Some(slot) = occupied {
                bridge.slots.remove(&slot);
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("device {} on any bridge", device_id)))
    }

    pub fn to_state(&self) -> Vec<BridgeState> {
        self.bridges
            .iter()
            .map(|b| BridgeState {
                kind: b.kind.as_str().to_string(),
                id: b.id.clone(),
                addr: b.addr,
                slots: b.slots.clone(),
            })
            .collect()
    }

    pub fn from_state(states: &[BridgeState]) -> Result<Self> {
        let mut bridges = Vec::with_capacity(states.len());
        for s in states {
            let kind: BridgeKind = s.kind.parse()?;
            bridges.push(Bridge {
                kind,
                id: s.id.clone(),
                addr: s.addr,
                capacity: kind.default_capacity(),
                slots: s.slots.clone(),
            });
        }
        Ok(Self { bridges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_lowest_slot() {
        let mut alloc = BridgeAllocator::new();
        alloc.add_bridge(BridgeKind::Pci, 2);

        let a = alloc.add_device("dev-a", BridgeKind::Pci).unwrap();
        let b = alloc.add_device("dev-b", BridgeKind::Pci).unwrap();
        assert_eq!(a.slot, 0);
        assert_eq!(b.slot, 1);

        // Freeing the lower slot makes it the next allocation again.
        alloc.remove_device("dev-a").unwrap();
        let c = alloc.add_device("dev-c", BridgeKind::Pci).unwrap();
        assert_eq!(c.slot, 0);
    }

    #[test]
    fn test_scan_order_across_bridges() {
        let mut alloc = BridgeAllocator::new();
        alloc.add_bridge(BridgeKind::Pcie, 1);
        alloc.add_bridge(BridgeKind::Pcie, 2);

        let a = alloc.add_device("a", BridgeKind::Pcie).unwrap();
        let b = alloc.add_device("b", BridgeKind::Pcie).unwrap();
        assert_eq!(a.bridge_addr, 1);
        assert_eq!(b.bridge_addr, 2);

        assert!(matches!(
            alloc.add_device("c", BridgeKind::Pcie),
            Err(Error::NoFreeSlot(_))
        ));
    }

    #[test]
    fn test_kind_mismatch_is_no_free_slot() {
        let mut alloc = BridgeAllocator::new();
        alloc.add_bridge(BridgeKind::Pci, 2);
        assert!(matches!(
            alloc.add_device("a", BridgeKind::Ccw),
            Err(Error::NoFreeSlot(_))
        ));
    }

    #[test]
    fn test_address_formats() {
        let pci = SlotAssignment {
            bridge_id: "pci-bridge-0".into(),
            bridge_addr: 2,
            kind: BridgeKind::Pci,
            slot: 10,
        };
        assert_eq!(pci.address(), "0a");
        assert_eq!(pci.pci_path().to_string(), "02/0a");

        let ccw = SlotAssignment {
            bridge_id: "ccw-bridge-0".into(),
            bridge_addr: 0,
            kind: BridgeKind::Ccw,
            slot: 3,
        };
        assert_eq!(ccw.address(), "0003");
        assert_eq!(ccw.ccw_addr(), "fe.0.0003");
    }

    #[test]
    fn test_state_round_trip() {
        let mut alloc = BridgeAllocator::new();
        alloc.add_bridge(BridgeKind::Pci, 2);
        alloc.add_device("dev-a", BridgeKind::Pci).unwrap();

        let state = alloc.to_state();
        let restored = BridgeAllocator::from_state(&state).unwrap();
        // dev-a still occupies slot 0, so the next device takes slot 1.
        let mut restored = restored;
        let next = restored.add_device("dev-b", BridgeKind::Pci).unwrap();
        assert_eq!(next.slot, 1);
    }
}
