//! Network engine: endpoint discovery in the sandbox netns, attachment to
//! the VMM, and host-side traffic shaping.

pub mod endpoint;
pub mod netns;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceConfig;
use crate::hypervisor::{Capabilities, Hypervisor};
use crate::persist::state::NetworkState;
use vmcell_shared::{Error, Result};

pub use endpoint::{Endpoint, EndpointKind, EndpointProperties, RateLimit};
pub use netns::run_in_netns;

/// How a discovered link is wired through to the VMM's tap device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetInterworkingModel {
    /// Mirror traffic between the CNI veth and a fresh tap with TC
    /// ingress filters.
    #[default]
    TcFilter,
    /// Bridge the host link with a macvtap device.
    Macvtap,
    /// Hand the link to the VMM untouched.
    None,
}

pub struct NetworkEngine {
    netns_path: Option<PathBuf>,
    netns_created: bool,
    model: NetInterworkingModel,
    endpoints: Vec<Endpoint>,
}

impl NetworkEngine {
    pub fn new(netns_path: Option<PathBuf>, model: NetInterworkingModel) -> Self {
        Self {
            netns_path,
            netns_created: false,
            model,
            endpoints: Vec::new(),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn netns_path(&self) -> Option<&Path> {
        self.netns_path.as_deref()
    }

    /// Enumerate links in the sandbox netns, skipping loopback, downed
    /// links and anything already tracked.
    pub async fn scan(&mut self) -> Result<usize> {
        let netns = self.netns_path.clone();
        let known: Vec<String> = self.endpoints.iter().map(|e| e.name.clone()).collect();

        let found = tokio::task::spawn_blocking(move || {
            run_in_netns(netns.as_deref(), move || scan_links(&known))
        })
        .await
        .map_err(|e| Error::Internal(format!("netns scan task: {}", e)))??;

        let count = found.len();
        self.endpoints.extend(found);
        Ok(count)
    }

    /// Attach every scanned endpoint to the VMM. With `hotplug` the
    /// devices go through the live monitor, otherwise they are queued for
    /// boot.
    pub async fn add_endpoints(
        &mut self,
        hypervisor: &Arc<dyn Hypervisor>,
        hotplug: bool,
    ) -> Result<()> {
        let shape_on_host = !hypervisor
            .capabilities()
            .await?
            .contains(Capabilities::MULTI_QUEUE);

        for (index, endpoint) in self.endpoints.iter_mut().enumerate() {
            prepare_endpoint(self.model, self.netns_path.as_deref(), index, endpoint)?;

            // Built-in VMM limiters win; otherwise shape with HTB qdiscs
            // on the host side.
            if let Some(limit) = endpoint.rate_limit {
                if shape_on_host {
                    let device = endpoint
                        .vm_dev_name
                        .clone()
                        .unwrap_or_else(|| endpoint.name.clone());
                    if let Err(e) =
                        shape_endpoint(self.netns_path.clone(), device, limit).await
                    {
                        tracing::warn!(endpoint = %endpoint.name, error = %e, "rate shaping failed");
                    }
                }
            }

            let config = DeviceConfig::Network(endpoint.device_config(index));
            let attached = if hotplug {
                hypervisor.hotplug_add_device(config).await?
            } else {
                hypervisor.add_device(config.clone()).await?;
                config
            };
            if let DeviceConfig::Network(net) = attached {
                endpoint.pci_path = net.pci_path;
            }
        }
        Ok(())
    }

    /// Detach endpoints from the VMM; a missing hypervisor degrades to
    /// pure host-side cleanup.
    pub async fn remove_endpoints(
        &mut self,
        hypervisor: Option<&Arc<dyn Hypervisor>>,
        hotplug: bool,
    ) -> Result<()> {
        let mut failures = Vec::new();
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if hotplug {
                if let Some(h) = hypervisor {
                    let config = DeviceConfig::Network(endpoint.device_config(index));
                    if let Err(e) = h.hotplug_remove_device(config).await {
                        failures.push(format!("{}: {}", endpoint.name, e));
                    }
                }
            }
            teardown_endpoint(self.netns_path.as_deref(), endpoint);
        }
        self.endpoints.clear();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }

    /// Hot-attach one endpoint to a running VM.
    pub async fn hot_attach_endpoint(
        &mut self,
        mut endpoint: Endpoint,
        hypervisor: &Arc<dyn Hypervisor>,
    ) -> Result<()> {
        let index = self.endpoints.len();
        prepare_endpoint(self.model, self.netns_path.as_deref(), index, &mut endpoint)?;
        let config = DeviceConfig::Network(endpoint.device_config(index));
        let attached = hypervisor.hotplug_add_device(config).await?;
        if let DeviceConfig::Network(net) = attached {
            endpoint.pci_path = net.pci_path;
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Hot-detach one endpoint by link name.
    pub async fn hot_detach_endpoint(
        &mut self,
        name: &str,
        hypervisor: &Arc<dyn Hypervisor>,
    ) -> Result<()> {
        let index = self
            .endpoints
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(format!("endpoint {}", name)))?;
        let config = DeviceConfig::Network(self.endpoints[index].device_config(index));
        hypervisor.hotplug_remove_device(config).await?;
        let endpoint = self.endpoints.remove(index);
        teardown_endpoint(self.netns_path.as_deref(), &endpoint);
        Ok(())
    }

    pub fn save(&self) -> NetworkState {
        NetworkState {
            netns_path: self
                .netns_path
                .as_ref()
                .map(|p| p.display().to_string()),
            netns_created: self.netns_created,
            endpoints: self.endpoints.iter().map(|e| e.to_state()).collect(),
        }
    }

    pub fn restore(state: &NetworkState, model: NetInterworkingModel) -> Result<Self> {
        let mut endpoints = Vec::with_capacity(state.endpoints.len());
        for ep in &state.endpoints {
            endpoints.push(Endpoint::from_state(ep)?);
        }
        Ok(Self {
            netns_path: state.netns_path.as_ref().map(PathBuf::from),
            netns_created: state.netns_created,
            model,
            endpoints,
        })
    }
}

/// Decide which host device carries the endpoint into the VMM and create
/// it when the interworking model needs one.
fn prepare_endpoint(
    model: NetInterworkingModel,
    netns: Option<&Path>,
    index: usize,
    endpoint: &mut Endpoint,
) -> Result<()> {
    match (model, endpoint.kind) {
        // Tap-like links and physical passthrough go in as-is.
        (_, EndpointKind::Tap | EndpointKind::Tuntap | EndpointKind::Physical | EndpointKind::Vfio)
        | (NetInterworkingModel::None, _) => {
            endpoint.vm_dev_name = Some(endpoint.name.clone());
            Ok(())
        }
        (NetInterworkingModel::Macvtap, _) => {
            endpoint.vm_dev_name = Some(format!("macvtap{}_vc", index));
            Ok(())
        }
        (NetInterworkingModel::TcFilter, _) => {
            let tap = format!("tap{}_vc", index);
            let link = endpoint.name.clone();
            let tap_for_worker = tap.clone();
            run_in_netns(netns, move || {
                create_tap(&tap_for_worker)?;
                setup_tc_mirror(&link, &tap_for_worker)
            })?;
            endpoint.vm_dev_name = Some(tap);
            Ok(())
        }
    }
}

fn teardown_endpoint(netns: Option<&Path>, endpoint: &Endpoint) {
    if let Some(tap) = endpoint.vm_dev_name.clone() {
        if tap != endpoint.name {
            let result = run_in_netns(netns, move || {
                delete_link(&tap);
                Ok(())
            });
            if let Err(e) = result {
                tracing::warn!(endpoint = %endpoint.name, error = %e, "tap teardown failed");
            }
        }
    }
}

/// Create a persistent multi-queue tap device.
fn create_tap(name: &str) -> Result<()> {
    use std::os::fd::AsRawFd;

    let tun = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI | libc::IFF_VNET_HDR) as i16;

    let rc = unsafe { libc::ioctl(tun.as_raw_fd(), libc::TUNSETIFF, &ifr) };
    if rc < 0 {
        return Err(Error::Internal(format!(
            "TUNSETIFF {}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    let rc = unsafe { libc::ioctl(tun.as_raw_fd(), libc::TUNSETPERSIST, 1) };
    if rc < 0 {
        return Err(Error::Internal(format!(
            "TUNSETPERSIST {}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Mirror frames between the CNI link and the tap with TC ingress
/// filters, both directions.
fn setup_tc_mirror(link: &str, tap: &str) -> Result<()> {
    run_ip_tool("ip", &["link", "set", tap, "up"])?;
    run_ip_tool("tc", &["qdisc", "add", "dev", link, "ingress"])?;
    run_ip_tool(
        "tc",
        &[
            "filter", "add", "dev", link, "parent", "ffff:", "protocol", "all", "u32", "match",
            "u8", "0", "0", "action", "mirred", "egress", "redirect", "dev", tap,
        ],
    )?;
    run_ip_tool("tc", &["qdisc", "add", "dev", tap, "ingress"])?;
    run_ip_tool(
        "tc",
        &[
            "filter", "add", "dev", tap, "parent", "ffff:", "protocol", "all", "u32", "match",
            "u8", "0", "0", "action", "mirred", "egress", "redirect", "dev", link,
        ],
    )
}

fn delete_link(name: &str) {
    let _ = run_ip_tool("ip", &["link", "del", name]);
}

fn run_ip_tool(tool: &str, args: &[&str]) -> Result<()> {
    let status = std::process::Command::new(tool)
        .args(args)
        .status()
        .map_err(|e| Error::ProcessSpawn(format!("{}: {}", tool, e)))?;
    if !status.success() {
        return Err(Error::Internal(format!(
            "{} {} exited with {}",
            tool,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

/// HTB-based bandwidth caps, applied when the VMM has no built-in limiter.
async fn shape_endpoint(netns: Option<PathBuf>, device: String, limit: RateLimit) -> Result<()> {
    let rate = format!("{}bit", limit.tx_bps.max(limit.rx_bps));

    tokio::task::spawn_blocking(move || {
        run_in_netns(netns.as_deref(), move || {
            run_ip_tool(
                "tc",
                &["qdisc", "add", "dev", &device, "root", "handle", "1:", "htb", "default", "10"],
            )?;
            run_ip_tool(
                "tc",
                &[
                    "class", "add", "dev", &device, "parent", "1:", "classid", "1:10", "htb",
                    "rate", &rate,
                ],
            )
        })
    })
    .await
    .map_err(|e| Error::Internal(format!("shaping task: {}", e)))?
}

/// Enumerate and classify links from the namespace's sysfs view.
fn scan_links(known: &[String]) -> Result<Vec<Endpoint>> {
    let mut endpoints = Vec::new();
    let entries = match std::fs::read_dir("/sys/class/net") {
        Ok(entries) => entries,
        Err(e) => {
            return Err(Error::Internal(format!("enumerate links: {}", e)));
        }
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" || known.iter().any(|k| *k == name) {
            continue;
        }
        let link_dir = entry.path();

        let flags = parse_link_flags(&read_sysfs(&link_dir, "flags"));
        if flags & (libc::IFF_UP as u32) == 0 {
            // Unconfigured link, nothing to carry into the guest.
            continue;
        }
        if flags & (libc::IFF_LOOPBACK as u32) != 0 {
            continue;
        }

        let hw_addr = read_sysfs(&link_dir, "address").trim().to_string();
        let mtu = read_sysfs(&link_dir, "mtu").trim().parse().unwrap_or(1500);

        let mut endpoint = Endpoint::new(classify_link(&link_dir), &name, hw_addr);
        endpoint.properties = EndpointProperties {
            mtu,
            addresses: Vec::new(),
            flags,
        };
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

/// Classification from the sysfs link directory: physical functions carry
/// a `device` backlink, tun/tap expose `tun_flags`, macv* advertise a
/// DEVTYPE, and the remaining virtual links in a CNI netns are veth pairs.
fn classify_link(link_dir: &Path) -> EndpointKind {
    if link_dir.join("device").exists() {
        let driver = std::fs::read_link(link_dir.join("device/driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        if driver == "vfio-pci" {
            return EndpointKind::Vfio;
        }
        return EndpointKind::Physical;
    }

    let tun_flags = read_sysfs(link_dir, "tun_flags");
    if !tun_flags.trim().is_empty() {
        let flags = parse_link_flags(&tun_flags);
        if flags & (libc::IFF_TAP as u32) != 0 {
            return EndpointKind::Tap;
        }
        return EndpointKind::Tuntap;
    }

    match devtype_of(&read_sysfs(link_dir, "uevent")) {
        Some(devtype) if devtype == "macvtap" => EndpointKind::Macvtap,
        Some(devtype) if devtype == "macvlan" => EndpointKind::Macvlan,
        Some(devtype) if devtype == "ipvlan" => EndpointKind::Ipvlan,
        _ => EndpointKind::Veth,
    }
}

fn read_sysfs(dir: &Path, file: &str) -> String {
    std::fs::read_to_string(dir.join(file)).unwrap_or_default()
}

fn parse_link_flags(raw: &str) -> u32 {
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(raw, 16).unwrap_or(0)
}

fn devtype_of(uevent: &str) -> Option<String> {
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVTYPE=").map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHypervisor;
    use crate::hypervisor::VmmState;

    #[test]
    fn test_flag_parsing() {
        assert_eq!(parse_link_flags("0x1003\n"), 0x1003);
        assert_eq!(parse_link_flags("1003"), 0x1003);
        assert_eq!(parse_link_flags("junk"), 0);
        assert_ne!(parse_link_flags("0x1003") & libc::IFF_UP as u32, 0);
    }

    #[test]
    fn test_devtype_extraction() {
        let uevent = "INTERFACE=eth0\nIFINDEX=5\nDEVTYPE=macvtap\n";
        assert_eq!(devtype_of(uevent).as_deref(), Some("macvtap"));
        assert_eq!(devtype_of("INTERFACE=eth0\n"), None);
    }

    #[tokio::test]
    async fn test_add_remove_endpoints_through_hypervisor() {
        let mock = Arc::new(MockHypervisor::new());
        mock.set_state(VmmState::Running).await;
        let hypervisor: Arc<dyn Hypervisor> = mock.clone();

        let mut engine = NetworkEngine::new(None, NetInterworkingModel::None);
        engine
            .endpoints
            .push(Endpoint::new(EndpointKind::Veth, "eth0", "02:00:ca:fe:00:01"));

        engine.add_endpoints(&hypervisor, true).await.unwrap();
        assert_eq!(mock.hotplug_added().await.len(), 1);

        engine
            .remove_endpoints(Some(&hypervisor), true)
            .await
            .unwrap();
        assert_eq!(mock.hotplug_removed().await.len(), 1);
        assert!(engine.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_save_restore() {
        let mut engine = NetworkEngine::new(
            Some(PathBuf::from("/run/netns/cni-1")),
            NetInterworkingModel::TcFilter,
        );
        engine
            .endpoints
            .push(Endpoint::new(EndpointKind::Veth, "eth0", "02:00:ca:fe:00:01"));

        let state = engine.save();
        assert_eq!(state.netns_path.as_deref(), Some("/run/netns/cni-1"));
        assert_eq!(state.endpoints.len(), 1);

        let restored =
            NetworkEngine::restore(&state, NetInterworkingModel::TcFilter).unwrap();
        assert_eq!(restored.endpoints().len(), 1);
        assert_eq!(restored.endpoints()[0].name, "eth0");
    }
}
