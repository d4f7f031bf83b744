//! Machine configuration validated before any VMM side effect.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::BlockDriver;
use vmcell_shared::{Error, Result};

/// Confidential-compute protection negotiated at `create_vm`. The kind
/// dictates which extra objects reach the VMM command line; any kind other
/// than `Disabled` forbids nvdimm and memory hot-plug.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    #[default]
    Disabled,
    Tdx,
    Sev,
    Snp,
    Cca,
    Se,
    Rme,
}

impl ProtectionKind {
    pub fn is_confidential(&self) -> bool {
        *self != ProtectionKind::Disabled
    }
}

impl fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtectionKind::Disabled => "disabled",
            ProtectionKind::Tdx => "tdx",
            ProtectionKind::Sev => "sev",
            ProtectionKind::Snp => "snp",
            ProtectionKind::Cca => "cca",
            ProtectionKind::Se => "se",
            ProtectionKind::Rme => "rme",
        };
        f.write_str(s)
    }
}

/// One guest kernel command-line parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParam {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl KernelParam {
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

impl fmt::Display for KernelParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.key, v),
            None => f.write_str(&self.key),
        }
    }
}

/// Join parameters into the guest command line. Later values override
/// earlier ones for the same key, so duplicates keep only the last
/// occurrence while preserving overall ordering.
pub fn join_kernel_params(params: &[KernelParam]) -> String {
    let mut kept: Vec<&KernelParam> = Vec::with_capacity(params.len());
    for param in params {
        kept.retain(|p| p.key != param.key);
        kept.push(param);
    }
    kept.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// VMM binary.
    pub vmm_path: PathBuf,
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    /// Rootfs image attached via nvdimm/pmem when permitted.
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub machine_type: String,

    pub default_vcpus: u32,
    #[serde(default)]
    pub default_max_vcpus: u32,
    pub default_memory_mib: u32,
    #[serde(default)]
    pub default_max_memory_mib: u32,
    #[serde(default)]
    pub memory_slots: u32,
    #[serde(default)]
    pub enable_virtio_mem: bool,
    #[serde(default)]
    pub use_nvdimm: bool,

    #[serde(default)]
    pub block_driver: BlockDriver,
    /// Export the shared directory over virtio-fs.
    #[serde(default)]
    pub shared_fs: bool,
    #[serde(default)]
    pub virtiofsd_path: Option<PathBuf>,

    #[serde(default)]
    pub kernel_params: Vec<KernelParam>,
    #[serde(default = "default_bridges")]
    pub default_bridges: u32,
    #[serde(default)]
    pub pcie_root_ports: u32,
    #[serde(default)]
    pub protection: ProtectionKind,
    /// Guest cid for vhost-vsock engines; hybrid-vsock engines ignore it.
    #[serde(default)]
    pub guest_cid: Option<u32>,
    /// Jailer binary for engines that chroot the VMM.
    #[serde(default)]
    pub jailer_path: Option<PathBuf>,
}

fn default_bridges() -> u32 {
    1
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            vmm_path: PathBuf::new(),
            kernel_path: PathBuf::new(),
            initrd_path: None,
            image_path: None,
            machine_type: String::new(),
            default_vcpus: 1,
            default_max_vcpus: 0,
            default_memory_mib: 2048,
            default_max_memory_mib: 0,
            memory_slots: 10,
            enable_virtio_mem: false,
            use_nvdimm: false,
            block_driver: BlockDriver::default(),
            shared_fs: false,
            virtiofsd_path: None,
            kernel_params: Vec::new(),
            default_bridges: 1,
            pcie_root_ports: 0,
            protection: ProtectionKind::Disabled,
            guest_cid: None,
            jailer_path: None,
        }
    }
}

impl HypervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vmm_path.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid("vmm path is empty".to_string()));
        }
        if self.kernel_path.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid("kernel path is empty".to_string()));
        }
        if self.default_vcpus == 0 {
            return Err(Error::ConfigInvalid(
                "at least one vcpu is required".to_string(),
            ));
        }
        if self.default_memory_mib == 0 {
            return Err(Error::ConfigInvalid("guest memory is zero".to_string()));
        }
        if self.default_max_vcpus != 0 && self.default_max_vcpus < self.default_vcpus {
            return Err(Error::ConfigInvalid(format!(
                "max vcpus {} below default {}",
                self.default_max_vcpus, self.default_vcpus
            )));
        }
        if self.shared_fs && self.virtiofsd_path.is_none() {
            return Err(Error::ConfigInvalid(
                "shared fs enabled without a virtiofsd path".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_vcpus(&self) -> u32 {
        if self.default_max_vcpus == 0 {
            self.default_vcpus
        } else {
            self.default_max_vcpus
        }
    }

    pub fn max_memory_mib(&self) -> u32 {
        if self.default_max_memory_mib == 0 {
            self.default_memory_mib
        } else {
            self.default_max_memory_mib
        }
    }

    /// nvdimm is force-disabled for confidential guests regardless of the
    /// caller's setting.
    pub fn nvdimm_enabled(&self) -> bool {
        self.use_nvdimm && !self.protection.is_confidential()
    }

    /// Memory hot-plug is unavailable under confidential protection.
    pub fn memory_hotplug_allowed(&self) -> bool {
        !self.protection.is_confidential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HypervisorConfig {
        HypervisorConfig {
            vmm_path: "/usr/bin/qemu-system-x86_64".into(),
            kernel_path: "/usr/share/vmcell/vmlinux".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validation() {
        assert!(valid_config().validate().is_ok());

        let mut cfg = valid_config();
        cfg.kernel_path = PathBuf::new();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.default_vcpus = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.shared_fs = true;
        assert!(cfg.validate().is_err());
        cfg.virtiofsd_path = Some("/usr/libexec/virtiofsd".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_kernel_param_join_later_overrides() {
        let params = vec![
            KernelParam::new("console", "hvc0"),
            KernelParam::flag("quiet"),
            KernelParam::new("root", "/dev/vda"),
            KernelParam::new("console", "ttyS0"),
        ];
        let joined = join_kernel_params(&params);
        assert_eq!(joined, "quiet root=/dev/vda console=ttyS0");
    }

    #[test]
    fn test_confidential_disables_nvdimm() {
        let mut cfg = valid_config();
        cfg.use_nvdimm = true;
        assert!(cfg.nvdimm_enabled());
        cfg.protection = ProtectionKind::Tdx;
        assert!(!cfg.nvdimm_enabled());
        assert!(!cfg.memory_hotplug_allowed());
    }
}
