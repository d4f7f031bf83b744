//! QEMU command-line assembly.
//!
//! The builder translates a validated [`HypervisorConfig`] plus the queued
//! cold-plug devices into argv. Ordering constraints that matter:
//! confidential-compute objects must precede the machine option that
//! references them, and kernel parameters are joined so that later values
//! override earlier ones.

use std::path::Path;

use crate::device::{BlockDriver, DeviceConfig};
use crate::hypervisor::config::{join_kernel_params, HypervisorConfig, ProtectionKind};
use vmcell_shared::{Error, Result};

pub struct QemuCmdLine<'a> {
    id: &'a str,
    uuid: &'a str,
    config: &'a HypervisorConfig,
    args: Vec<String>,
}

impl<'a> QemuCmdLine<'a> {
    pub fn new(id: &'a str, uuid: &'a str, config: &'a HypervisorConfig) -> Self {
        Self {
            id,
            uuid,
            config,
            args: Vec::new(),
        }
    }

    pub fn build(
        mut self,
        qmp_socket: &Path,
        console_socket: &Path,
        virtiofsd_socket: Option<&Path>,
        devices: &[DeviceConfig],
    ) -> Result<Vec<String>> {
        self.push_base(qmp_socket, console_socket);
        self.push_machine()?;
        self.push_memory_and_cpus();
        self.push_boot();
        self.push_bridges();
        self.push_vsock();
        if let Some(sock) = virtiofsd_socket {
            self.push_virtiofs(sock);
        }
        for device in devices {
            self.push_device(device)?;
        }
        Ok(self.args)
    }

    fn arg(&mut self, flag: &str, value: String) {
        self.args.push(flag.to_string());
        self.args.push(value);
    }

    fn flag(&mut self, flag: &str) {
        self.args.push(flag.to_string());
    }

    fn push_base(&mut self, qmp_socket: &Path, console_socket: &Path) {
        self.arg("-name", format!("sandbox-{}", self.id));
        self.arg("-uuid", self.uuid.to_string());
        self.flag("-nodefaults");
        self.flag("-no-user-config");
        self.arg("-display", "none".to_string());
        self.arg("-vga", "none".to_string());
        self.arg(
            "-qmp",
            format!("unix:{},server=on,wait=off", qmp_socket.display()),
        );
        self.arg(
            "-chardev",
            format!(
                "socket,id=charconsole0,path={},server=on,wait=off",
                console_socket.display()
            ),
        );
        self.arg("-device", "virtio-serial-pci,id=serial0".to_string());
        self.arg(
            "-device",
            "virtconsole,chardev=charconsole0,id=console0".to_string(),
        );
    }

    fn push_machine(&mut self) -> Result<()> {
        let machine_type = if self.config.machine_type.is_empty() {
            "q35"
        } else {
            &self.config.machine_type
        };
        let mut machine = format!("{},accel=kvm", machine_type);
        if self.config.nvdimm_enabled() {
            machine.push_str(",nvdimm=on");
        }

        // Protection objects come before the -machine option that names them.
        match self.config.protection {
            ProtectionKind::Disabled => {}
            ProtectionKind::Tdx => {
                self.arg("-object", "tdx-guest,id=tdx0".to_string());
                machine.push_str(",confidential-guest-support=tdx0");
            }
            ProtectionKind::Sev => {
                self.arg(
                    "-object",
                    "sev-guest,id=sev0,cbitpos=51,reduced-phys-bits=1".to_string(),
                );
                machine.push_str(",confidential-guest-support=sev0");
            }
            ProtectionKind::Snp => {
                self.arg(
                    "-object",
                    "sev-snp-guest,id=snp0,cbitpos=51,reduced-phys-bits=1".to_string(),
                );
                machine.push_str(",confidential-guest-support=snp0");
            }
            ProtectionKind::Cca | ProtectionKind::Rme => {
                self.arg("-object", "rme-guest,id=rme0".to_string());
                machine.push_str(",confidential-guest-support=rme0");
            }
            ProtectionKind::Se => {
                if !machine_type.starts_with("s390") {
                    return Err(Error::ConfigInvalid(format!(
                        "secure execution requires an s390 machine type, got {:?}",
                        machine_type
                    )));
                }
                self.arg("-object", "s390-pv-guest,id=pv0".to_string());
                machine.push_str(",confidential-guest-support=pv0");
            }
        }

        self.arg("-machine", machine);
        self.arg("-cpu", "host".to_string());
        Ok(())
    }

    fn push_memory_and_cpus(&mut self) {
        let memory = self.config.default_memory_mib;
        let max_memory = self.config.max_memory_mib();
        if self.config.memory_hotplug_allowed() && max_memory > memory {
            self.arg(
                "-m",
                format!(
                    "{}M,slots={},maxmem={}M",
                    memory, self.config.memory_slots, max_memory
                ),
            );
        } else {
            self.arg("-m", format!("{}M", memory));
        }

        // vhost-user backends (virtiofs) need shareable guest memory.
        if self.config.shared_fs {
            self.arg(
                "-object",
                format!("memory-backend-memfd,id=dimm1,share=on,size={}M", memory),
            );
            self.arg("-numa", "node,memdev=dimm1".to_string());
        }

        self.arg(
            "-smp",
            format!(
                "{},maxcpus={}",
                self.config.default_vcpus,
                self.config.max_vcpus()
            ),
        );

        if self.config.enable_virtio_mem && self.config.memory_hotplug_allowed() {
            let size = max_memory.saturating_sub(memory).max(1);
            self.arg(
                "-object",
                format!("memory-backend-ram,id=vmem0,size={}M", size),
            );
            self.arg(
                "-device",
                "virtio-mem-pci,id=virtiomem0,memdev=vmem0,requested-size=0".to_string(),
            );
        }
    }

    fn push_boot(&mut self) {
        self.arg("-kernel", self.config.kernel_path.display().to_string());
        if let Some(ref initrd) = self.config.initrd_path {
            self.arg("-initrd", initrd.display().to_string());
        }
        if let Some(ref image) = self.config.image_path {
            if self.config.nvdimm_enabled() {
                self.arg(
                    "-object",
                    format!(
                        "memory-backend-file,id=mem-rootfs,share=on,mem-path={},size=0",
                        image.display()
                    ),
                );
                self.arg(
                    "-device",
                    "nvdimm,id=nv0,memdev=mem-rootfs,unarmed=on".to_string(),
                );
            } else {
                self.arg(
                    "-blockdev",
                    format!(
                        "driver=raw,node-name=image0,file.driver=file,file.filename={},read-only=on",
                        image.display()
                    ),
                );
                self.arg("-device", "virtio-blk-pci,drive=image0".to_string());
            }
        }
        let params = join_kernel_params(&self.config.kernel_params);
        if !params.is_empty() {
            self.arg("-append", params);
        }
    }

    fn push_bridges(&mut self) {
        for i in 0..self.config.default_bridges {
            self.arg(
                "-device",
                format!(
                    "pci-bridge,bus=pcie.0,id=pci-bridge-{},chassis_nr={},addr={:#04x}",
                    i,
                    i + 1,
                    2 + i
                ),
            );
        }
        for i in 0..self.config.pcie_root_ports {
            self.arg(
                "-device",
                format!("pcie-root-port,id=rp{},bus=pcie.0", i),
            );
        }
    }

    fn push_vsock(&mut self) {
        let cid = self.config.guest_cid.unwrap_or(3);
        self.arg(
            "-device",
            format!("vhost-vsock-pci,id=vsock0,guest-cid={}", cid),
        );
    }

    fn push_virtiofs(&mut self, socket: &Path) {
        self.arg(
            "-chardev",
            format!("socket,id=charvirtiofs0,path={}", socket.display()),
        );
        self.arg(
            "-device",
            "vhost-user-fs-pci,chardev=charvirtiofs0,tag=shared,queue-size=1024".to_string(),
        );
    }

    fn push_device(&mut self, device: &DeviceConfig) -> Result<()> {
        match device {
            DeviceConfig::Block(block) => {
                self.arg(
                    "-blockdev",
                    format!(
                        "driver=raw,node-name={},file.driver=file,file.filename={}{}",
                        block.id,
                        block.path_on_host.display(),
                        if block.read_only { ",read-only=on" } else { "" }
                    ),
                );
                let frontend = match block.driver {
                    BlockDriver::VirtioBlock => "virtio-blk-pci",
                    BlockDriver::VirtioBlockCcw => "virtio-blk-ccw",
                    BlockDriver::VirtioMmio => "virtio-blk-device",
                    BlockDriver::VirtioScsi => "scsi-hd",
                };
                self.arg(
                    "-device",
                    format!("{},drive={},id=frontend-{}", frontend, block.id, block.id),
                );
            }
            DeviceConfig::Vfio(vfio) => {
                self.arg("-device", format!("vfio-pci,host={},id={}", vfio.bdf, vfio.id));
            }
            DeviceConfig::VhostUser(vu) => {
                self.arg(
                    "-chardev",
                    format!("socket,id=char-{},path={}", vu.id, vu.socket_path.display()),
                );
                self.arg(
                    "-device",
                    format!("vhost-user-blk-pci,chardev=char-{},id={}", vu.id, vu.id),
                );
            }
            DeviceConfig::Network(net) => {
                self.arg(
                    "-netdev",
                    format!("tap,id=net-{},ifname={}", net.id, net.host_dev_name),
                );
                self.arg(
                    "-device",
                    format!(
                        "virtio-net-pci,netdev=net-{},mac={},id={}",
                        net.id, net.guest_mac, net.id
                    ),
                );
            }
            DeviceConfig::ShareFs(fs) => {
                self.arg(
                    "-chardev",
                    format!("socket,id=char-{},path={}", fs.tag, fs.socket_path.display()),
                );
                self.arg(
                    "-device",
                    format!(
                        "vhost-user-fs-pci,chardev=char-{},tag={}",
                        fs.tag, fs.tag
                    ),
                );
            }
            DeviceConfig::Vsock(_) => {
                // The default vsock device is always present; extra vsock
                // devices are not a QEMU cold-plug concern.
            }
            DeviceConfig::Generic(_) => {
                // Realised inside the guest by the agent, nothing on the
                // VMM command line.
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::config::KernelParam;
    use std::path::PathBuf;

    fn config() -> HypervisorConfig {
        HypervisorConfig {
            vmm_path: "/usr/bin/qemu-system-x86_64".into(),
            kernel_path: "/usr/share/vmcell/vmlinux".into(),
            kernel_params: vec![
                KernelParam::new("console", "hvc0"),
                KernelParam::new("console", "ttyS0"),
            ],
            ..Default::default()
        }
    }

    fn build(cfg: &HypervisorConfig) -> Vec<String> {
        QemuCmdLine::new("sb1", "uuid-1", cfg)
            .build(
                &PathBuf::from("/run/q.sock"),
                &PathBuf::from("/run/c.sock"),
                None,
                &[],
            )
            .unwrap()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_append_uses_last_override() {
        let args = build(&config());
        assert_eq!(value_after(&args, "-append"), Some("console=ttyS0"));
    }

    #[test]
    fn test_confidential_guest_forbids_nvdimm() {
        let mut cfg = config();
        cfg.use_nvdimm = true;
        cfg.image_path = Some("/usr/share/vmcell/rootfs.img".into());
        cfg.protection = ProtectionKind::Tdx;

        let args = build(&cfg);
        let machine = value_after(&args, "-machine").unwrap();
        assert!(machine.contains("confidential-guest-support=tdx0"));
        assert!(!machine.contains("nvdimm=on"));
        assert!(!args.iter().any(|a| a.starts_with("nvdimm")));
        // Object precedes the machine option referencing it.
        let obj_pos = args.iter().position(|a| a == "tdx-guest,id=tdx0").unwrap();
        let machine_pos = args.iter().position(|a| a == "-machine").unwrap();
        assert!(obj_pos < machine_pos);
    }

    #[test]
    fn test_nvdimm_image_when_permitted() {
        let mut cfg = config();
        cfg.use_nvdimm = true;
        cfg.image_path = Some("/usr/share/vmcell/rootfs.img".into());
        let args = build(&cfg);
        assert!(args.iter().any(|a| a.starts_with("nvdimm,id=nv0")));
        assert!(value_after(&args, "-machine").unwrap().contains("nvdimm=on"));
    }

    #[test]
    fn test_se_requires_s390_machine() {
        let mut cfg = config();
        cfg.protection = ProtectionKind::Se;
        let err = QemuCmdLine::new("sb1", "u", &cfg)
            .build(
                &PathBuf::from("/run/q.sock"),
                &PathBuf::from("/run/c.sock"),
                None,
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));

        cfg.machine_type = "s390-ccw-virtio".to_string();
        let args = QemuCmdLine::new("sb1", "u", &cfg)
            .build(
                &PathBuf::from("/run/q.sock"),
                &PathBuf::from("/run/c.sock"),
                None,
                &[],
            )
            .unwrap();
        assert!(args.iter().any(|a| a.starts_with("s390-pv-guest")));
    }

    #[test]
    fn test_cold_plugged_block_device() {
        let cfg = config();
        let devices = vec![DeviceConfig::Block(crate::device::BlockConfig {
            id: "drive-0".into(),
            path_on_host: "/dev/loop0".into(),
            read_only: true,
            ..Default::default()
        })];
        let args = QemuCmdLine::new("sb1", "u", &cfg)
            .build(
                &PathBuf::from("/run/q.sock"),
                &PathBuf::from("/run/c.sock"),
                None,
                &devices,
            )
            .unwrap();
        assert!(args
            .iter()
            .any(|a| a.contains("node-name=drive-0") && a.contains("read-only=on")));
        assert!(args.iter().any(|a| a.contains("virtio-blk-pci,drive=drive-0")));
    }

    #[test]
    fn test_memory_hotplug_slots_present_only_with_headroom() {
        let mut cfg = config();
        cfg.default_max_memory_mib = 4096;
        let args = build(&cfg);
        assert!(value_after(&args, "-m").unwrap().contains("slots="));

        cfg.default_max_memory_mib = 0;
        let args = build(&cfg);
        assert!(!value_after(&args, "-m").unwrap().contains("slots="));
    }
}
