//! Atomic save/load of sandbox and container state.
//!
//! Saves go through write-to-temp plus rename so a crash never leaves a
//! half-written JSON file behind. Saves from the same process are
//! serialised by an internal mutex; stores are per-sandbox and never
//! shared across sandboxes.

pub mod state;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use vmcell_shared::{Error, Result};

pub use state::{ContainerState, SandboxState};

const SANDBOX_FILE: &str = "sandbox.json";
const CONTAINERS_DIR: &str = "containers";

/// Persistence handle for one sandbox.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Open a store rooted at the sandbox's state directory. No I/O happens
    /// until the first save.
    pub fn open(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True once a sandbox state file exists on disk.
    pub fn exists(&self) -> bool {
        self.dir.join(SANDBOX_FILE).exists()
    }

    pub fn save_sandbox(&self, state: &SandboxState) -> Result<()> {
        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.dir)?;
        atomic_write_json(&self.dir.join(SANDBOX_FILE), state)
    }

    pub fn save_container(&self, container_id: &str, state: &ContainerState) -> Result<()> {
        let _guard = self.write_lock.lock();
        let dir = self.dir.join(CONTAINERS_DIR);
        fs::create_dir_all(&dir)?;
        atomic_write_json(&dir.join(format!("{}.json", container_id)), state)
    }

    pub fn delete_container(&self, container_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self
            .dir
            .join(CONTAINERS_DIR)
            .join(format!("{}.json", container_id));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the sandbox state and all persisted container states.
    pub fn load(&self) -> Result<(SandboxState, HashMap<String, ContainerState>)> {
        let sandbox_path = self.dir.join(SANDBOX_FILE);
        let raw = match fs::read(&sandbox_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "sandbox state at {}",
                    sandbox_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let sandbox: SandboxState = serde_json::from_slice(&raw)
            .map_err(|e| Error::Corrupt(format!("{}: {}", sandbox_path.display(), e)))?;

        let mut containers = HashMap::new();
        let containers_dir = self.dir.join(CONTAINERS_DIR);
        if containers_dir.is_dir() {
            for entry in fs::read_dir(&containers_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = fs::read(&path)?;
                let state: ContainerState = serde_json::from_slice(&raw)
                    .map_err(|e| Error::Corrupt(format!("{}: {}", path.display(), e)))?;
                containers.insert(state.id.clone(), state);
            }
        }

        Ok((sandbox, containers))
    }

    /// Remove every trace of this sandbox's persisted state.
    pub fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Internal(format!("state serialisation: {}", e)))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::state::*;
    use super::*;
    use crate::types::{LifecycleState, ProcessSpec};
    use tempfile::tempdir;

    fn sample_state(id: &str) -> SandboxState {
        SandboxState {
            id: id.to_string(),
            state: LifecycleState::Ready,
            hypervisor: HypervisorState {
                kind: "qemu".into(),
                pid: Some(4242),
                uuid: "f2d4-77".into(),
                hotplugged_vcpus: vec![1, 2],
                hotplugged_memory_mib: 512,
                ..Default::default()
            },
            network: NetworkState {
                netns_path: Some("/run/netns/cni-1".into()),
                netns_created: false,
                endpoints: vec![EndpointState::Veth(EndpointCore {
                    name: "eth0".into(),
                    hw_addr: "02:00:ca:fe:00:01".into(),
                    mtu: 1500,
                    ..Default::default()
                })],
            },
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("sb1"));

        store.save_sandbox(&sample_state("sb1")).unwrap();
        store
            .save_container(
                "c1",
                &ContainerState {
                    id: "c1".into(),
                    state: LifecycleState::Running,
                    fs_type: Some("xfs".into()),
                    block_device_id: Some("drive-0".into()),
                    process: ProcessSpec::new(vec!["/bin/sh".into()]),
                },
            )
            .unwrap();

        let (sandbox, containers) = store.load().unwrap();
        assert_eq!(sandbox.id, "sb1");
        assert_eq!(sandbox.hypervisor.pid, Some(4242));
        assert_eq!(sandbox.network.endpoints.len(), 1);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers["c1"].fs_type.as_deref(), Some("xfs"));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("nope"));
        match store.load() {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_corrupt_state_detected() {
        let dir = tempdir().unwrap();
        let sb_dir = dir.path().join("sb1");
        fs::create_dir_all(&sb_dir).unwrap();
        fs::write(sb_dir.join(SANDBOX_FILE), b"{not json").unwrap();

        let store = StateStore::open(&sb_dir);
        match store.load() {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_endpoint_type_fails_load() {
        let dir = tempdir().unwrap();
        let sb_dir = dir.path().join("sb1");
        fs::create_dir_all(&sb_dir).unwrap();
        fs::write(
            sb_dir.join(SANDBOX_FILE),
            br#"{"id":"sb1","state":"ready","hypervisor":{"kind":"qemu"},
                 "network":{"endpoints":[{"type":"quantum","name":"x","hw_addr":""}]}}"#,
        )
        .unwrap();

        let store = StateStore::open(&sb_dir);
        assert!(matches!(store.load(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_save_is_atomic_no_tmp_left() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("sb1"));
        store.save_sandbox(&sample_state("sb1")).unwrap();
        store.save_sandbox(&sample_state("sb1")).unwrap();

        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("sb1"));
        store.save_sandbox(&sample_state("sb1")).unwrap();
        store.delete().unwrap();
        store.delete().unwrap();
        assert!(!store.exists());
    }
}
