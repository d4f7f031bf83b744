//! Watch+copy pipeline for kubelet projected volumes.
//!
//! The kubelet updates a configmap/secret/projected/downward-api volume by
//! writing a fresh `..YYYY_MM_DD_HH_MM_SS.<nnn>/` directory, atomically
//! repointing the `..data` symlink at it, then removing the previous
//! timestamped directory. Bind mounts freeze the old resolution inside the
//! guest, so the engine watches the live timestamped directory and, when
//! it disappears, streams the new content over the agent's `CopyFile`
//! operation — every regular file first, the `..data` symlink last so the
//! guest-visible paths flip atomically. Files that appear in an update get
//! user-visible symlinks created too; deletions are not propagated (the
//! agent has no unlink operation).
//!
//! A single event loop processes events serially. The source→destinations
//! map is mutex-guarded because container creation keeps appending to it
//! while the loop runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use futures::StreamExt;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::sync::{watch, Mutex};

use crate::agent::{copy_file_to_guest, Agent};
use vmcell_shared::{Error, Result};

const DATA_LINK: &str = "..data";

/// `..YYYY_MM_DD_HH_MM_SS.<nnn>` directories written by the kubelet.
pub fn is_timestamped_name(name: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"^\.\.\d{4}_\d{2}_\d{2}_\d{2}_\d{2}_\d{2}\.\d+$")
            .expect("timestamp regex")
    });
    re.is_match(name)
}

struct VolumeEntry {
    /// Guest directories this volume is projected into.
    guest_dirs: Vec<String>,
    /// Regular files (volume-relative) present in the last synced state.
    prev_files: HashSet<PathBuf>,
}

struct WatcherShared {
    agent: Arc<dyn Agent>,
    chunk_size: usize,
    volumes: Mutex<HashMap<PathBuf, VolumeEntry>>,
    watches: Mutex<Option<Watches>>,
    /// Watch on a timestamped dir → the volume dir owning it.
    wd_dirs: Mutex<HashMap<WatchDescriptor, PathBuf>>,
}

pub struct VolumeWatcher {
    shared: Arc<WatcherShared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VolumeWatcher {
    pub fn new(agent: Arc<dyn Agent>, chunk_size: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(WatcherShared {
                agent,
                chunk_size,
                volumes: Mutex::new(HashMap::new()),
                watches: Mutex::new(None),
                wd_dirs: Mutex::new(HashMap::new()),
            }),
            shutdown_tx,
            shutdown_rx,
            task: Mutex::new(None),
        }
    }

    /// Spin up the event loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.try_lock().map_err(|_| {
            Error::Internal("watcher started concurrently".to_string())
        })?;
        if task.is_some() {
            return Ok(());
        }

        let inotify = Inotify::init()
            .map_err(|e| Error::Internal(format!("inotify init: {}", e)))?;
        *self.shared.watches.try_lock().expect("no contention before start") =
            Some(inotify.watches());
        let events = inotify
            .into_event_stream([0u8; 4096])
            .map_err(|e| Error::Internal(format!("inotify stream: {}", e)))?;

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_rx.clone();
        *task = Some(tokio::spawn(run_loop(shared, events, shutdown_rx)));
        Ok(())
    }

    /// Register one more guest destination for a volume directory.
    pub async fn add_volume(&self, volume_dir: &Path, guest_dir: &str) -> Result<()> {
        let mut volumes = self.shared.volumes.lock().await;
        if let Some(entry) = volumes.get_mut(volume_dir) {
            if !entry.guest_dirs.iter().any(|d| d == guest_dir) {
                entry.guest_dirs.push(guest_dir.to_string());
            }
            return Ok(());
        }

        let data_dir = resolve_data_dir(volume_dir)?;
        let prev_files = list_regular_files(&data_dir)?;
        self.shared.watch_timestamped(&data_dir, volume_dir).await?;
        volumes.insert(
            volume_dir.to_path_buf(),
            VolumeEntry {
                guest_dirs: vec![guest_dir.to_string()],
                prev_files,
            },
        );
        tracing::debug!(
            volume = %volume_dir.display(),
            guest_dir,
            "watching projected volume"
        );
        Ok(())
    }

    /// Drop one guest destination; the volume stops being watched when the
    /// last one goes.
    pub async fn remove_volume(&self, volume_dir: &Path, guest_dir: &str) {
        let mut volumes = self.shared.volumes.lock().await;
        let empty = match volumes.get_mut(volume_dir) {
            Some(entry) => {
                entry.guest_dirs.retain(|d| d != guest_dir);
                entry.guest_dirs.is_empty()
            }
            None => return,
        };
        if empty {
            volumes.remove(volume_dir);
            self.shared.unwatch_volume(volume_dir).await;
        }
    }

    /// Stop the event loop. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.shared.watches.lock().await = None;
    }
}

impl WatcherShared {
    async fn watch_timestamped(&self, data_dir: &Path, volume_dir: &Path) -> Result<()> {
        let mut watches = self.watches.lock().await;
        let watches = watches.as_mut().ok_or_else(|| {
            Error::InvalidState("volume watcher is not running".to_string())
        })?;
        let wd = watches
            .add(data_dir, WatchMask::DELETE_SELF | WatchMask::MOVE_SELF)
            .map_err(|e| Error::Internal(format!("watch {}: {}", data_dir.display(), e)))?;
        self.wd_dirs.lock().await.insert(wd, volume_dir.to_path_buf());
        Ok(())
    }

    async fn unwatch_volume(&self, volume_dir: &Path) {
        let mut wd_dirs = self.wd_dirs.lock().await;
        let stale: Vec<WatchDescriptor> = wd_dirs
            .iter()
            .filter(|(_, dir)| dir.as_path() == volume_dir)
            .map(|(wd, _)| wd.clone())
            .collect();
        for wd in stale {
            wd_dirs.remove(&wd);
            if let Some(watches) = self.watches.lock().await.as_mut() {
                let _ = watches.remove(wd);
            }
        }
    }

    /// One update cycle for a volume whose timestamped dir just vanished.
    async fn sync_volume(&self, volume_dir: &Path) -> Result<()> {
        let data_dir = match resolve_data_dir(volume_dir) {
            Ok(dir) => dir,
            Err(_) => {
                // The whole volume went away with its pod; drop it.
                self.volumes.lock().await.remove(volume_dir);
                return Ok(());
            }
        };
        let ts_name = data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let new_files = list_regular_files(&data_dir)?;

        let (guest_dirs, prev_files) = {
            let volumes = self.volumes.lock().await;
            match volumes.get(volume_dir) {
                Some(entry) => (entry.guest_dirs.clone(), entry.prev_files.clone()),
                None => return Ok(()),
            }
        };

        for guest_dir in &guest_dirs {
            // Regular files into the guest-side timestamped directory.
            for rel in &new_files {
                let host = data_dir.join(rel);
                let guest = format!("{}/{}/{}", guest_dir, ts_name, rel.display());
                copy_file_to_guest(self.agent.as_ref(), &host, &guest, self.chunk_size).await?;
            }

            // Brand-new keys also need their user-visible symlink; there is
            // no unlink operation, so removals stay behind in the guest.
            for rel in new_files.difference(&prev_files) {
                let host_link = volume_dir.join(rel);
                if host_link.is_symlink() {
                    let guest = format!("{}/{}", guest_dir, rel.display());
                    copy_file_to_guest(self.agent.as_ref(), &host_link, &guest, self.chunk_size)
                        .await?;
                }
            }

            // ..data last: the guest-visible flip is atomic.
            let guest_data = format!("{}/{}", guest_dir, DATA_LINK);
            copy_file_to_guest(
                self.agent.as_ref(),
                &volume_dir.join(DATA_LINK),
                &guest_data,
                self.chunk_size,
            )
            .await?;
        }

        {
            let mut volumes = self.volumes.lock().await;
            if let Some(entry) = volumes.get_mut(volume_dir) {
                entry.prev_files = new_files;
            }
        }

        self.watch_timestamped(&data_dir, volume_dir).await?;
        tracing::debug!(
            volume = %volume_dir.display(),
            timestamp = %ts_name,
            "projected volume synchronised"
        );
        Ok(())
    }
}

async fn run_loop(
    shared: Arc<WatcherShared>,
    mut events: inotify::EventStream<[u8; 4096]>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        if !event
                            .mask
                            .intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF)
                        {
                            continue;
                        }
                        let volume_dir = shared.wd_dirs.lock().await.remove(&event.wd);
                        if let Some(volume_dir) = volume_dir {
                            if let Err(e) = shared.sync_volume(&volume_dir).await {
                                tracing::warn!(
                                    volume = %volume_dir.display(),
                                    error = %e,
                                    "projected volume sync failed"
                                );
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "volume watcher event error");
                    }
                    None => break,
                }
            }
        }
    }
}

/// Follow `..data` to the current timestamped directory.
fn resolve_data_dir(volume_dir: &Path) -> Result<PathBuf> {
    let target = std::fs::read_link(volume_dir.join(DATA_LINK))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !is_timestamped_name(&name) {
        return Err(Error::Internal(format!(
            "{} does not point at a timestamped directory",
            volume_dir.join(DATA_LINK).display()
        )));
    }
    Ok(volume_dir.join(target))
}

fn list_regular_files(dir: &Path) -> Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::Internal(format!("walk {}: {}", dir.display(), e)))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .expect("walkdir stays under its root")
                .to_path_buf();
            files.insert(rel);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use std::time::Duration;

    const TS1: &str = "..2026_07_01_10_00_00.100";
    const TS2: &str = "..2026_07_01_10_05_00.200";

    fn make_volume(dir: &Path, ts: &str, files: &[(&str, &str)]) {
        let ts_dir = dir.join(ts);
        std::fs::create_dir_all(&ts_dir).unwrap();
        for (name, content) in files {
            std::fs::write(ts_dir.join(name), content).unwrap();
        }
        let tmp = dir.join("..data_tmp");
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(ts, &tmp).unwrap();
        std::fs::rename(&tmp, dir.join(DATA_LINK)).unwrap();
        for (name, _) in files {
            let link = dir.join(name);
            if !link.exists() {
                std::os::unix::fs::symlink(format!("{}/{}", DATA_LINK, name), link).unwrap();
            }
        }
    }

    #[test]
    fn test_timestamped_name_matching() {
        assert!(is_timestamped_name("..2026_07_01_10_00_00.100"));
        assert!(is_timestamped_name("..1999_12_31_23_59_59.1"));
        assert!(!is_timestamped_name("..data"));
        assert!(!is_timestamped_name("config.yaml"));
        assert!(!is_timestamped_name("..2026_07_01_10_00_00"));
        assert!(!is_timestamped_name("..2026-07-01_10_00_00.1"));
    }

    #[tokio::test]
    async fn test_atomic_update_reaches_guest() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("config");
        std::fs::create_dir_all(&volume).unwrap();
        make_volume(&volume, TS1, &[("A", "v1")]);

        let agent = Arc::new(MockAgent::new());
        let watcher = VolumeWatcher::new(agent.clone(), 4096);
        watcher.start().unwrap();
        watcher
            .add_volume(&volume, "/run/vmcell/shared/containers/c1-tok-config")
            .await
            .unwrap();

        // Kubelet-style atomic update: new timestamp dir, repointed
        // ..data, old timestamp removed.
        make_volume(&volume, TS2, &[("A", "v2"), ("B", "fresh")]);
        std::fs::remove_dir_all(volume.join(TS1)).unwrap();

        // One watcher turnaround.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let copies = agent.copied_files().await;
            let has_data_link = copies.iter().any(|c| c.path.ends_with("/..data"));
            if has_data_link {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "watcher never synchronised the update"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let copies = agent.copied_files().await;
        let a_idx = copies
            .iter()
            .position(|c| c.path.ends_with(&format!("{}/A", TS2)))
            .expect("A copied into the new timestamped dir");
        assert_eq!(copies[a_idx].data, b"v2".to_vec());

        // The fresh key got its user-visible symlink.
        assert!(copies
            .iter()
            .any(|c| c.path.ends_with("c1-tok-config/B")
                && c.data == format!("{}/B", DATA_LINK).into_bytes()));

        // ..data flips last.
        let data_idx = copies
            .iter()
            .position(|c| c.path.ends_with("/..data"))
            .unwrap();
        assert!(data_idx > a_idx);
        assert_eq!(copies[data_idx].data, TS2.as_bytes().to_vec());

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_update_follows_first() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("secret");
        std::fs::create_dir_all(&volume).unwrap();
        make_volume(&volume, TS1, &[("token", "t1")]);

        let agent = Arc::new(MockAgent::new());
        let watcher = VolumeWatcher::new(agent.clone(), 4096);
        watcher.start().unwrap();
        watcher.add_volume(&volume, "/guest/secret").await.unwrap();

        make_volume(&volume, TS2, &[("token", "t2")]);
        std::fs::remove_dir_all(volume.join(TS1)).unwrap();
        wait_for_copy(&agent, "t2").await;

        let ts3 = "..2026_07_01_11_00_00.300";
        make_volume(&volume, ts3, &[("token", "t3")]);
        std::fs::remove_dir_all(volume.join(TS2)).unwrap();
        wait_for_copy(&agent, "t3").await;

        watcher.shutdown().await;
    }

    async fn wait_for_copy(agent: &Arc<MockAgent>, content: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let copies = agent.copied_files().await;
            if copies.iter().any(|c| c.data == content.as_bytes()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "copy of {:?} never arrived",
                content
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
