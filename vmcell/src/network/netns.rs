//! Entering the sandbox's network namespace.
//!
//! `setns(CLONE_NEWNET)` retargets the calling OS thread, so the closure
//! always runs on a dedicated thread that dies afterwards. The async
//! executor's workers never see the foreign namespace.

use std::fs::File;
use std::path::Path;

use nix::sched::{setns, CloneFlags};

use vmcell_shared::{Error, Result};

pub fn run_in_netns<T, F>(netns_path: Option<&Path>, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let path = match netns_path {
        None => return f(),
        Some(path) => path.to_path_buf(),
    };

    let netns = File::open(&path)
        .map_err(|e| Error::ConfigInvalid(format!("netns {}: {}", path.display(), e)))?;

    let handle = std::thread::Builder::new()
        .name("vmcell-netns".to_string())
        .spawn(move || -> Result<T> {
            setns(&netns, CloneFlags::CLONE_NEWNET).map_err(|e| {
                Error::Internal(format!("setns {}: {}", path.display(), e))
            })?;
            f()
        })
        .map_err(|e| Error::Internal(format!("spawn netns worker: {}", e)))?;

    handle
        .join()
        .map_err(|_| Error::Internal("netns worker panicked".to_string()))?
}
