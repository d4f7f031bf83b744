//! Process and namespace helpers.

use std::fs::File;

use nix::sys::signal::Signal;
use vmcell_shared::{Error, Result};

/// Send `signal` to `pid`, ignoring failures (the process may already be
/// gone, which is what the callers want anyway).
pub fn send_signal(pid: u32, signal: Signal) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
}

/// Check process existence with a null signal.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Make `command` execute inside the network namespace at `netns_path`.
///
/// The namespace file is opened in the parent; the child only calls
/// `setns(2)` between fork and exec, so no other thread of this process
/// ever observes the foreign namespace.
pub fn enter_netns_on_exec(command: &mut tokio::process::Command, netns_path: &str) -> Result<()> {
    let netns = File::open(netns_path)
        .map_err(|e| Error::ConfigInvalid(format!("netns {}: {}", netns_path, e)))?;
    unsafe {
        command.pre_exec(move || {
            nix::sched::setns(&netns, nix::sched::CloneFlags::CLONE_NEWNET)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }
    Ok(())
}

/// Random token for unique host-side mount names.
pub fn random_token() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_unlikely_pid_is_dead() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_token_shape() {
        let token = random_token();
        assert_eq!(token.len(), 16);
        assert_ne!(token, random_token());
    }
}
