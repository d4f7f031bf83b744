//! Error taxonomy for the vmcell runtime.
//!
//! One enum covers the whole core; every variant corresponds to a recovery
//! policy a caller can act on, not to the module that produced it.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected by a validator before any side effect happened.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Lookup miss in a store or registry.
    #[error("{0} not found")]
    NotFound(String),

    /// The resource still has live references; retryable after dropping them.
    #[error("{0} is still in use")]
    InUse(String),

    /// Operation not permitted in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A bounded wait expired. Partial state has been rolled back.
    #[error("timed out after {seconds}s: {what}")]
    Timeout { what: String, seconds: u64 },

    /// The VMM monitor connection failed or answered garbage.
    #[error("monitor transport: {0}")]
    MonitorTransport(String),

    /// Could not spawn or address a host process.
    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    /// The guest kernel or agent is gone. Fatal for the sandbox.
    #[error("guest panic: {0}")]
    GuestPanic(String),

    /// The selected hypervisor cannot do this on this platform.
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// Every matching bridge is fully populated.
    #[error("no free slot on any {0} bridge")]
    NoFreeSlot(String),

    /// The guest agent refused; carries the guest's message verbatim.
    #[error("agent: {0}")]
    AgentRpc(String),

    /// Persisted state failed to decode.
    #[error("persisted state corrupt: {0}")]
    Corrupt(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A teardown path finished best-effort but collected failures.
    #[error("cleanup finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Cleanup(Vec<String>),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Exit code contract for CLI callers (any concrete CLI may remap).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidState(_) => 2,
            Error::Timeout { .. } => 3,
            Error::GuestPanic(_) => 4,
            Error::Corrupt(_) => 5,
            _ => 1,
        }
    }

    /// True when retrying after releasing references can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::InUse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::InvalidState("x".into()).exit_code(), 2);
        assert_eq!(
            Error::Timeout {
                what: "vmm".into(),
                seconds: 1
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::GuestPanic("oops".into()).exit_code(), 4);
        assert_eq!(Error::Corrupt("bad json".into()).exit_code(), 5);
        assert_eq!(Error::NotFound("sandbox".into()).exit_code(), 1);
    }

    #[test]
    fn test_cleanup_message_aggregates() {
        let err = Error::Cleanup(vec!["unmount failed".into(), "kill failed".into()]);
        let msg = err.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("unmount failed"));
        assert!(msg.contains("kill failed"));
    }
}
