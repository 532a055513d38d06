use std::time::Duration;
use thiserror::Error;

pub type LaunchResult<T> = Result<T, LaunchError>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("dist_url=auto not supported in multi-machine jobs ({num_machines} machines)")]
    AutoUrlMultiMachine { num_machines: usize },
    #[error("world size is zero; need at least one process on one machine")]
    EmptyWorld,
    #[error("a distributed job with world size {world_size} needs a dist_url")]
    MissingDistUrl { world_size: usize },
    #[error("invalid dist_url {url:?}: {reason}")]
    InvalidDistUrl { url: String, reason: String },
    #[error("{what} rank {rank} out of range for {size}")]
    RankOutOfRange {
        what: &'static str,
        rank: usize,
        size: usize,
    },
    #[error("no free local port available: {0}")]
    NoFreePort(#[source] std::io::Error),
    #[error("rendezvous at {url} timed out after {timeout:?}")]
    RendezvousTimeout { url: String, timeout: Duration },
    #[error("rendezvous failed: {0}")]
    Rendezvous(String),
    #[error("process group already initialised in this process")]
    AlreadyInitialized,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn worker for local rank {local_rank}: {source}")]
    Spawn {
        local_rank: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("worker pid {pid} exited with {status}")]
    WorkerFailed { pid: u32, status: String },
}

impl LaunchError {
    /// Invalid launch parameters, detected before anything is spawned.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LaunchError::AutoUrlMultiMachine { .. }
                | LaunchError::EmptyWorld
                | LaunchError::MissingDistUrl { .. }
                | LaunchError::InvalidDistUrl { .. }
                | LaunchError::RankOutOfRange { .. }
        )
    }

    /// Missing local resources (ports).
    pub fn is_resource(&self) -> bool {
        matches!(self, LaunchError::NoFreePort(_))
    }

    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| LaunchError::Io { context, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_exhaustion_is_a_resource_error() {
        let err = LaunchError::NoFreePort(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no ephemeral ports left",
        ));
        assert!(err.is_resource());
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("no ephemeral ports left"));
    }

    #[test]
    fn launch_parameter_errors_are_not_resource_errors() {
        let err = LaunchError::MissingDistUrl { world_size: 4 };
        assert!(err.is_configuration());
        assert!(!err.is_resource());
    }
}
