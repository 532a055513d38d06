//! Rendezvous addresses (`--dist-url`).

use std::fmt;
use std::net::TcpListener;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{LaunchError, LaunchResult};

/// Where distributed workers meet to form a process group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistUrl {
    /// Pick a free port on localhost (single machine only).
    Auto,
    Tcp { host: String, port: u16 },
    /// Shared-filesystem rendezvous; unreliable across machines.
    File(PathBuf),
    /// Read `MASTER_ADDR`/`MASTER_PORT` from the environment.
    Env,
}

impl DistUrl {
    pub fn loopback(port: u16) -> Self {
        DistUrl::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, DistUrl::File(_))
    }

    /// `MASTER_ADDR`/`MASTER_PORT` as a tcp address.
    pub fn from_env() -> LaunchResult<Self> {
        let invalid = |reason: String| LaunchError::InvalidDistUrl {
            url: "env://".to_string(),
            reason,
        };
        let host =
            std::env::var("MASTER_ADDR").map_err(|_| invalid("MASTER_ADDR is not set".into()))?;
        let port =
            std::env::var("MASTER_PORT").map_err(|_| invalid("MASTER_PORT is not set".into()))?;
        let port = port
            .trim()
            .parse()
            .map_err(|e| invalid(format!("MASTER_PORT {port:?}: {e}")))?;
        Ok(DistUrl::Tcp { host, port })
    }
}

impl FromStr for DistUrl {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| LaunchError::InvalidDistUrl {
            url: s.to_string(),
            reason: reason.to_string(),
        };
        let s = s.trim();
        if s == "auto" {
            return Ok(DistUrl::Auto);
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| invalid("expected tcp://host:port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            let port = port.parse().map_err(|_| invalid("port is not a number"))?;
            return Ok(DistUrl::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid("missing path"));
            }
            return Ok(DistUrl::File(PathBuf::from(path)));
        }
        if s == "env://" {
            return Ok(DistUrl::Env);
        }
        Err(invalid("expected auto, tcp://, file:// or env://"))
    }
}

impl fmt::Display for DistUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistUrl::Auto => write!(f, "auto"),
            DistUrl::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            DistUrl::File(path) => write!(f, "file://{}", path.display()),
            DistUrl::Env => write!(f, "env://"),
        }
    }
}

/// Find an unused local port.
///
/// The port is released before returning, so another process may take it
/// before the workers bind it.
pub fn find_free_port() -> LaunchResult<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(LaunchError::NoFreePort)?;
    let port = listener
        .local_addr()
        .map_err(LaunchError::NoFreePort)?
        .port();
    Ok(port)
}
