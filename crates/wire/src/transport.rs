use std::path::Path;

use serde::{Deserialize, Serialize};

/// Directory holding IPC socket files.
pub const IPC_DIR: &str = "/tmp/schwarm";

/// Where a ZeroMQ socket binds or connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket named `/tmp/schwarm/<name>.sock`.
    /// Fastest option for workers on the coordinator's host.
    Ipc(String),

    /// TCP transport for workers on other machines.
    Tcp { host: String, port: u16 },
}

impl Transport {
    /// Create an IPC transport with the given socket name.
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    /// Create a TCP transport with the given host and port.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse a ZeroMQ endpoint such as `tcp://host:port` or
    /// `ipc:///tmp/schwarm/name.sock`.
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            let name = Path::new(path).file_stem()?.to_str()?;
            Some(Self::ipc(name))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':')?;
            Some(Self::tcp(host, port.parse().ok()?))
        } else {
            None
        }
    }

    /// Generate the ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc://{IPC_DIR}/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// True when the endpoint can only be served from this machine.
    pub fn is_local(&self) -> bool {
        match self {
            Self::Ipc(_) => true,
            Self::Tcp { host, .. } => {
                matches!(host.as_str(), "localhost" | "127.0.0.1" | "::1")
            }
        }
    }

    /// For IPC transports, ensure the parent directory exists.
    ///
    /// ZeroMQ requires the directory to exist before binding an IPC socket.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Self::Ipc(_) = self {
            std::fs::create_dir_all(IPC_DIR)?;
        }
        Ok(())
    }

    /// Remove a stale IPC socket file left over from a previous run.
    ///
    /// A worker that exits without cleanup leaves its `.sock` file behind,
    /// which makes the next bind fail with `EADDRINUSE`.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Self::Ipc(_) = self {
            let endpoint = self.endpoint();
            let path = endpoint.strip_prefix("ipc://").unwrap_or(&endpoint);
            match std::fs::remove_file(path) {
                Ok(()) => {
                    tracing::debug!(path, "removed stale IPC socket");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_endpoint() {
        let t = Transport::ipc("worker-1");
        assert_eq!(t.endpoint(), "ipc:///tmp/schwarm/worker-1.sock");
    }

    #[test]
    fn tcp_endpoint() {
        let t = Transport::tcp("127.0.0.1", 21000);
        assert_eq!(t.endpoint(), "tcp://127.0.0.1:21000");
        assert_eq!(t.to_string(), t.endpoint());
    }

    #[test]
    fn parse_endpoints() {
        assert_eq!(
            Transport::from_endpoint("tcp://10.0.0.2:21001"),
            Some(Transport::tcp("10.0.0.2", 21001))
        );
        assert_eq!(
            Transport::from_endpoint("ipc:///tmp/schwarm/fib.sock"),
            Some(Transport::ipc("fib"))
        );
        assert_eq!(Transport::from_endpoint("tcp://nohost"), None);
        assert_eq!(Transport::from_endpoint("udp://a:1"), None);
    }

    #[test]
    fn locality() {
        assert!(Transport::tcp("localhost", 1).is_local());
        assert!(Transport::tcp("127.0.0.1", 1).is_local());
        assert!(Transport::ipc("w").is_local());
        assert!(!Transport::tcp("compute-7", 1).is_local());
    }
}
