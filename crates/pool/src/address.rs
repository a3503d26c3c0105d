//! Worker addresses of the form `scheme:name@host:port`.
//!
//! `tcp:worker@compute-3:21000` names the object `worker` served over TCP on
//! `compute-3:21000`. With the `ipc` scheme the name alone selects the socket
//! file: the host must be local and host/port do not take part in the
//! identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use schwarm_wire::Transport;

use crate::error::PoolError;

/// Identity of a registered worker: its canonical address string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&WorkerAddress> for WorkerId {
    fn from(address: &WorkerAddress) -> Self {
        match address.scheme {
            Scheme::Tcp => Self(address.to_string()),
            Scheme::Ipc => Self(format!("ipc:{}@localhost:0", address.name)),
        }
    }
}

impl FromStr for WorkerId {
    type Err = PoolError;

    /// Normalizes through [`WorkerAddress`] so equal addresses give equal ids.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(&s.parse::<WorkerAddress>()?))
    }
}

/// How the coordinator reaches a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Tcp,
    Ipc,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Ipc => f.write_str("ipc"),
        }
    }
}

/// A parsed `scheme:name@host:port` worker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerAddress {
    pub scheme: Scheme,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl WorkerAddress {
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn id(&self) -> WorkerId {
        WorkerId::from(self)
    }

    /// The socket endpoint the worker binds.
    pub fn transport(&self) -> Transport {
        match self.scheme {
            Scheme::Tcp => Transport::tcp(self.host.clone(), self.port),
            Scheme::Ipc => Transport::ipc(&self.name),
        }
    }

    /// True when a missing worker at this address may be started on this host.
    pub fn is_local(&self) -> bool {
        self.transport().is_local()
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}:{}", self.scheme, self.name, self.host, self.port)
    }
}

impl FromStr for WorkerAddress {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PoolError::InvalidAddress(s.to_string());

        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Scheme::Tcp,
            "ipc" => Scheme::Ipc,
            _ => return Err(invalid()),
        };
        let (name, location) = rest.split_once('@').ok_or_else(invalid)?;
        let (host, port) = location.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;

        if name.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        if scheme == Scheme::Ipc && !Transport::tcp(host, port).is_local() {
            return Err(invalid());
        }
        Ok(Self {
            scheme,
            name: name.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_address() {
        let addr: WorkerAddress = "tcp:worker@localhost:21000".parse().unwrap();
        assert_eq!(addr, WorkerAddress::tcp("worker", "localhost", 21000));
        assert_eq!(addr.transport(), Transport::tcp("localhost", 21000));
        assert!(addr.is_local());
        assert_eq!(addr.to_string(), "tcp:worker@localhost:21000");
    }

    #[test]
    fn parse_ipc_address() {
        let addr: WorkerAddress = "ipc:fib-0@localhost:0".parse().unwrap();
        assert_eq!(addr.scheme, Scheme::Ipc);
        assert_eq!(addr.transport(), Transport::ipc("fib-0"));
        assert!(addr.is_local());
    }

    #[test]
    fn ipc_identity_ignores_host_and_port() {
        let a: WorkerAddress = "ipc:fib-0@localhost:0".parse().unwrap();
        let b: WorkerAddress = "ipc:fib-0@127.0.0.1:9000".parse().unwrap();
        assert_eq!(a.transport(), b.transport());
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().as_str(), "ipc:fib-0@localhost:0");

        let c: WorkerAddress = "ipc:fib-1@localhost:0".parse().unwrap();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn ipc_on_a_remote_host_is_rejected() {
        assert!(matches!(
            "ipc:fib-0@compute-7:0".parse::<WorkerAddress>(),
            Err(PoolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn remote_host_is_not_local() {
        let addr: WorkerAddress = "tcp:worker@compute-7:21000".parse().unwrap();
        assert!(!addr.is_local());
    }

    #[test]
    fn scheme_is_case_insensitive_and_ids_normalize() {
        let id: WorkerId = "TCP:worker@localhost:21000".parse().unwrap();
        assert_eq!(id.as_str(), "tcp:worker@localhost:21000");
    }

    #[test]
    fn reject_malformed_addresses() {
        for bad in [
            "worker@localhost:21000",
            "pyro:worker@localhost:21000",
            "tcp:worker@localhost",
            "tcp:@localhost:21000",
            "tcp:worker@:21000",
            "tcp:worker@localhost:notaport",
            "tcp:worker-localhost:21000",
        ] {
            assert!(
                matches!(bad.parse::<WorkerAddress>(), Err(PoolError::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }
}
