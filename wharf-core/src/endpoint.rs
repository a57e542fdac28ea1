//! Endpoint addresses in libzmq URI syntax.
//!
//! Only the three transports the fabric wires sockets over are accepted.
//! Parsing is purely syntactic; whether a host resolves is libzmq's business.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::pattern::Role;

/// A parsed socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `tcp://host:port`; host may be `*` and port `0` when binding
    Tcp { host: String, port: u16 },
    /// `ipc:///path/to/socket`
    Ipc(PathBuf),
    /// `inproc://name`, shared by sockets of one context
    Inproc(String),
}

impl Endpoint {
    /// Parse `s`.
    ///
    /// ```
    /// use wharf_core::endpoint::Endpoint;
    /// use wharf_core::pattern::Role;
    ///
    /// let any = Endpoint::parse("tcp://*:5556").unwrap();
    /// assert!(any.check_role(Role::Bind).is_ok());
    /// assert!(any.check_role(Role::Connect).is_err());
    ///
    /// assert_eq!(Endpoint::parse("inproc://status").unwrap().port(), None);
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// TCP port, if this is a TCP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// `*` host: listen on every interface.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Tcp { host, .. } if host == "*")
    }

    /// Port `0`: the OS picks the port at bind time.
    pub fn is_ephemeral(&self) -> bool {
        self.port() == Some(0)
    }

    /// Reject addresses that only make sense for the other role.
    ///
    /// A connecting socket needs a concrete host and port.
    pub fn check_role(&self, role: Role) -> Result<(), EndpointError> {
        if role == Role::Connect && (self.is_wildcard() || self.is_ephemeral()) {
            return Err(EndpointError::BindOnly(self.to_string()));
        }
        Ok(())
    }
}

fn parse_tcp(addr: &str) -> Result<Endpoint, EndpointError> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(EndpointError::MissingPort(addr.to_string()));
    };
    let host = match host.strip_prefix('[') {
        Some(v6) => v6
            .strip_suffix(']')
            .ok_or_else(|| EndpointError::BadHost(host.to_string()))?,
        None if host.contains(':') => return Err(EndpointError::BadHost(host.to_string())),
        None => host,
    };
    if host.is_empty() {
        return Err(EndpointError::BadHost(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| EndpointError::BadPort(port.to_string()))?;
    Ok(Endpoint::Tcp {
        host: host.to_string(),
        port,
    })
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| EndpointError::MissingScheme(s.to_string()))?;
        if rest.is_empty() {
            return Err(EndpointError::EmptyAddress(scheme.to_string()));
        }
        match scheme {
            "tcp" => parse_tcp(rest),
            "ipc" => Ok(Self::Ipc(PathBuf::from(rest))),
            "inproc" => Ok(Self::Inproc(rest.to_string())),
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Self::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

/// Why an endpoint string was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("missing `scheme://` prefix in {0:?}")]
    MissingScheme(String),

    #[error("unsupported transport {0:?} (expected tcp, ipc or inproc)")]
    UnsupportedScheme(String),

    #[error("empty {0} address")]
    EmptyAddress(String),

    #[error("missing port in {0:?}")]
    MissingPort(String),

    #[error("invalid port {0:?}")]
    BadPort(String),

    #[error("invalid host {0:?}")]
    BadHost(String),

    #[error("{0} can only be bound, not connected to")]
    BindOnly(String),
}
