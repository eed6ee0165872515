use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::Error;

pub const DEFAULT_PORT: u16 = 27017;

/// The network location of a single node.
///
/// Endpoints are used as map keys throughout the crate, so equality is
/// structural and host names are normalised to lower case on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndPoint {
    Host { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl EndPoint {
    pub fn host(host: impl AsRef<str>, port: u16) -> Self {
        Self::Host {
            host: host.as_ref().to_ascii_lowercase(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }
}

impl Display for EndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndPoint::Host { host, port } => {
                if host.contains(':') {
                    write!(f, "[{}]:{}", host, port)
                } else {
                    write!(f, "{}:{}", host, port)
                }
            }
            EndPoint::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for EndPoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::new_invalid_argument_error("endpoint cannot be empty"));
        }

        if s.starts_with('/') {
            if !s.ends_with(".sock") {
                return Err(Error::new_invalid_argument_error(&format!(
                    "unix domain socket path must end with .sock: {}",
                    s
                )));
            }
            return Ok(EndPoint::unix(s));
        }

        // [ipv6]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                Error::new_invalid_argument_error(&format!("invalid ipv6 endpoint: {}", s))
            })?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if after.is_empty() => DEFAULT_PORT,
                None => {
                    return Err(Error::new_invalid_argument_error(&format!(
                        "invalid ipv6 endpoint: {}",
                        s
                    )))
                }
            };
            return Ok(EndPoint::host(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(Error::new_invalid_argument_error(&format!(
                        "endpoint has no host: {}",
                        s
                    )));
                }
                Ok(EndPoint::host(host, parse_port(port)?))
            }
            None => Ok(EndPoint::host(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(port: &str) -> Result<u16, Error> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::new_invalid_argument_error(&format!(
            "invalid port: {}",
            port
        ))),
        Ok(p) => Ok(p),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId {
    pub cluster_id: ClusterId,
    pub end_point: EndPoint,
}

impl ServerId {
    pub fn new(cluster_id: ClusterId, end_point: EndPoint) -> Self {
        Self {
            cluster_id,
            end_point,
        }
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ cluster: {}, endpoint: {} }}", self.cluster_id, self.end_point)
    }
}

/// Identifies the backend behind a load balancer that a connection is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let ep: EndPoint = "Localhost:27018".parse().unwrap();
        assert_eq!(ep, EndPoint::host("localhost", 27018));
        assert_eq!("localhost:27018", ep.to_string());
    }

    #[test]
    fn parses_default_port() {
        let ep: EndPoint = "db.example.com".parse().unwrap();
        assert_eq!(ep, EndPoint::host("db.example.com", DEFAULT_PORT));
    }

    #[test]
    fn parses_ipv6() {
        let ep: EndPoint = "[::1]:27019".parse().unwrap();
        assert_eq!(ep, EndPoint::host("::1", 27019));
        assert_eq!("[::1]:27019", ep.to_string());
    }

    #[test]
    fn parses_unix_socket() {
        let ep: EndPoint = "/tmp/mongodb-27017.sock".parse().unwrap();
        assert_eq!(ep, EndPoint::unix("/tmp/mongodb-27017.sock"));
    }

    #[test]
    fn rejects_bad_port() {
        assert!("localhost:0".parse::<EndPoint>().is_err());
        assert!("localhost:abc".parse::<EndPoint>().is_err());
        assert!(":27017".parse::<EndPoint>().is_err());
    }

    #[test]
    fn server_ids_compare_structurally() {
        let cluster_id = ClusterId::from_value("c1");
        let a = ServerId::new(cluster_id.clone(), EndPoint::host("A", 1));
        let b = ServerId::new(cluster_id, EndPoint::host("a", 1));
        assert_eq!(a, b);
    }
}
