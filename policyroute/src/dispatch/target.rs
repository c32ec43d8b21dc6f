use crate::common::host_matcher::normalize_host;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Destination of one outbound connection as seen by the classifier.
///
/// A target may carry both an address and a sniffed domain; domain matchers
/// only look at the domain, CIDR and GEOIP matchers only at the address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnTarget {
    pub domain: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub process_name: Option<String>,
}

impl ConnTarget {
    pub fn domain(domain: &str, port: u16) -> Self {
        Self {
            domain: Some(normalize_host(domain).into_owned()),
            ip: None,
            port,
            process_name: None,
        }
    }

    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            domain: None,
            ip: Some(ip),
            port,
            process_name: None,
        }
    }

    pub fn with_sniffed_domain(mut self, domain: &str) -> Self {
        self.domain = Some(normalize_host(domain).into_owned());
        self
    }

    pub fn with_process<S: Into<String>>(mut self, name: S) -> Self {
        self.process_name = Some(name.into());
        self
    }
}

impl Display for ConnTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.domain, &self.ip) {
            (Some(d), _) => write!(f, "{}:{}", d, self.port),
            (None, Some(IpAddr::V6(v6))) => write!(f, "[{}]:{}", v6, self.port),
            (None, Some(ip)) => write!(f, "{}:{}", ip, self.port),
            (None, None) => write!(f, "<unknown>:{}", self.port),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid target: {0}")]
pub struct TargetParseError(pub String);

impl FromStr for ConnTarget {
    type Err = TargetParseError;

    /// Accepts `host`, `host:port`, `ip`, `ip:port` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TargetParseError(s.to_string()));
        }
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(Self::ip(addr.ip(), addr.port()));
        }
        if let Ok(ip) = IpAddr::from_str(s.trim_start_matches('[').trim_end_matches(']')) {
            return Ok(Self::ip(ip, 0));
        }
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| TargetParseError(s.to_string()))?,
            ),
            None => (s, 0),
        };
        if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == ':' || c == '/')
        {
            return Err(TargetParseError(s.to_string()));
        }
        Ok(Self::domain(host, port))
    }
}
