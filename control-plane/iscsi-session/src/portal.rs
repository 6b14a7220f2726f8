//! Portal endpoints and the parsing of comma-separated portal lists.

use crate::error::{Error, InvalidInput};
use regex::Regex;
use std::{
    collections::HashSet,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};
use utils::ISCSI_DEFAULT_PORT;

lazy_static::lazy_static! {
    /// RFC 1123 hostname: dot separated labels of alphanumerics and inner hyphens.
    static ref HOSTNAME_REGEX: Regex = Regex::new(
        r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$"
    )
    .unwrap();
}

/// A network endpoint through which iSCSI targets are reachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Portal {
    address: String,
    port: Option<u16>,
}

impl Portal {
    /// Return a new `Self` from an already validated address.
    pub fn new(address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
    /// The host name or ip address.
    pub fn address(&self) -> &str {
        &self.address
    }
    /// The port, if one was specified.
    pub fn port(&self) -> Option<u16> {
        self.port
    }
    /// The port to connect to, falling back to the well-known iSCSI port.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(ISCSI_DEFAULT_PORT)
    }
    /// The `host:port` endpoint, with the port always present.
    /// Two portals with the same endpoint refer to the same iSCSI portal.
    pub fn endpoint(&self) -> String {
        join_host_port(&self.address, self.effective_port())
    }
}

impl std::fmt::Display for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}", join_host_port(&self.address, port)),
            None => write!(f, "{}", self.address),
        }
    }
}

impl FromStr for Portal {
    type Err = String;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err("empty portal entry".to_string());
        }

        if let Some(bracketed) = entry.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("'{entry}' is missing the closing bracket"))?;
            if Ipv6Addr::from_str(host).is_err() {
                return Err(format!("'{host}' is not a valid IPv6 address"));
            }
            let port = match rest {
                "" => None,
                rest => match rest.strip_prefix(':') {
                    Some(port) => Some(parse_port(port)?),
                    None => return Err(format!("unexpected '{rest}' after '[{host}]'")),
                },
            };
            return Ok(Self::new(host, port));
        }

        // more than one colon can only be an IPv6 address without a port
        if entry.matches(':').count() > 1 {
            return match Ipv6Addr::from_str(entry) {
                Ok(_) => Ok(Self::new(entry, None)),
                Err(_) => Err(format!("'{entry}' is not a valid IPv6 address")),
            };
        }

        let (host, port) = match entry.split_once(':') {
            Some((host, port)) => (host, Some(parse_port(port)?)),
            None => (entry, None),
        };
        validate_host(host)?;
        Ok(Self::new(host, port))
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{port}' is not a valid port"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("port '{port}' is out of range")),
        Ok(port) => Ok(port),
    }
}

fn validate_host(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    // all-numeric labels are only acceptable as a dotted IPv4 address
    if host.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return match Ipv4Addr::from_str(host) {
            Ok(_) => Ok(()),
            Err(_) => Err(format!("'{host}' is not a valid IPv4 address")),
        };
    }
    if host.len() > 253 || !HOSTNAME_REGEX.is_match(host) {
        return Err(format!("'{host}' is not a valid host name"));
    }
    Ok(())
}

/// Join a host and a port, bracketing IPv6 addresses.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Ordered, duplicate free sequence of portals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalSet(Vec<Portal>);

impl PortalSet {
    /// Parse a comma-separated list of `host[:port]` entries.
    /// Duplicates (by endpoint) are dropped, keeping the first occurrence.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let invalid = |reason: String| InvalidInput { input: raw, reason }.build();
        if raw.trim().is_empty() {
            return InvalidInput {
                input: raw,
                reason: "no portals specified",
            }
            .fail();
        }

        let mut seen = HashSet::new();
        let mut portals = Vec::new();
        for entry in raw.split(',') {
            let portal = Portal::from_str(entry).map_err(invalid)?;
            if seen.insert(portal.endpoint()) {
                portals.push(portal);
            }
        }
        Ok(Self(portals))
    }
    /// Iterate over the portals in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Portal> {
        self.0.iter()
    }
    /// Number of distinct portals.
    pub fn len(&self) -> usize {
        self.0.len()
    }
    /// Whether there are no portals.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// The portals as a slice.
    pub fn as_slice(&self) -> &[Portal] {
        &self.0
    }
}

impl FromStr for PortalSet {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl<'a> IntoIterator for &'a PortalSet {
    type Item = &'a Portal;
    type IntoIter = std::slice::Iter<'a, Portal>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl std::fmt::Display for PortalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let portals = self.0.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "{}", portals.join(","))
    }
}
