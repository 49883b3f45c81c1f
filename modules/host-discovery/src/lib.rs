//! Target expansion: include/exclude address blocks crossed with ports.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Largest block a single include or exclude entry may expand to.
pub const MAX_BLOCK: u128 = 1 << 24;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid address or CIDR block {0:?}")]
    Invalid(String),
    #[error("block {spec} has {size} addresses, more than {MAX_BLOCK}")]
    TooLarge { spec: String, size: u128 },
    #[error("invalid port spec {0:?}")]
    Ports(String),
}

/// Parse `10.0.0.0/24`, `10.0.0.5` or `::1`. Bare addresses become /32 or /128.
pub fn parse_block(spec: &str) -> Result<IpNet, RangeError> {
    let spec = spec.trim();
    if spec.contains('/') {
        return spec.parse::<IpNet>().map_err(|_| RangeError::Invalid(spec.to_string()));
    }
    let ip: IpAddr = spec.parse().map_err(|_| RangeError::Invalid(spec.to_string()))?;
    let full = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, full).map_err(|_| RangeError::Invalid(spec.to_string()))
}

fn block_size(net: &IpNet) -> u128 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

/// Every address in the block, network and broadcast included.
fn expand_block(spec: &str) -> Result<Vec<IpAddr>, RangeError> {
    let net = parse_block(spec)?;
    let size = block_size(&net);
    if size > MAX_BLOCK {
        return Err(RangeError::TooLarge { spec: spec.trim().to_string(), size });
    }
    let ips = match net {
        IpNet::V4(n) => (u32::from(n.network())..=u32::from(n.broadcast()))
            .map(|a| IpAddr::V4(Ipv4Addr::from(a)))
            .collect(),
        IpNet::V6(n) => (u128::from(n.network())..=u128::from(n.broadcast()))
            .map(|a| IpAddr::V6(Ipv6Addr::from(a)))
            .collect(),
    };
    Ok(ips)
}

/// Expand `include` minus `exclude` into a deduplicated address list.
///
/// Both sides are fully expanded before the difference is taken, so an
/// exclusion may be a subset, superset or unrelated block. Any bad entry
/// fails the whole expansion.
pub fn enumerate_hosts<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Vec<IpAddr>, RangeError> {
    let mut skip: HashSet<IpAddr> = HashSet::new();
    for spec in exclude {
        skip.extend(expand_block(spec.as_ref())?);
    }
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut out = Vec::new();
    for spec in include {
        for ip in expand_block(spec.as_ref())? {
            if !skip.contains(&ip) && seen.insert(ip) {
                out.push(ip);
            }
        }
    }
    Ok(out)
}

/// Parse a comma-separated list of ports/ranges (e.g., "22,2222", "2200-2210").
pub fn parse_ports(spec: &str) -> Result<Vec<u16>, RangeError> {
    let bad = |part: &str| RangeError::Ports(part.to_string());
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse().map_err(|_| bad(part))?;
            let e: u16 = end.trim().parse().map_err(|_| bad(part))?;
            if s == 0 || e == 0 || s > e {
                return Err(bad(part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse().map_err(|_| bad(part))?;
            if p == 0 {
                return Err(bad(part));
            }
            ports.push(p);
        }
    }
    if ports.is_empty() {
        return Err(bad(spec));
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

/// An expanded target set. Hostports are produced on demand.
#[derive(Debug, Clone)]
pub struct Targets {
    addrs: Vec<IpAddr>,
    ports: Vec<u16>,
}

impl Targets {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S], ports: &[u16]) -> Result<Self, RangeError> {
        Ok(Targets { addrs: enumerate_hosts(include, exclude)?, ports: ports.to_vec() })
    }

    pub fn len(&self) -> usize {
        self.addrs.len() * self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `addr:port` strings, sweeping every address for one port before the next.
    pub fn hostports(&self) -> impl Iterator<Item = String> + Send + '_ {
        self.ports
            .iter()
            .flat_map(move |&port| self.addrs.iter().map(move |&ip| SocketAddr::new(ip, port).to_string()))
    }

    /// Owning variant of [`Targets::hostports`], for handing to a producer task.
    pub fn into_hostports(self) -> impl Iterator<Item = String> + Send + 'static {
        let Targets { addrs, ports } = self;
        ports
            .into_iter()
            .flat_map(move |port| addrs.clone().into_iter().map(move |ip| SocketAddr::new(ip, port).to_string()))
    }
}
