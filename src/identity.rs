//! Local box identity
//!
//! A director must know which configured box it runs on: the selector gives
//! that box a latency bonus, the bandwidth meter samples its interface and
//! gossip signs vectors with its name. The box is found by matching resolved
//! box addresses against the host's interface addresses.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

use crate::config::DirectorConfig;

/// Interface address → interface name
pub type InterfaceMap = HashMap<IpAddr, String>;

/// Identity errors (fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to enumerate interfaces: {0}")]
    Interfaces(String),

    #[error("local box override {0} is not a configured box")]
    UnknownOverride(String),

    #[error("no configured box matches a local interface address")]
    NotFound,
}

/// Addresses of one box after resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedBox {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// The box this process runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: String,
    /// Interface carrying the box address, when known
    pub netint: Option<String>,
}

#[cfg(target_os = "linux")]
pub fn local_interfaces() -> Result<InterfaceMap, IdentityError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| IdentityError::Interfaces(e.to_string()))?;
    let mut map = InterfaceMap::new();
    for ifaddr in addrs {
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            map.insert(IpAddr::V4(sin.ip()), ifaddr.interface_name.clone());
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            map.insert(IpAddr::V6(sin6.ip()), ifaddr.interface_name.clone());
        }
    }
    debug!("{} local interface addresses", map.len());
    Ok(map)
}

#[cfg(not(target_os = "linux"))]
pub fn local_interfaces() -> Result<InterfaceMap, IdentityError> {
    let mut map = InterfaceMap::new();
    map.insert(IpAddr::V4(Ipv4Addr::LOCALHOST), "lo".to_string());
    Ok(map)
}

/// Resolve every box hostname not pinned by a static `ipv4`. A failed lookup
/// leaves the box unresolved.
pub async fn resolve_boxes(config: &DirectorConfig) -> BTreeMap<String, ResolvedBox> {
    let mut resolved = BTreeMap::new();
    for cdnbox in &config.cdnboxes {
        let mut entry = ResolvedBox {
            ipv4: cdnbox.ipv4,
            ipv6: cdnbox.ipv6,
        };
        if entry.ipv4.is_none() {
            match tokio::net::lookup_host((cdnbox.hostname.as_str(), 0)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        match addr.ip() {
                            IpAddr::V4(v4) if entry.ipv4.is_none() => entry.ipv4 = Some(v4),
                            IpAddr::V6(v6) if entry.ipv6.is_none() => entry.ipv6 = Some(v6),
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(hostname = %cdnbox.hostname, error = %e, "no IP for hostname");
                }
            }
        }
        resolved.insert(cdnbox.name.clone(), entry);
    }
    resolved
}

/// Pick the local box: the `local_box` override, else the first box whose
/// IPv4 address is assigned to this host (or is loopback).
pub fn detect_local(
    config: &DirectorConfig,
    resolved: &BTreeMap<String, ResolvedBox>,
    interfaces: &InterfaceMap,
) -> Result<LocalIdentity, IdentityError> {
    let netint_of = |name: &str| {
        resolved
            .get(name)
            .and_then(|r| r.ipv4)
            .and_then(|ip| interfaces.get(&IpAddr::V4(ip)).cloned())
    };

    if let Some(name) = &config.local_box {
        if config.box_config(name).is_none() {
            return Err(IdentityError::UnknownOverride(name.clone()));
        }
        return Ok(LocalIdentity {
            name: name.clone(),
            netint: netint_of(name),
        });
    }

    for cdnbox in &config.cdnboxes {
        let Some(ipv4) = resolved.get(&cdnbox.name).and_then(|r| r.ipv4) else {
            continue;
        };
        if ipv4.is_loopback() || interfaces.contains_key(&IpAddr::V4(ipv4)) {
            let identity = LocalIdentity {
                name: cdnbox.name.clone(),
                netint: netint_of(&cdnbox.name),
            };
            info!(cdnbox = %identity.name, netint = ?identity.netint, "local box identified");
            return Ok(identity);
        }
    }
    Err(IdentityError::NotFound)
}
