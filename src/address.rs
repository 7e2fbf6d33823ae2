//! Normalized IP+port identity with equality predicates and local-interface
//! detection.

use std::collections::HashSet;
use std::sync::OnceLock;

/// An IP address (textual form) plus a port. Port 0 means "unset" (used for
/// protocol layers below UDP/TCP, such as a bare IP reassembly result).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// ip-only equality predicate.
    pub fn ip_eq(&self, other: &Address) -> bool {
        self.ip == other.ip
    }

    /// ip-and-port equality predicate.
    pub fn addr_eq(&self, other: &Address) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// Parses an "ip:port" string. Returns `None` on malformed input, mirroring
    /// the lenient `sscanf("%[^:]:%d", ...)` parse of the original tool: a
    /// missing colon or non-numeric port is rejected rather than panicking.
    pub fn from_str(s: &str) -> Option<Address> {
        let (ip, port) = s.rsplit_once(':')?;
        if ip.is_empty() {
            return None;
        }
        let port: u16 = port.parse().ok()?;
        Some(Address::new(ip, port))
    }

    /// Whether this address's IP is configured on any local interface.
    ///
    /// The interface list is scanned once per process and cached; re-scanning
    /// is intentionally not supported, matching the source's "scan once" cache
    /// discipline (SPEC_FULL.md §9).
    pub fn is_local(&self) -> bool {
        local_interface_ips().contains(&self.ip)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

static LOCAL_IPS: OnceLock<HashSet<String>> = OnceLock::new();

/// Lazily initialized, process-lifetime cache of every IP address bound to a
/// local interface. Populated once via `getifaddrs`; there is no explicit
/// teardown hook since the cache is plain owned data dropped at process exit.
fn local_interface_ips() -> &'static HashSet<String> {
    LOCAL_IPS.get_or_init(scan_local_interfaces)
}

#[cfg(unix)]
fn scan_local_interfaces() -> HashSet<String> {
    let mut ips = HashSet::new();
    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => {
            for ifaddr in addrs {
                if let Some(address) = ifaddr.address {
                    if let Some(sockaddr) = address.as_sockaddr_in() {
                        ips.insert(std::net::Ipv4Addr::from(sockaddr.ip()).to_string());
                    } else if let Some(sockaddr) = address.as_sockaddr_in6() {
                        ips.insert(sockaddr.ip().to_string());
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!("failed to enumerate local interfaces: {e}");
        }
    }
    ips
}

#[cfg(not(unix))]
fn scan_local_interfaces() -> HashSet<String> {
    tracing::warn!("local interface enumeration is unsupported on this platform");
    HashSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_eq_ignores_port() {
        let a = Address::new("10.0.0.1", 5060);
        let b = Address::new("10.0.0.1", 5061);
        assert!(a.ip_eq(&b));
        assert!(!a.addr_eq(&b));
    }

    #[test]
    fn test_addr_eq_requires_port_match() {
        let a = Address::new("10.0.0.1", 5060);
        let b = Address::new("10.0.0.1", 5060);
        assert!(a.addr_eq(&b));
    }

    #[test]
    fn test_from_str_parses_ip_and_port() {
        let addr = Address::from_str("192.168.1.10:5060").unwrap();
        assert_eq!(addr.ip, "192.168.1.10");
        assert_eq!(addr.port, 5060);
    }

    #[test]
    fn test_from_str_parses_ipv6_with_rsplit() {
        // rsplit_once on the last colon correctly separates IPv6 literals too.
        let addr = Address::from_str("::1:5060").unwrap();
        assert_eq!(addr.ip, "::1");
        assert_eq!(addr.port, 5060);
    }

    #[test]
    fn test_from_str_rejects_missing_colon() {
        assert!(Address::from_str("noport").is_none());
    }

    #[test]
    fn test_from_str_rejects_non_numeric_port() {
        assert!(Address::from_str("10.0.0.1:abc").is_none());
    }

    #[test]
    fn test_from_str_rejects_empty_ip() {
        assert!(Address::from_str(":5060").is_none());
    }

    #[test]
    fn test_display_formats_as_ip_colon_port() {
        let addr = Address::new("10.0.0.1", 5060);
        assert_eq!(addr.to_string(), "10.0.0.1:5060");
    }

    #[test]
    fn test_loopback_is_local() {
        // 127.0.0.1 is present on every unix host's interface list.
        let addr = Address::new("127.0.0.1", 0);
        assert!(addr.is_local());
    }

    #[test]
    fn test_unroutable_address_is_not_local() {
        let addr = Address::new("203.0.113.254", 0);
        assert!(!addr.is_local());
    }
}
