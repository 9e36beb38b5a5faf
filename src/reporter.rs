//! Reachable address discovery.
//!
//! Operators connect to the proxies over globally routable IPv6, so only those
//! addresses are worth printing. Everything else (IPv4, IPv4-mapped IPv6,
//! loopback, link-local, multicast) is filtered out.

use std::{
    fmt::Display,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

/// UnicastScope is the address capability the reporter filters on
pub trait UnicastScope {
    /// is_global_unicast is true for any unicast address that is neither
    /// unspecified, loopback nor link-local
    fn is_global_unicast(&self) -> bool;

    /// is_ipv4 is true for IPv4 addresses, including IPv4-mapped IPv6
    fn is_ipv4(&self) -> bool;
}

impl UnicastScope for Ipv4Addr {
    fn is_global_unicast(&self) -> bool {
        !(self.is_unspecified()
            || self.is_loopback()
            || self.is_link_local()
            || self.is_multicast()
            || self.is_broadcast())
    }

    fn is_ipv4(&self) -> bool {
        true
    }
}

impl UnicastScope for Ipv6Addr {
    fn is_global_unicast(&self) -> bool {
        if let Some(v4) = self.to_ipv4_mapped() {
            return v4.is_global_unicast();
        }

        !(self.is_unspecified()
            || self.is_loopback()
            || self.is_multicast()
            || self.is_unicast_link_local())
    }

    fn is_ipv4(&self) -> bool {
        self.to_ipv4_mapped().is_some()
    }
}

impl UnicastScope for IpAddr {
    fn is_global_unicast(&self) -> bool {
        match self {
            IpAddr::V4(ip) => ip.is_global_unicast(),
            IpAddr::V6(ip) => ip.is_global_unicast(),
        }
    }

    fn is_ipv4(&self) -> bool {
        match self {
            IpAddr::V4(ip) => UnicastScope::is_ipv4(ip),
            IpAddr::V6(ip) => UnicastScope::is_ipv4(ip),
        }
    }
}

/// filter_reachable keeps global unicast, non-IPv4 addresses, in input order
pub fn filter_reachable<A, I>(addrs: I) -> Vec<String>
where
    A: UnicastScope + Display,
    I: IntoIterator<Item = A>,
{
    addrs
        .into_iter()
        .filter(|a| a.is_global_unicast() && !a.is_ipv4())
        .map(|a| a.to_string())
        .collect()
}

/// AddressSource lists the addresses that connection URLs are rendered for
pub type AddressSource = fn() -> io::Result<Vec<String>>;

/// discover_reachable_addresses enumerates the local interfaces and returns
/// their globally routable IPv6 addresses. An empty list is not an error
pub fn discover_reachable_addresses() -> io::Result<Vec<String>> {
    let interfaces = get_if_addrs::get_if_addrs()?;

    Ok(filter_reachable(interfaces.iter().map(|iface| iface.ip())))
}

/// render_connection_url formats a bracketed IPv6 URL for one address
pub fn render_connection_url(scheme: &str, address: &str, port: u16) -> String {
    format!("{scheme}://[{address}]:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn keeps_only_global_ipv6() {
        let addrs = [ip("fe80::1"), ip("192.168.1.2"), ip("2001:db8::1")];
        assert_eq!(filter_reachable(addrs), vec!["2001:db8::1".to_string()]);
    }

    #[test]
    fn drops_loopback_multicast_and_unspecified() {
        let addrs = [ip("::1"), ip("ff02::1"), ip("::"), ip("127.0.0.1")];
        assert!(filter_reachable(addrs).is_empty());
    }

    #[test]
    fn drops_ipv4_mapped_addresses() {
        let addrs = [ip("::ffff:203.0.113.7"), ip("2400:cb00::42")];
        assert_eq!(filter_reachable(addrs), vec!["2400:cb00::42".to_string()]);
    }

    #[test]
    fn unique_local_counts_as_global_unicast() {
        assert!(ip("fd00::5").is_global_unicast());
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(filter_reachable(Vec::<IpAddr>::new()).is_empty());
    }

    #[test]
    fn renders_bracketed_url() {
        assert_eq!(
            render_connection_url("socks5h", "2001:db8::1", 1080),
            "socks5h://[2001:db8::1]:1080"
        );
    }

    #[test]
    fn discovery_never_returns_ipv4() {
        // whatever the host has, the result must be parseable global IPv6
        if let Ok(addrs) = discover_reachable_addresses() {
            for addr in addrs {
                let parsed: Ipv6Addr = addr.parse().unwrap();
                assert!(parsed.is_global_unicast());
            }
        }
    }
}
