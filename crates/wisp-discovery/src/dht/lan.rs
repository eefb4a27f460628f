//! LAN discovery.
//!
//! A node periodically broadcasts its DHT key on the local network. A
//! presence packet is only believed when it comes from a LAN address;
//! such nodes enter the routing table without ping verification.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Default DHT port used for broadcasts
pub const DEFAULT_LAN_PORT: u16 = 33445;

/// Is `ip` on a local network segment?
///
/// Covers loopback, RFC 1918 private ranges, link-local, carrier-grade NAT
/// (100.64/10), IPv6 link-local and unique-local, and IPv4-mapped forms of
/// all of these.
#[must_use]
pub fn is_lan_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_lan_ipv4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_lan_ipv4(&mapped);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xffc0) == 0xfe80 // link-local
                || (first & 0xfe00) == 0xfc00 // unique local
        }
    }
}

fn is_lan_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
}

/// Where to send presence broadcasts
#[must_use]
pub fn broadcast_targets(port: u16, ipv6: bool) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)];
    if ipv6 {
        // All-nodes link-local multicast
        targets.push(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)),
            port,
        ));
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lan_ipv4() {
        assert!(is_lan_ip(&ip("127.0.0.1")));
        assert!(is_lan_ip(&ip("10.2.3.4")));
        assert!(is_lan_ip(&ip("172.16.0.9")));
        assert!(is_lan_ip(&ip("192.168.1.1")));
        assert!(is_lan_ip(&ip("169.254.10.10")));
        assert!(is_lan_ip(&ip("100.64.0.1")));
        assert!(!is_lan_ip(&ip("100.128.0.1")));
        assert!(!is_lan_ip(&ip("8.8.8.8")));
        assert!(!is_lan_ip(&ip("172.32.0.1")));
    }

    #[test]
    fn test_lan_ipv6() {
        assert!(is_lan_ip(&ip("::1")));
        assert!(is_lan_ip(&ip("fe80::1")));
        assert!(is_lan_ip(&ip("fd00::5")));
        assert!(is_lan_ip(&ip("::ffff:192.168.0.2")));
        assert!(!is_lan_ip(&ip("2001:db8::1")));
        assert!(!is_lan_ip(&ip("::ffff:8.8.8.8")));
    }

    #[test]
    fn test_broadcast_targets() {
        assert_eq!(broadcast_targets(33445, false).len(), 1);
        let both = broadcast_targets(33445, true);
        assert_eq!(both.len(), 2);
        assert!(both.iter().all(|t| t.port() == 33445));
    }
}
