//! Target validation for edge blocking
//!
//! The controller must never block its own infrastructure. Anything that is not
//! a globally routable unicast address is rejected before any state is touched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Why an address was refused as a block target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRejection {
    /// Empty input
    Empty,
    /// Not an IPv4/IPv6 literal
    Malformed,
    /// Loopback (127.0.0.0/8, ::1)
    Loopback,
    /// RFC 1918, unique-local, link-local or carrier-grade NAT space
    Private,
    /// Unspecified, broadcast, multicast, benchmarking, documentation (v6) or
    /// other special-purpose space
    Reserved,
}

impl IpRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpRejection::Empty => "empty",
            IpRejection::Malformed => "malformed",
            IpRejection::Loopback => "loopback",
            IpRejection::Private => "private",
            IpRejection::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for IpRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} address", self.as_str())
    }
}

/// Parse `raw` and accept it only if it is safe to block at the edge.
pub fn validate_block_target(raw: &str) -> Result<IpAddr, IpRejection> {
    if raw.is_empty() {
        return Err(IpRejection::Empty);
    }
    let ip: IpAddr = raw.parse().map_err(|_| IpRejection::Malformed)?;
    match ip {
        IpAddr::V4(v4) => classify_v4(v4)?,
        IpAddr::V6(v6) => classify_v6(v6)?,
    }
    Ok(ip)
}

fn classify_v4(ip: Ipv4Addr) -> Result<(), IpRejection> {
    let [a, b, c, _] = ip.octets();

    if ip.is_loopback() {
        return Err(IpRejection::Loopback);
    }
    // 100.64.0.0/10 is shared address space (carrier-grade NAT)
    if ip.is_private() || ip.is_link_local() || (a == 100 && (b & 0xc0) == 64) {
        return Err(IpRejection::Private);
    }
    // 0.0.0.0/8, multicast, and 240.0.0.0/4 (includes broadcast)
    if a == 0 || ip.is_multicast() || a >= 240 {
        return Err(IpRejection::Reserved);
    }
    // 192.0.0.0/24 protocol assignments, 192.88.99.0/24 6to4 relay,
    // 198.18.0.0/15 benchmarking
    if (a == 192 && b == 0 && c == 0)
        || (a == 192 && b == 88 && c == 99)
        || (a == 198 && (b & 0xfe) == 18)
    {
        return Err(IpRejection::Reserved);
    }
    Ok(())
}

fn classify_v6(ip: Ipv6Addr) -> Result<(), IpRejection> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_v4(v4);
    }
    if ip.is_loopback() {
        return Err(IpRejection::Loopback);
    }

    let first = ip.segments()[0];
    // fc00::/7 unique local, fe80::/10 link-local
    if (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 {
        return Err(IpRejection::Private);
    }
    if ip.is_unspecified() || ip.is_multicast() {
        return Err(IpRejection::Reserved);
    }
    let segments = ip.segments();
    // 2001:db8::/32 documentation, 100::/64 discard-only
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8;
    let discard = segments[..4] == [0x0100, 0, 0, 0];
    if documentation || discard {
        return Err(IpRejection::Reserved);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_addresses_accepted() {
        for raw in ["8.8.8.8", "203.0.113.1", "1.1.1.1", "2606:4700:4700::1111"] {
            assert!(validate_block_target(raw).is_ok(), "{} should be accepted", raw);
        }
    }

    #[test]
    fn test_private_and_loopback_rejected() {
        let cases = [
            ("127.0.0.1", IpRejection::Loopback),
            ("::1", IpRejection::Loopback),
            ("10.0.0.5", IpRejection::Private),
            ("172.16.4.2", IpRejection::Private),
            ("192.168.1.100", IpRejection::Private),
            ("169.254.10.1", IpRejection::Private),
            ("100.64.0.1", IpRejection::Private),
            ("fd00::1", IpRejection::Private),
            ("fe80::1", IpRejection::Private),
            ("::ffff:192.168.0.1", IpRejection::Private),
        ];
        for (raw, expected) in cases {
            assert_eq!(validate_block_target(raw), Err(expected), "{}", raw);
        }
    }

    #[test]
    fn test_reserved_rejected() {
        for raw in ["0.0.0.0", "255.255.255.255", "240.0.0.1", "224.0.0.1", "::", "ff02::1"] {
            assert_eq!(validate_block_target(raw), Err(IpRejection::Reserved), "{}", raw);
        }
    }

    #[test]
    fn test_special_purpose_ranges_rejected() {
        for raw in [
            "192.0.0.8",
            "192.0.0.170",
            "198.18.0.1",
            "198.19.255.254",
            "192.88.99.1",
            "2001:db8::1",
            "100::1",
            "::ffff:198.18.0.1",
        ] {
            assert_eq!(validate_block_target(raw), Err(IpRejection::Reserved), "{}", raw);
        }
        // Neighbors of those ranges stay blockable
        for raw in ["192.0.1.1", "198.17.255.255", "198.20.0.1", "192.88.98.1", "2001:db9::1"] {
            assert!(validate_block_target(raw).is_ok(), "{} should be accepted", raw);
        }
    }

    #[test]
    fn test_malformed_rejected() {
        assert_eq!(validate_block_target(""), Err(IpRejection::Empty));
        for raw in ["not-an-ip", "999.1.1.1", "1.2.3", " 8.8.8.8", "8.8.8.8/32"] {
            assert_eq!(validate_block_target(raw), Err(IpRejection::Malformed), "{}", raw);
        }
    }
}
