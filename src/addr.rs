use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use serde::Serialize;

/// Address family of a snooping instance. IGMP runs over IPv4, MLD over IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Family {
    #[serde(rename = "igmp")]
    Ipv4,

    #[serde(rename = "mld")]
    Ipv6,
}

impl Family {
    pub fn is_ipv4(&self) -> bool {
        *self == Family::Ipv4
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            Family::Ipv4 => "IGMP",
            Family::Ipv6 => "MLD",
        }
    }

    fn bits(&self) -> u32 {
        match self {
            Family::Ipv4 => 32,
            Family::Ipv6 => 128,
        }
    }
}

/// An IPv4 or IPv6 address used as group or source key.
///
/// Ordering is only defined between addresses of the same family. Comparing
/// an IPv4 address with an IPv6 address is a bug in the caller and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpmcAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpmcAddr {
    pub const ALL_NODES_V4: IpmcAddr = IpmcAddr::V4(Ipv4Addr::new(224, 0, 0, 1));
    pub const ALL_ROUTERS_V4: IpmcAddr = IpmcAddr::V4(Ipv4Addr::new(224, 0, 0, 2));
    pub const IGMPV3_ROUTERS: IpmcAddr = IpmcAddr::V4(Ipv4Addr::new(224, 0, 0, 22));
    pub const ALL_NODES_V6: IpmcAddr = IpmcAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1));
    pub const ALL_ROUTERS_V6: IpmcAddr = IpmcAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2));
    pub const MLDV2_ROUTERS: IpmcAddr = IpmcAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16));

    pub fn zero(family: Family) -> Self {
        match family {
            Family::Ipv4 => IpmcAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::Ipv6 => IpmcAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn all_nodes(family: Family) -> Self {
        match family {
            Family::Ipv4 => Self::ALL_NODES_V4,
            Family::Ipv6 => Self::ALL_NODES_V6,
        }
    }

    pub fn all_routers(family: Family) -> Self {
        match family {
            Family::Ipv4 => Self::ALL_ROUTERS_V4,
            Family::Ipv6 => Self::ALL_ROUTERS_V6,
        }
    }

    /// Netmask with the `len` most significant bits set.
    pub fn prefix_mask(family: Family, len: u8) -> Self {
        let len = (len as u32).min(family.bits());
        let bits = if len == 0 {
            0
        } else {
            (u128::MAX << (128 - len)) >> (128 - family.bits())
        };
        Self::from_bits(family, bits)
    }

    pub fn family(&self) -> Family {
        match self {
            IpmcAddr::V4(_) => Family::Ipv4,
            IpmcAddr::V6(_) => Family::Ipv6,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.family().is_ipv4()
    }

    pub fn is_zero(&self) -> bool {
        self.bits() == 0
    }

    pub fn is_multicast(&self) -> bool {
        match self {
            IpmcAddr::V4(addr) => addr.is_multicast(),
            IpmcAddr::V6(addr) => addr.is_multicast(),
        }
    }

    /// Usable as a source address: not zero, not multicast and not the IPv4
    /// limited broadcast address.
    pub fn is_unicast(&self) -> bool {
        if self.is_zero() || self.is_multicast() {
            return false;
        }
        match self {
            IpmcAddr::V4(addr) => addr.octets()[0] < 224,
            IpmcAddr::V6(_) => true,
        }
    }

    pub fn is_link_local(&self) -> bool {
        match self {
            IpmcAddr::V4(addr) => addr.is_link_local(),
            IpmcAddr::V6(addr) => (addr.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    /// Group addresses that must never be joined through a report:
    /// 224.0.0.0/24 for IPv4, ff02::1 and ff02::2 for IPv6.
    pub fn is_reserved_group(&self) -> bool {
        match self {
            IpmcAddr::V4(addr) => {
                let o = addr.octets();
                o[0] == 224 && o[1] == 0 && o[2] == 0
            }
            IpmcAddr::V6(_) => *self == Self::ALL_NODES_V6 || *self == Self::ALL_ROUTERS_V6,
        }
    }

    pub fn successor(&self) -> Self {
        Self::from_bits(self.family(), self.bits().wrapping_add(1) & self.family_mask())
    }

    pub fn predecessor(&self) -> Self {
        Self::from_bits(self.family(), self.bits().wrapping_sub(1) & self.family_mask())
    }

    /// Bitwise AND. Panics if the families differ.
    pub fn mask(&self, mask: &IpmcAddr) -> Self {
        self.assert_same_family(mask);
        Self::from_bits(self.family(), self.bits() & mask.bits())
    }

    pub fn prefix_matches(&self, prefix: &IpmcAddr, len: u8) -> bool {
        if self.family() != prefix.family() {
            return false;
        }
        let mask = Self::prefix_mask(self.family(), len);
        self.mask(&mask) == prefix.mask(&mask)
    }

    /// Ethernet multicast address this IP multicast address maps to.
    pub fn multicast_mac(&self) -> [u8; 6] {
        match self {
            IpmcAddr::V4(addr) => {
                let o = addr.octets();
                [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
            }
            IpmcAddr::V6(addr) => {
                let o = addr.octets();
                [0x33, 0x33, o[12], o[13], o[14], o[15]]
            }
        }
    }

    pub fn octets(&self) -> Vec<u8> {
        match self {
            IpmcAddr::V4(addr) => addr.octets().to_vec(),
            IpmcAddr::V6(addr) => addr.octets().to_vec(),
        }
    }

    pub fn from_slice(family: Family, data: &[u8]) -> Option<Self> {
        match family {
            Family::Ipv4 => {
                let octets: [u8; 4] = data.get(..4)?.try_into().ok()?;
                Some(IpmcAddr::V4(octets.into()))
            }
            Family::Ipv6 => {
                let octets: [u8; 16] = data.get(..16)?.try_into().ok()?;
                Some(IpmcAddr::V6(octets.into()))
            }
        }
    }

    fn bits(&self) -> u128 {
        match self {
            IpmcAddr::V4(addr) => u32::from(*addr) as u128,
            IpmcAddr::V6(addr) => u128::from(*addr),
        }
    }

    fn family_mask(&self) -> u128 {
        match self {
            IpmcAddr::V4(_) => u32::MAX as u128,
            IpmcAddr::V6(_) => u128::MAX,
        }
    }

    fn from_bits(family: Family, bits: u128) -> Self {
        match family {
            Family::Ipv4 => IpmcAddr::V4(Ipv4Addr::from(bits as u32)),
            Family::Ipv6 => IpmcAddr::V6(Ipv6Addr::from(bits)),
        }
    }

    fn assert_same_family(&self, other: &IpmcAddr) {
        assert_eq!(self.family(), other.family(), "address family mismatch: {} vs {}", self, other);
    }
}

impl std::ops::Not for IpmcAddr {
    type Output = IpmcAddr;

    fn not(self) -> Self::Output {
        Self::from_bits(self.family(), !self.bits() & self.family_mask())
    }
}

impl std::ops::BitAnd for IpmcAddr {
    type Output = IpmcAddr;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.mask(&rhs)
    }
}

impl PartialOrd for IpmcAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IpmcAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.assert_same_family(other);
        self.bits().cmp(&other.bits())
    }
}

impl std::fmt::Display for IpmcAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            IpmcAddr::V4(addr) => write!(f, "{}", addr),
            IpmcAddr::V6(addr) => write!(f, "{}", addr),
        }
    }
}

impl From<Ipv4Addr> for IpmcAddr {
    fn from(addr: Ipv4Addr) -> Self {
        IpmcAddr::V4(addr)
    }
}

impl From<Ipv6Addr> for IpmcAddr {
    fn from(addr: Ipv6Addr) -> Self {
        IpmcAddr::V6(addr)
    }
}

impl From<std::net::IpAddr> for IpmcAddr {
    fn from(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(addr) => IpmcAddr::V4(addr),
            std::net::IpAddr::V6(addr) => IpmcAddr::V6(addr),
        }
    }
}

impl std::str::FromStr for IpmcAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<std::net::IpAddr>().map(IpmcAddr::from)
    }
}

/// IPv6 link-local address derived from a MAC address (modified EUI-64).
pub fn link_local_from_mac(mac: &[u8; 6]) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o[0] = 0xfe;
    o[1] = 0x80;
    o[8] = mac[0] ^ 0x02;
    o[9] = mac[1];
    o[10] = mac[2];
    o[11] = 0xff;
    o[12] = 0xfe;
    o[13] = mac[3];
    o[14] = mac[4];
    o[15] = mac[5];
    Ipv6Addr::from(o)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpmcAddr {
        s.parse().unwrap()
    }

    #[test]
    fn classification() {
        assert!(v4("239.1.1.1").is_multicast());
        assert!(!v4("239.1.1.1").is_unicast());
        assert!(v4("10.0.0.1").is_unicast());
        assert!(!v4("0.0.0.0").is_unicast());
        assert!(!v4("255.255.255.255").is_unicast());
        assert!(v4("224.0.0.251").is_reserved_group());
        assert!(!v4("224.0.1.1").is_reserved_group());
        assert!(v4("ff02::2").is_reserved_group());
        assert!(!v4("ff02::16").is_reserved_group());
        assert!(v4("fe80::1").is_link_local());
        assert!(!v4("2001:db8::1").is_link_local());
    }

    #[test]
    fn successor_wraps_within_family() {
        assert_eq!(v4("255.255.255.255").successor(), v4("0.0.0.0"));
        assert_eq!(v4("0.0.0.0").predecessor(), v4("255.255.255.255"));
        assert_eq!(v4("10.0.0.255").successor(), v4("10.0.1.0"));
        assert_eq!(v4("::").predecessor(), v4("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"));
    }

    #[test]
    fn masks() {
        assert_eq!(IpmcAddr::prefix_mask(Family::Ipv4, 8), v4("255.0.0.0"));
        assert_eq!(IpmcAddr::prefix_mask(Family::Ipv4, 0), v4("0.0.0.0"));
        assert_eq!(IpmcAddr::prefix_mask(Family::Ipv6, 32), v4("ffff:ffff::"));
        assert_eq!(!v4("255.0.0.0"), v4("0.255.255.255"));
        assert_eq!(v4("232.1.2.3") & v4("255.0.0.0"), v4("232.0.0.0"));
        assert!(v4("232.1.2.3").prefix_matches(&v4("232.0.0.0"), 8));
        assert!(!v4("239.1.2.3").prefix_matches(&v4("232.0.0.0"), 8));
        assert!(!v4("ff3e::1").prefix_matches(&v4("232.0.0.0"), 8));
    }

    #[test]
    fn multicast_mac_mapping() {
        assert_eq!(v4("239.129.1.2").multicast_mac(), [0x01, 0x00, 0x5e, 0x01, 0x01, 0x02]);
        assert_eq!(v4("ff02::1:ff00:1234").multicast_mac(), [0x33, 0x33, 0xff, 0x00, 0x12, 0x34]);
    }

    #[test]
    #[should_panic]
    fn cross_family_ordering_panics() {
        let _ = v4("10.0.0.1") < v4("::1");
    }

    #[test]
    fn eui64_link_local() {
        let addr = link_local_from_mac(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(addr, "fe80::211:22ff:fe33:4455".parse::<Ipv6Addr>().unwrap());
    }
}
