use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use crate::ShaperError;

/// Maps IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) back to IPv4, so dual-stack
/// listeners match IPv4 subnets.
pub trait IpAddrExt {
    fn canonical(&self) -> IpAddr;
}

impl IpAddrExt for IpAddr {
    fn canonical(&self) -> IpAddr {
        match self {
            Self::V6(v6) => v6.to_ipv4_mapped().map_or(*self, IpAddr::V4),
            Self::V4(_) => *self,
        }
    }
}

/// A network prefix, e.g. `10.0.0.0/8` or `fd00::/8`.
///
/// The address is always stored masked to the prefix length, so two spellings of the
/// same network (`127.0.0.1/24`, `127.0.0.0/24`) compare equal and print the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    address: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Returns `None` if `prefix_len` is longer than the address.
    pub fn new(address: IpAddr, prefix_len: u8) -> Option<Self> {
        let address = match address {
            IpAddr::V4(v4) if prefix_len <= 32 => {
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix_len)))
            }
            IpAddr::V6(v6) if prefix_len <= 128 => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix_len)))
            }
            _ => return None,
        };

        Some(Self { address, prefix_len })
    }

    #[inline]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    #[inline]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns `true` if `ip` lies inside this network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip.canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }
}

#[inline]
fn v4_mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

#[inline]
fn v6_mask(prefix_len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0)
}

impl FromStr for Subnet {
    type Err = ShaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ShaperError::InvalidCidr(s.to_owned());

        let (address, prefix_len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address = address.parse::<IpAddr>().map_err(|_| invalid())?;
        // Reject signs and whitespace that u8::from_str would otherwise accept.
        if prefix_len.is_empty() || !prefix_len.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let prefix_len = prefix_len.parse::<u8>().map_err(|_| invalid())?;

        Self::new(address, prefix_len).ok_or_else(invalid)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}
