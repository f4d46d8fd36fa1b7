use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

/// OnionCat prefix used to tunnel Tor hidden-service ids as IPv6.
const ONION_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

/// The address family a service address belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetworkClass {
    IPv4,
    IPv6,
    Onion,
}

/// A masternode's advertised service endpoint.
///
/// Stored in wire form: a 16-byte IPv6(-mapped) address plus a port. IPv4
/// addresses use the `::ffff:a.b.c.d` mapping, onion addresses the OnionCat
/// range.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceAddress {
    pub ip: [u8; 16],
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(ip: [u8; 16], port: u16) -> Self {
        Self { ip, port }
    }

    pub fn network_class(&self) -> NetworkClass {
        if self.ip[..6] == ONION_PREFIX {
            NetworkClass::Onion
        } else if Ipv6Addr::from(self.ip).to_ipv4_mapped().is_some() {
            NetworkClass::IPv4
        } else {
            NetworkClass::IPv6
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let ip6 = Ipv6Addr::from(self.ip);
        if self.network_class() == NetworkClass::Onion {
            return None;
        }
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        Some(SocketAddr::new(ip, self.port))
    }

    /// RFC1918 private IPv4 space. Entries on these addresses are never
    /// served to peers.
    pub fn is_rfc1918(&self) -> bool {
        match Ipv6Addr::from(self.ip).to_ipv4_mapped() {
            Some(ip4) => ip4.is_private(),
            None => false,
        }
    }

    pub fn is_local(&self) -> bool {
        let ip6 = Ipv6Addr::from(self.ip);
        match ip6.to_ipv4_mapped() {
            Some(ip4) => ip4.is_loopback() || ip4.is_unspecified(),
            None => ip6.is_loopback() || ip6.is_unspecified(),
        }
    }
}

impl From<SocketAddr> for ServiceAddress {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
            IpAddr::V6(ip6) => ip6.octets(),
        };
        Self {
            ip,
            port: addr.port(),
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "onion:{}", self.port),
        }
    }
}

impl Encodable for ServiceAddress {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.ip);
        encoder.write_bytes(&self.port.to_be_bytes());
    }
}

impl Decodable for ServiceAddress {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let ip = decoder.read_fixed::<16>()?;
        let port_bytes = decoder.read_fixed::<2>()?;
        Ok(Self {
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}
