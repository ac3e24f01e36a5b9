//! Remote endpoint identity.

use core::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// The identity a datagram came from or goes to.
///
/// Deduplication and exchange correlation key on this tuple; two
/// endpoints are the same peer iff every field matches, including the
/// zone index a link-local IPv6 address needs to be routable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteEndpoint {
    /// Name of the transport that carries this peer
    pub transport: &'static str,
    /// Network address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
    /// IPv6 zone index for link-local scopes
    pub zone: Option<u32>,
}

impl RemoteEndpoint {
    /// Build from a socket address, keeping a nonzero IPv6 scope id as
    /// the zone.
    #[must_use]
    pub fn from_socket_addr(transport: &'static str, addr: SocketAddr) -> Self {
        let zone = match addr {
            SocketAddr::V6(v6) if v6.scope_id() != 0 => Some(v6.scope_id()),
            _ => None,
        };
        RemoteEndpoint {
            transport,
            addr: addr.ip(),
            port: addr.port(),
            zone,
        }
    }

    /// The socket address to hand to the OS, zone restored.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        match self.addr {
            IpAddr::V4(v4) => SocketAddr::V4(SocketAddrV4::new(v4, self.port)),
            IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(
                v6,
                self.port,
                0,
                self.zone.unwrap_or(0),
            )),
        }
    }

    /// True for multicast destinations, which never get confirmable
    /// traffic or retransmission.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.addr.is_multicast()
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.zone) {
            (IpAddr::V6(addr), Some(zone)) => {
                write!(f, "{}:[{addr}%{zone}]:{}", self.transport, self.port)
            }
            (IpAddr::V6(addr), None) => {
                write!(f, "{}:[{addr}]:{}", self.transport, self.port)
            }
            (IpAddr::V4(addr), _) => write!(f, "{}:{addr}:{}", self.transport, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_over_all_fields() {
        let a = RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5683".parse().unwrap());
        let b = RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5683".parse().unwrap());
        let c = RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5684".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut d = a.clone();
        d.transport = "loopback";
        assert_ne!(a, d);
    }

    #[test]
    fn test_zone_distinguishes_endpoints() {
        let mut a =
            RemoteEndpoint::from_socket_addr("udp", "[fe80::1]:5683".parse().unwrap());
        let mut b = a.clone();
        a.zone = Some(1);
        b.zone = Some(2);
        assert_ne!(a, b);
        // zone survives the round trip to a socket address
        assert_eq!(
            RemoteEndpoint::from_socket_addr("udp", a.socket_addr()),
            a
        );
    }

    #[test]
    fn test_multicast_detection() {
        let multicast =
            RemoteEndpoint::from_socket_addr("udp", "[ff02::fd]:5683".parse().unwrap());
        let unicast =
            RemoteEndpoint::from_socket_addr("udp", "[2001:db8::1]:5683".parse().unwrap());
        assert!(multicast.is_multicast());
        assert!(!unicast.is_multicast());
    }

    #[test]
    fn test_display() {
        let v4 = RemoteEndpoint::from_socket_addr("udp", "203.0.113.9:5683".parse().unwrap());
        assert_eq!(v4.to_string(), "udp:203.0.113.9:5683");
    }
}
