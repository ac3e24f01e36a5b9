//! # shrike-transport
//!
//! Datagram transports for the shrike CoAP stack.
//!
//! The [`Transport`] trait abstracts over carriers of encoded datagrams
//! keyed by a [`RemoteEndpoint`] identity. The endpoint layer composes
//! several transports in a priority list and routes outgoing messages to
//! the first one that claims the target URI scheme and address.
//!
//! Implementations:
//! - [`UdpTransport`]: unicast UDP over IPv4 or IPv6, built through
//!   `socket2` for buffer sizing and multicast group membership
//! - [`LoopbackTransport`]: an in-process pair with programmable packet
//!   loss and duplication, used by the endpoint scenario tests

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod endpoint;
pub mod loopback;
pub mod transport;
pub mod udp;

pub use endpoint::RemoteEndpoint;
pub use loopback::LoopbackTransport;
pub use transport::{Transport, TransportError, TransportResult};
pub use udp::UdpTransport;

/// IPv6 link-local "All CoAP Nodes" group.
pub const COAP_MULTICAST_V6_LINK_LOCAL: &str = "ff02::fd";

/// IPv6 site-local "All CoAP Nodes" group.
pub const COAP_MULTICAST_V6_SITE_LOCAL: &str = "ff05::fd";

/// IPv4 "All CoAP Nodes" group.
pub const COAP_MULTICAST_V4: &str = "224.0.1.187";

/// A UDP payload bound conservatively below the IPv6 minimum MTU.
pub const MAX_DATAGRAM_SIZE: usize = 1152;
