//! UDP transport over IPv4 or IPv6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::endpoint::RemoteEndpoint;
use crate::transport::{Transport, TransportError, TransportResult};
use crate::{COAP_MULTICAST_V4, COAP_MULTICAST_V6_LINK_LOCAL, COAP_MULTICAST_V6_SITE_LOCAL};

const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Unicast (and optionally multicast-listening) UDP transport.
///
/// The socket is built through `socket2` so buffer sizes and group
/// memberships can be set before it is handed to Tokio.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Bind a unicast socket on `addr`.
    ///
    /// # Errors
    ///
    /// `BindFailed` when socket construction or binding fails.
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let socket = build_socket(addr)?;
        Ok(UdpTransport {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind a server socket on `addr` and join the CoAP "All Nodes"
    /// multicast groups: ff02::fd on each interface index in
    /// `interfaces` (0 meaning the default), ff05::fd, and 224.0.1.187
    /// for IPv4 sockets.
    ///
    /// # Errors
    ///
    /// `BindFailed` on socket errors; `MulticastJoin` when a group
    /// cannot be joined.
    pub async fn bind_multicast(
        addr: SocketAddr,
        interfaces: &[u32],
    ) -> TransportResult<Self> {
        let socket = build_socket(addr)?;

        match addr {
            SocketAddr::V6(_) => {
                let link_local: Ipv6Addr = COAP_MULTICAST_V6_LINK_LOCAL
                    .parse()
                    .expect("well-known group");
                let site_local: Ipv6Addr = COAP_MULTICAST_V6_SITE_LOCAL
                    .parse()
                    .expect("well-known group");
                let indexes: &[u32] = if interfaces.is_empty() {
                    &[0]
                } else {
                    interfaces
                };
                for &index in indexes {
                    socket.join_multicast_v6(&link_local, index).map_err(|e| {
                        TransportError::MulticastJoin {
                            group: IpAddr::V6(link_local),
                            reason: e.to_string(),
                        }
                    })?;
                }
                socket.join_multicast_v6(&site_local, 0).map_err(|e| {
                    TransportError::MulticastJoin {
                        group: IpAddr::V6(site_local),
                        reason: e.to_string(),
                    }
                })?;
            }
            SocketAddr::V4(_) => {
                let group: Ipv4Addr = COAP_MULTICAST_V4.parse().expect("well-known group");
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| TransportError::MulticastJoin {
                        group: IpAddr::V4(group),
                        reason: e.to_string(),
                    })?;
            }
        }

        tracing::debug!(local = %addr, "joined CoAP multicast groups");
        Ok(UdpTransport {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// socket2 construction: buffer sizes, v6-only off where supported, then
/// conversion into a Tokio socket.
fn build_socket(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let bind_failed = |e: std::io::Error| TransportError::BindFailed {
        addr,
        reason: e.to_string(),
    };

    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_failed)?;

    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(bind_failed)?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(bind_failed)?;
    if addr.is_ipv6() {
        // Dual-stack where the platform allows it; failure keeps the
        // socket v6-only.
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;

    UdpSocket::from_std(socket.into()).map_err(bind_failed)
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn send_to(&self, buf: &[u8], remote: &RemoteEndpoint) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let sent = self.socket.send_to(buf, remote.socket_addr()).await?;
        tracing::trace!(%remote, bytes = sent, "datagram sent");
        Ok(sent)
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> TransportResult<(usize, RemoteEndpoint, Instant)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let (size, from) = self.socket.recv_from(buf).await?;
        let remote = RemoteEndpoint::from_socket_addr(self.name(), from);
        tracing::trace!(%remote, bytes = size, "datagram received");
        Ok((size, remote, Instant::now()))
    }

    fn local_addrs(&self) -> TransportResult<Vec<SocketAddr>> {
        Ok(vec![self.socket.local_addr()?])
    }

    fn claims(&self, scheme: &str, host: IpAddr) -> bool {
        if scheme != "coap" {
            return false;
        }
        match self.socket.local_addr() {
            // A v6 socket reaches v4 peers through the dual-stack
            // mapping; a v4 socket only reaches v4.
            Ok(local) => local.is_ipv6() || host.is_ipv4(),
            Err(_) => false,
        }
    }

    async fn shutdown(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addrs = transport.local_addrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let server = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let server_endpoint =
            RemoteEndpoint::from_socket_addr("udp", server.local_addrs().unwrap()[0]);
        client.send_to(b"coap bytes", &server_endpoint).await.unwrap();

        let mut buf = vec![0u8; 1500];
        let (size, from, _when) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(&buf[..size], b"coap bytes");
        assert_eq!(from.socket_addr(), client.local_addrs().unwrap()[0]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_io() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        transport.shutdown().await.unwrap();
        assert!(transport.is_shutdown());

        let remote = RemoteEndpoint::from_socket_addr("udp", "127.0.0.1:9".parse().unwrap());
        assert!(matches!(
            transport.send_to(b"x", &remote).await,
            Err(TransportError::Closed)
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            transport.recv_from(&mut buf).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_claims_scheme_and_family() {
        let v4 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(v4.claims("coap", "192.0.2.1".parse().unwrap()));
        assert!(!v4.claims("coap", "2001:db8::1".parse().unwrap()));
        assert!(!v4.claims("coaps", "192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_multicast_bind_v4() {
        // Joining 224.0.1.187 on the wildcard interface must succeed on
        // a plain IPv4 socket.
        let transport =
            UdpTransport::bind_multicast("0.0.0.0:0".parse().unwrap(), &[])
                .await
                .unwrap();
        assert!(!transport.is_shutdown());
    }
}
