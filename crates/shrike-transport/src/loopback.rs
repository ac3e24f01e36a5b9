//! In-process transport pair for tests.
//!
//! Two [`LoopbackTransport`] halves are connected by unbounded channels.
//! Each half can be told to drop or duplicate its next outgoing
//! datagrams, which is how the endpoint scenario tests exercise
//! retransmission and deduplication without real sockets or clock
//! dependence on the network.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::endpoint::RemoteEndpoint;
use crate::transport::{Transport, TransportError, TransportResult};

/// One half of an in-process transport pair.
pub struct LoopbackTransport {
    local: RemoteEndpoint,
    peer: RemoteEndpoint,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    drop_outbound: AtomicU32,
    duplicate_outbound: AtomicU32,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// Create a connected pair. The first half answers on port 11111,
    /// the second on 22222, both on 127.0.0.1.
    #[must_use]
    pub fn pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let a_endpoint = endpoint(11111);
        let b_endpoint = endpoint(22222);
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Arc::new(LoopbackTransport {
            local: a_endpoint.clone(),
            peer: b_endpoint.clone(),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            drop_outbound: AtomicU32::new(0),
            duplicate_outbound: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(LoopbackTransport {
            local: b_endpoint,
            peer: a_endpoint,
            tx: b_tx,
            rx: Mutex::new(b_rx),
            drop_outbound: AtomicU32::new(0),
            duplicate_outbound: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }

    /// The identity of the other half, as this half addresses it.
    #[must_use]
    pub fn peer_endpoint(&self) -> RemoteEndpoint {
        self.peer.clone()
    }

    /// The identity of this half.
    #[must_use]
    pub fn local_endpoint(&self) -> RemoteEndpoint {
        self.local.clone()
    }

    /// Silently discard the next `count` outgoing datagrams.
    pub fn drop_next_outbound(&self, count: u32) {
        self.drop_outbound.fetch_add(count, Ordering::Relaxed);
    }

    /// Deliver the next `count` outgoing datagrams twice.
    pub fn duplicate_next_outbound(&self, count: u32) {
        self.duplicate_outbound.fetch_add(count, Ordering::Relaxed);
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
    }
}

fn endpoint(port: u16) -> RemoteEndpoint {
    RemoteEndpoint {
        transport: "loopback",
        addr: IpAddr::V4([127, 0, 0, 1].into()),
        port,
        zone: None,
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn send_to(&self, buf: &[u8], _remote: &RemoteEndpoint) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if Self::consume(&self.drop_outbound) {
            tracing::trace!(bytes = buf.len(), "loopback dropping datagram");
            return Ok(buf.len());
        }
        let duplicate = Self::consume(&self.duplicate_outbound);

        self.tx
            .send(buf.to_vec())
            .map_err(|_| TransportError::Closed)?;
        if duplicate {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(buf.len())
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> TransportResult<(usize, RemoteEndpoint, Instant)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let datagram = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        let size = datagram.len().min(buf.len());
        buf[..size].copy_from_slice(&datagram[..size]);
        Ok((size, self.peer.clone(), Instant::now()))
    }

    fn local_addrs(&self) -> TransportResult<Vec<SocketAddr>> {
        Ok(vec![self.local.socket_addr()])
    }

    fn claims(&self, scheme: &str, _host: IpAddr) -> bool {
        scheme == "coap"
    }

    async fn shutdown(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
