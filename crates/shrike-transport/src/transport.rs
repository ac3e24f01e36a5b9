//! The transport trait and its error type.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use async_trait::async_trait;

use crate::endpoint::RemoteEndpoint;

/// Transport layer errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport has been shut down
    #[error("transport is shut down")]
    Closed,

    /// Address binding failed
    #[error("failed to bind {addr}: {reason}")]
    BindFailed {
        /// The requested local address
        addr: SocketAddr,
        /// The OS-level cause
        reason: String,
    },

    /// Joining a multicast group failed
    #[error("failed to join multicast group {group}: {reason}")]
    MulticastJoin {
        /// The group address
        group: IpAddr,
        /// The OS-level cause
        reason: String,
    },
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A carrier of encoded datagrams, keyed by remote endpoint identity.
///
/// The endpoint layer owns one receive loop per transport and treats the
/// trait object as shared; implementations must be internally
/// synchronized.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short scheme-like name, also stamped into every
    /// [`RemoteEndpoint`] this transport produces.
    fn name(&self) -> &'static str;

    /// Send one datagram to `remote`.
    ///
    /// # Errors
    ///
    /// `Closed` after shutdown, `Io` on socket failure.
    async fn send_to(&self, buf: &[u8], remote: &RemoteEndpoint) -> TransportResult<usize>;

    /// Receive one datagram. Returns the size, the sender identity and
    /// the arrival timestamp.
    ///
    /// # Errors
    ///
    /// `Closed` after shutdown, `Io` on socket failure.
    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> TransportResult<(usize, RemoteEndpoint, Instant)>;

    /// The local addresses this transport answers on.
    ///
    /// # Errors
    ///
    /// `Io` when the socket cannot report its address.
    fn local_addrs(&self) -> TransportResult<Vec<SocketAddr>>;

    /// Whether this transport carries traffic for `scheme` towards
    /// `host`. The endpoint layer asks its transports in priority order
    /// and dispatches to the first claimant.
    fn claims(&self, scheme: &str, host: IpAddr) -> bool;

    /// Stop the transport. Subsequent operations return `Closed`.
    ///
    /// # Errors
    ///
    /// `Io` if releasing resources fails.
    async fn shutdown(&self) -> TransportResult<()>;

    /// True once [`shutdown`](Self::shutdown) has run.
    fn is_shutdown(&self) -> bool;
}
