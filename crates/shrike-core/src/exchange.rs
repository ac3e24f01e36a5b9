//! The message layer: reliable delivery of single datagrams.
//!
//! Outbound CONs get a per-remote message ID, a jittered exponential
//! retransmission schedule and an NSTART gate; inbound CONs are
//! deduplicated by (remote, message ID) with the emitted reply cached
//! for the exchange lifetime. Token-level correlation is explicitly not
//! this layer's business.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use shrike_msg::{Message, MessageId};
use shrike_transport::{RemoteEndpoint, Transport};
use tokio::sync::{oneshot, Semaphore};
use tokio::time::sleep;

use crate::config::TransmissionParameters;
use crate::error::Error;

/// How a confirmable exchange ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExchangeOutcome {
    /// The peer acknowledged; a piggybacked response travels separately
    /// through the request layer.
    Acked,
    /// The peer rejected with RST.
    Reset,
}

/// What to do with an arriving CON.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DedupVerdict {
    /// First sighting; process it.
    New,
    /// Duplicate of a CON still being processed; drop silently.
    DuplicateDrop,
    /// Duplicate of an answered CON; re-emit these bytes.
    DuplicateReply(Vec<u8>),
}

struct DedupEntry {
    reply: Option<Vec<u8>>,
    inserted: Instant,
}

struct LayerState {
    mid_counters: HashMap<RemoteEndpoint, MessageId>,
    exchanges: HashMap<(RemoteEndpoint, u16), oneshot::Sender<ExchangeOutcome>>,
    dedup: HashMap<(RemoteEndpoint, u16), DedupEntry>,
    nstart: HashMap<RemoteEndpoint, Arc<Semaphore>>,
}

/// Message-layer state shared by every transport's receive loop and all
/// request drivers.
pub(crate) struct MessageLayer {
    params: TransmissionParameters,
    state: Mutex<LayerState>,
    /// Retransmissions performed, for diagnostics
    retransmissions: AtomicU64,
}

impl MessageLayer {
    pub(crate) fn new(params: TransmissionParameters) -> Self {
        MessageLayer {
            params,
            state: Mutex::new(LayerState {
                mid_counters: HashMap::new(),
                exchanges: HashMap::new(),
                dedup: HashMap::new(),
                nstart: HashMap::new(),
            }),
            retransmissions: AtomicU64::new(0),
        }
    }

    /// Allocate the next message ID towards `remote`. Counters start at
    /// a random point and wrap.
    pub(crate) fn next_mid(&self, remote: &RemoteEndpoint) -> MessageId {
        let mut state = self.state.lock().expect("message layer lock");
        let counter = state
            .mid_counters
            .entry(remote.clone())
            .or_insert_with(|| MessageId(rand::thread_rng().gen()));
        let mid = *counter;
        *counter = counter.next();
        mid
    }

    /// Send a CON and drive its retransmission until ACK, RST,
    /// exhaustion or transport failure.
    ///
    /// Holds one NSTART permit towards `remote` for the whole exchange.
    pub(crate) async fn transmit_reliable(
        &self,
        transport: &Arc<dyn Transport>,
        remote: &RemoteEndpoint,
        message: &Message,
    ) -> Result<ExchangeOutcome, Error> {
        let key = (remote.clone(), message.mid.0);
        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let semaphore = {
            let mut state = self.state.lock().expect("message layer lock");
            state.exchanges.insert(key.clone(), outcome_tx);
            state
                .nstart
                .entry(remote.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.params.nstart)))
                .clone()
        };
        let _guard = ExchangeGuard { layer: self, key };
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::LibraryShutdown)?;

        let bytes = message.encode();
        let mut timeout = self.initial_timeout();
        let mut retransmission = 0;

        loop {
            transport.send_to(&bytes, remote).await?;
            tokio::select! {
                outcome = &mut outcome_rx => {
                    return outcome.map_err(|_| Error::LibraryShutdown);
                }
                () = sleep(timeout) => {
                    if retransmission >= self.params.max_retransmit {
                        tracing::debug!(%remote, mid = %message.mid, "retransmissions exhausted");
                        return Err(Error::RequestTimedOut);
                    }
                    retransmission += 1;
                    timeout *= 2;
                    self.retransmissions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        %remote,
                        mid = %message.mid,
                        retransmission,
                        "retransmitting CON"
                    );
                }
            }
        }
    }

    /// Send a NON, ACK or RST exactly once.
    pub(crate) async fn transmit_once(
        &self,
        transport: &Arc<dyn Transport>,
        remote: &RemoteEndpoint,
        message: &Message,
    ) -> Result<(), Error> {
        transport.send_to(&message.encode(), remote).await?;
        Ok(())
    }

    /// Route an incoming ACK or RST to its exchange. Returns false when
    /// no exchange was waiting on this (remote, mid).
    pub(crate) fn resolve_exchange(
        &self,
        remote: &RemoteEndpoint,
        mid: MessageId,
        outcome: ExchangeOutcome,
    ) -> bool {
        let sender = {
            let mut state = self.state.lock().expect("message layer lock");
            state.exchanges.remove(&(remote.clone(), mid.0))
        };
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Classify an arriving CON against the deduplication cache and
    /// reserve its slot when new.
    pub(crate) fn dedup_check(&self, remote: &RemoteEndpoint, mid: MessageId) -> DedupVerdict {
        let lifetime = self.params.exchange_lifetime();
        let mut state = self.state.lock().expect("message layer lock");
        state
            .dedup
            .retain(|_, entry| entry.inserted.elapsed() < lifetime);

        match state.dedup.get(&(remote.clone(), mid.0)) {
            Some(DedupEntry {
                reply: Some(bytes), ..
            }) => DedupVerdict::DuplicateReply(bytes.clone()),
            Some(DedupEntry { reply: None, .. }) => DedupVerdict::DuplicateDrop,
            None => {
                state.dedup.insert(
                    (remote.clone(), mid.0),
                    DedupEntry {
                        reply: None,
                        inserted: Instant::now(),
                    },
                );
                DedupVerdict::New
            }
        }
    }

    /// Remember the reply emitted for a CON so duplicates re-trigger it.
    pub(crate) fn record_reply(&self, remote: &RemoteEndpoint, mid: MessageId, bytes: Vec<u8>) {
        let mut state = self.state.lock().expect("message layer lock");
        if let Some(entry) = state.dedup.get_mut(&(remote.clone(), mid.0)) {
            entry.reply = Some(bytes);
        }
    }

    /// Total retransmissions performed since construction.
    pub(crate) fn retransmission_count(&self) -> u64 {
        self.retransmissions.load(Ordering::Relaxed)
    }

    /// Fail every exchange still in flight, for shutdown.
    pub(crate) fn drain(&self) {
        let mut state = self.state.lock().expect("message layer lock");
        state.exchanges.clear();
        state.dedup.clear();
    }

    fn initial_timeout(&self) -> std::time::Duration {
        let factor = rand::thread_rng().gen_range(1.0..=self.params.ack_random_factor);
        self.params.ack_timeout.mul_f64(factor)
    }
}

/// Removes the exchange entry when the driving future is dropped or
/// finished without the ACK path having consumed it.
struct ExchangeGuard<'a> {
    layer: &'a MessageLayer,
    key: (RemoteEndpoint, u16),
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.layer.state.lock() {
            state.exchanges.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrike_msg::{Code, MessageType};
    use shrike_transport::LoopbackTransport;
    use std::time::Duration;

    fn layer() -> MessageLayer {
        MessageLayer::new(TransmissionParameters::default())
    }

    fn con(mid: u16) -> Message {
        Message::new(MessageType::Con, Code::GET, MessageId(mid))
    }

    #[test]
    fn test_mid_allocation_increments_per_remote() {
        let layer = layer();
        let a = RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5683".parse().unwrap());
        let b = RemoteEndpoint::from_socket_addr("udp", "192.0.2.2:5683".parse().unwrap());

        let a1 = layer.next_mid(&a);
        let a2 = layer.next_mid(&a);
        assert_eq!(a2.0, a1.0.wrapping_add(1));

        // independent counters per remote
        let b1 = layer.next_mid(&b);
        let a3 = layer.next_mid(&a);
        assert_eq!(a3.0, a1.0.wrapping_add(2));
        let _ = b1;
    }

    #[test]
    fn test_dedup_lifecycle() {
        let layer = layer();
        let remote = RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5683".parse().unwrap());

        assert_eq!(layer.dedup_check(&remote, MessageId(7)), DedupVerdict::New);
        // duplicate while processing
        assert_eq!(
            layer.dedup_check(&remote, MessageId(7)),
            DedupVerdict::DuplicateDrop
        );

        layer.record_reply(&remote, MessageId(7), vec![1, 2, 3]);
        assert_eq!(
            layer.dedup_check(&remote, MessageId(7)),
            DedupVerdict::DuplicateReply(vec![1, 2, 3])
        );

        // a different mid is fresh
        assert_eq!(layer.dedup_check(&remote, MessageId(8)), DedupVerdict::New);
    }

    #[tokio::test]
    async fn test_reliable_resolves_on_ack() {
        let layer = Arc::new(layer());
        let (a, b) = LoopbackTransport::pair();
        let transport: Arc<dyn Transport> = a.clone();
        let remote = a.peer_endpoint();

        let driver = {
            let layer = layer.clone();
            let remote = remote.clone();
            tokio::spawn(async move {
                layer.transmit_reliable(&transport, &remote, &con(42)).await
            })
        };

        // peer receives the CON, we resolve the exchange as the receive
        // loop would on a matching ACK
        let mut buf = [0u8; 128];
        let _ = b.recv_from(&mut buf).await.unwrap();
        // let the driver reach its select
        tokio::task::yield_now().await;
        assert!(layer.resolve_exchange(&remote, MessageId(42), ExchangeOutcome::Acked));

        let outcome = driver.await.unwrap().unwrap();
        assert_eq!(outcome, ExchangeOutcome::Acked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_retransmits_then_times_out() {
        let layer = Arc::new(layer());
        let (a, _b) = LoopbackTransport::pair();
        let transport: Arc<dyn Transport> = a.clone();
        let remote = a.peer_endpoint();

        let result = layer.transmit_reliable(&transport, &remote, &con(1)).await;
        assert!(matches!(result, Err(Error::RequestTimedOut)));
        // initial send + MAX_RETRANSMIT retransmissions
        assert_eq!(layer.retransmission_count(), 4);
    }

    #[tokio::test]
    async fn test_resolve_unknown_exchange_is_false() {
        let layer = layer();
        let remote = RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5683".parse().unwrap());
        assert!(!layer.resolve_exchange(&remote, MessageId(9), ExchangeOutcome::Reset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nstart_serializes_cons() {
        let layer = Arc::new(layer());
        let (a, b) = LoopbackTransport::pair();
        let transport: Arc<dyn Transport> = a.clone();
        let remote = a.peer_endpoint();

        // First CON occupies the single NSTART slot.
        let first = {
            let layer = layer.clone();
            let transport = transport.clone();
            let remote = remote.clone();
            tokio::spawn(
                async move { layer.transmit_reliable(&transport, &remote, &con(1)).await },
            )
        };
        tokio::task::yield_now().await;

        let second = {
            let layer = layer.clone();
            let transport = transport.clone();
            let remote = remote.clone();
            tokio::spawn(
                async move { layer.transmit_reliable(&transport, &remote, &con(2)).await },
            )
        };
        tokio::task::yield_now().await;

        // Only the first CON is on the wire.
        let mut buf = [0u8; 128];
        let (size, _, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(Message::decode(&buf[..size]).unwrap().mid, MessageId(1));

        assert!(layer.resolve_exchange(&remote, MessageId(1), ExchangeOutcome::Acked));
        first.await.unwrap().unwrap();

        // Slot freed; the second CON goes out now.
        let (_, _, _) = b.recv_from(&mut buf).await.unwrap();
        assert!(layer.resolve_exchange(&remote, MessageId(2), ExchangeOutcome::Acked));
        second.await.unwrap().unwrap();
    }
}
