//! Client-side request tracking: the pending-request table, response
//! matching, observation freshness and the public [`RequestHandle`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shrike_msg::{Message, OptionNumber, Token};
use shrike_oscore::{RequestAssociation, SecurityContext};
use shrike_transport::RemoteEndpoint;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// Observe values older than this are fresh again regardless of the
/// counter comparison (RFC 7641 §3.4).
const FRESHNESS_FALLBACK: Duration = Duration::from_secs(128);

/// Response options the client itself understands; any *other* critical
/// option in a response fails the request with `BadOption`.
const HANDLED_RESPONSE_OPTIONS: &[OptionNumber] = &[
    OptionNumber::IF_MATCH,
    OptionNumber::ETAG,
    OptionNumber::OBSERVE,
    OptionNumber::OSCORE,
    OptionNumber::LOCATION_PATH,
    OptionNumber::CONTENT_FORMAT,
    OptionNumber::MAX_AGE,
    OptionNumber::LOCATION_QUERY,
    OptionNumber::BLOCK2,
    OptionNumber::BLOCK1,
    OptionNumber::SIZE2,
    OptionNumber::SIZE1,
    OptionNumber::ECHO,
];

/// Client-side observation bookkeeping.
struct ObserveState {
    last_value: Option<u32>,
    last_seen: Instant,
}

/// One outstanding request.
struct PendingRequest {
    response_tx: Option<oneshot::Sender<Result<Message, Error>>>,
    notify_tx: Option<mpsc::UnboundedSender<Message>>,
    observe: Option<ObserveState>,
    security: Option<(Arc<Mutex<SecurityContext>>, RequestAssociation)>,
}

/// Verdict of routing an incoming response.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RouteVerdict {
    /// Delivered to a pending request (or filtered by freshness, which
    /// still consumes the message).
    Delivered,
    /// Nothing was waiting on this (remote, token).
    Unmatched,
}

/// The pending-request table.
pub(crate) struct RequestLayer {
    pending: Mutex<HashMap<(RemoteEndpoint, Token), PendingRequest>>,
    /// Multicast requests are keyed by token alone: the answers come
    /// from unicast remotes the request never named.
    multicast: Mutex<HashMap<Token, PendingRequest>>,
}

/// Channels backing a freshly registered request.
pub(crate) struct Registration {
    pub(crate) response_rx: oneshot::Receiver<Result<Message, Error>>,
    pub(crate) notify_rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl RequestLayer {
    pub(crate) fn new() -> Self {
        RequestLayer {
            pending: Mutex::new(HashMap::new()),
            multicast: Mutex::new(HashMap::new()),
        }
    }

    /// True when `token` is outstanding towards `remote`.
    pub(crate) fn token_in_use(&self, remote: &RemoteEndpoint, token: &Token) -> bool {
        self.pending
            .lock()
            .expect("request layer lock")
            .contains_key(&(remote.clone(), *token))
            || self
                .multicast
                .lock()
                .expect("request layer lock")
                .contains_key(token)
    }

    /// Register a request and hand back its channels. `observing` opens
    /// the notification stream alongside the single-response future.
    pub(crate) fn register(
        &self,
        remote: &RemoteEndpoint,
        token: Token,
        observing: bool,
        security: Option<(Arc<Mutex<SecurityContext>>, RequestAssociation)>,
    ) -> Registration {
        let (response_tx, response_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = if observing {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let entry = PendingRequest {
            response_tx: Some(response_tx),
            notify_tx,
            observe: observing.then(|| ObserveState {
                last_value: None,
                last_seen: Instant::now(),
            }),
            security,
        };
        self.pending
            .lock()
            .expect("request layer lock")
            .insert((remote.clone(), token), entry);

        Registration {
            response_rx,
            notify_rx,
        }
    }

    /// Register a request sent to a multicast group: any number of
    /// unicast responses share the token. The first resolves the
    /// response future, the rest flow through the notification stream.
    pub(crate) fn register_multicast(&self, token: Token) -> Registration {
        let (response_tx, response_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        self.multicast.lock().expect("request layer lock").insert(
            token,
            PendingRequest {
                response_tx: Some(response_tx),
                notify_tx: Some(notify_tx),
                observe: None,
                security: None,
            },
        );
        Registration {
            response_rx,
            notify_rx: Some(notify_rx),
        }
    }

    /// Forget a multicast request.
    pub(crate) fn remove_multicast(&self, token: &Token) {
        self.multicast
            .lock()
            .expect("request layer lock")
            .remove(token);
    }

    /// Route a decoded response to its pending request, unprotecting,
    /// validating options and applying the observe freshness rule.
    pub(crate) fn route_response(
        &self,
        remote: &RemoteEndpoint,
        message: Message,
        arrived: Instant,
    ) -> RouteVerdict {
        let key = (remote.clone(), message.token);
        let mut pending = self.pending.lock().expect("request layer lock");
        if !pending.contains_key(&key) {
            drop(pending);
            return self.route_multicast(remote, message);
        }
        let Some(entry) = pending.get_mut(&key) else {
            return RouteVerdict::Unmatched;
        };

        let message = match unprotect_if_needed(entry, message) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%remote, %error, "failing request on security error");
                if let Some(tx) = entry.response_tx.take() {
                    let _ = tx.send(Err(error));
                }
                pending.remove(&key);
                return RouteVerdict::Delivered;
            }
        };

        if let Some(number) = message
            .options
            .unknown_critical(HANDLED_RESPONSE_OPTIONS)
            .next()
        {
            tracing::warn!(%remote, option = number.0, "critical option in response");
            if let Some(tx) = entry.response_tx.take() {
                let _ = tx.send(Err(Error::BadOption(number.0)));
            }
            pending.remove(&key);
            return RouteVerdict::Delivered;
        }

        if !message.code.is_response() {
            if let Some(tx) = entry.response_tx.take() {
                let _ = tx.send(Err(Error::NotAResponse(message.code)));
            }
            pending.remove(&key);
            return RouteVerdict::Delivered;
        }

        // Observation: filter stale notifications, then deliver to the
        // single-response slot first and the stream afterwards.
        if let Some(observe) = entry.observe.as_mut() {
            if let Ok(Some(value)) = message.options.get_uint(OptionNumber::OBSERVE) {
                let value = (value & 0x00FF_FFFF) as u32;
                if !is_fresher(observe, value, arrived) {
                    tracing::debug!(%remote, value, "dropping stale notification");
                    return RouteVerdict::Delivered;
                }
                observe.last_value = Some(value);
                observe.last_seen = arrived;
            }
        }

        if let Some(tx) = entry.response_tx.take() {
            let _ = tx.send(Ok(message));
            // Non-observing requests are done after the single response.
            if entry.notify_tx.is_none() {
                pending.remove(&key);
            }
        } else if let Some(tx) = &entry.notify_tx {
            if tx.send(message).is_err() {
                // stream consumer gone; forget the observation
                pending.remove(&key);
            }
        } else {
            pending.remove(&key);
        }
        RouteVerdict::Delivered
    }

    /// Resolve one request with an error.
    pub(crate) fn fail(&self, remote: &RemoteEndpoint, token: &Token, error: Error) {
        let mut pending = self.pending.lock().expect("request layer lock");
        if let Some(mut entry) = pending.remove(&(remote.clone(), *token)) {
            if let Some(tx) = entry.response_tx.take() {
                let _ = tx.send(Err(error));
            }
        }
    }

    /// Remove a request without resolving it (cancellation after the
    /// channels are already being torn down).
    pub(crate) fn remove(&self, remote: &RemoteEndpoint, token: &Token) {
        self.pending
            .lock()
            .expect("request layer lock")
            .remove(&(remote.clone(), *token));
    }

    /// Fail everything, for shutdown.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("request layer lock");
        for (_, mut entry) in pending.drain() {
            if let Some(tx) = entry.response_tx.take() {
                let _ = tx.send(Err(Error::LibraryShutdown));
            }
        }
        drop(pending);
        let mut multicast = self.multicast.lock().expect("request layer lock");
        for (_, mut entry) in multicast.drain() {
            if let Some(tx) = entry.response_tx.take() {
                let _ = tx.send(Err(Error::LibraryShutdown));
            }
        }
    }

    /// Deliver a unicast answer to a multicast request, if one is
    /// waiting on this token.
    fn route_multicast(&self, remote: &RemoteEndpoint, message: Message) -> RouteVerdict {
        let mut multicast = self.multicast.lock().expect("request layer lock");
        let Some(entry) = multicast.get_mut(&message.token) else {
            return RouteVerdict::Unmatched;
        };
        if !message.code.is_response() {
            return RouteVerdict::Unmatched;
        }
        tracing::debug!(%remote, "multicast leg answered");
        if let Some(tx) = entry.response_tx.take() {
            let _ = tx.send(Ok(message));
        } else if let Some(tx) = &entry.notify_tx {
            let _ = tx.send(message);
        }
        RouteVerdict::Delivered
    }
}

fn unprotect_if_needed(entry: &PendingRequest, message: Message) -> Result<Message, Error> {
    match &entry.security {
        None => Ok(message),
        Some((context, assoc)) => {
            let mut context = context.lock().expect("security context lock");
            Ok(context.unprotect_response(&message, assoc)?)
        }
    }
}

/// RFC 7641 §3.4 freshness: counter comparison in 24-bit serial-number
/// space, with a wall-clock escape hatch.
fn is_fresher(state: &ObserveState, incoming: u32, arrived: Instant) -> bool {
    let Some(last) = state.last_value else {
        return true;
    };
    let v1 = i64::from(last);
    let v2 = i64::from(incoming);
    (v1 < v2 && v2 - v1 < (1 << 23))
        || (v1 > v2 && v1 - v2 > (1 << 23))
        || arrived.duration_since(state.last_seen) > FRESHNESS_FALLBACK
}

/// Handle on an outstanding request.
///
/// `response()` resolves with the final (or first, for observations)
/// response; `next_notification()` yields further notifications for
/// requests sent with Observe = 0; `cancel()` tears the request down.
#[derive(Debug)]
pub struct RequestHandle {
    pub(crate) response_rx: Option<oneshot::Receiver<Result<Message, Error>>>,
    pub(crate) notify_rx: Option<mpsc::UnboundedReceiver<Message>>,
    pub(crate) cancel_tx: Option<oneshot::Sender<()>>,
    pub(crate) token: Token,
}

impl RequestHandle {
    /// Await the response.
    ///
    /// # Errors
    ///
    /// Whatever failed the exchange: `RequestTimedOut`, `ResetReceived`,
    /// `RequestCancelled`, `LibraryShutdown`, security or network
    /// errors.
    pub async fn response(&mut self) -> Result<Message, Error> {
        match self.response_rx.take() {
            Some(rx) => rx.await.map_err(|_| Error::LibraryShutdown)?,
            None => Err(Error::RequestCancelled),
        }
    }

    /// Next observation notification; `None` once the stream ended or
    /// for requests that did not observe.
    pub async fn next_notification(&mut self) -> Option<Message> {
        match self.notify_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// The token this request runs under.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Cancel the request: stop retransmission, deregister an
    /// observation (Observe = 1 towards the server) and resolve the
    /// response future with `RequestCancelled`.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}
