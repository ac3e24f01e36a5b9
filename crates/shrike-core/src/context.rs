//! The endpoint façade.
//!
//! A [`Context`] owns the transports, the message layer, the pending-
//! request table, the site tree and the credential stores. One receive
//! task per transport decodes datagrams and dispatches them; outgoing
//! requests run in per-request driver tasks that handle OSCORE
//! protection, blockwise transfers and cancellation.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use shrike_msg::{BlockValue, Code, Message, MessageType, OptionNumber, Token};
use shrike_transport::{RemoteEndpoint, Transport, UdpTransport};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::block::{chunk, needs_block1, Block2Assembly, UploadTracker};
use crate::client::{RequestHandle, RequestLayer};
use crate::config::EndpointConfig;
use crate::credentials::{ClientCredentials, ServerCredentials};
use crate::error::Error;
use crate::exchange::{DedupVerdict, ExchangeOutcome, MessageLayer};
use crate::link_format::WellKnownCore;
use crate::observe::ObservationRegistry;
use crate::site::{Request, Site};
use crate::token::TokenAllocator;

/// Everything the endpoint owns, shared between the public handle, the
/// receive loops and the request drivers.
pub(crate) struct ContextInner {
    pub(crate) config: EndpointConfig,
    pub(crate) transports: Vec<Arc<dyn Transport>>,
    pub(crate) message_layer: MessageLayer,
    pub(crate) request_layer: RequestLayer,
    pub(crate) tokens: Mutex<TokenAllocator>,
    pub(crate) site: Option<Arc<Site>>,
    pub(crate) observations: ObservationRegistry,
    pub(crate) client_credentials: Mutex<ClientCredentials>,
    pub(crate) server_credentials: Mutex<ServerCredentials>,
    pub(crate) uploads: UploadTracker,
    pub(crate) running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The CoAP endpoint: client, server, or both.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    /// A client-only context on an ephemeral UDP port.
    ///
    /// # Errors
    ///
    /// Transport bind failures.
    pub async fn create_client_context() -> Result<Context, Error> {
        let udp = UdpTransport::bind("[::]:0".parse().expect("literal")).await?;
        Ok(Context::with_transports(vec![Arc::new(udp)], None))
    }

    /// A server context on the default CoAP port, joined to the CoAP
    /// multicast groups, serving `site`.
    ///
    /// # Errors
    ///
    /// Transport bind failures.
    pub async fn create_server_context(site: Arc<Site>) -> Result<Context, Error> {
        let udp =
            UdpTransport::bind_multicast("[::]:5683".parse().expect("literal"), &[]).await?;
        Ok(Context::with_transports(vec![Arc::new(udp)], Some(site)))
    }

    /// Build a context over explicit transports; `site` enables the
    /// server role. The `SHRIKE_CLIENT_TRANSPORT` / `SHRIKE_SERVER_-
    /// TRANSPORT` lists filter and order the given transports by name.
    #[must_use]
    pub fn with_transports(
        transports: Vec<Arc<dyn Transport>>,
        site: Option<Arc<Site>>,
    ) -> Context {
        Context::with_config(transports, site, EndpointConfig::from_env())
    }

    /// Like [`with_transports`](Self::with_transports) with explicit
    /// configuration instead of the environment.
    #[must_use]
    pub fn with_config(
        transports: Vec<Arc<dyn Transport>>,
        site: Option<Arc<Site>>,
        config: EndpointConfig,
    ) -> Context {
        let transports = order_transports(transports, &config, site.is_some());

        if let Some(site) = &site {
            let wkc = Arc::new(WellKnownCore::new(site));
            site.add_resource(&[".well-known", "core"], wkc);
        }

        let inner = Arc::new(ContextInner {
            message_layer: MessageLayer::new(config.transmission.clone()),
            request_layer: RequestLayer::new(),
            tokens: Mutex::new(TokenAllocator::new()),
            site,
            observations: ObservationRegistry::new(),
            client_credentials: Mutex::new(ClientCredentials::new()),
            server_credentials: Mutex::new(ServerCredentials::new()),
            uploads: UploadTracker::new(),
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            transports,
            config,
        });

        for transport in &inner.transports {
            let task = tokio::spawn(receive_loop(inner.clone(), transport.clone()));
            inner.tasks.lock().expect("context lock").push(task);
        }
        Context { inner }
    }

    /// Protect outgoing requests matching `pattern` (a URI glob like
    /// `coap://host/*`) with `context`.
    pub fn add_client_credential(
        &self,
        pattern: impl Into<String>,
        context: shrike_oscore::SecurityContext,
    ) {
        self.inner
            .client_credentials
            .lock()
            .expect("context lock")
            .add(pattern, context);
    }

    /// Accept protected requests under `context`.
    pub fn add_server_credential(&self, context: shrike_oscore::SecurityContext) {
        self.inner
            .server_credentials
            .lock()
            .expect("context lock")
            .add(context);
    }

    /// Issue a request. Returns immediately with a handle; transmission,
    /// OSCORE protection and blockwise transfers run in a driver task.
    #[must_use]
    pub fn request(&self, mut message: Message, remote: RemoteEndpoint) -> RequestHandle {
        let inner = self.inner.clone();
        let observing = matches!(
            message.options.get_uint(OptionNumber::OBSERVE),
            Ok(Some(0))
        );
        let token = inner.allocate_token(&remote);
        message.token = token;

        // Transparent protection when a credential matches the URI.
        let security = {
            let uri = request_uri(&message, &remote);
            inner
                .client_credentials
                .lock()
                .expect("context lock")
                .context_for(&uri)
        };
        let mut send_message = message.clone();
        let mut security_pair = None;
        if let Some(context) = security {
            let protected = context
                .lock()
                .expect("security context lock")
                .protect_request(&message);
            match protected {
                Ok((outer, assoc)) => {
                    send_message = outer;
                    security_pair = Some((context, assoc));
                }
                Err(error) => return failed_handle(token, error.into()),
            }
        }

        let mut registration = if remote.is_multicast() {
            send_message.mtype = MessageType::Non;
            inner.request_layer.register_multicast(token)
        } else {
            inner
                .request_layer
                .register(&remote, token, observing, security_pair)
        };

        let (outer_tx, outer_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = RequestHandle {
            response_rx: Some(outer_rx),
            notify_rx: registration.notify_rx.take(),
            cancel_tx: Some(cancel_tx),
            token,
        };

        let cancel_template = message;
        let task = tokio::spawn(async move {
            let token = send_message.token;
            let remote_for_cleanup = remote.clone();
            let result = tokio::select! {
                result = run_request(&inner, send_message, &remote, registration.response_rx) => result,
                _ = cancel_rx => {
                    inner.request_layer.remove(&remote_for_cleanup, &token);
                    inner.request_layer.remove_multicast(&token);
                    if observing {
                        deregister_observation(&inner, cancel_template, &remote_for_cleanup, token).await;
                    }
                    Err(Error::RequestCancelled)
                }
            };
            let _ = outer_tx.send(result);
        });
        self.inner.tasks.lock().expect("context lock").push(task);
        handle
    }

    /// Re-render `path` and notify every observer registered on it.
    /// Returns how many notifications were sent.
    pub async fn notify_observers(&self, path: &[&str]) -> usize {
        let inner = &self.inner;
        let Some(site) = &inner.site else { return 0 };
        let path_vec: Vec<String> = path.iter().map(ToString::to_string).collect();
        let Some((resource, sub_path)) = site.lookup(&path_vec) else {
            return 0;
        };

        let mut sent = 0;
        for (id, observation) in inner.observations.on_path(&path_vec) {
            let request = Request {
                code: Code::GET,
                options: {
                    let mut options = shrike_msg::OptionList::new();
                    for segment in &path_vec {
                        options.add(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
                    }
                    options
                },
                payload: Vec::new(),
                sub_path: sub_path.clone(),
                remote: observation.remote.clone(),
            };
            let response = match resource.render(request).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(path = %path.join("/"), ?error, "notification render failed");
                    continue;
                }
            };
            let Some(plan) = inner.observations.plan_notification(id) else {
                continue;
            };

            let mtype = if plan.confirmable {
                MessageType::Con
            } else {
                MessageType::Non
            };
            let mid = inner.message_layer.next_mid(&observation.remote);
            let mut notification = Message::new(mtype, response.code, mid);
            notification.token = observation.token;
            notification.options = response.options;
            notification
                .options
                .set_uint(OptionNumber::OBSERVE, u64::from(plan.observe_value));
            notification.payload = response.payload;

            // Protected observations answer under their registration's
            // association with a fresh partial IV.
            if let Some(assoc) = &observation.security {
                let context = inner
                    .server_credentials
                    .lock()
                    .expect("context lock")
                    .context_for_kid(&assoc.kid);
                match context {
                    Some(context) => {
                        let protected = context
                            .lock()
                            .expect("security context lock")
                            .protect_response(&notification, assoc, true);
                        match protected {
                            Ok(outer) => notification = outer,
                            Err(error) => {
                                tracing::warn!(%error, "notification protection failed");
                                continue;
                            }
                        }
                    }
                    None => continue,
                }
            }

            inner
                .observations
                .note_notification_mid(id, &observation.remote, mid.0);

            let inner = inner.clone();
            let remote = observation.remote.clone();
            let confirmable = plan.confirmable;
            tokio::spawn(async move {
                let Ok(transport) = inner.transport_for(&remote) else {
                    return;
                };
                if confirmable {
                    match inner
                        .message_layer
                        .transmit_reliable(&transport, &remote, &notification)
                        .await
                    {
                        Ok(ExchangeOutcome::Acked) => {}
                        Ok(ExchangeOutcome::Reset) | Err(_) => {
                            tracing::debug!(%remote, "observer gone, deregistering");
                            inner.observations.deregister_id(id);
                        }
                    }
                } else if let Err(error) = inner
                    .message_layer
                    .transmit_once(&transport, &remote, &notification)
                    .await
                {
                    tracing::debug!(%remote, %error, "notification send failed");
                }
            });
            sent += 1;
        }
        sent
    }

    /// Remove the resource at `path`, terminating its observations with
    /// a 4.04 notification.
    pub async fn remove_resource(&self, path: &[&str]) {
        let inner = &self.inner;
        let Some(site) = &inner.site else { return };
        let path_vec: Vec<String> = path.iter().map(ToString::to_string).collect();
        site.remove(path);

        for (id, observation) in inner.observations.on_path(&path_vec) {
            let mid = inner.message_layer.next_mid(&observation.remote);
            let mut terminal = Message::new(MessageType::Non, Code::NOT_FOUND, mid);
            terminal.token = observation.token;

            if let Ok(transport) = inner.transport_for(&observation.remote) {
                let _ = inner
                    .message_layer
                    .transmit_once(&transport, &observation.remote, &terminal)
                    .await;
            }
            inner.observations.deregister_id(id);
        }
    }

    /// The site served by this context, if it has the server role.
    #[must_use]
    pub fn site(&self) -> Option<Arc<Site>> {
        self.inner.site.clone()
    }

    /// Shut the context down: fail outstanding requests with
    /// `LibraryShutdown`, stop the receive loops, close transports and
    /// persist every OSCORE sender counter.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("context shutting down");

        for transport in &inner.transports {
            if let Err(error) = transport.shutdown().await {
                tracing::warn!(%error, "transport shutdown failed");
            }
        }
        for task in inner.tasks.lock().expect("context lock").drain(..) {
            task.abort();
        }
        inner.request_layer.fail_all();
        inner.message_layer.drain();

        let contexts: Vec<_> = {
            let client = inner.client_credentials.lock().expect("context lock");
            let server = inner.server_credentials.lock().expect("context lock");
            client.all().into_iter().chain(server.all()).collect()
        };
        for context in contexts {
            if let Err(error) = context.lock().expect("security context lock").persist() {
                tracing::warn!(%error, "failed to persist security context");
            }
        }
        tracing::info!("context stopped");
    }
}

impl ContextInner {
    /// A token unused towards `remote`.
    pub(crate) fn allocate_token(&self, remote: &RemoteEndpoint) -> Token {
        self.tokens
            .lock()
            .expect("context lock")
            .allocate(|candidate| self.request_layer.token_in_use(remote, candidate))
    }

    /// The transport carrying `remote`: its namesake if present, else
    /// the first one claiming the scheme and address family.
    pub(crate) fn transport_for(
        &self,
        remote: &RemoteEndpoint,
    ) -> Result<Arc<dyn Transport>, Error> {
        self.transports
            .iter()
            .find(|t| t.name() == remote.transport)
            .or_else(|| {
                self.transports
                    .iter()
                    .find(|t| t.claims("coap", remote.addr))
            })
            .cloned()
            .ok_or_else(|| Error::NoTransport(remote.to_string()))
    }

    /// Transmit a request message that is already registered: CONs run
    /// the reliability machinery, everything else goes out once.
    pub(crate) async fn transmit_request(
        &self,
        message: &Message,
        remote: &RemoteEndpoint,
    ) -> Result<(), Error> {
        let transport = self.transport_for(remote)?;
        match message.mtype {
            MessageType::Con => match self
                .message_layer
                .transmit_reliable(&transport, remote, message)
                .await?
            {
                ExchangeOutcome::Acked => Ok(()),
                ExchangeOutcome::Reset => Err(Error::ResetReceived),
            },
            _ => {
                self.message_layer
                    .transmit_once(&transport, remote, message)
                    .await
            }
        }
    }

    /// One complete sub-exchange with its own token: register, send,
    /// await the response.
    pub(crate) async fn single_exchange(
        self: &Arc<Self>,
        mut message: Message,
        remote: &RemoteEndpoint,
    ) -> Result<Message, Error> {
        let token = self.allocate_token(remote);
        message.token = token;
        message.mid = self.message_layer.next_mid(remote);
        let registration = self.request_layer.register(remote, token, false, None);

        if let Err(error) = self.transmit_request(&message, remote).await {
            self.request_layer.remove(remote, &token);
            return Err(error);
        }
        registration
            .response_rx
            .await
            .map_err(|_| Error::LibraryShutdown)?
    }
}

/// The driver body: blockwise upload, main exchange, blockwise download.
async fn run_request(
    inner: &Arc<ContextInner>,
    mut message: Message,
    remote: &RemoteEndpoint,
    response_rx: oneshot::Receiver<Result<Message, Error>>,
) -> Result<Message, Error> {
    let token = message.token;
    let szx = inner.config.default_szx.min(6);
    // Protected payloads travel whole; blockwise applies to plain
    // exchanges (and never to multicast).
    let blockwise_ok =
        message.options.get_first(OptionNumber::OSCORE).is_none() && !remote.is_multicast();

    if blockwise_ok && needs_block1(message.payload.len(), szx) {
        let payload = std::mem::take(&mut message.payload);
        let mut offset = 0usize;
        let mut cur_szx = szx;
        let mut num = 0u32;

        loop {
            let (data, more) =
                chunk(&payload, num, cur_szx).ok_or(Error::UnexpectedBlock1)?;
            let block = BlockValue::new(num, more, cur_szx)?;
            let mut block_message = message.clone();
            block_message
                .options
                .set(OptionNumber::BLOCK1, block.encode());
            block_message.payload = data.to_vec();

            if !more {
                // The final block is the main exchange, on the
                // registered token.
                block_message.token = token;
                block_message.mid = inner.message_layer.next_mid(remote);
                if let Err(error) = inner.transmit_request(&block_message, remote).await {
                    inner.request_layer.remove(remote, &token);
                    return Err(error);
                }
                break;
            }

            let response = inner.single_exchange(block_message, remote).await?;
            if response.code != Code::CONTINUE {
                // The server rejected the transfer; that answer is the
                // request's outcome.
                inner.request_layer.remove(remote, &token);
                return Ok(response);
            }
            offset += data.len();
            if let Some(opt) = response.options.get_first(OptionNumber::BLOCK1) {
                let echoed = BlockValue::decode(&opt.value)?;
                // The server may shrink the block size; never enlarge.
                if echoed.szx < cur_szx {
                    cur_szx = echoed.szx;
                }
            }
            num = (offset >> (cur_szx + 4)) as u32;
        }
    } else {
        message.mid = inner.message_layer.next_mid(remote);
        if let Err(error) = inner.transmit_request(&message, remote).await {
            inner.request_layer.remove(remote, &token);
            inner.request_layer.remove_multicast(&token);
            return Err(error);
        }
    }

    let mut final_response = response_rx.await.map_err(|_| Error::LibraryShutdown)??;

    // Block2: fetch and reassemble the remaining representation.
    if blockwise_ok {
        if let Some(opt) = final_response.options.get_first(OptionNumber::BLOCK2) {
            let block = BlockValue::decode(&opt.value)?;
            if block.more {
                let mut template = message.clone();
                template.payload = Vec::new();
                template.options.remove(OptionNumber::BLOCK1);

                let mut assembly = Block2Assembly::default();
                let mut next = assembly.absorb(&block, &final_response.payload)?;
                while let Some(num) = next {
                    let mut continuation = template.clone();
                    continuation.options.set(
                        OptionNumber::BLOCK2,
                        BlockValue::new(num, false, block.szx)?.encode(),
                    );
                    let response = inner.single_exchange(continuation, remote).await?;
                    let opt = response
                        .options
                        .get_first(OptionNumber::BLOCK2)
                        .ok_or(Error::UnexpectedBlock2)?;
                    let echoed = BlockValue::decode(&opt.value)?;
                    next = assembly.absorb(&echoed, &response.payload)?;
                }
                final_response.payload = assembly.into_payload();
                final_response.options.remove(OptionNumber::BLOCK2);
            }
        }
    }

    Ok(final_response)
}

/// Best-effort Observe=1 deregistration on cancel.
async fn deregister_observation(
    inner: &Arc<ContextInner>,
    mut template: Message,
    remote: &RemoteEndpoint,
    token: Token,
) {
    template.mtype = MessageType::Non;
    template.token = token;
    template.mid = inner.message_layer.next_mid(remote);
    template.options.set_uint(OptionNumber::OBSERVE, 1);
    template.payload = Vec::new();

    if let Ok(transport) = inner.transport_for(remote) {
        if let Err(error) = inner
            .message_layer
            .transmit_once(&transport, remote, &template)
            .await
        {
            tracing::debug!(%remote, %error, "observe deregistration failed");
        }
    }
}

/// A handle that already failed (e.g. protection failed before send).
fn failed_handle(token: Token, error: Error) -> RequestHandle {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(error));
    RequestHandle {
        response_rx: Some(rx),
        notify_rx: None,
        cancel_tx: None,
        token,
    }
}

/// The URI a request is addressed to, for credential matching.
fn request_uri(message: &Message, remote: &RemoteEndpoint) -> String {
    let host = message
        .options
        .get_first(OptionNumber::URI_HOST)
        .map(|o| String::from_utf8_lossy(&o.value).into_owned())
        .unwrap_or_else(|| match remote.addr {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("[{addr}]"),
        });
    format!("coap://{}/{}", host, message.options.uri_path().join("/"))
}

/// Filter and order transports by the configured priority list.
fn order_transports(
    transports: Vec<Arc<dyn Transport>>,
    config: &EndpointConfig,
    serving: bool,
) -> Vec<Arc<dyn Transport>> {
    let list = if serving {
        &config.server_transports
    } else {
        &config.client_transports
    };
    if list.is_empty() {
        return transports;
    }

    let mut ordered = Vec::new();
    for name in list {
        match transports.iter().find(|t| t.name() == name.as_str()) {
            Some(transport) => ordered.push(transport.clone()),
            None if config.expect_all_transports => {
                tracing::error!(name = %name, "requested transport unavailable");
            }
            None => {
                tracing::warn!(name = %name, "requested transport unavailable, skipping");
            }
        }
    }
    if ordered.is_empty() {
        tracing::warn!("transport list matched nothing, using all transports");
        return transports;
    }
    ordered
}

/// One transport's receive loop.
async fn receive_loop(inner: Arc<ContextInner>, transport: Arc<dyn Transport>) {
    let mut buf = vec![0u8; 65535];
    tracing::debug!(transport = transport.name(), "receive loop started");

    while inner.running.load(Ordering::SeqCst) {
        let (size, remote, when) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(shrike_transport::TransportError::Closed) => break,
            Err(error) => {
                tracing::warn!(%error, "receive failed");
                continue;
            }
        };
        let message = match Message::decode(&buf[..size]) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%remote, %error, "dropping malformed datagram");
                continue;
            }
        };
        dispatch_incoming(&inner, message, remote, when, &transport).await;
    }
    tracing::debug!(transport = transport.name(), "receive loop terminated");
}

/// Sort one decoded message into the machinery.
async fn dispatch_incoming(
    inner: &Arc<ContextInner>,
    message: Message,
    remote: RemoteEndpoint,
    when: Instant,
    transport: &Arc<dyn Transport>,
) {
    match message.mtype {
        MessageType::Ack => {
            inner
                .message_layer
                .resolve_exchange(&remote, message.mid, ExchangeOutcome::Acked);
            if message.code.is_response() {
                route_response(inner, message, remote, when, transport).await;
            }
        }
        MessageType::Rst => {
            let matched =
                inner
                    .message_layer
                    .resolve_exchange(&remote, message.mid, ExchangeOutcome::Reset);
            if !matched {
                // Maybe it rejects a NON notification.
                if inner
                    .observations
                    .deregister_by_mid(&remote, message.mid.0)
                    .is_some()
                {
                    tracing::debug!(%remote, "observation cancelled by RST");
                }
            }
        }
        MessageType::Con | MessageType::Non => {
            if message.code.is_empty() {
                // CoAP ping; answered with RST.
                if message.mtype == MessageType::Con {
                    let rst = Message::rst_for(message.mid);
                    let _ = inner
                        .message_layer
                        .transmit_once(transport, &remote, &rst)
                        .await;
                }
            } else if message.code.is_request() {
                if inner.site.is_none() && inner.server_credentials.lock().expect("context lock").is_empty() {
                    // No server role; reject.
                    if message.mtype == MessageType::Con {
                        let rst = Message::rst_for(message.mid);
                        let _ = inner
                            .message_layer
                            .transmit_once(transport, &remote, &rst)
                            .await;
                    }
                    return;
                }
                match inner.message_layer.dedup_check(&remote, message.mid) {
                    DedupVerdict::DuplicateDrop => {
                        tracing::debug!(%remote, mid = %message.mid, "duplicate dropped");
                    }
                    DedupVerdict::DuplicateReply(bytes) => {
                        tracing::debug!(%remote, mid = %message.mid, "duplicate, replaying reply");
                        let _ = transport.send_to(&bytes, &remote).await;
                    }
                    DedupVerdict::New => {
                        let inner = inner.clone();
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            crate::server::serve(&inner, message, remote, &transport).await;
                        });
                    }
                }
            } else if message.code.is_response() {
                route_response(inner, message, remote, when, transport).await;
            }
        }
    }
}

/// Deliver a response (piggybacked, separate CON or NON) to the request
/// layer, acknowledging and deduplicating as the types demand.
async fn route_response(
    inner: &Arc<ContextInner>,
    message: Message,
    remote: RemoteEndpoint,
    when: Instant,
    transport: &Arc<dyn Transport>,
) {
    let confirmable = message.mtype == MessageType::Con;
    if confirmable {
        match inner.message_layer.dedup_check(&remote, message.mid) {
            DedupVerdict::DuplicateReply(bytes) => {
                let _ = transport.send_to(&bytes, &remote).await;
                return;
            }
            DedupVerdict::DuplicateDrop => return,
            DedupVerdict::New => {
                let ack = Message::ack_for(message.mid);
                let bytes = ack.encode();
                let _ = transport.send_to(&bytes, &remote).await;
                inner.message_layer.record_reply(&remote, message.mid, bytes);
            }
        }
    }

    let mid = message.mid;
    let mtype = message.mtype;
    match inner.request_layer.route_response(&remote, message, when) {
        crate::client::RouteVerdict::Delivered => {}
        crate::client::RouteVerdict::Unmatched => {
            tracing::debug!(%remote, "unsolicited response");
            // ACKs cannot be rejected; unsolicited CON/NON draw an RST.
            if mtype != MessageType::Ack {
                let rst = Message::rst_for(mid);
                let _ = inner
                    .message_layer
                    .transmit_once(transport, &remote, &rst)
                    .await;
            }
        }
    }
}
