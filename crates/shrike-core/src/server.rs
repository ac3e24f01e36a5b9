//! Server-side request handling: OSCORE unprotection, option
//! validation, blockwise reassembly and slicing, observation
//! registration, handler invocation and reply shaping (piggybacked vs
//! separate response).

use std::sync::{Arc, Mutex};

use shrike_msg::{BlockValue, Code, Message, MessageType, OptionList, OptionNumber};
use shrike_oscore::{peek_association, RequestAssociation, SecurityContext, SecurityError};
use shrike_transport::{RemoteEndpoint, Transport};
use tokio::time::sleep;

use crate::block::UploadProgress;
use crate::context::ContextInner;
use crate::site::{Request, Response};

/// Request options this server processes itself; any other critical
/// option draws 4.02 Bad Option.
const HANDLED_REQUEST_OPTIONS: &[OptionNumber] = &[
    OptionNumber::IF_MATCH,
    OptionNumber::URI_HOST,
    OptionNumber::ETAG,
    OptionNumber::IF_NONE_MATCH,
    OptionNumber::OBSERVE,
    OptionNumber::URI_PORT,
    OptionNumber::OSCORE,
    OptionNumber::URI_PATH,
    OptionNumber::CONTENT_FORMAT,
    OptionNumber::URI_QUERY,
    OptionNumber::ACCEPT,
    OptionNumber::BLOCK2,
    OptionNumber::BLOCK1,
    OptionNumber::SIZE2,
    OptionNumber::SIZE1,
    OptionNumber::ECHO,
];

/// Handle one deduplicated incoming request end to end.
pub(crate) async fn serve(
    inner: &Arc<ContextInner>,
    message: Message,
    remote: RemoteEndpoint,
    transport: &Arc<dyn Transport>,
) {
    // Unprotect first; protected requests are dispatched on their inner
    // content.
    let mut security = None;
    let plain = if message.options.get_first(OptionNumber::OSCORE).is_some() {
        match unprotect_incoming(inner, &message) {
            Ok((plain, pair)) => {
                security = Some(pair);
                plain
            }
            Err(Some(content)) => {
                send_reply(inner, &message, &remote, transport, content, false).await;
                return;
            }
            Err(None) => return,
        }
    } else {
        message.clone()
    };

    // Promote to a separate response when the handler outlives the
    // processing grace period.
    let render = render_plain(inner, &plain, &remote, security.as_ref().map(|(_, a)| a));
    tokio::pin!(render);
    let deadline = sleep(inner.config.transmission.processing_delay());

    let (content, separate) = if message.mtype == MessageType::Con {
        tokio::select! {
            content = &mut render => (content, false),
            () = deadline => {
                let ack = Message::ack_for(message.mid);
                let bytes = ack.encode();
                let _ = transport.send_to(&bytes, &remote).await;
                inner.message_layer.record_reply(&remote, message.mid, bytes);
                tracing::debug!(%remote, mid = %message.mid, "promoted to separate response");
                (render.await, true)
            }
        }
    } else {
        (render.await, false)
    };

    let content = match protect_reply(&message, content, &security) {
        Some(content) => content,
        None => return,
    };
    send_reply(inner, &message, &remote, transport, content, separate).await;
}

/// Wrap the rendered content under the request's security context.
fn protect_reply(
    request: &Message,
    content: Response,
    security: &Option<(Arc<Mutex<SecurityContext>>, RequestAssociation)>,
) -> Option<Response> {
    let Some((context, assoc)) = security else {
        return Some(content);
    };

    let mut template = Message::new(MessageType::Ack, content.code, request.mid);
    template.token = request.token;
    template.options = content.options;
    template.payload = content.payload;

    let protected = context
        .lock()
        .expect("security context lock")
        .protect_response(&template, assoc, false);
    match protected {
        Ok(outer) => Some(Response {
            code: outer.code,
            options: outer.options,
            payload: outer.payload,
        }),
        Err(error) => {
            tracing::warn!(%error, "response protection failed, dropping");
            None
        }
    }
}

/// Shape and transmit the reply for `request`.
async fn send_reply(
    inner: &Arc<ContextInner>,
    request: &Message,
    remote: &RemoteEndpoint,
    transport: &Arc<dyn Transport>,
    content: Response,
    separate: bool,
) {
    let mut reply = if request.mtype == MessageType::Con && !separate {
        Message::new(MessageType::Ack, content.code, request.mid)
    } else {
        let mtype = if request.mtype == MessageType::Con {
            MessageType::Con
        } else {
            MessageType::Non
        };
        Message::new(mtype, content.code, inner.message_layer.next_mid(remote))
    };
    reply.token = request.token;
    reply.options = content.options;
    reply.payload = content.payload;

    match reply.mtype {
        MessageType::Ack => {
            let bytes = reply.encode();
            let _ = transport.send_to(&bytes, remote).await;
            inner.message_layer.record_reply(remote, request.mid, bytes);
        }
        MessageType::Con => {
            if let Err(error) = inner
                .message_layer
                .transmit_reliable(transport, remote, &reply)
                .await
            {
                tracing::debug!(%remote, %error, "separate response failed");
            }
        }
        _ => {
            let _ = inner
                .message_layer
                .transmit_once(transport, remote, &reply)
                .await;
        }
    }
}

/// Locate the security context for a protected request and unprotect
/// it. `Err(Some(content))` carries the error reply to send,
/// `Err(None)` means drop silently.
#[allow(clippy::type_complexity)]
fn unprotect_incoming(
    inner: &Arc<ContextInner>,
    message: &Message,
) -> Result<
    (Message, (Arc<Mutex<SecurityContext>>, RequestAssociation)),
    Option<Response>,
> {
    let Ok(peeked) = peek_association(message) else {
        return Err(Some(unauthorized("Malformed OSCORE option")));
    };
    let context = inner
        .server_credentials
        .lock()
        .expect("context lock")
        .context_for_kid(&peeked.kid);
    let Some(context) = context else {
        tracing::warn!(kid = %hex::encode(&peeked.kid), "no security context for kid");
        return Err(Some(unauthorized("Security context not found")));
    };

    let result = context
        .lock()
        .expect("security context lock")
        .unprotect_request(message);
    match result {
        Ok((plain, assoc)) => Ok((plain, (context, assoc))),
        Err(SecurityError::ReplayDetected) => {
            tracing::warn!("replayed OSCORE request");
            Err(Some(unauthorized("Replay detected")))
        }
        Err(SecurityError::EchoRequired { challenge }) => {
            // Challenge the peer; the 4.01 travels protected with a
            // fresh partial IV so the client can trust the Echo value.
            let mut template = Message::new(MessageType::Ack, Code::UNAUTHORIZED, message.mid);
            template.token = message.token;
            template.options.set(OptionNumber::ECHO, challenge);

            let protected = context
                .lock()
                .expect("security context lock")
                .protect_response(&template, &peeked, true);
            match protected {
                Ok(outer) => Err(Some(Response {
                    code: outer.code,
                    options: outer.options,
                    payload: outer.payload,
                })),
                Err(error) => {
                    tracing::warn!(%error, "echo challenge protection failed");
                    Err(None)
                }
            }
        }
        Err(SecurityError::ProtectionInvalid) => {
            tracing::warn!("OSCORE verification failed");
            Err(Some(unauthorized("Decryption failed")))
        }
        Err(error) => {
            tracing::warn!(%error, "dropping undecryptable request");
            Err(None)
        }
    }
}

fn unauthorized(diagnostic: &str) -> Response {
    Response {
        code: Code::UNAUTHORIZED,
        options: OptionList::new(),
        payload: diagnostic.as_bytes().to_vec(),
    }
}

fn error_response(code: Code, diagnostic: impl Into<String>) -> Response {
    Response {
        code,
        options: OptionList::new(),
        payload: diagnostic.into().into_bytes(),
    }
}

/// Validate, reassemble, dispatch and slice one plaintext request into
/// its response content.
async fn render_plain(
    inner: &Arc<ContextInner>,
    plain: &Message,
    remote: &RemoteEndpoint,
    protected: Option<&RequestAssociation>,
) -> Response {
    if plain
        .options
        .get_first(OptionNumber::PROXY_URI)
        .or_else(|| plain.options.get_first(OptionNumber::PROXY_SCHEME))
        .is_some()
    {
        return error_response(Code::PROXYING_NOT_SUPPORTED, "not a proxy");
    }
    if let Some(number) = plain
        .options
        .unknown_critical(HANDLED_REQUEST_OPTIONS)
        .next()
    {
        tracing::debug!(%remote, option = number.0, "unknown critical option");
        return error_response(
            Code::BAD_OPTION,
            format!("Unknown critical option {}", number.0),
        );
    }

    let path = plain.options.uri_path();

    // Block1 upload reassembly.
    let mut payload = plain.payload.clone();
    let mut block1_echo = None;
    if let Some(opt) = plain.options.get_first(OptionNumber::BLOCK1) {
        let Ok(block) = BlockValue::decode(&opt.value) else {
            return error_response(Code::BAD_REQUEST, "bad Block1");
        };
        match inner.uploads.absorb(remote, &path, &block, &plain.payload) {
            Ok(UploadProgress::Continue) => {
                let mut response = Response::with_code(Code::CONTINUE);
                response.options.set(OptionNumber::BLOCK1, block.encode());
                return response;
            }
            Ok(UploadProgress::Complete(data)) => {
                payload = data;
                block1_echo = Some(block);
            }
            Err(_) => {
                return error_response(
                    Code::REQUEST_ENTITY_INCOMPLETE,
                    "block sequence broken",
                );
            }
        }
    }

    let Some(site) = &inner.site else {
        return error_response(Code::NOT_FOUND, "no resources");
    };
    let Some((resource, sub_path)) = site.lookup(&path) else {
        return error_response(Code::NOT_FOUND, format!("/{} not here", path.join("/")));
    };

    // Preconditions against the current entity tag.
    if plain
        .options
        .get_first(OptionNumber::IF_NONE_MATCH)
        .is_some()
    {
        return error_response(Code::PRECONDITION_FAILED, "resource exists");
    }
    let if_match: Vec<_> = plain.options.get_all(OptionNumber::IF_MATCH).collect();
    if !if_match.is_empty() {
        let etag = resource.etag();
        let matched = if_match.iter().any(|o| {
            o.value.is_empty() || Some(&o.value) == etag.as_ref()
        });
        if !matched {
            return error_response(Code::PRECONDITION_FAILED, "entity tag mismatch");
        }
    }

    // Observe registration and cancellation.
    let mut observe_value = None;
    if plain.code == Code::GET {
        match plain.options.get_uint(OptionNumber::OBSERVE) {
            Ok(Some(0)) if resource.observable() => {
                let (_, value) = inner.observations.register(
                    remote.clone(),
                    plain.token,
                    path.clone(),
                    protected.cloned(),
                );
                observe_value = Some(value);
                tracing::debug!(%remote, path = %path.join("/"), "observation registered");
            }
            Ok(Some(1)) => {
                inner.observations.deregister(remote, &plain.token);
            }
            _ => {}
        }
    }

    let request = Request {
        code: plain.code,
        options: plain.options.clone(),
        payload,
        sub_path,
        remote: remote.clone(),
    };
    let mut response = match resource.render(request).await {
        Ok(response) => response,
        Err(error) => error_response(error.code, error.diagnostic),
    };

    // A failed registration must not linger.
    if response.code.is_error() && observe_value.is_some() {
        inner.observations.deregister(remote, &plain.token);
        observe_value = None;
    }
    if let Some(value) = observe_value {
        response
            .options
            .set_uint(OptionNumber::OBSERVE, u64::from(value));
    }
    if let Some(block) = block1_echo {
        response.options.set(OptionNumber::BLOCK1, block.encode());
    }

    // Block2 slicing, honouring the requested size and never enlarging.
    let requested = plain
        .options
        .get_first(OptionNumber::BLOCK2)
        .and_then(|o| BlockValue::decode(&o.value).ok());
    let szx = requested
        .map_or(inner.config.default_szx, |b| b.szx)
        .min(inner.config.default_szx)
        .min(6);
    let num = requested.map_or(0, |b| b.num);
    let block_size = 1usize << (szx + 4);

    if response.payload.len() > block_size || num > 0 {
        match crate::block::chunk(&response.payload, num, szx) {
            Some((data, more)) => {
                match BlockValue::new(num, more, szx) {
                    Ok(block) => {
                        response.options.set(OptionNumber::BLOCK2, block.encode());
                        response.payload = data.to_vec();
                    }
                    Err(_) => {
                        return error_response(Code::BAD_REQUEST, "bad Block2");
                    }
                }
            }
            None => return error_response(Code::BAD_REQUEST, "Block2 out of range"),
        }
    }

    response
}
