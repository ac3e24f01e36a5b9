//! Credential stores: which OSCORE context protects which traffic.
//!
//! The client store maps URI globs (`coap://host/*`) to security
//! contexts and is consulted when a request is built; the server store
//! is a flat set searched by the kid of incoming protected requests.
//! Contexts are shared behind mutexes because protect and unprotect
//! mutate sequence and replay state.

use std::sync::{Arc, Mutex};

use shrike_oscore::SecurityContext;

/// Client-side URI-glob → context mapping.
///
/// Globs are matched in insertion order; `*` at the end of a pattern
/// matches any suffix, everything else is literal.
#[derive(Default)]
pub struct ClientCredentials {
    entries: Vec<(String, Arc<Mutex<SecurityContext>>)>,
}

impl ClientCredentials {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        ClientCredentials::default()
    }

    /// Register `context` for every URI matching `pattern`.
    pub fn add(&mut self, pattern: impl Into<String>, context: SecurityContext) {
        self.entries
            .push((pattern.into(), Arc::new(Mutex::new(context))));
    }

    /// The context protecting `uri`, if any.
    #[must_use]
    pub fn context_for(&self, uri: &str) -> Option<Arc<Mutex<SecurityContext>>> {
        self.entries
            .iter()
            .find(|(pattern, _)| glob_matches(pattern, uri))
            .map(|(_, context)| context.clone())
    }

    /// All contexts, for shutdown persistence.
    pub(crate) fn all(&self) -> Vec<Arc<Mutex<SecurityContext>>> {
        self.entries
            .iter()
            .map(|(_, context)| context.clone())
            .collect()
    }
}

/// Server-side context set, searched by kid.
#[derive(Default)]
pub struct ServerCredentials {
    contexts: Vec<Arc<Mutex<SecurityContext>>>,
}

impl ServerCredentials {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        ServerCredentials::default()
    }

    /// Accept protected requests under `context`.
    pub fn add(&mut self, context: SecurityContext) {
        self.contexts.push(Arc::new(Mutex::new(context)));
    }

    /// The context whose recipient ID equals `kid`.
    #[must_use]
    pub fn context_for_kid(&self, kid: &[u8]) -> Option<Arc<Mutex<SecurityContext>>> {
        self.contexts
            .iter()
            .find(|context| {
                context
                    .lock()
                    .map(|guard| guard.recipient_id() == kid)
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// All contexts, for shutdown persistence.
    pub(crate) fn all(&self) -> Vec<Arc<Mutex<SecurityContext>>> {
        self.contexts.clone()
    }

    /// Whether any context is registered at all; an unprotected request
    /// to a protected-only server is answered differently.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

fn glob_matches(pattern: &str, uri: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => uri.starts_with(prefix),
        None => pattern == uri,
    }
}
