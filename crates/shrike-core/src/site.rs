//! The site tree: hierarchical resource registration and dispatch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use shrike_msg::{Code, OptionList, OptionNumber};
use shrike_transport::RemoteEndpoint;

use crate::error::RenderableError;

/// An incoming request as a handler sees it.
#[derive(Debug, Clone)]
pub struct Request {
    /// The method code
    pub code: Code,
    /// All request options
    pub options: OptionList,
    /// The (reassembled) payload
    pub payload: Vec<u8>,
    /// Path segments below the resource's registration point
    pub sub_path: Vec<String>,
    /// Who is asking
    pub remote: RemoteEndpoint,
}

/// What a handler returns.
#[derive(Debug, Clone)]
pub struct Response {
    /// Response code
    pub code: Code,
    /// Response options (Content-Format, ETag, ...)
    pub options: OptionList,
    /// Response payload
    pub payload: Vec<u8>,
}

impl Response {
    /// 2.05 Content with a payload.
    #[must_use]
    pub fn content(payload: impl Into<Vec<u8>>) -> Self {
        Response {
            code: Code::CONTENT,
            options: OptionList::new(),
            payload: payload.into(),
        }
    }

    /// 2.04 Changed with no payload.
    #[must_use]
    pub fn changed() -> Self {
        Response {
            code: Code::CHANGED,
            options: OptionList::new(),
            payload: Vec::new(),
        }
    }

    /// An arbitrary code with no payload.
    #[must_use]
    pub fn with_code(code: Code) -> Self {
        Response {
            code,
            options: OptionList::new(),
            payload: Vec::new(),
        }
    }

    /// Set the Content-Format option.
    #[must_use]
    pub fn with_content_format(mut self, format: u64) -> Self {
        self.options.set_uint(OptionNumber::CONTENT_FORMAT, format);
        self
    }
}

/// CoRE Link Format attributes a resource advertises in
/// `/.well-known/core` (RFC 6690).
#[derive(Debug, Clone, Default)]
pub struct ResourceLink {
    /// Resource type (`rt`)
    pub resource_type: Option<String>,
    /// Interface description (`if`)
    pub interface: Option<String>,
    /// Content format hint (`ct`)
    pub content_format: Option<u64>,
    /// Estimated size (`sz`)
    pub size: Option<usize>,
}

/// A server-side resource.
///
/// One implementation serves every method; handlers match on
/// `request.code` and answer 4.05 for methods they do not support (the
/// dispatcher does this for them when they return
/// [`RenderableError::method_not_allowed`]).
#[async_trait]
pub trait Resource: Send + Sync {
    /// Handle one request.
    ///
    /// # Errors
    ///
    /// A [`RenderableError`] carrying the error response to send.
    async fn render(&self, request: Request) -> Result<Response, RenderableError>;

    /// Link-format attributes for the registry rendering.
    fn link(&self) -> ResourceLink {
        ResourceLink::default()
    }

    /// Whether Observe registrations are accepted.
    fn observable(&self) -> bool {
        false
    }

    /// The current entity tag, evaluated for If-Match / If-None-Match
    /// preconditions before the handler runs.
    fn etag(&self) -> Option<Vec<u8>> {
        None
    }
}

enum SiteEntry {
    Resource(Arc<dyn Resource>),
    Subsite(Arc<Site>),
}

/// A mapping from URI path prefixes to resources and nested sites.
#[derive(Default)]
pub struct Site {
    entries: RwLock<HashMap<Vec<String>, SiteEntry>>,
}

impl Site {
    /// An empty site.
    #[must_use]
    pub fn new() -> Self {
        Site::default()
    }

    /// Register a resource at `path` (segments, not a slash string).
    /// Replaces whatever was there.
    pub fn add_resource(&self, path: &[&str], resource: Arc<dyn Resource>) {
        let key: Vec<String> = path.iter().map(ToString::to_string).collect();
        self.entries
            .write()
            .expect("site lock")
            .insert(key, SiteEntry::Resource(resource));
    }

    /// Mount a whole site under a path prefix.
    pub fn add_site(&self, path: &[&str], site: Arc<Site>) {
        let key: Vec<String> = path.iter().map(ToString::to_string).collect();
        self.entries
            .write()
            .expect("site lock")
            .insert(key, SiteEntry::Subsite(site));
    }

    /// Remove the entry at exactly `path`, returning the resource if one
    /// was registered there. Outstanding observations are the caller's
    /// (the context's) business.
    pub fn remove(&self, path: &[&str]) -> Option<Arc<dyn Resource>> {
        let key: Vec<String> = path.iter().map(ToString::to_string).collect();
        match self.entries.write().expect("site lock").remove(&key) {
            Some(SiteEntry::Resource(resource)) => Some(resource),
            _ => None,
        }
    }

    /// Longest-prefix lookup. Returns the resource and the path suffix
    /// below its registration point.
    #[must_use]
    pub fn lookup(&self, path: &[String]) -> Option<(Arc<dyn Resource>, Vec<String>)> {
        let entries = self.entries.read().expect("site lock");
        // Longest registered prefix wins; ties cannot happen since the
        // map is keyed by the full prefix.
        for split in (0..=path.len()).rev() {
            let (prefix, suffix) = path.split_at(split);
            match entries.get(prefix) {
                Some(SiteEntry::Resource(resource)) => {
                    return Some((resource.clone(), suffix.to_vec()));
                }
                Some(SiteEntry::Subsite(site)) => {
                    return site.lookup(&suffix.to_vec());
                }
                None => {}
            }
        }
        None
    }

    /// Every registered path with its link attributes and observability,
    /// subsites flattened with their prefix.
    #[must_use]
    pub fn links(&self) -> Vec<(Vec<String>, ResourceLink, bool)> {
        let entries = self.entries.read().expect("site lock");
        let mut links = Vec::new();
        for (path, entry) in entries.iter() {
            match entry {
                SiteEntry::Resource(resource) => {
                    links.push((path.clone(), resource.link(), resource.observable()));
                }
                SiteEntry::Subsite(site) => {
                    for (sub_path, link, obs) in site.links() {
                        let mut full = path.clone();
                        full.extend(sub_path);
                        links.push((full, link, obs));
                    }
                }
            }
        }
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths: Vec<String> = self
            .links()
            .iter()
            .map(|(path, _, _)| path.join("/"))
            .collect();
        f.debug_struct("Site").field("paths", &paths).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static [u8]);

    #[async_trait]
    impl Resource for Fixed {
        async fn render(&self, _request: Request) -> Result<Response, RenderableError> {
            Ok(Response::content(self.0.to_vec()))
        }

        fn link(&self) -> ResourceLink {
            ResourceLink {
                resource_type: Some("test".into()),
                ..ResourceLink::default()
            }
        }
    }

    fn segs(path: &[&str]) -> Vec<String> {
        path.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_exact_lookup() {
        let site = Site::new();
        site.add_resource(&["hello"], Arc::new(Fixed(b"hi")));

        let (resource, suffix) = site.lookup(&segs(&["hello"])).unwrap();
        assert!(suffix.is_empty());
        let _ = resource;
        assert!(site.lookup(&segs(&["nope"])).is_none());
    }

    #[test]
    fn test_longest_prefix_and_suffix() {
        let site = Site::new();
        site.add_resource(&["files"], Arc::new(Fixed(b"root")));
        site.add_resource(&["files", "special"], Arc::new(Fixed(b"special")));

        let (_, suffix) = site.lookup(&segs(&["files", "a", "b"])).unwrap();
        assert_eq!(suffix, segs(&["a", "b"]));

        // the deeper registration shadows the shallow one
        let (_, suffix) = site.lookup(&segs(&["files", "special"])).unwrap();
        assert!(suffix.is_empty());
    }

    #[test]
    fn test_subsite_dispatch() {
        let sub = Arc::new(Site::new());
        sub.add_resource(&["leaf"], Arc::new(Fixed(b"leaf")));

        let site = Site::new();
        site.add_site(&["sub"], sub);

        let (_, suffix) = site.lookup(&segs(&["sub", "leaf", "x"])).unwrap();
        assert_eq!(suffix, segs(&["x"]));
        assert!(site.lookup(&segs(&["sub", "other"])).is_none());
    }

    #[test]
    fn test_remove() {
        let site = Site::new();
        site.add_resource(&["gone"], Arc::new(Fixed(b"x")));
        assert!(site.remove(&["gone"]).is_some());
        assert!(site.lookup(&segs(&["gone"])).is_none());
        assert!(site.remove(&["gone"]).is_none());
    }

    #[test]
    fn test_links_flatten_subsites() {
        let sub = Arc::new(Site::new());
        sub.add_resource(&["leaf"], Arc::new(Fixed(b"leaf")));

        let site = Site::new();
        site.add_resource(&["top"], Arc::new(Fixed(b"top")));
        site.add_site(&["nested"], sub);

        let paths: Vec<String> = site
            .links()
            .iter()
            .map(|(path, _, _)| path.join("/"))
            .collect();
        assert_eq!(paths, vec!["nested/leaf", "top"]);
    }
}
