//! CoRE Link Format (RFC 6690) rendering for `/.well-known/core`.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::RenderableError;
use crate::site::{Request, Resource, ResourceLink, Response, Site};

/// Content-Format number for application/link-format.
pub const LINK_FORMAT_CONTENT_TYPE: u64 = 40;

/// The `/.well-known/core` resource. Holds a weak reference to the site
/// it describes, since it is itself registered inside that site.
pub struct WellKnownCore {
    site: Weak<Site>,
}

impl WellKnownCore {
    /// A registry view over `site`.
    #[must_use]
    pub fn new(site: &Arc<Site>) -> Self {
        WellKnownCore {
            site: Arc::downgrade(site),
        }
    }
}

#[async_trait]
impl Resource for WellKnownCore {
    async fn render(&self, request: Request) -> Result<Response, RenderableError> {
        if request.code != shrike_msg::Code::GET {
            return Err(RenderableError::method_not_allowed());
        }
        let site = self
            .site
            .upgrade()
            .ok_or_else(RenderableError::internal)?;

        let body = render_link_format(&site.links(), &request.options.uri_query());
        Ok(Response::content(body.into_bytes())
            .with_content_format(LINK_FORMAT_CONTENT_TYPE))
    }

    fn link(&self) -> ResourceLink {
        ResourceLink {
            content_format: Some(LINK_FORMAT_CONTENT_TYPE),
            ..ResourceLink::default()
        }
    }
}

/// Render the links, filtered by the query parameters of RFC 6690 §4.1
/// (`rt`, `if`, `href`; a trailing `*` matches by prefix).
#[must_use]
pub fn render_link_format(
    links: &[(Vec<String>, ResourceLink, bool)],
    query: &[String],
) -> String {
    links
        .iter()
        .filter(|(path, link, _)| matches_query(path, link, query))
        .map(|(path, link, observable)| {
            let mut entry = format!("</{}>", path.join("/"));
            if let Some(rt) = &link.resource_type {
                entry.push_str(&format!(";rt=\"{rt}\""));
            }
            if let Some(interface) = &link.interface {
                entry.push_str(&format!(";if=\"{interface}\""));
            }
            if let Some(ct) = link.content_format {
                entry.push_str(&format!(";ct={ct}"));
            }
            if let Some(sz) = link.size {
                entry.push_str(&format!(";sz={sz}"));
            }
            if *observable {
                entry.push_str(";obs");
            }
            entry
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn matches_query(path: &[String], link: &ResourceLink, query: &[String]) -> bool {
    query.iter().all(|parameter| {
        let Some((key, wanted)) = parameter.split_once('=') else {
            return true;
        };
        let actual = match key {
            "rt" => link.resource_type.clone(),
            "if" => link.interface.clone(),
            "href" => Some(format!("/{}", path.join("/"))),
            _ => return true,
        };
        match actual {
            None => false,
            Some(actual) => match wanted.strip_suffix('*') {
                Some(prefix) => actual.starts_with(prefix),
                None => actual == wanted,
            },
        }
    })
}
