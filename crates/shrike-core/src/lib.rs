//! # shrike-core
//!
//! The CoAP endpoint: a symmetric client/server over pluggable datagram
//! transports, with reliability (CON retransmission, deduplication),
//! request/response correlation, blockwise transfers, observation and
//! transparent OSCORE protection.
//!
//! ## Quick start
//!
//! ```no_run
//! use shrike_core::{Context, msg};
//! use shrike_transport::RemoteEndpoint;
//!
//! # async fn example() -> Result<(), shrike_core::Error> {
//! let context = Context::create_client_context().await?;
//!
//! let mut request = msg::Message::new(
//!     msg::MessageType::Con,
//!     msg::Code::GET,
//!     msg::MessageId(0), // assigned at transmission
//! );
//! request.options.set_uri_path("/hello");
//!
//! let remote = RemoteEndpoint::from_socket_addr("udp", "[2001:db8::1]:5683".parse().unwrap());
//! let mut handle = context.request(request, remote);
//! let response = handle.response().await?;
//! println!("{}: {:?}", response.code, response.payload);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod block;
mod client;
pub mod config;
mod context;
pub mod credentials;
pub mod error;
mod exchange;
pub mod link_format;
mod observe;
mod server;
pub mod site;
mod token;

pub use client::RequestHandle;
pub use config::{EndpointConfig, TransmissionParameters};
pub use context::Context;
pub use credentials::{ClientCredentials, ServerCredentials};
pub use error::{Error, RenderableError};
pub use link_format::WellKnownCore;
pub use observe::ObservationId;
pub use site::{Request, Resource, ResourceLink, Response, Site};

// The wire-level crates, re-exported for callers that build messages or
// provision security contexts.
pub use shrike_msg as msg;
pub use shrike_oscore as oscore;
pub use shrike_transport as transport;
