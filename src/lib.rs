//! wireline - embeddable request/response endpoint for host applications
//!
//! A small listener that lets a host process expose a few paths (status
//! queries, webhooks, health checks) without pulling in a web framework.
//! Every connection carries exactly one exchange:
//!
//! ```text
//! accept -> read headers -> read body -> dispatch by path -> send -> close
//! ```
//!
//! # Features
//!
//! - **Exact path dispatch** through a live [`HandlerRegistry`]; handlers can
//!   be added and removed while the server runs
//! - **Fault isolation** - a handler that fails or panics only affects its own
//!   exchange
//! - **Bounded reads** - a hard per-phase ceiling and read deadlines, see
//!   [`ConnLimits`](limits::ConnLimits)
//! - **Deflate** request and response bodies, with in-place buffer reuse
//! - **Charsets** - request bodies decoded and text responses encoded with
//!   any charset `encoding_rs` knows, including Windows code pages
//!
//! # Examples
//!
//! ```no_run
//! use wireline::{Context, HandlerError, HandlerRegistry, Server, StatusCode};
//! use tokio::net::TcpListener;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(HandlerRegistry::new());
//!
//!     registry.register("/status", |ctx: &mut Context| -> Result<(), HandlerError> {
//!         ctx.response_mut()
//!             .content_type(mime::APPLICATION_JSON)
//!             .cache_seconds(0)
//!             .body(r#"{"state":"idle"}"#);
//!         Ok(())
//!     });
//!
//!     registry.register("/hook", |ctx: &mut Context| -> Result<(), HandlerError> {
//!         if ctx.request().header("X-Signature").is_none() {
//!             ctx.response_mut().status(StatusCode::Unauthorized);
//!             return Ok(());
//!         }
//!
//!         let event = ctx.request().text().to_string();
//!         ctx.response_mut().status(StatusCode::Accepted).body(event);
//!         Ok(())
//!     });
//!
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .registry(registry)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # Not included
//!
//! - persistent connections, pipelining and chunked transfer encoding
//! - TLS, routing patterns, middleware
//! - any compression other than deflate

pub(crate) mod http {
    pub mod charset;
    pub(crate) mod headers;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;

    pub(crate) use types::{Method, StatusCode, Version};
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod context;
    pub mod deflate;
    pub(crate) mod registry;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, HandlerError, Result},
    http::{
        charset,
        headers::Headers,
        query::{self, QueryParams},
        request::Request,
        response::{Payload, Response},
        types::{Method, StatusCode, Version},
    },
    server::{
        connection::{ConnState, ConnStats, Connection, ConnectionTable, Transport},
        context::Context,
        deflate::{self, Transformed},
        registry::{Dispatch, Handler, HandlerRegistry},
        server_impl::{Server, ServerBuilder},
    },
};

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }
}
