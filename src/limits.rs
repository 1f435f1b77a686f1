//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! The defaults are conservative on purpose. They keep a misbehaving peer
//! from pinning memory or a worker:
//! - the receive ceiling bounds every read (headers and body alike)
//! - the read deadline bounds how long a silent peer can hold a worker
//! - the pending queue bounds how many accepted sockets may wait for a worker
//!
//! # Examples
//!
//! ```no_run
//! use wireline::{HandlerRegistry, Server, limits::{ConnLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .registry(Arc::new(HandlerRegistry::new()))
//!         .server_limits(ServerLimits {
//!             max_connections: 16,
//!             verbose: true,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             max_receive_size: 256 * 1024, // webhook payloads can be large
//!             read_timeout: Duration::from_secs(2),
//!             ..ConnLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use encoding_rs::{Encoding, UTF_8};
use mime::Mime;
use std::time::Duration;

/// Controls server-level concurrency and queueing.
///
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Room in queue? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \/
///   [ Worker: one exchange, then close ]
/// ```
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks serving exchanges concurrently (default: `32`).
    pub max_connections: usize,

    /// Accepted sockets allowed to wait for a free worker (default: `128`).
    ///
    /// Once the queue is full, new connections get an immediate `503` and
    /// are closed.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue (default: `Sleep(100μs)`).
    pub wait_strategy: WaitStrategy,

    /// Log per-exchange byte counts at `info` instead of `trace` (default: `false`).
    pub verbose: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 32,
            max_pending_connections: 128,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(100)),
            verbose: false,

            _priv: (),
        }
    }
}

/// Strategy for worker tasks waiting on an empty queue.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Uses [`tokio::task::yield_now()`]. Keeps a core busy, use with care.
    Yield,

    /// Uses [`tokio::time::sleep()`] with the given period.
    Sleep(Duration),
}

/// Per-connection byte and time limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Hard ceiling on bytes received by a single read phase (default: `64 KiB`).
    ///
    /// Applies separately to the header block, to the body as received and
    /// to the body once inflated. Exceeding it aborts the exchange and tears
    /// the connection down; nothing is sent back.
    pub max_receive_size: usize,

    /// Deadline for each read phase (default: `1 second`).
    ///
    /// A header block, or a body, that has not completed within this window
    /// is abandoned, however steadily bytes keep arriving.
    pub read_timeout: Duration,

    /// Quiet period after which a body without `Content-Length` is
    /// considered complete (default: `50 ms`).
    pub body_poll_window: Duration,

    /// Longest time a response write may take (default: `3 seconds`).
    pub write_timeout: Duration,

    /// Upper bound for the socket send-buffer hint (default: `1 MiB`).
    ///
    /// Large responses grow the hint up to this value so they leave in few
    /// system calls.
    pub max_send_buffer: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_receive_size: 64 * 1024,
            read_timeout: Duration::from_secs(1),
            body_poll_window: Duration::from_millis(50),
            write_timeout: Duration::from_secs(3),
            max_send_buffer: 1024 * 1024,

            _priv: (),
        }
    }
}

/// Defaults applied to every fresh [`Response`](crate::Response).
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Content type of a response nobody touched (default: `application/octet-stream`).
    pub default_content_type: Mime,

    /// Charset used for text payloads (default: `UTF-8`).
    pub default_encoding: &'static Encoding,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_content_type: mime::APPLICATION_OCTET_STREAM,
            default_encoding: UTF_8,

            _priv: (),
        }
    }
}
