use std::{error, io};
use thiserror::Error;

/// Failure raised by a registered handler.
///
/// Returned errors and panics are treated the same way: logged with the
/// offending path, after which the exchange completes with a default response.
pub type HandlerError = Box<dyn error::Error + Send + Sync>;

/// Errors produced while driving a single exchange.
///
/// Only two classes end a connection early: [`Error::Overflow`] (resource
/// exhaustion) and the transport faults ([`Error::is_transport`]). Neither
/// is ever answered with a response.
#[derive(Debug, Error)]
pub enum Error {
    /// More bytes arrived than the configured receive ceiling allows.
    #[error("receive ceiling exceeded: received {received} bytes, limit is {limit}")]
    Overflow { limit: usize, received: usize },

    /// The read deadline elapsed before the expected data arrived.
    #[error("read deadline elapsed")]
    Timeout,

    /// The peer closed the stream in the middle of a message.
    #[error("connection closed by peer")]
    Closed,

    /// The server asked this connection to go away.
    #[error("connection disconnected by server")]
    Disconnected,

    /// A deflate transform failed.
    #[error("deflate error: {0}")]
    Deflate(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` for the resource-exhaustion fault.
    #[inline]
    pub const fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }

    /// `true` when the connection simply has no usable request this time.
    #[inline]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Closed | Self::Disconnected | Self::Io(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
