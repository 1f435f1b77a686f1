use crate::{
    errors::Result,
    http::{request::Request, response::Response, Method},
    server::connection::{ConnState, ConnStats, Connection},
};
use std::net::SocketAddr;

/// Everything one exchange needs: the connection, the parsed request and the
/// response being built.
///
/// Handlers get `&mut Context`; the server owns it and disposes of it once
/// the response has been sent.
#[derive(Debug)]
pub struct Context {
    connection: Connection,
    request: Request,
    response: Response,
}

impl Context {
    pub fn new(connection: Connection, request: Request, response: Response) -> Self {
        Self {
            connection,
            request,
            response,
        }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[inline]
    pub fn response(&self) -> &Response {
        &self.response
    }

    #[inline]
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Path used for handler lookup.
    #[inline]
    pub fn path(&self) -> &str {
        self.request.path()
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    #[inline]
    pub fn stats(&self) -> &ConnStats {
        self.connection.stats()
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.connection.set_state(state);
    }

    /// Serializes the response and writes it out.
    pub(crate) async fn send_response(&mut self) -> Result<usize> {
        let version = self.request.version();
        let head_only = self.request.method() == Method::Head;

        let connection = &self.connection;
        let wire = self
            .response
            .serialize(version, head_only, |buffer| connection.compress(buffer))
            .await?;

        self.connection.send(&wire).await?;
        Ok(wire.len())
    }

    /// Releases the response payload and closes the connection.
    pub async fn dispose(mut self, from_disconnect_notifier: bool) {
        self.response.dispose();
        self.connection.close(from_disconnect_notifier).await;
    }
}
