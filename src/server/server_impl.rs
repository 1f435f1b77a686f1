use crate::{
    errors::Error,
    http::{request::Request, response::Response, Method, StatusCode, Version},
    limits::{ConnLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{
        connection::{ConnState, Connection, ConnectionTable},
        context::Context,
        deflate,
        registry::{Dispatch, HandlerRegistry},
    },
};
use crossbeam::queue::SegQueue;
use std::{
    future::{pending, Future},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};
use tracing::{debug, info, trace, warn};

/// Listener that runs one request/response exchange per connection.
///
/// Accepted sockets go to a bounded queue served by a fixed set of worker
/// tasks. A socket that finds the queue full is answered with
/// `503 Service Unavailable` and closed.
///
/// Each exchange:
/// 1. reads the header block and, when one is expected, the body
/// 2. builds a [`Context`] and dispatches it through the [`HandlerRegistry`]
/// 3. sends the response and closes the connection
///
/// | Situation                          | Answer                       |
/// |------------------------------------|------------------------------|
/// | unknown method                     | `400`, no handler runs       |
/// | no handler for the path            | `404`                        |
/// | registry stopped                   | `503`                        |
/// | handler error or panic             | default response (`200`)     |
/// | receive ceiling exceeded, timeout  | nothing, connection dropped  |
/// | body inflates past the ceiling     | nothing, connection dropped  |
///
/// Handlers run synchronously on the worker task, so they should be short.
///
/// # Examples
///
/// ```no_run
/// use wireline::{Context, HandlerError, HandlerRegistry, Server};
/// use tokio::net::TcpListener;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = Arc::new(HandlerRegistry::new());
///     registry.register("/ping", |ctx: &mut Context| -> Result<(), HandlerError> {
///         ctx.response_mut().content_type(mime::TEXT_PLAIN).body("pong");
///         Ok(())
///     });
///
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .registry(registry)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    shared: Arc<Shared>,
}

struct Shared {
    registry: Arc<HandlerRegistry>,
    table: Arc<ConnectionTable>,
    shutdown: AtomicBool,

    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    resp_limits: RespLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            registry: None,
            server_limits: None,
            connection_limits: None,
            response_limits: None,
        }
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry the workers dispatch to.
    #[inline]
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        self.shared.registry.clone()
    }

    /// Table of the connections currently open.
    #[inline]
    pub fn connections(&self) -> Arc<ConnectionTable> {
        self.shared.table.clone()
    }

    /// Accepts connections forever.
    #[inline]
    pub async fn launch(self) {
        self.launch_until(pending()).await
    }

    /// Accepts connections until `signal` completes.
    ///
    /// On shutdown the listener is dropped, queued sockets are discarded and
    /// every open connection is told to disconnect.
    pub async fn launch_until<F: Future<Output = ()>>(self, signal: F) {
        tokio::pin!(signal);
        info!(addr = ?self.listener.local_addr().ok(), "server started");

        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(value) => self.enqueue(value),
                    Err(e) => debug!(cause = %e, "accept failed"),
                },
            }
        }

        self.shared.shutdown.store(true, Ordering::Release);
        let disconnected = self.shared.table.disconnect_all();
        info!(disconnected, "server stopped");
    }

    #[inline]
    fn enqueue(&self, value: (TcpStream, SocketAddr)) {
        match self.stream_queue.len() < self.shared.server_limits.max_pending_connections {
            true => self.stream_queue.push(value),
            false => {
                debug!(peer = %value.1, "pending queue full, rejecting");
                self.error_queue.push(value)
            }
        }
    }

    // `None` once the server has shut down.
    #[inline]
    async fn get_stream(queue: &TcpQueue, shared: &Shared) -> Option<(TcpStream, SocketAddr)> {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(value) = queue.pop() {
                return Some(value);
            }

            match &shared.server_limits.wait_strategy {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    registry: Option<Arc<HandlerRegistry>>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    response_limits: Option<RespLimits>,
}

impl ServerBuilder {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the handler registry. Without one the server starts with an
    /// empty registry, reachable through [`Server::registry`].
    #[inline(always)]
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Configures worker count, queueing and logging.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() {
    /// use wireline::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .server_limits(ServerLimits {
    ///         max_connections: 4,
    ///         max_pending_connections: 16,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection byte ceilings and timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures the defaults of fresh responses.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder and spawns the worker tasks.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Error message: ``The `listener` method must be called to create``
    ///
    /// Panics when the `listener` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let listener = self
            .listener
            .expect("The `listener` method must be called to create");

        let shared = Arc::new(Shared {
            registry: self.registry.unwrap_or_default(),
            table: Arc::new(ConnectionTable::new()),
            shutdown: AtomicBool::new(false),

            server_limits: self.server_limits.unwrap_or_default(),
            conn_limits: self.connection_limits.unwrap_or_default(),
            resp_limits: self.response_limits.unwrap_or_default(),
        });

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..shared.server_limits.max_connections {
            Self::spawn_worker(&stream_queue, &shared);
        }
        Self::spawn_alarmist(&error_queue, &shared);

        Server {
            listener,
            stream_queue,
            error_queue,
            shared,
        }
    }

    #[inline]
    fn spawn_worker(queue: &TcpQueue, shared: &Arc<Shared>) {
        let queue = queue.clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            while let Some((stream, _)) = Server::get_stream(&queue, &shared).await {
                let _ = stream.set_nodelay(true);

                let connection = Connection::new(stream, shared.conn_limits.clone(), shared.table.clone());
                exchange(connection, &shared).await;
            }
        });
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, shared: &Arc<Shared>) {
        let queue = queue.clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            while let Some((stream, _)) = Server::get_stream(&queue, &shared).await {
                let mut connection = Connection::detached(stream, shared.conn_limits.clone());

                let mut response = Response::new(&shared.resp_limits);
                response.status(StatusCode::ServiceUnavailable);

                if let Ok(wire) = response.serialize(Version::Http11, false, deflate::compress).await {
                    if let Err(e) = connection.send(&wire).await {
                        debug!(cause = %e, "failed to send 503");
                    }
                }
                connection.close(false).await;
            }
        });
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

// EXCHANGE

async fn exchange(mut connection: Connection, shared: &Shared) {
    let peer = connection.peer_addr();

    let head = match connection.read_headers().await {
        Ok(Some(head)) => head,
        Ok(None) => {
            trace!(?peer, "no request received");
            return connection.close(false).await;
        }
        Err(err) => return abort(connection, err).await,
    };

    let mut request = Request::parse(&head);

    let mut body = match request.expects_body() {
        true => {
            let max = shared.conn_limits.max_receive_size;
            match connection.read_body(max, request.content_length()).await {
                Ok(body) => body,
                Err(err) => return abort(connection, err).await,
            }
        }
        false => connection.take_pending(),
    };

    let raw_length = body.len();
    if request.is_compressed() && !body.is_empty() {
        match connection.decompress(&mut body) {
            Ok(out) => body.truncate(out.len),
            Err(err) if err.is_overflow() => return abort(connection, err).await,
            Err(e) => debug!(?peer, cause = %e, "body is not valid deflate, keeping it as received"),
        }
    }
    request.attach_body(body, raw_length);

    let mut ctx = Context::new(connection, request, Response::new(&shared.resp_limits));
    ctx.set_state(ConnState::Dispatching);

    let outcome = match ctx.request().method() {
        Method::Unknown => None,
        _ => Some(shared.registry.dispatch(&mut ctx)),
    };

    match outcome {
        None => {
            ctx.response_mut().status(StatusCode::BadRequest);
        }
        Some(Dispatch::NotFound) => {
            ctx.response_mut().status(StatusCode::NotFound);
        }
        Some(Dispatch::Unavailable) => {
            ctx.response_mut().status(StatusCode::ServiceUnavailable);
        }
        Some(Dispatch::Handled | Dispatch::Failed) => {}
    }

    let status = ctx.response().status.as_u16();
    match ctx.send_response().await {
        Ok(_) => {
            let stats = ctx.stats();
            let elapsed = stats.opened.elapsed();

            if shared.server_limits.verbose {
                info!(?peer, path = ctx.path(), status, read = stats.bytes_read, written = stats.bytes_written, ?elapsed, "exchange complete");
            } else {
                trace!(?peer, path = ctx.path(), status, read = stats.bytes_read, written = stats.bytes_written, ?elapsed, "exchange complete");
            }
        }
        Err(err) => report(peer, &err),
    }

    ctx.dispose(false).await;
}

async fn abort(mut connection: Connection, err: Error) {
    report(connection.peer_addr(), &err);
    connection.close(matches!(err, Error::Disconnected)).await;
}

fn report(peer: Option<SocketAddr>, err: &Error) {
    if err.is_overflow() {
        warn!(?peer, cause = %err, "dropping connection");
    } else {
        debug!(?peer, cause = %err, "exchange aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::HandlerError, http::charset};
    use std::{sync::atomic::AtomicUsize, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::oneshot,
        task::JoinHandle,
    };

    struct Running {
        addr: SocketAddr,
        table: Arc<ConnectionTable>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    }

    async fn start(registry: Arc<HandlerRegistry>, server_limits: ServerLimits) -> Running {
        let server = Server::builder()
            .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
            .registry(registry)
            .server_limits(server_limits)
            .connection_limits(ConnLimits {
                max_receive_size: 4096,
                read_timeout: Duration::from_millis(300),
                body_poll_window: Duration::from_millis(20),
                ..ConnLimits::default()
            })
            .build();

        let addr = server.local_addr().unwrap();
        let table = server.connections();
        let (stop, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.launch_until(async move {
            let _ = rx.await;
        }));

        Running { addr, table, stop, task }
    }

    fn limits() -> ServerLimits {
        ServerLimits {
            max_connections: 2,
            wait_strategy: WaitStrategy::Sleep(Duration::from_millis(1)),
            ..ServerLimits::default()
        }
    }

    async fn send(addr: SocketAddr, request: &[u8]) -> (String, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();

        let mut wire = Vec::new();
        stream.read_to_end(&mut wire).await.unwrap();

        let split = wire
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(wire.len(), |pos| pos + 4);
        let body = wire.split_off(split);

        (String::from_utf8(wire).unwrap(), body)
    }

    fn registry() -> Arc<HandlerRegistry> {
        let registry = Arc::new(HandlerRegistry::new());

        registry.register("/ping", |ctx: &mut Context| -> Result<(), HandlerError> {
            ctx.response_mut().content_type(mime::TEXT_PLAIN).body("pong");
            Ok(())
        });
        registry.register("/echo", |ctx: &mut Context| -> Result<(), HandlerError> {
            let text = ctx.request().text().to_string();
            let compress = ctx.request().query().contains("deflate");

            ctx.response_mut()
                .content_type(mime::TEXT_PLAIN)
                .compress(compress)
                .body(text);
            Ok(())
        });
        registry.register("/fail", |ctx: &mut Context| -> Result<(), HandlerError> {
            ctx.response_mut().status(StatusCode::Conflict).body("half-written");
            Err("storage offline".into())
        });
        registry.register("/panic", |_: &mut Context| -> Result<(), HandlerError> {
            panic!("handler bug");
        });
        registry.register("/length", |ctx: &mut Context| -> Result<(), HandlerError> {
            let report = format!("{} {}", ctx.request().raw_length(), ctx.request().text());
            ctx.response_mut().content_type(mime::TEXT_PLAIN).body(report);
            Ok(())
        });

        registry
    }

    #[tokio::test]
    async fn ping_pong() {
        let server = start(registry(), limits()).await;

        let (head, body) = send(server.addr, b"GET /ping HTTP/1.1\r\nHost: test\r\n\r\n").await;

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(head.contains("Content-Type: text/plain; charset=UTF-8\r\n"), "{head}");
        assert!(head.contains("Content-Length: 4\r\n"), "{head}");
        assert!(head.contains("Connection: close\r\n"), "{head}");
        assert_eq!(body, b"pong");

        server.stop.send(()).unwrap();
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn status_answers() {
        let server = start(registry(), limits()).await;

        #[rustfmt::skip]
        let cases: [(&[u8], &str); 4] = [
            (b"GET /missing HTTP/1.1\r\n\r\n",  "HTTP/1.1 404 Not Found\r\n"),
            (b"BREW /ping HTTP/1.1\r\n\r\n",    "HTTP/1.1 400 Bad Request\r\n"),
            (b"GET /fail HTTP/1.0\r\n\r\n",     "HTTP/1.0 200 OK\r\n"),
            (b"GET /panic HTTP/1.1\r\n\r\n",    "HTTP/1.1 200 OK\r\n"),
        ];

        for (request, status_line) in cases {
            let (head, body) = send(server.addr, request).await;

            assert!(head.starts_with(status_line), "{head}");
            assert!(head.contains("Content-Length: 0\r\n"), "{head}");
            assert!(body.is_empty());
        }

        // Faulty handlers leave the server serving.
        let (_, body) = send(server.addr, b"GET /ping HTTP/1.1\r\n\r\n").await;
        assert_eq!(body, b"pong");

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn body_with_content_length_and_charset() {
        let server = start(registry(), limits()).await;

        let text = charset::encode("Привет", encoding_rs::WINDOWS_1251);
        let mut request = format!(
            "POST /echo HTTP/1.1\r\nContent-Type: text/plain; charset=windows-1251\r\nContent-Length: {}\r\n\r\n",
            text.len()
        )
        .into_bytes();
        request.extend_from_slice(&text);

        let (head, body) = send(server.addr, &request).await;

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert_eq!(String::from_utf8(body).unwrap(), "Привет");

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn deflate_both_ways() {
        let server = start(registry(), limits()).await;

        let original = "reading=42;".repeat(50);
        let mut packed = original.clone().into_bytes();
        let out = deflate::compress(&mut packed).unwrap();
        packed.truncate(out.len);

        let mut request = format!("POST /echo?deflate HTTP/1.1\r\nContent-Length: {}\r\n\r\n", packed.len()).into_bytes();
        request.extend_from_slice(&packed);

        let (head, mut body) = send(server.addr, &request).await;

        assert!(head.contains("Content-Encoding: deflate\r\n"), "{head}");
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())), "{head}");

        let out = deflate::decompress(&mut body).unwrap();
        assert_eq!(&body[..out.len], original.as_bytes());

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn undecodable_deflate_body_is_kept_raw() {
        let server = start(registry(), limits()).await;

        let raw = "not deflate at all";
        let request = format!(
            "POST /length HTTP/1.1\r\nContent-Encoding: deflate\r\nContent-Length: {}\r\n\r\n{raw}",
            raw.len()
        );

        let (head, body) = send(server.addr, request.as_bytes()).await;

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert_eq!(String::from_utf8(body).unwrap(), format!("{} {raw}", raw.len()));

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn deflate_bomb_gets_no_answer() {
        let server = start(registry(), limits()).await;

        // Fits the 4 KiB ceiling on the wire, inflates to 1 MiB.
        let mut packed = vec![0; 1 << 20];
        let out = deflate::compress(&mut packed).unwrap();
        packed.truncate(out.len);
        assert!(packed.len() < 4096);

        let mut request = format!("POST /length?deflate HTTP/1.1\r\nContent-Length: {}\r\n\r\n", packed.len()).into_bytes();
        request.extend_from_slice(&packed);

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream.write_all(&request).await.unwrap();

        let mut wire = Vec::new();
        let _ = stream.read_to_end(&mut wire).await;
        assert!(wire.is_empty());

        let (_, body) = send(server.addr, b"GET /ping HTTP/1.1\r\n\r\n").await;
        assert_eq!(body, b"pong");

        server.stop.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_panic_is_isolated() {
        let registry = registry();
        let in_flight = Arc::new(AtomicUsize::new(0));

        // Each handler waits (bounded) until the other one is running too.
        fn rendezvous(in_flight: &AtomicUsize) -> bool {
            in_flight.fetch_add(1, Ordering::SeqCst);
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while in_flight.load(Ordering::SeqCst) < 2 {
                if std::time::Instant::now() > deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            true
        }

        let overlapped = Arc::new(AtomicBool::new(false));
        let (flight, seen) = (in_flight.clone(), overlapped.clone());
        registry.register("/slow-panic", move |_: &mut Context| -> Result<(), HandlerError> {
            if rendezvous(&flight) {
                seen.store(true, Ordering::SeqCst);
            }
            panic!("handler bug under load");
        });
        let flight = in_flight.clone();
        registry.register("/slow-ping", move |ctx: &mut Context| -> Result<(), HandlerError> {
            rendezvous(&flight);
            ctx.response_mut().content_type(mime::TEXT_PLAIN).body("pong");
            Ok(())
        });

        let server = start(registry, limits()).await;

        let (failed, answered) = tokio::join!(
            send(server.addr, b"GET /slow-panic HTTP/1.1\r\n\r\n"),
            send(server.addr, b"GET /slow-ping HTTP/1.1\r\n\r\n"),
        );

        assert!(overlapped.load(Ordering::SeqCst), "handlers did not run concurrently");
        assert!(failed.0.starts_with("HTTP/1.1 200 OK\r\n"), "{}", failed.0);
        assert!(failed.1.is_empty());
        assert!(answered.0.starts_with("HTTP/1.1 200 OK\r\n"), "{}", answered.0);
        assert_eq!(answered.1, b"pong");

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn oversized_request_gets_no_answer() {
        let server = start(registry(), limits()).await;

        let mut request = b"GET /ping HTTP/1.1\r\nX-Fill: ".to_vec();
        request.resize(8192, b'a');

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let _ = stream.write_all(&request).await;

        let mut wire = Vec::new();
        let _ = stream.read_to_end(&mut wire).await;
        assert!(wire.is_empty());

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn stopped_registry_is_unavailable() {
        let registry = registry();
        let server = start(registry.clone(), limits()).await;
        registry.stop();

        let (head, _) = send(server.addr, b"GET /ping HTTP/1.1\r\n\r\n").await;
        assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{head}");

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn full_queue_is_rejected() {
        let server = start(
            registry(),
            ServerLimits {
                max_connections: 0,
                max_pending_connections: 0,
                ..limits()
            },
        )
        .await;

        // Rejected sockets are answered without being read, so send nothing.
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut wire = Vec::new();
        stream.read_to_end(&mut wire).await.unwrap();

        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{text}");
        assert!(text.ends_with("Content-Length: 0\r\nConnection: close\r\n\r\n"), "{text}");

        server.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn shutdown_disconnects_open_connections() {
        let server = start(registry(), limits()).await;

        // Connects but never finishes its header block.
        let mut idle = TcpStream::connect(server.addr).await.unwrap();
        idle.write_all(b"GET /ping HT").await.unwrap();

        while server.table.is_empty() {
            tokio_sleep(Duration::from_millis(1)).await;
        }

        server.stop.send(()).unwrap();
        server.task.await.unwrap();

        let mut wire = Vec::new();
        let _ = idle.read_to_end(&mut wire).await;
        assert!(wire.is_empty());
        assert!(server.table.is_empty());
    }
}
