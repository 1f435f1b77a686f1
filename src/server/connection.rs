use crate::{
    errors::{Error, Result},
    limits::ConnLimits,
    server::deflate::{self, Transformed},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::TcpStream,
    sync::Notify,
    time::{timeout, timeout_at, Instant as Deadline},
};
use tracing::{debug, trace};

const MIN_CHUNK: usize = 512;
const MAX_CHUNK: usize = 16 * 1024;

/// Byte stream a [`Connection`] can drive.
///
/// Implemented for [`TcpStream`] and for tokio's in-memory [`DuplexStream`].
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    /// Address of the remote end, when there is one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Asks the OS to size the send buffer to at least `size` bytes.
    fn set_send_buffer(&self, _size: usize) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_send_buffer(&self, size: usize) -> io::Result<()> {
        socket2::SockRef::from(self).set_send_buffer_size(size)
    }
}

impl Transport for DuplexStream {}

// CONNECTION TABLE

/// Live connections of a server.
///
/// Each [`Connection`] registers itself on creation and unregisters on
/// close. [`ConnectionTable::disconnect_all`] is the disconnect notifier: it
/// empties the table and wakes every connection, which then closes without
/// touching the table again.
#[derive(Default)]
pub struct ConnectionTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, TableEntry>>,
}

struct TableEntry {
    peer: Option<SocketAddr>,
    opened: Instant,
    disconnect: Arc<Notify>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, peer: Option<SocketAddr>) -> (u64, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let disconnect = Arc::new(Notify::new());

        self.entries.lock().insert(
            id,
            TableEntry {
                peer,
                opened: Instant::now(),
                disconnect: disconnect.clone(),
            },
        );

        (id, disconnect)
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Number of connections currently open.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Peers of the open connections with how long each has been open.
    pub fn snapshot(&self) -> Vec<(Option<SocketAddr>, Duration)> {
        self.entries
            .lock()
            .values()
            .map(|entry| (entry.peer, entry.opened.elapsed()))
            .collect()
    }

    /// Removes every entry and tells each connection to go away.
    ///
    /// Returns the number of connections notified.
    pub fn disconnect_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (_, entry) in &drained {
            // `notify_one` stores a permit, so a connection between two reads
            // still sees it on its next read.
            entry.disconnect.notify_one();
        }
        drained.len()
    }
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("open", &self.len())
            .finish()
    }
}

// CONNECTION

/// Lifecycle of a [`Connection`].
///
/// `Open → ReadingHeaders → ReadingBody → Dispatching → Writing → Closed`.
/// `Closed` is absorbing: every operation afterwards is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    ReadingHeaders,
    ReadingBody,
    Dispatching,
    Writing,
    Closed,
}

/// Byte counters of one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnStats {
    pub opened: Instant,
    pub bytes_read: usize,
    pub bytes_written: usize,
}

impl ConnStats {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }
}

/// One accepted socket and the byte-level primitives of an exchange.
pub struct Connection {
    id: u64,
    peer: Option<SocketAddr>,
    stream: Option<Box<dyn Transport>>,
    state: ConnState,

    // Bytes received past the header terminator, served first by reads.
    pending: Vec<u8>,
    scratch: Vec<u8>,
    send_hint: usize,

    limits: ConnLimits,
    stats: ConnStats,

    table: Option<Arc<ConnectionTable>>,
    disconnect: Arc<Notify>,
}

impl Connection {
    /// Wraps `stream` and registers it in `table`.
    pub fn new<T: Transport>(stream: T, limits: ConnLimits, table: Arc<ConnectionTable>) -> Self {
        let peer = stream.peer_addr();
        let (id, disconnect) = table.register(peer);

        Self::build(Box::new(stream), peer, id, disconnect, limits, Some(table))
    }

    /// Wraps `stream` without any connection table.
    pub fn detached<T: Transport>(stream: T, limits: ConnLimits) -> Self {
        let peer = stream.peer_addr();
        Self::build(Box::new(stream), peer, 0, Arc::new(Notify::new()), limits, None)
    }

    fn build(
        stream: Box<dyn Transport>,
        peer: Option<SocketAddr>,
        id: u64,
        disconnect: Arc<Notify>,
        limits: ConnLimits,
        table: Option<Arc<ConnectionTable>>,
    ) -> Self {
        Self {
            id,
            peer,
            stream: Some(stream),
            state: ConnState::Open,
            pending: Vec::new(),
            scratch: vec![0; MIN_CHUNK],
            send_hint: 0,
            limits,
            stats: ConnStats::new(),
            table,
            disconnect,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        if self.state != ConnState::Closed {
            self.state = state;
        }
    }

    /// Reads until the header terminator (`CR LF CR LF`) and returns the
    /// header block including the terminator.
    ///
    /// Bytes that arrive after the terminator are kept for [`read_body`].
    /// Returns `Ok(None)` when the peer sends nothing before EOF or the read
    /// deadline. The deadline covers the whole header block: `read_timeout`
    /// after the call, however steadily bytes keep arriving. Holding more than `max_receive_size` bytes without a
    /// terminator is an [`Error::Overflow`].
    ///
    /// [`read_body`]: Connection::read_body
    pub async fn read_headers(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Ok(None);
        }
        self.state = ConnState::ReadingHeaders;

        let max = self.limits.max_receive_size;
        let deadline = deadline_after(self.limits.read_timeout);
        let mut scanner = HeaderTerminator::default();
        let mut head = std::mem::take(&mut self.pending);

        if let Some(end) = scanner.feed(&head) {
            return self.finish_headers(head, end, max);
        }

        loop {
            if head.len() > max {
                return Err(Error::Overflow {
                    limit: max,
                    received: head.len(),
                });
            }

            // Never hold more than one byte past the ceiling.
            let room = max.saturating_add(1) - head.len();
            let n = match self.read_chunk(room, deadline).await {
                Ok(0) | Err(Error::Timeout) if head.is_empty() => return Ok(None),
                Ok(0) => return Err(Error::Closed),
                Ok(n) => n,
                Err(err) => return Err(err),
            };

            let start = head.len();
            head.extend_from_slice(&self.scratch[..n]);

            if let Some(end) = scanner.feed(&head[start..]) {
                return self.finish_headers(head, start + end, max);
            }
        }
    }

    fn finish_headers(&mut self, mut head: Vec<u8>, end: usize, max: usize) -> Result<Option<Vec<u8>>> {
        if end > max {
            return Err(Error::Overflow {
                limit: max,
                received: end,
            });
        }

        self.pending = head.split_off(end);
        trace!(bytes = end, pending = self.pending.len(), "header block complete");
        Ok(Some(head))
    }

    /// Reads the message body, never accepting more than `max_bytes`.
    ///
    /// With `expected` set (a `Content-Length`), exactly that many bytes are
    /// read; a declared length above the ceiling fails before reading. Without
    /// it, everything up to EOF or a quiet `body_poll_window` is taken.
    ///
    /// The whole body must arrive within `read_timeout`, otherwise the read
    /// fails with [`Error::Timeout`].
    pub async fn read_body(&mut self, max_bytes: usize, expected: Option<usize>) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Ok(Vec::new());
        }
        self.state = ConnState::ReadingBody;

        let deadline = deadline_after(self.limits.read_timeout);
        let mut body = std::mem::take(&mut self.pending);

        match expected {
            Some(len) if len > max_bytes => Err(Error::Overflow {
                limit: max_bytes,
                received: len,
            }),
            Some(len) => {
                while body.len() < len {
                    let n = self.read_chunk(len - body.len(), deadline).await?;
                    if n == 0 {
                        return Err(Error::Closed);
                    }
                    body.extend_from_slice(&self.scratch[..n]);
                }

                body.truncate(len);
                Ok(body)
            }
            None => loop {
                if body.len() > max_bytes {
                    return Err(Error::Overflow {
                        limit: max_bytes,
                        received: body.len(),
                    });
                }

                let room = max_bytes.saturating_add(1) - body.len();
                let quiet = deadline_after(self.limits.body_poll_window);
                match self.read_chunk(room, quiet.min(deadline)).await {
                    Ok(0) => return Ok(body),
                    Err(Error::Timeout) if quiet <= deadline => return Ok(body),
                    Ok(n) => body.extend_from_slice(&self.scratch[..n]),
                    Err(err) => return Err(err),
                }
            },
        }
    }

    /// Hands over bytes already buffered past the header block.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    // Reads at most `room` bytes into `scratch`, growing it after full reads.
    async fn read_chunk(&mut self, room: usize, deadline: Deadline) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };

        let want = room.min(self.scratch.len());
        let read = tokio::select! {
            biased;

            _ = self.disconnect.notified() => return Err(Error::Disconnected),
            read = timeout_at(deadline, stream.read(&mut self.scratch[..want])) => read,
        };

        let n = read.map_err(|_| Error::Timeout)??;
        self.stats.bytes_read += n;

        if n == self.scratch.len() && n < MAX_CHUNK {
            self.scratch.resize(n * 2, 0);
        }

        Ok(n)
    }

    /// Inflates `buffer` in place, producing at most `max_receive_size`
    /// bytes. See [`deflate::decompress_limited`].
    pub fn decompress(&self, buffer: &mut Vec<u8>) -> Result<Transformed> {
        let input = buffer.len();
        let out = deflate::decompress_limited(buffer, self.limits.max_receive_size)?;
        trace!(conn = self.id, input, output = out.len, reused = out.reused, "inflated");
        Ok(out)
    }

    /// Deflates `buffer` in place. See [`deflate::compress`].
    pub fn compress(&self, buffer: &mut Vec<u8>) -> Result<Transformed> {
        let input = buffer.len();
        let out = deflate::compress(buffer)?;
        trace!(conn = self.id, input, output = out.len, reused = out.reused, "deflated");
        Ok(out)
    }

    /// Writes the whole buffer.
    ///
    /// Payloads bigger than the current send-buffer hint grow it, capped at
    /// `max_send_buffer`.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.state = ConnState::Writing;

        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let hint = bytes.len().min(self.limits.max_send_buffer);
        if hint > self.send_hint {
            match stream.set_send_buffer(hint) {
                Ok(()) => self.send_hint = hint,
                Err(e) => debug!(cause = %e, hint, "failed to grow send buffer"),
            }
        }

        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        timeout(self.limits.write_timeout, write)
            .await
            .map_err(|_| Error::Timeout)??;

        self.stats.bytes_written += bytes.len();
        Ok(())
    }

    /// Closes the connection. Idempotent.
    ///
    /// `from_disconnect_notifier` must be `true` when the close was triggered
    /// by [`ConnectionTable::disconnect_all`], which already dropped the
    /// entry. Shutdown failures are logged, never returned.
    pub async fn close(&mut self, from_disconnect_notifier: bool) {
        if self.is_closed() {
            return;
        }
        self.state = ConnState::Closed;

        if !from_disconnect_notifier {
            if let Some(table) = &self.table {
                table.unregister(self.id);
            }
        }

        if let Some(mut stream) = self.stream.take() {
            match timeout(self.limits.write_timeout, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(conn = self.id, cause = %e, "shutdown connection error"),
                Err(_) => debug!(conn = self.id, "shutdown connection timed out"),
            }
        }

        self.pending = Vec::new();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Some(table) = &self.table {
                table.unregister(self.id);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

// `Instant + Duration` panics on overflow; an absurd timeout means "never".
fn deadline_after(wait: Duration) -> Deadline {
    let now = Deadline::now();
    now.checked_add(wait)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 30))
}

// HEADER TERMINATOR

/// Incremental detector for `CR LF CR LF`.
///
/// The state survives between calls, so a terminator split across reads is
/// still found. Any byte other than the expected CR/LF resets it.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HeaderTerminator {
    state: u8,
}

impl HeaderTerminator {
    /// Feeds `chunk`; returns the index just past the terminator if it
    /// completes inside this chunk.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        let mut i = 0;

        while i < chunk.len() {
            if self.state == 0 {
                i += memchr::memchr(b'\r', &chunk[i..])?;
            }

            self.state = match (self.state, chunk[i]) {
                (0 | 2, b'\r') => self.state + 1,
                (1 | 3, b'\n') => self.state + 1,
                (_, b'\r') => 1,
                _ => 0,
            };
            i += 1;

            if self.state == 4 {
                self.state = 0;
                return Some(i);
            }
        }

        None
    }
}
