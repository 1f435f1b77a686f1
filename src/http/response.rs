//! Outbound response model and its wire serialization.

use crate::{
    errors::Result,
    http::{charset, headers::Headers, StatusCode, Version},
    limits::RespLimits,
    server::deflate::Transformed,
};
use encoding_rs::Encoding;
use mime::Mime;
use std::{fmt, io::Read, mem, sync::Arc};

/// Response body.
///
/// `Shared` bytes are only ever borrowed by the engine: the response holds a
/// reference and the caller keeps its own copy alive as long as it likes.
#[derive(Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Text, encoded with the response charset when sent.
    Text(String),
    Bytes(Vec<u8>),
    Shared(Arc<[u8]>),
    /// Read to the end on a blocking thread when the response is sent.
    /// Consumed by sending.
    Stream(Box<dyn Read + Send>),
}

impl Payload {
    pub fn stream<R: Read + Send + 'static>(reader: R) -> Self {
        Self::Stream(Box::new(reader))
    }

    /// Byte length when known without reading; `None` for streams.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Text(text) => Some(text.len()),
            Self::Bytes(bytes) => Some(bytes.len()),
            Self::Shared(bytes) => Some(bytes.len()),
            Self::Stream(_) => None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Shared(bytes) => write!(f, "Shared({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

macro_rules! impl_payload_from {
    ($($t:ty => |$v:ident| $e:expr),+ $(,)?) => {
        $(impl From<$t> for Payload {
            #[inline]
            fn from($v: $t) -> Self {
                $e
            }
        })+
    };
}

impl_payload_from! {
    &str => |v| Payload::Text(v.to_owned()),
    String => |v| Payload::Text(v),
    &[u8] => |v| Payload::Bytes(v.to_vec()),
    Vec<u8> => |v| Payload::Bytes(v),
    Arc<[u8]> => |v| Payload::Shared(v),
}

/// Response populated by a handler and serialized once the handler returns.
///
/// Fields are public; each one also has a chaining setter of the same name.
///
/// # Examples
/// ```
/// use wireline::{Response, StatusCode};
///
/// let mut resp = Response::default();
/// resp.status(StatusCode::Created)
///     .content_type(mime::APPLICATION_JSON)
///     .header("X-Trace", "abc")
///     .cache_seconds(60)
///     .body(r#"{"ok":true}"#);
///
/// assert_eq!(resp.status, StatusCode::Created);
/// assert_eq!(resp.data.len(), Some(11));
/// ```
///
/// # Generated headers
///
/// | Header                | When                                                    |
/// |-----------------------|---------------------------------------------------------|
/// | `Content-Type`        | always; `; charset=` added for textual types            |
/// | `Content-Length`      | always                                                  |
/// | `Connection: close`   | always                                                  |
/// | `Content-Encoding`    | `compress` set and the body is not empty                |
/// | `Content-Disposition` | `file_name` set                                         |
/// | `Cache-Control`       | `cache_seconds >= 0`: `0` disables caching              |
///
/// User headers with the same name replace generated ones, except
/// `Content-Length` and `Connection` which are always computed.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub content_type: Mime,
    /// Charset for [`Payload::Text`] bodies and the `charset=` parameter.
    pub encoding: &'static Encoding,
    pub data: Payload,
    /// Deflate the body before sending.
    pub compress: bool,
    /// Drop the payload when the exchange is disposed (default: `true`).
    pub free_data_on_dispose: bool,
    /// Suggests a download under this name.
    pub file_name: Option<String>,
    /// `Cache-Control` lifetime; negative values omit the header (default: `-1`).
    pub cache_seconds: i64,

    default_content_type: Mime,
    default_encoding: &'static Encoding,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(&RespLimits::default())
    }
}

impl Response {
    pub fn new(limits: &RespLimits) -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Headers::new(),
            content_type: limits.default_content_type.clone(),
            encoding: limits.default_encoding,
            data: Payload::Empty,
            compress: false,
            free_data_on_dispose: true,
            file_name: None,
            cache_seconds: -1,

            default_content_type: limits.default_content_type.clone(),
            default_encoding: limits.default_encoding,
        }
    }

    /// Puts every field back to its initial value.
    pub fn reset(&mut self) {
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.content_type = self.default_content_type.clone();
        self.encoding = self.default_encoding;
        self.data = Payload::Empty;
        self.compress = false;
        self.free_data_on_dispose = true;
        self.file_name = None;
        self.cache_seconds = -1;
    }

    /// Releases the payload if `free_data_on_dispose` is set.
    pub fn dispose(&mut self) {
        if self.free_data_on_dispose {
            self.data = Payload::Empty;
        }
        self.headers.clear();
    }
}

/// Chaining setters
impl Response {
    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Adds or replaces a header.
    #[inline]
    pub fn header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the content type. A `charset` parameter it carries also becomes
    /// the response encoding.
    pub fn content_type(&mut self, content_type: Mime) -> &mut Self {
        if let Some(name) = content_type.get_param(mime::CHARSET) {
            if let Some(encoding) = charset::resolve(name.as_str()) {
                self.encoding = encoding;
            }
        }
        self.content_type = content_type;
        self
    }

    #[inline]
    pub fn encoding(&mut self, encoding: &'static Encoding) -> &mut Self {
        self.encoding = encoding;
        self
    }

    #[inline]
    pub fn body<T: Into<Payload>>(&mut self, data: T) -> &mut Self {
        self.data = data.into();
        self
    }

    #[inline]
    pub fn compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;
        self
    }

    #[inline]
    pub fn free_data_on_dispose(&mut self, free: bool) -> &mut Self {
        self.free_data_on_dispose = free;
        self
    }

    #[inline]
    pub fn file_name<T: Into<String>>(&mut self, name: T) -> &mut Self {
        self.file_name = Some(name.into());
        self
    }

    #[inline]
    pub fn cache_seconds(&mut self, seconds: i64) -> &mut Self {
        self.cache_seconds = seconds;
        self
    }
}

impl Response {
    /// Renders the full message: status line, headers, blank line and body.
    ///
    /// `deflate` runs at most once, only when `compress` is set and the body
    /// is not empty. With `head_only` the body is left out but
    /// `Content-Length` still describes it.
    pub(crate) async fn serialize<F>(&mut self, version: Version, head_only: bool, deflate: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<Transformed>,
    {
        let mut body = self.body_bytes().await?;

        let compressed = self.compress && !body.is_empty();
        if compressed {
            let out = deflate(&mut body)?;
            body.truncate(out.len);
        }

        let headers = self.wire_headers(body.len(), compressed);
        let status_line = self.status.status_line(version);

        let body_len = if head_only { 0 } else { body.len() };
        let mut wire = Vec::with_capacity(status_line.len() + headers.len() * 32 + 2 + body_len);

        wire.extend_from_slice(status_line);
        headers.write_to(&mut wire);
        wire.extend_from_slice(b"\r\n");
        if !head_only {
            wire.extend_from_slice(&body);
        }

        Ok(wire)
    }

    // Owned payloads that are freed on dispose anyway are moved, not copied.
    async fn body_bytes(&mut self) -> Result<Vec<u8>> {
        let owned = self.free_data_on_dispose || matches!(self.data, Payload::Stream(_));
        if !owned {
            return Ok(match &self.data {
                Payload::Empty | Payload::Stream(_) => Vec::new(),
                Payload::Text(text) => charset::encode(text, self.encoding),
                Payload::Bytes(bytes) => bytes.clone(),
                Payload::Shared(bytes) => bytes.to_vec(),
            });
        }

        Ok(match mem::take(&mut self.data) {
            Payload::Empty => Vec::new(),
            Payload::Text(text) if self.encoding == encoding_rs::UTF_8 => text.into_bytes(),
            Payload::Text(text) => charset::encode(&text, self.encoding),
            Payload::Bytes(bytes) => bytes,
            Payload::Shared(bytes) => bytes.to_vec(),
            Payload::Stream(mut reader) => {
                let read = tokio::task::spawn_blocking(move || {
                    let mut buffer = Vec::new();
                    reader.read_to_end(&mut buffer).map(|_| buffer)
                });
                read.await.map_err(std::io::Error::other)??
            }
        })
    }

    fn wire_headers(&self, content_length: usize, compressed: bool) -> Headers {
        let mut headers = Headers::new();

        headers.insert("Content-Type", self.content_type_value());
        headers.insert("Content-Length", content_length.to_string());
        headers.insert("Connection", "close");

        if compressed {
            headers.insert("Content-Encoding", "deflate");
        }
        if let Some(name) = &self.file_name {
            let name = name.replace(['"', '\\'], "");
            headers.insert("Content-Disposition", format!("attachment; filename=\"{name}\""));
        }
        match self.cache_seconds {
            0 => {
                headers.insert("Cache-Control", "no-cache, no-store");
            }
            seconds if seconds > 0 => {
                headers.insert("Cache-Control", format!("public, max-age={seconds}"));
            }
            _ => {}
        }

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            headers.insert(name, value);
        }

        headers
    }

    fn content_type_value(&self) -> String {
        let mime = &self.content_type;
        if mime.get_param(mime::CHARSET).is_some() || !is_textual(mime) {
            return mime.to_string();
        }

        format!("{mime}; charset={}", self.encoding.name())
    }
}

fn is_textual(mime: &Mime) -> bool {
    mime.type_() == mime::TEXT
        || mime.subtype() == mime::JSON
        || mime.subtype() == mime::XML
        || mime.subtype() == mime::JAVASCRIPT
        || mime.suffix() == Some(mime::JSON)
        || mime.suffix() == Some(mime::XML)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{server::deflate, tools::*};
    use encoding_rs::WINDOWS_1251;

    async fn render(resp: &mut Response) -> String {
        let wire = resp.serialize(Version::Http11, false, deflate::compress).await.unwrap();
        String::from_utf8_lossy(&wire).into_owned()
    }

    #[tokio::test]
    async fn default_response() {
        let mut resp = Response::default();

        assert_eq!(
            render(&mut resp).await,
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             \r\n"
        );
    }

    #[tokio::test]
    async fn generated_headers() {
        let mut resp = Response::default();
        resp.status(StatusCode::Accepted)
            .content_type(mime::TEXT_PLAIN)
            .file_name("report \"q3\".txt")
            .cache_seconds(0)
            .header("X-Id", "7")
            .body("pong");

        assert_eq!(
            render(&mut resp).await,
            "HTTP/1.1 202 Accepted\r\n\
             Content-Type: text/plain; charset=UTF-8\r\n\
             Content-Length: 4\r\n\
             Connection: close\r\n\
             Content-Disposition: attachment; filename=\"report q3.txt\"\r\n\
             Cache-Control: no-cache, no-store\r\n\
             X-Id: 7\r\n\
             \r\n\
             pong"
        );
    }

    #[tokio::test]
    async fn user_headers_override_except_framing() {
        let mut resp = Response::default();
        resp.cache_seconds(30)
            .header("cache-control", "private")
            .header("Content-Length", "999")
            .header("Connection", "keep-alive")
            .body(vec![1, 2, 3]);

        let text = render(&mut resp).await;
        assert!(text.contains("Cache-Control: private\r\n"), "{text}");
        assert!(text.contains("Content-Length: 3\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"), "{text}");
        assert!(!text.contains("999"), "{text}");
        assert!(!text.contains("max-age"), "{text}");
    }

    #[test]
    fn cache_control_values() {
        #[rustfmt::skip]
        let cases = [
            (-1,   None),
            (0,    Some("no-cache, no-store")),
            (3600, Some("public, max-age=3600")),
        ];

        for (seconds, expected) in cases {
            let mut resp = Response::default();
            resp.cache_seconds(seconds);

            assert_eq!(resp.wire_headers(0, false).get("Cache-Control"), expected, "{seconds}");
        }
    }

    #[tokio::test]
    async fn text_uses_response_charset() {
        let mut resp = Response::default();
        resp.content_type("text/plain; charset=windows-1251".parse().unwrap())
            .body("Привет");
        assert_eq!(resp.encoding, WINDOWS_1251);

        let wire = resp.serialize(Version::Http11, false, deflate::compress).await.unwrap();
        let (head, body) = wire.split_at(wire.len() - 6);

        assert!(str_op(head).contains("Content-Type: text/plain; charset=windows-1251\r\n"));
        assert!(str_op(head).contains("Content-Length: 6\r\n"));
        assert_eq!(charset::decode(body, WINDOWS_1251), "Привет");
    }

    #[tokio::test]
    async fn compressed_exactly_once() {
        let original = "status=ok;".repeat(100);
        let mut resp = Response::default();
        resp.compress(true).body(original.as_str());

        let mut calls = 0;
        let wire = resp
            .serialize(Version::Http11, false, |buffer| {
                calls += 1;
                deflate::compress(buffer)
            })
            .await
            .unwrap();
        assert_eq!(calls, 1);

        let split = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = str_op(&wire[..split]);
        let mut body = wire[split..].to_vec();

        assert!(head.contains("Content-Encoding: deflate\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));

        let out = deflate::decompress(&mut body).unwrap();
        assert_eq!(&body[..out.len], original.as_bytes());
    }

    #[tokio::test]
    async fn empty_body_is_not_compressed() {
        let mut resp = Response::default();
        resp.compress(true);

        let text = render(&mut resp).await;
        assert!(!text.contains("Content-Encoding"), "{text}");
    }

    #[tokio::test]
    async fn head_only_keeps_length() {
        let mut resp = Response::default();
        resp.body("hello");

        let wire = resp.serialize(Version::Http10, true, deflate::compress).await.unwrap();
        let text = str_op(&wire);

        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn stream_payload() {
        let mut resp = Response::default();
        resp.body(Payload::stream(std::io::Cursor::new(b"streamed".to_vec())));
        assert_eq!(resp.data.len(), None);

        assert!(render(&mut resp).await.ends_with("Content-Length: 8\r\nConnection: close\r\n\r\nstreamed"));
        assert!(resp.data.is_empty());
    }

    #[tokio::test]
    async fn shared_payload_and_dispose() {
        let shared: Arc<[u8]> = Arc::from(&b"cached"[..]);

        let mut resp = Response::default();
        resp.free_data_on_dispose(false).body(shared.clone());
        assert_eq!(Arc::strong_count(&shared), 2);

        assert!(render(&mut resp).await.ends_with("cached"));
        resp.dispose();
        assert!(matches!(resp.data, Payload::Shared(_)));

        resp.free_data_on_dispose(true).dispose();
        assert!(resp.data.is_empty());
        assert_eq!(Arc::strong_count(&shared), 1);
    }

    #[test]
    fn reset_restores_defaults() {
        let limits = RespLimits {
            default_content_type: mime::TEXT_PLAIN,
            ..RespLimits::default()
        };
        let mut resp = Response::new(&limits);
        resp.status(StatusCode::NotFound)
            .content_type(mime::APPLICATION_JSON)
            .encoding(WINDOWS_1251)
            .compress(true)
            .file_name("x")
            .header("A", "b")
            .body("data");

        resp.reset();

        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.content_type, mime::TEXT_PLAIN);
        assert_eq!(resp.encoding, encoding_rs::UTF_8);
        assert!(resp.headers.is_empty());
        assert!(resp.data.is_empty());
        assert!(!resp.compress);
        assert_eq!(resp.file_name, None);
        assert_eq!(resp.cache_seconds, -1);
    }

    #[test]
    fn textual_types() {
        #[rustfmt::skip]
        let cases = [
            ("text/html",                   true),
            ("application/json",            true),
            ("application/problem+json",    true),
            ("image/svg+xml",               true),
            ("application/octet-stream",    false),
            ("image/png",                   false),
        ];

        for (value, expected) in cases {
            assert_eq!(is_textual(&value.parse().unwrap()), expected, "{value}");
        }
    }
}
