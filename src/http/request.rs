use crate::http::{charset, headers::Headers, query, query::QueryParams, Method, Version};
use encoding_rs::{Encoding, UTF_8};
use memchr::memchr;
use mime::Mime;

/// Parsed inbound request.
///
/// Parsing is lenient: a malformed request still yields a `Request`, with
/// whatever could be recovered filled in and everything else defaulted.
///
/// # Header block
///
/// ```text
/// [METHOD] SP [TARGET] SP [VERSION] CRLF
/// [NAME]: [VALUE] CRLF
/// ...
/// CRLF
/// ```
///
/// - a bare `LF` is accepted as a line terminator
/// - `[TARGET]` is split at the first `?` into path and query string
/// - a header line is split at its first `:`, not at the first space after
///   it, so `Name:value` parses the same as `Name: value`
/// - `[NAME]` is trimmed; one space after the colon is skipped and the rest
///   of the line, including further colons, is the value
/// - lines without a colon, or with an empty name, are ignored
/// - an unknown `[METHOD]` becomes [`Method::Unknown`]
///
/// # Body
///
/// The body is inflated when `Content-Encoding` names `deflate` or the query
/// carries a `deflate` flag, then decoded to text with the charset declared
/// by `Content-Type` (UTF-8 when absent or unknown).
///
/// # Examples
/// ```
/// use wireline::{Method, Request};
///
/// let mut req = Request::parse(
///     b"POST /hook?id=7 HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n",
/// );
/// req.attach_body(b"hello".to_vec(), 5);
///
/// assert_eq!(req.method(), Method::Post);
/// assert_eq!(req.path(), "/hook");
/// assert_eq!(req.query().get("id"), Some("7"));
/// assert_eq!(req.text(), "hello");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    version: Version,
    target: String,
    path_end: usize,

    query: QueryParams,
    headers: Headers,

    content_type: Mime,
    encoding: &'static Encoding,

    body: Vec<u8>,
    text: String,
    raw_length: usize,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Unknown,
            version: Version::Http11,
            target: String::new(),
            path_end: 0,
            query: QueryParams::new(),
            headers: Headers::new(),
            content_type: mime::APPLICATION_OCTET_STREAM,
            encoding: UTF_8,
            body: Vec::new(),
            text: String::new(),
            raw_length: 0,
        }
    }
}

impl Request {
    /// Parses a header block, as returned by
    /// [`Connection::read_headers`](crate::Connection::read_headers).
    pub fn parse(head: &[u8]) -> Self {
        let mut request = Request::default();
        let mut lines = Lines(head);

        if let Some(line) = lines.next() {
            request.parse_request_line(line);
        }

        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = split_header(line) {
                request.headers.insert(name, value);
            }
        }

        if let Some(value) = request.headers.get("content-type") {
            request.content_type = value.parse().unwrap_or(mime::APPLICATION_OCTET_STREAM);
            request.encoding = charset::from_content_type(value);
        }

        request
    }

    fn parse_request_line(&mut self, line: &[u8]) {
        let mut parts = line.split(|&b| b == b' ').filter(|part| !part.is_empty());

        self.method = parts.next().map_or(Method::Unknown, Method::from_token);
        self.target = parts
            .next()
            .map(|target| String::from_utf8_lossy(target).into_owned())
            .unwrap_or_default();
        self.version = parts.next().map_or(Version::Http11, Version::from_token);

        self.path_end = self.target.find('?').unwrap_or(self.target.len());
        self.query = query::decode(self.query_string());
    }

    /// Attaches the message body.
    ///
    /// `body` is what will be exposed (already inflated when the request was
    /// compressed); `raw_length` is the byte count as received.
    pub fn attach_body(&mut self, body: Vec<u8>, raw_length: usize) {
        self.text = charset::decode(&body, self.encoding);
        self.body = body;
        self.raw_length = raw_length;
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request target as sent: path plus optional `?query`.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Path part of the target. Used verbatim for handler lookup.
    #[inline]
    pub fn path(&self) -> &str {
        &self.target[..self.path_end]
    }

    /// Raw query string, without the leading `?`.
    #[inline]
    pub fn query_string(&self) -> &str {
        self.target.get(self.path_end + 1..).unwrap_or("")
    }

    #[inline]
    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Declared `Content-Length`, if it parses.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// Content type of the body; `application/octet-stream` when missing or
    /// unparsable.
    #[inline]
    pub fn content_type(&self) -> &Mime {
        &self.content_type
    }

    #[inline]
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Name of the body charset, e.g. `UTF-8` or `windows-1251`.
    #[inline]
    pub fn charset(&self) -> &'static str {
        self.encoding.name()
    }

    /// `true` when the body arrives deflated.
    pub fn is_compressed(&self) -> bool {
        let declared = self.headers.get("content-encoding").is_some_and(|value| {
            value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("deflate"))
        });

        declared || self.query.contains("deflate")
    }

    /// `true` when the method carries a body even without `Content-Length`.
    pub(crate) fn expects_body(&self) -> bool {
        self.content_length().is_some() || matches!(self.method, Method::Post | Method::Put)
    }

    /// Body bytes after inflation.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded with the request charset.
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Body size as received on the wire.
    #[inline]
    pub fn raw_length(&self) -> usize {
        self.raw_length
    }
}

// Splits on LF, dropping a trailing CR from each line.
struct Lines<'a>(&'a [u8]);

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.is_empty() {
            return None;
        }

        let (line, rest) = match memchr(b'\n', self.0) {
            Some(pos) => (&self.0[..pos], &self.0[pos + 1..]),
            None => (self.0, &[][..]),
        };
        self.0 = rest;

        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }
}

fn split_header(line: &[u8]) -> Option<(String, String)> {
    let colon = memchr(b':', line)?;
    let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
    if name.is_empty() {
        return None;
    }

    let value = &line[colon + 1..];
    let value = value.strip_prefix(b" ").unwrap_or(value);

    Some((name, String::from_utf8_lossy(value).into_owned()))
}
