//! Core protocol types shared by requests and responses

// METHOD

/// Request methods understood by the engine.
///
/// Anything else maps to [`Method::Unknown`], which the server answers with
/// `400 Bad Request` instead of dropping the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Unknown,
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    /// Maps a request-line token to a method. Matching is case-sensitive.
    #[inline]
    pub fn from_token(token: &[u8]) -> Self {
        match token {
            b"OPTIONS" => Self::Options,
            b"GET" => Self::Get,
            b"HEAD" => Self::Head,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"TRACE" => Self::Trace,
            b"CONNECT" => Self::Connect,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Options => "OPTIONS",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }
}

// VERSION

/// Protocol version echoed back in the status line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Version {
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,
    /// [RFC 7230](https://tools.ietf.org/html/rfc7230). Also used for
    /// anything the parser does not recognise.
    #[default]
    Http11,
}

impl Version {
    #[inline]
    pub fn from_token(token: &[u8]) -> Self {
        match token {
            b"HTTP/1.0" => Self::Http10,
            _ => Self::Http11,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// Response status codes
        ///
        /// The subset of [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15)
        /// codes a small embedded endpoint needs.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub enum StatusCode {
            #[default]
            Ok = 200,
            $(
                #[doc = concat!(stringify!($num), " ", $str)]
                $name = $num,
            )+
        }

        impl StatusCode {
            pub const fn as_u16(&self) -> u16 {
                *self as u16
            }

            pub const fn reason(&self) -> &'static str {
                match self {
                    StatusCode::Ok => "OK",
                    $( StatusCode::$name => $str, )+
                }
            }

            // e.g. `b"HTTP/1.1 200 OK\r\n"`
            pub(crate) const fn status_line(&self, version: Version) -> &'static [u8] {
                match (self, version) {
                    (StatusCode::Ok, Version::Http11) => b"HTTP/1.1 200 OK\r\n",
                    (StatusCode::Ok, Version::Http10) => b"HTTP/1.0 200 OK\r\n",
                    $(
                        (StatusCode::$name, Version::Http11) => {
                            concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                        },
                        (StatusCode::$name, Version::Http10) => {
                            concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                        },
                    )+
                }
            }

            /// `true` for 2xx codes.
            pub const fn is_success(&self) -> bool {
                matches!(self.as_u16(), 200..=299)
            }
        }
    }
}

set_status_codes! {
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    PayloadTooLarge = (413, "Payload Too Large");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    UnprocessableEntity = (422, "Unprocessable Entity");
    TooManyRequests = (429, "Too Many Requests");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    ServiceUnavailable = (503, "Service Unavailable");
}

// FIELD MAP

/// Ordered name/value pairs with ASCII case-insensitive names.
///
/// Inserting an existing name replaces the value in place, so the first
/// position of a name is kept while the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[inline]
    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub(crate) fn insert(&mut self, name: String, value: String) -> Option<String> {
        match self.position(&name) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens() {
        #[rustfmt::skip]
        let cases: [(&[u8], Method); 11] = [
            (b"GET",     Method::Get),
            (b"HEAD",    Method::Head),
            (b"POST",    Method::Post),
            (b"PUT",     Method::Put),
            (b"DELETE",  Method::Delete),
            (b"OPTIONS", Method::Options),
            (b"TRACE",   Method::Trace),
            (b"CONNECT", Method::Connect),
            (b"get",     Method::Unknown),
            (b"PATCH",   Method::Unknown),
            (b"",        Method::Unknown),
        ];

        for (token, expected) in cases {
            assert_eq!(Method::from_token(token), expected);
        }
    }

    #[test]
    fn status_lines() {
        assert_eq!(StatusCode::Ok.status_line(Version::Http11), b"HTTP/1.1 200 OK\r\n");
        assert_eq!(
            StatusCode::NotFound.status_line(Version::Http10),
            b"HTTP/1.0 404 Not Found\r\n"
        );
        assert_eq!(StatusCode::ServiceUnavailable.as_u16(), 503);
        assert!(StatusCode::NoContent.is_success());
        assert!(!StatusCode::BadRequest.is_success());
    }

    #[test]
    fn field_map_case_and_order() {
        let mut map = FieldMap::new();
        assert_eq!(map.insert("Content-Type".into(), "a".into()), None);
        assert_eq!(map.insert("X-Id".into(), "1".into()), None);
        assert_eq!(map.insert("content-type".into(), "b".into()), Some("a".into()));

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("CONTENT-TYPE"), Some("b"));
        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            [("Content-Type", "b"), ("X-Id", "1")]
        );

        assert_eq!(map.remove("x-id"), Some("1".into()));
        assert_eq!(map.remove("x-id"), None);
        assert_eq!(map.len(), 1);
    }
}
