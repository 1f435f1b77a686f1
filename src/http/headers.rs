//! Protocol header collection

use crate::http::types::FieldMap;

/// Header fields of a request or response.
///
/// Names compare ASCII case-insensitively and a repeated name overwrites the
/// earlier value (last write wins) while keeping its original position.
///
/// # Examples
/// ```
/// use wireline::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-Signature", "abc");
/// headers.insert("x-signature", "def");
///
/// assert_eq!(headers.len(), 1);
/// assert_eq!(headers.get("X-SIGNATURE"), Some("def"));
/// assert_eq!(headers.to_bytes(), b"X-Signature: def\r\n");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(FieldMap);

impl Headers {
    #[inline]
    pub const fn new() -> Self {
        Self(FieldMap::new())
    }

    /// Returns the value stored under `name`, ignoring case.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.0.get(name).is_some()
    }

    /// Inserts or replaces a header, returning the previous value.
    #[inline]
    pub fn insert<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    #[inline]
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    /// Iterates headers in first-insertion order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Appends every header as a `Name: Value\r\n` line.
    ///
    /// CR and LF inside names or values are dropped so a handler cannot
    /// smuggle extra header lines into the response.
    pub fn write_to(&self, buffer: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            push_sanitized(buffer, name);
            buffer.extend_from_slice(b": ");
            push_sanitized(buffer, value);
            buffer.extend_from_slice(b"\r\n");
        }
    }

    /// Serializes the collection into a raw header block (without the
    /// terminating blank line).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.len() * 32);
        self.write_to(&mut buffer);
        buffer
    }
}

#[inline]
fn push_sanitized(buffer: &mut Vec<u8>, value: &str) {
    match memchr::memchr2(b'\r', b'\n', value.as_bytes()) {
        None => buffer.extend_from_slice(value.as_bytes()),
        Some(_) => buffer.extend(value.bytes().filter(|b| !matches!(b, b'\r' | b'\n'))),
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
