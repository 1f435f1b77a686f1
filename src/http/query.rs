//! URL query string codec and the parameter map handed to handlers.

use crate::http::types::FieldMap;
use std::collections::BTreeMap;

/// Decodes a query string into ordered `(key, value)` pairs.
///
/// - an optional leading `?` is ignored, so `?a=1` and `a=1` are equivalent
/// - segments split on `&`, then on the first `=`
/// - a segment without `=` yields an empty value
/// - empty segments (`a=1&&b=2`) are skipped
/// - keys and values are percent-decoded and `+` becomes a space; a broken
///   escape such as `%zz` stays as written
///
/// Never fails.
///
/// # Examples
/// ```
/// use wireline::query;
///
/// let pairs = query::decode_pairs("?name=John%20Doe&flag&sum=1+2");
/// assert_eq!(pairs, [
///     ("name".to_string(), "John Doe".to_string()),
///     ("flag".to_string(), String::new()),
///     ("sum".to_string(), "1 2".to_string()),
/// ]);
/// ```
pub fn decode_pairs(query: &str) -> Vec<(String, String)> {
    let query = query.strip_prefix('?').unwrap_or(query);
    if query.is_empty() {
        return Vec::new();
    }

    serde_urlencoded::from_str(query).unwrap_or_else(|_| fallback_pairs(query))
}

/// Decodes a query string into a case-insensitive [`QueryParams`] map.
///
/// On duplicate keys the last value wins.
pub fn decode(query: &str) -> QueryParams {
    decode_pairs(query).into_iter().collect()
}

/// Encodes a map into a query string.
///
/// Pairs are sorted by key so equal maps always produce equal strings.
/// `decode(&encode(m))` returns the same pairs for any map without control
/// characters.
///
/// # Examples
/// ```
/// use wireline::query;
/// use std::collections::HashMap;
///
/// let map = HashMap::from([("b", "x y"), ("a", "1&2")]);
/// assert_eq!(query::encode(&map), "a=1%262&b=x+y");
/// ```
pub fn encode<'a, I, K, V>(params: I) -> String
where
    I: IntoIterator<Item = (&'a K, &'a V)>,
    K: AsRef<str> + ?Sized + 'a,
    V: AsRef<str> + ?Sized + 'a,
{
    let sorted: BTreeMap<&str, &str> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .collect();

    // Serializing a flat map of strings cannot fail.
    serde_urlencoded::to_string(&sorted).unwrap_or_default()
}

// Only reached if the deserializer ever rejects input; keeps `decode` total.
fn fallback_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (segment.to_string(), String::new()),
        })
        .collect()
}

/// Query parameters of a request.
///
/// Keys compare ASCII case-insensitively; the last duplicate wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(FieldMap);

impl QueryParams {
    #[inline]
    pub const fn new() -> Self {
        Self(FieldMap::new())
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.0.get(key).is_some()
    }

    #[inline]
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

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

    /// Re-encodes the parameters with [`encode`].
    pub fn to_query_string(&self) -> String {
        encode(self.iter())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = QueryParams::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}
