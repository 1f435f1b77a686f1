//! Charset resolution and text transcoding.
//!
//! Resolution never fails: every unknown or malformed name degrades to UTF-8.

use encoding_rs::{Encoding, UTF_8};
use mime::Mime;

/// Resolves a charset name to an encoding.
///
/// Accepted forms:
/// - a label such as `utf-8`, `iso-8859-1`, `koi8-r`, `shift_jis`
/// - `windows-<codepage>` (`windows-1251`, `windows-65001`, ...)
/// - `cp<codepage>` or a bare numeric code page (`1252`)
///
/// Surrounding quotes and whitespace are ignored. Anything else yields
/// `None`; see [`resolve_or_default`] for the total version.
pub fn resolve(name: &str) -> Option<&'static Encoding> {
    let name = name.trim().trim_matches('"').trim();
    if name.is_empty() {
        return None;
    }

    if let Some(page) = code_page_number(name) {
        if let Some(encoding) = from_code_page(page) {
            return Some(encoding);
        }
    }

    Encoding::for_label_no_replacement(name.as_bytes())
}

/// Like [`resolve`], falling back to UTF-8.
#[inline]
pub fn resolve_or_default(name: &str) -> &'static Encoding {
    resolve(name).unwrap_or(UTF_8)
}

/// Picks the charset declared by a `Content-Type` value, or UTF-8.
///
/// Works on raw header text so that a value `mime` refuses to parse can still
/// carry a usable `charset=` parameter.
pub fn from_content_type(value: &str) -> &'static Encoding {
    if let Ok(mime) = value.parse::<Mime>() {
        return match mime.get_param(mime::CHARSET) {
            Some(charset) => resolve_or_default(charset.as_str()),
            None => UTF_8,
        };
    }

    value
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map_or(UTF_8, |(_, charset)| resolve_or_default(charset))
}

/// Decodes bytes as text in the given encoding.
///
/// Malformed sequences are replaced with U+FFFD. A byte-order mark is kept
/// as a character rather than used to switch encodings.
pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    if encoding == UTF_8 {
        if let Ok(text) = simdutf8::basic::from_utf8(bytes) {
            return text.to_owned();
        }
    }

    encoding.decode_without_bom_handling(bytes).0.into_owned()
}

/// Encodes text for the wire.
///
/// UTF-16 targets are written as UTF-8, as `encoding_rs` only encodes to
/// ASCII-compatible charsets; unmappable characters become numeric character
/// references.
pub fn encode(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    if encoding == UTF_8 {
        return text.as_bytes().to_vec();
    }

    encoding.encode(text).0.into_owned()
}

fn code_page_number(name: &str) -> Option<u16> {
    let digits = if let Some(rest) = strip_prefix_ignore_case(name, "windows-") {
        rest
    } else if let Some(rest) = strip_prefix_ignore_case(name, "cp") {
        rest
    } else {
        name
    };

    match digits.bytes().all(|b| b.is_ascii_digit()) {
        true => digits.parse().ok(),
        false => None,
    }
}

#[inline]
fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    match head.eq_ignore_ascii_case(prefix) {
        true => Some(&value[prefix.len()..]),
        false => None,
    }
}

/// Maps Windows code page numbers onto the encodings `encoding_rs` knows.
fn from_code_page(page: u16) -> Option<&'static Encoding> {
    use encoding_rs::*;

    Some(match page {
        65001 => UTF_8,
        1200 => UTF_16LE,
        1201 => UTF_16BE,
        874 => WINDOWS_874,
        932 => SHIFT_JIS,
        936 => GBK,
        949 => EUC_KR,
        950 => BIG5,
        1250 => WINDOWS_1250,
        1251 => WINDOWS_1251,
        // Latin-1 and US-ASCII are both decoded as windows-1252 on the web.
        1252 | 20127 | 28591 => WINDOWS_1252,
        1253 => WINDOWS_1253,
        1254 | 28599 => WINDOWS_1254,
        1255 => WINDOWS_1255,
        1256 => WINDOWS_1256,
        1257 => WINDOWS_1257,
        1258 => WINDOWS_1258,
        10000 => MACINTOSH,
        10007 => X_MAC_CYRILLIC,
        20866 => KOI8_R,
        21866 => KOI8_U,
        28592 => ISO_8859_2,
        28593 => ISO_8859_3,
        28594 => ISO_8859_4,
        28595 => ISO_8859_5,
        28596 => ISO_8859_6,
        28597 => ISO_8859_7,
        28598 => ISO_8859_8,
        28603 => ISO_8859_13,
        28605 => ISO_8859_15,
        38598 => ISO_8859_8_I,
        50220 => ISO_2022_JP,
        51932 => EUC_JP,
        54936 => GB18030,
        _ => return None,
    })
}
