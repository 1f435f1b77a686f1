//! In-place deflate transforms for request and response payloads.
//!
//! Output that fits in the input buffer is written back over it and the rest
//! of the buffer is zeroed, so no stale input survives past the new length.
//! Larger output replaces the buffer with a fresh allocation.

use crate::errors::{Error, Result};
use flate2::{
    read::{DeflateDecoder, ZlibDecoder},
    write::ZlibEncoder,
    Compression,
};
use std::io::{Read, Write};

/// Outcome of an in-place transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transformed {
    /// Number of meaningful bytes at the front of the buffer.
    pub len: usize,
    /// `true` when the input allocation was reused; bytes `len..` are zero.
    pub reused: bool,
}

/// Compresses `buffer` with zlib-framed deflate.
///
/// # Examples
/// ```
/// use wireline::deflate;
///
/// let mut buffer = vec![b'a'; 4096];
/// let out = deflate::compress(&mut buffer).unwrap();
///
/// assert!(out.reused);
/// assert!(buffer[out.len..].iter().all(|&b| b == 0));
///
/// let mut packed = buffer[..out.len].to_vec();
/// let back = deflate::decompress(&mut packed).unwrap();
/// assert_eq!(&packed[..back.len], &[b'a'; 4096][..]);
/// ```
pub fn compress(buffer: &mut Vec<u8>) -> Result<Transformed> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(buffer.len() / 2 + 64), Compression::default());
    encoder.write_all(buffer).map_err(Error::Deflate)?;
    let output = encoder.finish().map_err(Error::Deflate)?;

    Ok(store(buffer, output))
}

/// Inflates `buffer`.
///
/// Zlib framing is expected; raw deflate streams are accepted as a fallback
/// since some clients send those under the same name.
///
/// The output is unbounded. For untrusted input use [`decompress_limited`].
#[inline]
pub fn decompress(buffer: &mut Vec<u8>) -> Result<Transformed> {
    decompress_limited(buffer, usize::MAX)
}

/// Inflates `buffer`, refusing to produce more than `limit` bytes.
///
/// Output past `limit` fails with [`Error::Overflow`] and leaves `buffer`
/// untouched. At most `limit + 1` bytes are ever inflated.
///
/// # Examples
/// ```
/// use wireline::{deflate, Error};
///
/// let mut buffer = vec![0; 1 << 20];
/// let out = deflate::compress(&mut buffer).unwrap();
/// buffer.truncate(out.len);
///
/// let err = deflate::decompress_limited(&mut buffer, 4096).unwrap_err();
/// assert!(matches!(err, Error::Overflow { limit: 4096, .. }));
/// ```
pub fn decompress_limited(buffer: &mut Vec<u8>, limit: usize) -> Result<Transformed> {
    let output = match inflate(ZlibDecoder::new(&buffer[..]), buffer.len(), limit) {
        Ok(output) => output,
        Err(_) => inflate(DeflateDecoder::new(&buffer[..]), buffer.len(), limit).map_err(Error::Deflate)?,
    };

    if output.len() > limit {
        return Err(Error::Overflow {
            limit,
            received: output.len(),
        });
    }

    Ok(store(buffer, output))
}

#[inline]
fn inflate<R: Read>(decoder: R, hint: usize, limit: usize) -> std::io::Result<Vec<u8>> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut output = Vec::with_capacity(hint.saturating_mul(2).min(limit.saturating_add(1)));
    decoder.take(cap).read_to_end(&mut output)?;
    Ok(output)
}

fn store(buffer: &mut Vec<u8>, output: Vec<u8>) -> Transformed {
    let len = output.len();

    if len <= buffer.len() {
        buffer[..len].copy_from_slice(&output);
        buffer[len..].fill(0);
        Transformed { len, reused: true }
    } else {
        *buffer = output;
        Transformed { len, reused: false }
    }
}
