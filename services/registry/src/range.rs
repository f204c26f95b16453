//! Byte range expressions, as found in `Range` and `Content-Range` headers.

use crate::error::{RegistryError, RegistryResult};

const PREFIX: &str = "bytes=";

/// A contiguous range of bytes within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Offset of the first byte
    pub start: u64,

    /// Number of bytes in the range
    pub length: u64,
}

impl ByteRange {
    /// Create a range from its start offset and length.
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Render as a `Content-Range` value for a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        let end = (self.start + self.length).saturating_sub(1);
        format!("bytes {}-{}/{}", self.start, end, size)
    }
}

fn invalid(spec: &str) -> RegistryError {
    RegistryError::InvalidRange(spec.to_string())
}

fn number(raw: &str, spec: &str) -> RegistryResult<u64> {
    raw.parse().map_err(|_| invalid(spec))
}

/// Parse a range header against a resource of `size` bytes, following RFC 7233.
///
/// An empty header requests no ranges. Multiple comma separated ranges are
/// accepted; it is up to the caller to decide whether it supports them.
pub fn parse_range(header: &str, size: u64) -> RegistryResult<Vec<ByteRange>> {
    if header.is_empty() {
        return Ok(Vec::new());
    }

    let specs = header.strip_prefix(PREFIX).ok_or_else(|| invalid(header))?;

    let mut ranges = Vec::new();
    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }

        let (start, end) = spec.split_once('-').ok_or_else(|| invalid(spec))?;
        let (start, end) = (start.trim(), end.trim());

        let range = if start.is_empty() {
            // Suffix form: the last `end` bytes of the resource.
            let suffix = number(end, spec)?.min(size);
            ByteRange::new(size - suffix, suffix)
        } else {
            let start = number(start, spec)?;
            if start >= size {
                return Err(invalid(spec));
            }

            if end.is_empty() {
                ByteRange::new(start, size - start)
            } else {
                let end = number(end, spec)?;
                if start > end {
                    return Err(invalid(spec));
                }
                let end = end.min(size - 1);
                ByteRange::new(start, end - start + 1)
            }
        };

        ranges.push(range);
    }

    Ok(ranges)
}
