/// A raw `Range` request header: `bytes=<start>-<end>`, where either bound
/// may be missing (`bytes=100-` reads to EOF, `bytes=-100` is a suffix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

/// A range resolved against a known entity size, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

impl ByteRange {
    /// Parses a `Range` header value. Multi-range and malformed headers
    /// return `None`; the caller falls back to a full-body response.
    pub fn parse(header: &str) -> Option<ByteRange> {
        let rest = header.trim().strip_prefix("bytes=")?;
        let (lo, hi) = rest.split_once('-')?;
        let lo = lo.trim();
        let hi = hi.trim();
        let start = if lo.is_empty() {
            None
        } else {
            Some(lo.parse().ok()?)
        };
        let end = if hi.is_empty() {
            None
        } else {
            Some(hi.parse().ok()?)
        };
        if start.is_none() && end.is_none() {
            return None;
        }
        Some(ByteRange { start, end })
    }

    /// Length of the requested slice, when both bounds are explicit.
    pub fn known_len(&self) -> Option<u64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end >= start => Some(end - start + 1),
            _ => None,
        }
    }

    /// Rebuilds the header value for forwarding to the origin.
    pub fn header_value(&self) -> String {
        format!(
            "bytes={}-{}",
            self.start.map(|v| v.to_string()).unwrap_or_default(),
            self.end.map(|v| v.to_string()).unwrap_or_default(),
        )
    }

    /// Suffix appended to the cache key so ranged slices of one URL get
    /// distinct entries (fMP4 init vs media segments share a URL).
    pub fn key_suffix(&self) -> String {
        format!(
            "-{}-{}",
            self.start.map(|v| v.to_string()).unwrap_or_default(),
            self.end.map(|v| v.to_string()).unwrap_or_default(),
        )
    }

    /// Resolves the raw bounds against a known size. The upper bound is
    /// clamped to `size - 1`; an empty or inverted slice is unsatisfiable.
    pub fn resolve(&self, size: u64) -> Result<RangeSpec, RangeError> {
        match (self.start, self.end) {
            (None, Some(suffix)) => {
                if suffix == 0 || size == 0 {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(RangeSpec {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                })
            }
            (Some(start), end) => {
                if size == 0 || start >= size {
                    return Err(RangeError::Unsatisfiable);
                }
                let end = end.map_or(size - 1, |e| e.min(size - 1));
                if end < start {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(RangeSpec { start, end })
            }
            (None, None) => Err(RangeError::Invalid),
        }
    }
}

impl RangeSpec {
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}
