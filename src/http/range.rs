//! Single `Range: bytes=` header handling.

use std::fmt;

/// An inclusive byte range within a resource of `total` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    #[inline]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// `true` when the range does not cover the whole resource.
    #[inline]
    pub const fn is_partial(&self) -> bool {
        self.start != 0 || self.end + 1 != self.total
    }

    /// Value for the `Content-Range` header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Why a `Range` header could not be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Syntax error, answered with `400`.
    Malformed,
    /// Syntactically valid but outside the resource, answered with `416`.
    Unsatisfiable,
}

/// Parses a `Range` header against a resource length.
///
/// Returns `Ok(None)` when the header does not ask for a single byte range
/// (other units, several ranges) so the full resource is served. An `end`
/// past the resource is clamped; a suffix range `bytes=-N` selects the last
/// `N` bytes.
pub fn parse_range(header: &str, total: u64) -> Result<Option<ByteRange>, RangeError> {
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if ranges.contains(',') {
        return Ok(None);
    }

    let (start, end) = ranges.split_once('-').ok_or(RangeError::Malformed)?;
    let (start, end) = (start.trim(), end.trim());

    let number = |s: &str| s.parse::<u64>().map_err(|_| RangeError::Malformed);

    let (start, end) = match (start.is_empty(), end.is_empty()) {
        (true, true) => return Err(RangeError::Malformed),
        (true, false) => {
            let suffix = number(end)?;
            if suffix == 0 || total == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            (total.saturating_sub(suffix), total - 1)
        }
        (false, true) => (number(start)?, total.saturating_sub(1)),
        (false, false) => {
            let (start, end) = (number(start)?, number(end)?);
            if end < start {
                return Err(RangeError::Malformed);
            }
            (start, end.min(total.saturating_sub(1)))
        }
    };

    if total == 0 || start >= total {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(Some(ByteRange { start, end, total }))
}

#[cfg(test)]
mod range_tests {
    use super::*;

    fn range(start: u64, end: u64, total: u64) -> Result<Option<ByteRange>, RangeError> {
        Ok(Some(ByteRange { start, end, total }))
    }

    #[test]
    fn ranges() {
        #[rustfmt::skip]
        let cases = [
            ("bytes=0-99", 1000, range(0, 99, 1000)),
            ("bytes=100-", 1000, range(100, 999, 1000)),
            ("bytes=-100", 1000, range(900, 999, 1000)),
            ("bytes=-5000", 1000, range(0, 999, 1000)),
            ("bytes=900-5000", 1000, range(900, 999, 1000)),
            (" bytes=1-1 ", 10, range(1, 1, 10)),

            ("items=0-1", 1000, Ok(None)),
            ("bytes=0-1,5-6", 1000, Ok(None)),

            ("bytes=abc-1", 1000, Err(RangeError::Malformed)),
            ("bytes=5-1", 1000, Err(RangeError::Malformed)),
            ("bytes=-", 1000, Err(RangeError::Malformed)),
            ("bytes=12", 1000, Err(RangeError::Malformed)),

            ("bytes=1000-", 1000, Err(RangeError::Unsatisfiable)),
            ("bytes=0-1", 0, Err(RangeError::Unsatisfiable)),
            ("bytes=-0", 1000, Err(RangeError::Unsatisfiable)),
        ];

        for (header, total, expected) in cases {
            assert_eq!(parse_range(header, total), expected, "{header:?}");
        }
    }

    #[test]
    fn helpers() {
        let r = ByteRange { start: 0, end: 99, total: 1000 };
        assert_eq!(r.len(), 100);
        assert!(r.is_partial());
        assert_eq!(r.content_range(), "bytes 0-99/1000");

        let whole = ByteRange { start: 0, end: 9, total: 10 };
        assert!(!whole.is_partial());
    }
}
