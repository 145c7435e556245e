//! URL query string and `application/x-www-form-urlencoded` parser.

use memchr::memchr;
use std::{borrow::Cow, error, fmt};

/// Query string parser with percent-decoding.
///
/// The same grammar is used for request targets and urlencoded form
/// bodies: pairs separated by `&`, key and value separated by the first `=`,
/// `+` decoded to a space, `%XX` escapes decoded as UTF-8.
///
/// # Examples
/// ```rust
/// use dispatch_web::query::Query;
///
/// let params = Query::parse("name=John+Smith&email=user%40example.com&debug", 10).unwrap();
///
/// assert_eq!(params.len(), 3);
/// assert_eq!(params[0], ("name".to_string(), "John Smith".to_string()));
/// assert_eq!(params[1], ("email".to_string(), "user@example.com".to_string()));
/// assert_eq!(params[2], ("debug".to_string(), String::new()));
///
/// // Handle limits
/// assert!(Query::parse("a=1&b=2", 1).is_err());
/// ```
pub struct Query;

impl Query {
    /// Parses a query string into ordered `(key, value)` pairs.
    ///
    /// A leading `?` is skipped, so `?a=1` and `a=1` are equivalent. Empty
    /// segments (`a=1&&b=2`) are ignored.
    pub fn parse(query: &str, limit: usize) -> Result<Vec<(String, String)>, Error> {
        let mut result = Vec::new();
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses a query string, appending to an existing collection.
    ///
    /// The limit counts the pairs already present in `result`.
    #[inline]
    pub fn parse_into(
        result: &mut Vec<(String, String)>,
        query: &str,
        limit: usize,
    ) -> Result<(), Error> {
        let data = query.strip_prefix('?').unwrap_or(query).as_bytes();

        let mut start = 0;
        while start < data.len() {
            // Find next '&' or end of string
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            if end == start {
                start = end + 1;
                continue;
            }

            if result.len() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let segment = &data[start..end];
            let (key, value) = match memchr(b'=', segment) {
                Some(i) => (&segment[..i], &segment[i + 1..]),
                None => (segment, &b""[..]),
            };

            result.push((decode(key)?, decode(value)?));
            start = end + 1;
        }

        Ok(())
    }
}

/// Decodes one urlencoded component (`+` as space, `%XX` escapes).
pub(crate) fn decode(raw: &[u8]) -> Result<String, Error> {
    let replaced: Cow<'_, [u8]> = match memchr(b'+', raw) {
        Some(_) => Cow::Owned(
            raw.iter()
                .map(|&b| if b == b'+' { b' ' } else { b })
                .collect(),
        ),
        None => Cow::Borrowed(raw),
    };

    match memchr(b'%', &replaced) {
        None => String::from_utf8(replaced.into_owned()).map_err(|_| Error::Encoding),
        Some(_) => {
            let decoded = urlencoding::decode_binary(&replaced);
            String::from_utf8(decoded.into_owned()).map_err(|_| Error::Encoding)
        }
    }
}

/// Error types that can occur during query parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The number of parameters exceeded the specified limit.
    OverLimit(usize),

    /// A decoded key or value is not valid UTF-8.
    Encoding,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => {
                write!(f, "Query parameter limit exceeded: limit={}", limit)
            }
            Error::Encoding => {
                write!(f, "Query parameter is not valid UTF-8 after decoding")
            }
        }
    }
}
