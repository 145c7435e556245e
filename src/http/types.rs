#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

use crate::errors::ErrorKind;
use std::fmt;

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 9110, Section 9](https://datatracker.ietf.org/doc/html/rfc9110#section-9)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
///
/// `TRACE` and `CONNECT` are not accepted by the parser.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// Transfer a current representation of the target resource
    Get,
    /// Replace the target resource with the request payload
    Put,
    /// Resource-specific processing of the request payload
    Post,
    /// Same as GET but without response body
    Head,
    /// Apply partial modifications to a resource
    Patch,
    /// Remove the target resource
    Delete,
    /// Describe the communication options for the target resource
    Options,
}

impl Method {
    /// Every method the server accepts, in declaration order.
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Put,
        Method::Post,
        Method::Head,
        Method::Patch,
        Method::Delete,
        Method::Options,
    ];

    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Parses a method name, ignoring ASCII case.
    ///
    /// ```
    /// use dispatch_web::Method;
    ///
    /// assert_eq!(Method::parse("get"), Some(Method::Get));
    /// assert_eq!(Method::parse("Delete"), Some(Method::Delete));
    /// assert_eq!(Method::parse("TRACE"), None);
    /// ```
    pub fn parse(name: &str) -> Option<Self> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(name))
    }

    /// The canonical upper-case token, e.g. `"GET"`.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - [RFC 1945](https://tools.ietf.org/html/rfc1945)
    ///
    /// Connections close after every response unless the client
    /// sends `Connection: keep-alive`.
    Http10,

    /// HTTP/1.1 - [RFC 9112](https://tools.ietf.org/html/rfc9112)
    ///
    /// Persistent connections by default.
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            [b'H', b'T', b'T', b'P', b'/', ..] => Err(ErrorKind::UnsupportedVersion),
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    /// The protocol token, e.g. `"HTTP/1.1"`.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        /// HTTP status codes
        ///
        /// The subset of [RFC 9110, Section 15](https://datatracker.ietf.org/doc/html/rfc9110#section-15)
        /// (plus RFC 6585 additions) that the server produces.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the HTTP status line (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn status_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// The reason phrase, e.g. `"Not Found"`.
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            /// Looks up a status by its numeric code.
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

set_status_codes! {
    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    /// Sent for conditional requests whose validators still match.
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    LengthRequired = (411, "Length Required");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    /// Sent when a `Range` header lies outside the resource.
    RangeNotSatisfiable = (416, "Range Not Satisfiable");
    UnprocessableEntity = (422, "Unprocessable Entity");
    /// Default answer of the rate limiter.
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    /// Sent to connections shed from a full intake queue.
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    /// The numeric code, e.g. `404`.
    #[inline]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// `true` for statuses that never carry a body (`204`, `304`).
    #[inline]
    pub(crate) const fn is_bodiless(&self) -> bool {
        matches!(self, StatusCode::NoContent | StatusCode::NotModified)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

// HEADER

/// A single request header, name as received.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Header {
    pub(crate) name: String,
    pub(crate) value: String,
}

impl Header {
    #[inline]
    pub(crate) fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Header name exactly as the client sent it.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Header value with surrounding whitespace removed.
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn parse_usize() {
        #[rustfmt::skip]
        let cases = [
            ("0", Some(0)), ("42", Some(42)), ("", None),
            ("4a", None), ("-1", None), ("99999999999999999999999", None),
        ];

        for (input, expected) in cases {
            assert_eq!(slice_to_usize(input.as_bytes()), expected, "{input:?}");
        }
    }

    #[test]
    fn method_tokens() {
        for method in Method::ALL {
            assert_eq!(Method::from_bytes(method.as_str().as_bytes()), Ok(method));
        }

        for bad in ["get", "TRACE", "CONNECT", "", "GETS"] {
            assert_eq!(
                Method::from_bytes(bad.as_bytes()),
                Err(ErrorKind::InvalidMethod)
            );
        }
    }

    #[test]
    fn version_tokens() {
        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.1", Ok(Version::Http11)),
            ("HTTP/1.0", Ok(Version::Http10)),
            ("HTTP/2.0", Err(ErrorKind::UnsupportedVersion)),
            ("HTTP/0.9", Err(ErrorKind::UnsupportedVersion)),
            ("HTPT/1.1", Err(ErrorKind::InvalidVersion)),
        ];

        for (input, expected) in cases {
            assert_eq!(Version::from_bytes(input.as_bytes()), expected, "{input}");
        }
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            StatusCode::TooManyRequests.status_line(Version::Http11),
            b"HTTP/1.1 429 Too Many Requests\r\n"
        );
        assert_eq!(
            StatusCode::PartialContent.status_line(Version::Http10),
            b"HTTP/1.0 206 Partial Content\r\n"
        );
        assert_eq!(StatusCode::from_u16(304), Some(StatusCode::NotModified));
        assert_eq!(StatusCode::from_u16(418), None);
        assert_eq!(StatusCode::NotFound.to_string(), "404 Not Found");
    }
}
