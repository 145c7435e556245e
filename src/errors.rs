use crate::{
    http::{query, types::StatusCode},
    Version,
};
use std::{error, fmt, io, net::SocketAddr, path::PathBuf};
use thiserror::Error;

/// Boxed error accepted from user handlers, middleware and callbacks.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Failures while configuring or starting a [`Server`](crate::Server).
///
/// Protocol errors never surface here: malformed requests are answered
/// with a `4xx` response and the connection is closed.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid listener prefix `{0}`")]
    InvalidPrefix(String),

    #[error("no listener configured; call `bind`, `prefix` or `listener` on the builder")]
    NoListener,

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid route template `{template}`: {source}")]
    InvalidTemplate {
        template: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown rate limit time unit `{0}` (expected seconds, minutes, hours or days)")]
    InvalidTimeUnit(String),

    #[error("ticker interval must be greater than zero")]
    ZeroInterval,

    #[error("server is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Protocol-level failures detected before a request reaches the pipeline.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    UrlTooLong,
    Query(query::Error),

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    HeadTooLarge,
    InvalidEncoding,
    InvalidContentLength,
    UnsupportedTransferEncoding,

    BodyTooLarge,
    InvalidForm,

    RequestTimeout,
    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status:ident => $message:literal, $code:literal; )*) => {
        pub(crate) const fn status(&self) -> StatusCode {
            match self { $(
                Self::$name { .. } => StatusCode::$status,
            )* }
        }

        pub(crate) const fn json(&self) -> &'static str {
            match self { $(
                Self::$name { .. } => concat!(
                    r#"{"error":""#, $message, r#"","code":""#, $code, r#""}"#
                ),
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: BadRequest => "Invalid HTTP method", "INVALID_METHOD";

        InvalidUrl: BadRequest => "Invalid URL format", "INVALID_URL";
        UrlTooLong: UriTooLong => "URL too long", "URL_TOO_LONG";
        Query: BadRequest => "Invalid query string", "INVALID_QUERY";

        InvalidVersion: BadRequest => "Invalid HTTP version", "INVALID_VERSION";
        UnsupportedVersion: HttpVersionNotSupported
            => "HTTP version not supported", "UNSUPPORTED_VERSION";

        InvalidHeader: BadRequest => "Invalid header format", "INVALID_HEADER";
        TooManyHeaders: RequestHeaderFieldsTooLarge => "Too many headers", "TOO_MANY_HEADERS";
        HeadTooLarge: RequestHeaderFieldsTooLarge
            => "Request head too large", "HEAD_TOO_LARGE";
        InvalidEncoding: BadRequest => "Request head is not valid UTF-8", "INVALID_ENCODING";
        InvalidContentLength: BadRequest => "Invalid Content-Length", "INVALID_CONTENT_LENGTH";
        UnsupportedTransferEncoding: NotImplemented
            => "Transfer-Encoding not supported", "UNSUPPORTED_TRANSFER_ENCODING";

        BodyTooLarge: PayloadTooLarge => "Request body too large", "BODY_TOO_LARGE";
        InvalidForm: BadRequest => "Malformed form body", "INVALID_FORM";

        RequestTimeout: RequestTimeout => "Request not received in time", "REQUEST_TIMEOUT";

        ServiceUnavailable: ServiceUnavailable
            => "Service temporarily unavailable", "SERVICE_UNAVAILABLE";
        Io: ServiceUnavailable => "I/O error occurred", "IO_ERROR";
    }

    /// Renders a complete `connection: close` response.
    pub(crate) fn as_http(&self, version: Version, json: bool) -> Vec<u8> {
        let status = self.status();
        let body = if json { self.json() } else { "" };

        let mut out = Vec::with_capacity(128 + body.len());
        out.extend_from_slice(status.status_line(version));
        out.extend_from_slice(b"connection: close\r\ncontent-length: ");
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        if json {
            out.extend_from_slice(b"content-type: application/json\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body.as_bytes());
        out
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// `true` when an I/O error only means the peer went away.
pub(crate) fn is_client_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod errors_tests {
    use super::*;

    #[test]
    fn rendered_errors_are_consistent() {
        let errors = [
            ErrorKind::InvalidMethod,
            ErrorKind::UrlTooLong,
            ErrorKind::TooManyHeaders,
            ErrorKind::BodyTooLarge,
            ErrorKind::UnsupportedTransferEncoding,
            ErrorKind::ServiceUnavailable,
        ];

        for err in errors {
            for json in [true, false] {
                let raw = err.as_http(Version::Http11, json);
                let text = String::from_utf8(raw).unwrap();
                let (head, body) = text.split_once("\r\n\r\n").unwrap();

                assert!(head.starts_with("HTTP/1.1 "), "{head}");
                assert!(head.contains(&format!("content-length: {}", body.len())));
                assert_eq!(json, !body.is_empty());
                if json {
                    let value: serde_json::Value = serde_json::from_str(body).unwrap();
                    assert!(value["code"].is_string());
                }
            }
        }
    }

    #[test]
    fn statuses() {
        assert_eq!(ErrorKind::BodyTooLarge.status(), StatusCode::PayloadTooLarge);
        assert_eq!(
            ErrorKind::TooManyHeaders.status(),
            StatusCode::RequestHeaderFieldsTooLarge
        );
        assert_eq!(
            ErrorKind::UnsupportedVersion.as_http(Version::Http10, false),
            b"HTTP/1.0 505 HTTP Version Not Supported\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        );
    }

    #[test]
    fn disconnect_kinds() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(is_client_disconnect(&reset));
        assert!(!is_client_disconnect(&denied));
    }
}
