use crate::{
    errors::ErrorKind,
    http::{
        form::Form,
        query::Query,
        types::{slice_to_usize, Header, Method, Version},
    },
    limits::ReqLimits,
    routing::Params,
};
use memchr::{memchr, memchr_iter, memmem};
use serde::de::DeserializeOwned;
use std::net::{IpAddr, SocketAddr};

/// An HTTP request with its head parsed and body buffered.
///
/// # General designations
///
/// ```text
/// POST /api/users/42?page=2 HTTP/1.1\r\n    <- request line
/// Host: example.com\r\n                     <- headers
/// Content-Length: 13\r\n
/// \r\n
/// {"id":42}                                 <- body
/// ```
///
/// Route parameters, form fields and uploaded files are filled in by the
/// server before the request reaches handlers.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) path_len: usize,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) version: Version,
    pub(crate) headers: Vec<Header>,

    pub(crate) keep_alive: bool,
    pub(crate) content_length: Option<usize>,
    pub(crate) body: Vec<u8>,

    pub(crate) form: Form,
    pub(crate) params: Params,

    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
}

// Public API
impl Request {
    /// HTTP method of the request line.
    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Protocol version of the request line.
    #[inline]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Raw request target including the query string.
    ///
    /// For `/api/users/123?sort=name&debug`:
    /// ```text
    /// /api/users/123?sort=name&debug
    /// ```
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Path component of the target, not percent-decoded.
    ///
    /// For `/api/users/123?sort=name&debug`:
    /// ```text
    /// /api/users/123
    /// ```
    #[inline]
    pub fn path(&self) -> &str {
        &self.target[..self.path_len]
    }

    /// First decoded value of a query parameter.
    ///
    /// For `/search?q=rust+lang&debug`:
    /// - `query("q")`: `Some("rust lang")`
    /// - `query("debug")`: `Some("")`
    /// - `query("page")`: `None`
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All decoded query parameters in order.
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// Value of a header, name compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All headers in the order received.
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Declared body length, if any.
    #[inline]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Whether the client asked to keep the connection open.
    #[inline]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Buffered request body.
    ///
    /// Empty for raw and stream-upload routes, which read the body from the
    /// connection themselves.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text.
    pub fn body_str(&self) -> Option<&str> {
        simdutf8::basic::from_utf8(&self.body).ok()
    }

    /// Deserializes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Parsed form body (urlencoded or multipart). Empty for other content types.
    #[inline]
    pub fn form(&self) -> &Form {
        &self.form
    }

    /// First value of a form field.
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name)
    }

    /// Value of a `{name}` placeholder from the matched route template.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// All placeholder values of the matched route.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Address of the TCP peer.
    #[inline]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address the connection was accepted on.
    #[inline]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// IP of the TCP peer; rate limits are keyed on it.
    #[inline]
    pub fn client_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    /// Address claimed by a proxy: the first valid entry of
    /// `X-Forwarded-For`, then `X-Real-IP`.
    ///
    /// Any client can send these headers, so only trust the value when the
    /// peer is a known proxy.
    pub fn forwarded_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());

        forwarded.or_else(|| self.header("x-real-ip").and_then(|v| v.trim().parse().ok()))
    }

    /// `Last-Event-ID` sent by reconnecting event-stream clients.
    pub fn last_event_id(&self) -> Option<&str> {
        self.header("last-event-id")
    }
}

impl Request {
    /// Builds a request without a connection, mostly useful in tests of
    /// handlers and middleware.
    ///
    /// ```
    /// use dispatch_web::{Method, Request};
    ///
    /// let req = Request::builder(Method::Post, "/login?next=%2Fhome")
    ///     .header("Content-Type", "application/json")
    ///     .body(r#"{"user":"alice"}"#)
    ///     .build();
    ///
    /// assert_eq!(req.path(), "/login");
    /// assert_eq!(req.query("next"), Some("/home"));
    /// assert_eq!(req.header("content-type"), Some("application/json"));
    /// ```
    pub fn builder(method: Method, target: &str) -> RequestBuilder {
        let path_len = memchr(b'?', target.as_bytes()).unwrap_or(target.len());
        let query = Query::parse(&target[path_len..], usize::MAX).unwrap_or_default();
        let unspecified = SocketAddr::from(([127, 0, 0, 1], 0));

        RequestBuilder(Request {
            method,
            target: target.to_string(),
            path_len,
            query,
            version: Version::Http11,
            headers: Vec::new(),
            keep_alive: true,
            content_length: None,
            body: Vec::new(),
            form: Form::default(),
            params: Params::default(),
            peer_addr: unspecified,
            local_addr: unspecified,
        })
    }
}

/// Builder returned by [`Request::builder`].
#[derive(Debug)]
pub struct RequestBuilder(Request);

impl RequestBuilder {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.0.headers.push(Header::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.0.body = body.into();
        self.0.content_length = Some(self.0.body.len());
        self
    }

    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.0.peer_addr = addr;
        self
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.0.params.push(name, value);
        self
    }

    pub fn build(self) -> Request {
        self.0
    }
}

// PARSER

/// Locates the end of the request head (`\r\n\r\n`), returning the index
/// just past it.
#[inline]
pub(crate) fn find_head_end(buffer: &[u8]) -> Option<usize> {
    memmem::find(buffer, b"\r\n\r\n").map(|i| i + 4)
}

/// Parses a complete request head (including the terminating blank line).
pub(crate) fn parse_head(
    head: &[u8],
    limits: &ReqLimits,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Request, ErrorKind> {
    check_utf8(head)?;

    let mut lines = memchr_iter(b'\n', head);
    let first_end = lines.next().ok_or(ErrorKind::InvalidUrl)?;
    let first_line = strip_cr(&head[..first_end]).ok_or(ErrorKind::InvalidHeader)?;

    let (method, target, version) = parse_first_line(first_line, limits)?;

    let path_len = memchr(b'?', target.as_bytes()).unwrap_or(target.len());
    let query = Query::parse(&target[path_len..], limits.url_query_parts)?;

    let mut request = Request {
        method,
        target,
        path_len,
        query,
        version,
        headers: Vec::new(),
        keep_alive: version == Version::Http11,
        content_length: None,
        body: Vec::new(),
        form: Form::default(),
        params: Params::default(),
        peer_addr,
        local_addr,
    };

    let mut start = first_end + 1;
    for end in lines {
        let line = strip_cr(&head[start..end]).ok_or(ErrorKind::InvalidHeader)?;
        start = end + 1;

        if line.is_empty() {
            break;
        }
        if request.headers.len() >= limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        request.push_header(line)?;
    }

    Ok(request)
}

fn parse_first_line(
    line: &[u8],
    limits: &ReqLimits,
) -> Result<(Method, String, Version), ErrorKind> {
    let first_space = memchr(b' ', line).ok_or(ErrorKind::InvalidMethod)?;
    let method = Method::from_bytes(&line[..first_space])?;

    let rest = &line[first_space + 1..];
    let second_space = memchr(b' ', rest).ok_or(ErrorKind::InvalidUrl)?;
    let target = &rest[..second_space];
    let version = Version::from_bytes(&rest[second_space + 1..])?;

    if target.len() > limits.url_size {
        return Err(ErrorKind::UrlTooLong);
    }
    if target.first() != Some(&b'/') || target.iter().any(|b| b.is_ascii_control()) {
        return Err(ErrorKind::InvalidUrl);
    }

    // UTF-8 already checked for the whole head
    let target = String::from_utf8_lossy(target).into_owned();
    Ok((method, target, version))
}

impl Request {
    fn push_header(&mut self, line: &[u8]) -> Result<(), ErrorKind> {
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(ErrorKind::InvalidHeader);
        }

        let value = line[colon + 1..].trim_ascii();

        if name.eq_ignore_ascii_case(b"content-length") {
            let len = slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
            if self.content_length.is_some_and(|prev| prev != len) {
                return Err(ErrorKind::InvalidContentLength);
            }
            self.content_length = Some(len);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if !value.eq_ignore_ascii_case(b"identity") {
                return Err(ErrorKind::UnsupportedTransferEncoding);
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            if contains_token(value, b"close") {
                self.keep_alive = false;
            } else if contains_token(value, b"keep-alive") {
                self.keep_alive = true;
            }
        }

        self.headers.push(Header::new(
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(value),
        ));
        Ok(())
    }
}

#[inline]
fn strip_cr(line: &[u8]) -> Option<&[u8]> {
    line.strip_suffix(b"\r")
}

#[inline]
fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(token))
}

#[inline]
fn check_utf8(head: &[u8]) -> Result<(), ErrorKind> {
    simdutf8::basic::from_utf8(head)
        .map(|_| ())
        .map_err(|_| ErrorKind::InvalidEncoding)
}

#[cfg(test)]
mod request_tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 7], 5555))
    }

    pub(crate) fn parse(raw: &str) -> Result<Request, ErrorKind> {
        parse_head(raw.as_bytes(), &ReqLimits::default(), addr(), addr())
    }

    #[test]
    fn first_line() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n", Method::Get, "/", "/", Version::Http11),
            ("POST /api/users?x=1 HTTP/1.0\r\n\r\n", Method::Post, "/api/users?x=1", "/api/users", Version::Http10),
            ("DELETE /a/b/c HTTP/1.1\r\n\r\n", Method::Delete, "/a/b/c", "/a/b/c", Version::Http11),
            ("OPTIONS /? HTTP/1.1\r\n\r\n", Method::Options, "/?", "/", Version::Http11),
        ];

        for (raw, method, target, path, version) in cases {
            let req = parse(raw).unwrap();
            assert_eq!(req.method(), method, "{raw:?}");
            assert_eq!(req.target(), target);
            assert_eq!(req.path(), path);
            assert_eq!(req.version(), version);
        }
    }

    #[test]
    fn first_line_errors() {
        #[rustfmt::skip]
        let cases = [
            ("GTE / HTTP/1.1\r\n\r\n", ErrorKind::InvalidMethod),
            ("GET\r\n\r\n", ErrorKind::InvalidMethod),
            ("GET /\r\n\r\n", ErrorKind::InvalidUrl),
            ("GET api HTTP/1.1\r\n\r\n", ErrorKind::InvalidUrl),
            ("GET / HTTP/2.0\r\n\r\n", ErrorKind::UnsupportedVersion),
            ("GET / HTPT/1.1\r\n\r\n", ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\n\r\n", ErrorKind::InvalidHeader),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse(raw).unwrap_err(), expected, "{raw:?}");
        }
    }

    #[test]
    fn headers() {
        let req = parse(
            "POST /upload HTTP/1.1\r\n\
             Host: example.com\r\n\
             Content-Length:  42 \r\n\
             X-Custom:value\r\n\
             Connection: Close\r\n\r\n",
        )
        .unwrap();

        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.header("X-CUSTOM"), Some("value"));
        assert_eq!(req.content_length(), Some(42));
        assert!(!req.is_keep_alive());
        assert_eq!(req.headers().len(), 4);
    }

    #[test]
    fn keep_alive_defaults() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n", true),
            ("GET / HTTP/1.0\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", true),
            ("GET / HTTP/1.1\r\nConnection: upgrade, close\r\n\r\n", false),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse(raw).unwrap().is_keep_alive(), expected, "{raw:?}");
        }
    }

    #[test]
    fn header_errors() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n", ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nBad Name: x\r\n\r\n", ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nContent-Length: 1x\r\n\r\n", ErrorKind::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n", ErrorKind::InvalidContentLength),
            ("GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", ErrorKind::UnsupportedTransferEncoding),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse(raw).unwrap_err(), expected, "{raw:?}");
        }
    }

    #[test]
    fn limits() {
        let limits = ReqLimits {
            header_count: 1,
            url_size: 8,
            url_query_parts: 1,
            ..ReqLimits::default()
        };
        let run = |raw: &str| parse_head(raw.as_bytes(), &limits, addr(), addr());

        assert_eq!(
            run("GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\n\r\n").unwrap_err(),
            ErrorKind::TooManyHeaders
        );
        assert_eq!(
            run("GET /123456789 HTTP/1.1\r\n\r\n").unwrap_err(),
            ErrorKind::UrlTooLong
        );
        assert!(matches!(
            run("GET /?a&b HTTP/1.1\r\n\r\n").unwrap_err(),
            ErrorKind::Query(_)
        ));
    }

    #[test]
    fn invalid_utf8() {
        let raw = b"GET /\xFF HTTP/1.1\r\n\r\n";
        assert_eq!(
            parse_head(raw, &ReqLimits::default(), addr(), addr()).unwrap_err(),
            ErrorKind::InvalidEncoding
        );
    }

    #[test]
    fn head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn client_and_forwarded_ip() {
        #[rustfmt::skip]
        let cases = [
            (vec![], None),
            (vec![("X-Forwarded-For", "203.0.113.9, 10.0.0.1")], Some("203.0.113.9")),
            (vec![("X-Forwarded-For", "garbage"), ("X-Real-IP", "198.51.100.2")], Some("198.51.100.2")),
            (vec![("X-Real-IP", "::1")], Some("::1")),
        ];

        for (headers, expected) in cases {
            let mut builder = Request::builder(Method::Get, "/").peer_addr(addr());
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            let req = builder.build();

            assert_eq!(req.client_ip().to_string(), "10.0.0.7");
            assert_eq!(req.forwarded_ip().map(|ip| ip.to_string()).as_deref(), expected);
        }
    }

    #[test]
    fn json_body() {
        #[derive(serde::Deserialize)]
        struct Login {
            user: String,
        }

        let req = Request::builder(Method::Post, "/login")
            .body(r#"{"user":"alice"}"#)
            .build();
        assert_eq!(req.json::<Login>().unwrap().user, "alice");
        assert_eq!(req.body_str(), Some(r#"{"user":"alice"}"#));
    }
}
