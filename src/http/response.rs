use crate::{
    http::{
        range::ByteRange,
        types::{StatusCode, Version},
    },
    server::raw::RawHandler,
    Request,
};
use serde::Serialize;
use std::{
    borrow::Cow,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use write::WriteBuffer;

/// An HTTP response: status, headers and one of several body kinds.
///
/// Built with a small fluent API:
/// ```
/// use dispatch_web::{Response, StatusCode};
///
/// let resp = Response::text(StatusCode::Created, "saved")
///     .header("X-Request-Id", 42)
///     .header("Cache-Control", "no-store");
///
/// assert_eq!(resp.status(), StatusCode::Created);
/// assert_eq!(resp.header_value("x-request-id"), Some("42"));
/// assert_eq!(resp.body_bytes(), Some(&b"saved"[..]));
/// ```
///
/// `Content-Length`, `Transfer-Encoding` and `Connection` are always
/// computed by the server; values set through [`header`](Self::header) are
/// ignored when the response is written.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: Vec<(Cow<'static, str>, String)>,
    pub(crate) body: Body,
}

pub(crate) enum Body {
    Empty,
    Bytes(Vec<u8>),
    Shared(Arc<[u8]>),
    File(FileBody),
    Upgrade(Upgrade),
}

#[derive(Debug, Clone)]
pub(crate) struct FileBody {
    pub(crate) path: PathBuf,
    pub(crate) start: u64,
    pub(crate) len: u64,
    pub(crate) bandwidth_limit_kb: u32,
}

/// Hands the connection over to a raw route handler after middleware ran.
pub(crate) struct Upgrade {
    pub(crate) handler: Arc<dyn RawHandler>,
    pub(crate) request: Box<Request>,
}

impl Response {
    /// An empty response with the given status.
    #[inline]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// `text/plain; charset=utf-8` body.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .with_body(Body::Bytes(text.into().into_bytes()))
    }

    /// `text/html; charset=utf-8` body.
    pub fn html(status: StatusCode, html: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/html; charset=utf-8")
            .with_body(Body::Bytes(html.into().into_bytes()))
    }

    /// Raw bytes with an explicit content type.
    pub fn bytes(status: StatusCode, content_type: &str, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(status)
            .header("Content-Type", content_type)
            .with_body(Body::Bytes(bytes.into()))
    }

    /// Serializes `value` as `application/json`.
    ///
    /// A serialization failure yields a `500` with a JSON error body.
    ///
    /// ```
    /// use dispatch_web::{Response, StatusCode};
    /// use serde_json::json;
    ///
    /// let resp = Response::json(StatusCode::Ok, &json!({"id": 7}));
    /// assert_eq!(resp.header_value("content-type"), Some("application/json; charset=utf-8"));
    /// assert_eq!(resp.body_bytes(), Some(&br#"{"id":7}"#[..]));
    /// ```
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::bytes(status, "application/json; charset=utf-8", body),
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize JSON response");
                Self::bytes(
                    StatusCode::InternalServerError,
                    "application/json; charset=utf-8",
                    &br#"{"error":"Failed to serialize response","code":"SERIALIZATION_FAILED"}"#[..],
                )
            }
        }
    }

    /// `302 Found` to `location`.
    pub fn redirect(location: &str) -> Self {
        Self::new(StatusCode::Found).header("Location", location)
    }

    /// `301 Moved Permanently` to `location`.
    pub fn moved_permanently(location: &str) -> Self {
        Self::new(StatusCode::MovedPermanently).header("Location", location)
    }

    /// Streams a file from disk, read at write time in fixed-size chunks.
    ///
    /// Returns `404 Not Found` if `path` is not a regular file. With
    /// [`FileOptions::download_name`] the response carries a
    /// `Content-Disposition: attachment` header.
    ///
    /// ```no_run
    /// use dispatch_web::{response::FileOptions, Response};
    ///
    /// # async fn run() {
    /// let resp = Response::file(
    ///     "reports/2024.pdf",
    ///     FileOptions::default()
    ///         .download_name("report.pdf")
    ///         .bandwidth_limit_kb(512),
    /// )
    /// .await;
    /// # }
    /// ```
    pub async fn file(path: impl AsRef<Path>, options: FileOptions) -> Self {
        let path = path.as_ref();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Self::text(StatusCode::NotFound, "File not found"),
        };

        let content_type = options
            .content_type
            .unwrap_or_else(|| crate::http::mime::from_path(path).to_string());

        let mut resp = Self::new(StatusCode::Ok)
            .header("Content-Type", content_type)
            .with_file(path, 0, meta.len(), options.bandwidth_limit_kb);

        if let Some(name) = options.download_name {
            resp = resp.header("Content-Disposition", content_disposition(&name));
        }
        if let Ok(modified) = meta.modified() {
            resp = resp.header("Last-Modified", httpdate::fmt_http_date(modified));
        }

        resp
    }

    /// Adds a header. Repeated names are all sent.
    #[inline]
    #[track_caller]
    pub fn header<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<Cow<'static, str>>,
        V: WriteBuffer,
    {
        let mut buf = Vec::new();
        value.write_to(&mut buf);

        let name = name.into();
        debug_assert!(
            !name.is_empty() && !name.contains([':', '\r', '\n']),
            "Invalid header name: {name:?}"
        );

        let value = String::from_utf8_lossy(&buf).replace(['\r', '\n'], " ");
        self.headers.push((name, value));
        self
    }

    /// Replaces the first header with this name, or adds it.
    pub fn set_header<V: WriteBuffer>(mut self, name: &'static str, value: V) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.header(name, value)
    }

    /// Changes the status, keeping headers and body.
    #[inline]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[inline]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// First value of a header, name compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// In-memory body, `None` for empty, file and raw bodies.
    pub fn body_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Bytes(bytes) => Some(bytes.as_slice()),
            Body::Shared(bytes) => Some(&bytes[..]),
            _ => None,
        }
    }

    /// `true` when the body is streamed from disk.
    pub fn is_file(&self) -> bool {
        matches!(self.body, Body::File(_))
    }
}

// Crate internal
impl Response {
    #[inline]
    pub(crate) fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub(crate) fn with_file(self, path: &Path, start: u64, len: u64, bandwidth_limit_kb: u32) -> Self {
        self.with_body(Body::File(FileBody {
            path: path.to_path_buf(),
            start,
            len,
            bandwidth_limit_kb,
        }))
    }

    pub(crate) fn with_range(mut self, range: ByteRange) -> Self {
        if let Body::File(file) = &mut self.body {
            file.start = range.start;
            file.len = range.len();
        }
        self.status = StatusCode::PartialContent;
        self.header("Content-Range", range.content_range())
    }

    pub(crate) fn upgrade(handler: Arc<dyn RawHandler>, request: Request) -> Self {
        Self::new(StatusCode::Ok).with_body(Body::Upgrade(Upgrade {
            handler,
            request: Box::new(request),
        }))
    }

    /// Length of the body as sent, `None` for raw connections.
    pub(crate) fn body_len(&self) -> Option<u64> {
        match &self.body {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Shared(bytes) => Some(bytes.len() as u64),
            Body::File(file) => Some(file.len),
            Body::Upgrade(_) => None,
        }
    }

    /// Serializes the status line and headers.
    pub(crate) fn write_head(&self, version: Version, keep_alive: bool, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.status.status_line(version));

        buf.extend_from_slice(b"date: ");
        buf.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            if is_managed_header(name) {
                continue;
            }
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if let Some(value) = connection_header(version, keep_alive) {
            buf.extend_from_slice(b"connection: ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }

        if !self.status.is_bodiless() {
            if let Some(len) = self.body_len() {
                buf.extend_from_slice(b"content-length: ");
                len.write_to(buf);
                buf.extend_from_slice(b"\r\n");
            }
        }

        buf.extend_from_slice(b"\r\n");
    }

    #[inline]
    pub(crate) const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }
}

#[inline(always)]
const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some(b"close"),
        (Version::Http10, true) => Some(b"keep-alive"),
        (Version::Http10, false) => Some(b"close"),
    }
}

#[inline]
fn is_managed_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("date")
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 name.
pub(crate) fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();

    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            Body::Empty => "empty".to_string(),
            Body::Bytes(b) => format!("{} bytes", b.len()),
            Body::Shared(b) => format!("{} bytes (shared)", b.len()),
            Body::File(file) => format!("file {:?}", file.path),
            Body::Upgrade(_) => "raw connection".to_string(),
        };

        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &body)
            .finish()
    }
}

/// Options for [`Response::file`].
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    pub(crate) download_name: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) bandwidth_limit_kb: u32,
}

impl FileOptions {
    /// Sends `Content-Disposition: attachment` with this file name.
    pub fn download_name(mut self, name: impl Into<String>) -> Self {
        self.download_name = Some(name.into());
        self
    }

    /// Overrides the type guessed from the extension.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Throttles the transfer to about `kb` KiB per second; `0` disables it.
    pub fn bandwidth_limit_kb(mut self, kb: u32) -> Self {
        self.bandwidth_limit_kb = kb;
        self
    }
}

// INTO RESPONSE

/// Conversion of handler return values into a [`Response`].
///
/// | Type | Result |
/// |------|--------|
/// | [`Response`] | as is |
/// | [`StatusCode`] | empty body |
/// | `&'static str`, `String` | `200` text |
/// | `Vec<u8>` | `200` `application/octet-stream` |
/// | `()` | `204 No Content` |
/// | [`Json<T>`] | `200` JSON |
/// | `(StatusCode, T)` | `T` with the status replaced |
/// | `Option<T>` | `None` becomes `404` |
/// | `Result<T, E: Display>` | `Err` is logged and becomes `500` |
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    #[inline]
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for StatusCode {
    fn into_response(self) -> Response {
        Response::new(self)
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::text(StatusCode::Ok, self)
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        Response::text(StatusCode::Ok, self)
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response {
        Response::bytes(StatusCode::Ok, "application/octet-stream", self)
    }
}

impl IntoResponse for () {
    fn into_response(self) -> Response {
        Response::new(StatusCode::NoContent)
    }
}

impl<T: IntoResponse> IntoResponse for (StatusCode, T) {
    fn into_response(self) -> Response {
        self.1.into_response().with_status(self.0)
    }
}

impl<T: IntoResponse> IntoResponse for Option<T> {
    fn into_response(self) -> Response {
        match self {
            Some(value) => value.into_response(),
            None => Response::text(StatusCode::NotFound, "Not Found"),
        }
    }
}

impl<T: IntoResponse, E: fmt::Display> IntoResponse for Result<T, E> {
    fn into_response(self) -> Response {
        match self {
            Ok(value) => value.into_response(),
            Err(err) => {
                tracing::error!(error = %err, "Handler returned an error");
                Response::text(StatusCode::InternalServerError, "Internal Server Error")
            }
        }
    }
}

/// JSON response wrapper: `Json(value)` serializes `value` with status `200`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        Response::json(StatusCode::Ok, &self.0)
    }
}

pub mod write {
    use super::*;
    use std::rc::Rc;

    /// Trait for values accepted as header values by [`Response::header`].
    ///
    /// Implemented for strings, byte slices, booleans, `char` and integer
    /// types (excluding floating-point numbers).
    ///
    /// # Note on Floating-Point
    /// Floating-point numbers are not implemented to avoid locale-dependent
    /// formatting and precision issues in protocol headers.
    ///
    /// # Example
    /// ```
    /// use dispatch_web::WriteBuffer;
    ///
    /// struct RequestId(u64);
    ///
    /// impl WriteBuffer for RequestId {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(b"req-");
    ///         self.0.write_to(buffer);
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        number(u128), impl_write_buffer_u128 => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), impl_write_buffer_i128 => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline(always)]
    fn impl_write_buffer_u128(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = Response::number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn impl_write_buffer_i128(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        let abs = value.unsigned_abs();

        let (arr, start) = Response::number_to_bytes(abs);
        buffer.extend_from_slice(&arr[start..]);
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::tools::*;

    fn head(resp: &Response, version: Version, keep_alive: bool) -> String {
        let mut buf = Vec::new();
        resp.write_head(version, keep_alive, &mut buf);
        // Drop the date line, it changes every second
        str_op(&buf)
            .lines()
            .filter(|l| !l.starts_with("date: "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn connection_headers() {
        let cases = [
            (Version::Http11, true, ""),
            (Version::Http11, false, "connection: close\n"),
            (Version::Http10, true, "connection: keep-alive\n"),
            (Version::Http10, false, "connection: close\n"),
        ];

        for (version, keep_alive, header) in cases {
            let resp = Response::new(StatusCode::Ok);
            assert_eq!(
                head(&resp, version, keep_alive),
                format!(
                    "{} 200 OK\n{header}content-length: 0\n",
                    version.as_str()
                )
            );
        }
    }

    #[test]
    fn managed_headers_are_skipped() {
        let resp = Response::text(StatusCode::Ok, "hello")
            .header("Content-Length", 999)
            .header("transfer-encoding", "chunked")
            .header("X-Trace", true);

        assert_eq!(
            head(&resp, Version::Http11, true),
            "HTTP/1.1 200 OK\nContent-Type: text/plain; charset=utf-8\nX-Trace: true\ncontent-length: 5\n"
        );
    }

    #[test]
    fn bodiless_statuses() {
        let resp = Response::new(StatusCode::NotModified).header("ETag", "\"A1\"");
        assert_eq!(
            head(&resp, Version::Http11, true),
            "HTTP/1.1 304 Not Modified\nETag: \"A1\"\n"
        );
    }

    #[test]
    fn header_values() {
        let resp = Response::new(StatusCode::Ok)
            .header("A", -42i32)
            .header("B", 0u8)
            .header("C", 'x')
            .header("D", String::from("line\r\nbreak"))
            .set_header("A", "replaced");

        assert_eq!(resp.header_value("a"), Some("replaced"));
        assert_eq!(resp.header_value("b"), Some("0"));
        assert_eq!(resp.header_value("c"), Some("x"));
        assert_eq!(resp.header_value("d"), Some("line  break"));
    }

    #[test]
    fn into_response() {
        #[rustfmt::skip]
        let cases: [(Response, StatusCode, Option<&[u8]>); 7] = [
            ("hi".into_response(), StatusCode::Ok, Some(&b"hi"[..])),
            (StatusCode::Forbidden.into_response(), StatusCode::Forbidden, None),
            (().into_response(), StatusCode::NoContent, None),
            ((StatusCode::Created, "made").into_response(), StatusCode::Created, Some(&b"made"[..])),
            (None::<String>.into_response(), StatusCode::NotFound, Some(&b"Not Found"[..])),
            (Err::<String, _>("boom").into_response(), StatusCode::InternalServerError, Some(&b"Internal Server Error"[..])),
            (Json(vec![1, 2]).into_response(), StatusCode::Ok, Some(&b"[1,2]"[..])),
        ];

        for (resp, status, body) in cases {
            assert_eq!(resp.status(), status);
            assert_eq!(resp.body_bytes(), body);
        }
    }

    #[test]
    fn disposition() {
        assert_eq!(
            content_disposition("report 2024.pdf"),
            "attachment; filename=\"report 2024.pdf\"; filename*=UTF-8''report%202024.pdf"
        );
        assert_eq!(
            content_disposition("отчёт.txt"),
            "attachment; filename=\"_____.txt\"; filename*=UTF-8''%D0%BE%D1%82%D1%87%D1%91%D1%82.txt"
        );
    }

    #[tokio::test]
    async fn file_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();

        let resp = Response::file(&path, FileOptions::default().download_name("data.csv")).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(resp.body_len(), Some(8));
        assert_eq!(resp.header_value("content-type"), Some("text/csv; charset=utf-8"));
        assert!(resp.header_value("content-disposition").is_some());
        assert!(resp.header_value("last-modified").is_some());

        let missing = Response::file(dir.path().join("nope"), FileOptions::default()).await;
        assert_eq!(missing.status(), StatusCode::NotFound);
    }
}
