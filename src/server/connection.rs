use crate::{
    errors::{ErrorKind, IoError},
    http::{
        form,
        request::{find_head_end, parse_head, Request},
        types::{Method, Version},
    },
    limits::{ConnLimits, ReqLimits},
};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout_at, Instant},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8 * 1024;

/// Metadata about the connection a request arrived on, handed to
/// connection middleware.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    client_ip: IpAddr,
    connected_at: SystemTime,
    requests_served: usize,
    method: Method,
    path: String,
}

impl ConnectionInfo {
    pub(crate) fn new(conn: &Connection, request: &Request) -> Self {
        Self {
            id: conn.id,
            peer_addr: conn.peer_addr,
            local_addr: conn.local_addr,
            client_ip: request.forwarded_ip().unwrap_or_else(|| request.client_ip()),
            connected_at: conn.connected_at,
            requests_served: conn.requests_served,
            method: request.method(),
            path: request.path().to_string(),
        }
    }

    /// Process-unique connection number.
    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `X-Forwarded-For` / `X-Real-IP` if present, else the peer IP.
    /// Client-supplied; use [`peer_addr`](Self::peer_addr) for anything
    /// security related.
    #[inline]
    pub const fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    #[inline]
    pub const fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Requests completed on this connection before the current one.
    #[inline]
    pub const fn requests_served(&self) -> usize {
        self.requests_served
    }

    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn for_tests(path: &str) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            id: 0,
            peer_addr: addr,
            local_addr: addr,
            client_ip: addr.ip(),
            connected_at: SystemTime::now(),
            requests_served: 0,
            method: Method::Get,
            path: path.to_string(),
        }
    }
}

/// A client socket plus the bytes read past the last request.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    buffer: Vec<u8>,

    pub(crate) id: u64,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    created: Instant,
    connected_at: SystemTime,
    pub(crate) requests_served: usize,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let _ = stream.set_nodelay(true);

        Ok(Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            created: Instant::now(),
            connected_at: SystemTime::now(),
            requests_served: 0,
        })
    }

    /// Reads and parses the next request head.
    ///
    /// `Ok(None)` means the client closed the connection between requests.
    pub(crate) async fn read_head(
        &mut self,
        limits: &ReqLimits,
        read_timeout: Duration,
    ) -> Result<Option<Request>, ErrorKind> {
        let deadline = Instant::now() + read_timeout;

        loop {
            if let Some(end) = find_head_end(&self.buffer) {
                if end > limits.head_size {
                    return Err(ErrorKind::HeadTooLarge);
                }

                let request =
                    parse_head(&self.buffer[..end], limits, self.peer_addr, self.local_addr)?;
                self.buffer.drain(..end);
                return Ok(Some(request));
            }

            if self.buffer.len() > limits.head_size {
                return Err(ErrorKind::HeadTooLarge);
            }

            if self.fill(deadline).await? == 0 {
                return match self.buffer.is_empty() {
                    true => Ok(None),
                    false => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                };
            }
        }
    }

    /// Reads a `Content-Length` body and decodes form content types.
    pub(crate) async fn read_body(
        &mut self,
        request: &mut Request,
        limits: &ReqLimits,
        read_timeout: Duration,
    ) -> Result<(), ErrorKind> {
        let Some(len) = request.content_length else {
            return Ok(());
        };
        if len > limits.body_size {
            return Err(ErrorKind::BodyTooLarge);
        }

        self.send_continue(request).await?;

        let deadline = Instant::now() + read_timeout;
        while self.buffer.len() < len {
            if self.fill(deadline).await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }

        let rest = self.buffer.split_off(len);
        request.body = std::mem::replace(&mut self.buffer, rest);

        let parsed = match request.header("content-type") {
            Some(content_type) => form::parse(content_type, &request.body, limits.form_parts),
            None => Ok(None),
        };
        match parsed {
            Ok(Some(form)) => request.form = form,
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = ?err, "Rejected form body");
                return Err(ErrorKind::InvalidForm);
            }
        }

        Ok(())
    }

    async fn fill(&mut self, deadline: Instant) -> Result<usize, ErrorKind> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = timeout_at(deadline, self.stream.read(&mut chunk))
            .await
            .map_err(|_| ErrorKind::RequestTimeout)?
            .map_err(|err| ErrorKind::Io(IoError(err)))?;

        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// `true` when a pipelined request is already buffered.
    #[inline]
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    #[inline]
    pub(crate) fn is_expired(&self, limits: &ConnLimits) -> bool {
        self.requests_served >= limits.max_requests_per_connection
            || self.created.elapsed() > limits.connection_lifetime
    }

    /// Hands the socket and unread bytes to a raw handler.
    /// Answers `Expect: 100-continue` when the body has not arrived yet.
    pub(crate) async fn send_continue(&mut self, request: &Request) -> io::Result<()> {
        let expects_continue = request.version() == Version::Http11
            && request
                .header("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
        let pending = request.content_length.is_some_and(|len| self.buffer.len() < len);

        if expects_continue && pending {
            self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (TcpStream, Vec<u8>) {
        (self.stream, self.buffer)
    }
}

pub(crate) mod writer {
    use crate::{
        errors::ErrorKind,
        http::{
            response::{Body, FileBody, Response},
            types::Version,
        },
        lifecycle::CancelSignal,
    };
    use std::io::{self, SeekFrom};
    use tokio::{
        io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
        time::{sleep_until, timeout, Duration, Instant},
    };

    /// How a response is put on the wire.
    pub(crate) struct WriteOptions<'a> {
        pub(crate) version: Version,
        pub(crate) keep_alive: bool,
        /// Answering `HEAD`: headers only.
        pub(crate) head_only: bool,
        pub(crate) timeout: Duration,
        pub(crate) chunk_size: usize,
        pub(crate) shutdown: &'a CancelSignal,
        /// How long a file body may keep streaming once shutdown starts.
        pub(crate) grace: Duration,
    }

    pub(crate) async fn write_response<W>(
        stream: &mut W,
        response: Response,
        opts: &WriteOptions<'_>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(256);
        response.write_head(opts.version, opts.keep_alive, &mut buf);

        let send_body = !opts.head_only && !response.status().is_bodiless();
        match response.body {
            Body::Bytes(bytes) if send_body => buf.extend_from_slice(&bytes),
            Body::Shared(bytes) if send_body => buf.extend_from_slice(&bytes),
            Body::File(file) if send_body => {
                write_bytes(stream, &buf, opts.timeout).await?;
                return stream_file(stream, &file, opts).await;
            }
            _ => {}
        }

        write_bytes(stream, &buf, opts.timeout).await?;
        stream.flush().await
    }

    /// Sends a protocol error; the connection is closed afterwards.
    pub(crate) async fn send_error<W>(
        stream: &mut W,
        version: Version,
        error: &ErrorKind,
        json: bool,
        time: Duration,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_bytes(stream, &error.as_http(version, json), time).await
    }

    #[inline]
    pub(crate) async fn write_bytes<W>(stream: &mut W, bytes: &[u8], time: Duration) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        timeout(time, stream.write_all(bytes)).await?
    }

    /// Copies `file.len` bytes from `file.start`, paced to the bandwidth
    /// limit when one is set.
    async fn stream_file<W>(stream: &mut W, file: &FileBody, opts: &WriteOptions<'_>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut source = tokio::fs::File::open(&file.path).await?;
        if file.start > 0 {
            source.seek(SeekFrom::Start(file.start)).await?;
        }

        let rate = u64::from(file.bandwidth_limit_kb) * 1024;
        let chunk = match rate {
            0 => opts.chunk_size,
            rate => opts.chunk_size.min((rate / 4).max(1024) as usize),
        };

        let mut buf = vec![0u8; chunk.max(1)];
        let mut remaining = file.len;
        let mut sent = 0u64;
        let started = Instant::now();
        let mut cutoff: Option<Instant> = None;

        while remaining > 0 {
            if cutoff.is_none() && opts.shutdown.is_triggered() {
                cutoff = Some(Instant::now() + opts.grace);
            }
            if cutoff.is_some_and(|cutoff| Instant::now() >= cutoff) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "shutdown grace period elapsed",
                ));
            }

            let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
            let n = source.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while streaming",
                ));
            }

            write_bytes(stream, &buf[..n], opts.timeout).await?;
            remaining -= n as u64;
            sent += n as u64;

            if rate > 0 && remaining > 0 {
                let due = started + Duration::from_secs_f64(sent as f64 / rate as f64);
                let wake = cutoff.map_or(due, |cutoff| due.min(cutoff));
                sleep_until(wake).await;
            }
        }

        stream.flush().await
    }
}

#[cfg(test)]
mod connection_tests {
    use super::{writer::*, *};
    use crate::{
        http::types::Version, lifecycle::CancelSignal, tools::str_op, Response, StatusCode,
    };
    use std::io::Write;
    use tokio::net::TcpListener;

    async fn pair(payload: &'static [u8]) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(payload).await.unwrap();
            // Keep the socket open long enough for the server side to read
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (stream, peer) = listener.accept().await.unwrap();
        Connection::new(stream, peer).unwrap()
    }

    fn opts(signal: &CancelSignal, head_only: bool) -> WriteOptions<'_> {
        WriteOptions {
            version: Version::Http11,
            keep_alive: true,
            head_only,
            timeout: Duration::from_secs(1),
            chunk_size: 4,
            shutdown: signal,
            grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn pipelined_requests() {
        let mut conn = pair(
            b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n",
        )
        .await;
        let limits = ReqLimits::default();
        let time = Duration::from_secs(1);

        let mut first = conn.read_head(&limits, time).await.unwrap().unwrap();
        conn.read_body(&mut first, &limits, time).await.unwrap();
        assert_eq!(first.path(), "/a");
        assert_eq!(first.body(), b"hello");
        assert!(conn.has_buffered());

        let second = conn.read_head(&limits, time).await.unwrap().unwrap();
        assert_eq!(second.method(), Method::Get);
        assert_eq!(second.path(), "/b");
        assert!(!conn.has_buffered());

        assert!(matches!(conn.read_head(&limits, time).await, Ok(None)));
    }

    #[tokio::test]
    async fn form_body() {
        let mut conn = pair(
            b"POST /f HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 12\r\n\r\nname=a+b&x=1",
        )
        .await;
        let limits = ReqLimits::default();
        let time = Duration::from_secs(1);

        let mut req = conn.read_head(&limits, time).await.unwrap().unwrap();
        conn.read_body(&mut req, &limits, time).await.unwrap();
        assert_eq!(req.form_value("name"), Some("a b"));
        assert_eq!(req.form_value("x"), Some("1"));
    }

    #[tokio::test]
    async fn slow_body_times_out() {
        let mut conn = pair(b"POST /s HTTP/1.1\r\nContent-Length: 13\r\n\r\nshort").await;
        let limits = ReqLimits::default();

        let mut req = conn
            .read_head(&limits, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let result = conn.read_body(&mut req, &limits, Duration::from_millis(50)).await;
        assert_eq!(result, Err(ErrorKind::RequestTimeout));
    }

    #[tokio::test]
    async fn body_limits() {
        let mut conn = pair(b"POST /big HTTP/1.1\r\nContent-Length: 100\r\n\r\n").await;
        let limits = ReqLimits {
            body_size: 10,
            ..ReqLimits::default()
        };

        let mut req = conn
            .read_head(&limits, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let result = conn.read_body(&mut req, &limits, Duration::from_secs(1)).await;
        assert_eq!(result, Err(ErrorKind::BodyTooLarge));
    }

    #[tokio::test]
    async fn oversized_head() {
        let mut conn = pair(b"GET / HTTP/1.1\r\nX-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n").await;
        let limits = ReqLimits {
            head_size: 32,
            ..ReqLimits::default()
        };

        let result = conn.read_head(&limits, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap_err(), ErrorKind::HeadTooLarge);
    }

    #[tokio::test]
    async fn head_request_has_no_body() {
        let signal = CancelSignal::new();
        let mut out = Vec::new();

        let resp = Response::text(StatusCode::Ok, "hello");
        write_response(&mut out, resp, &opts(&signal, true)).await.unwrap();

        let text = str_op(&out);
        assert!(text.contains("content-length: 5\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn file_body_range() {
        let signal = CancelSignal::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let resp = Response::new(StatusCode::PartialContent).with_file(file.path(), 3, 5, 0);
        let mut out = Vec::new();
        write_response(&mut out, resp, &opts(&signal, false)).await.unwrap();

        let text = str_op(&out);
        assert!(text.contains("content-length: 5\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n34567"), "{text}");
    }

    #[tokio::test]
    async fn throttled_file_body() {
        let signal = CancelSignal::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'x'; 2048]).unwrap();

        let resp = Response::new(StatusCode::Ok).with_file(file.path(), 0, 2048, 4);
        let mut out = Vec::new();
        let mut options = opts(&signal, false);
        options.chunk_size = 64 * 1024;

        let started = std::time::Instant::now();
        write_response(&mut out, resp, &options).await.unwrap();

        // 4 KB/s: the second 1 KiB chunk waits for the first quarter second
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(out.ends_with(&[b'x'; 2048]));
    }

    #[tokio::test]
    async fn shutdown_grace_for_streaming() {
        let signal = CancelSignal::new();
        signal.trigger();

        let mut small = tempfile::NamedTempFile::new().unwrap();
        small.write_all(b"abc").unwrap();
        let resp = Response::new(StatusCode::Ok).with_file(small.path(), 0, 3, 0);

        let mut out = Vec::new();
        write_response(&mut out, resp, &opts(&signal, false)).await.unwrap();
        assert!(out.ends_with(b"\r\n\r\nabc"));

        // 8 KiB at 1 KB/s needs 8s, far past the grace period
        let mut large = tempfile::NamedTempFile::new().unwrap();
        large.write_all(&[b'x'; 8192]).unwrap();
        let resp = Response::new(StatusCode::Ok).with_file(large.path(), 0, 8192, 1);
        let options = WriteOptions {
            grace: Duration::from_millis(100),
            ..opts(&signal, false)
        };

        let started = std::time::Instant::now();
        let mut out = Vec::new();
        let err = write_response(&mut out, resp, &options).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(out.len() < 8192);
    }

    #[tokio::test]
    async fn error_rendering() {
        let mut out = Vec::new();
        send_error(
            &mut out,
            Version::Http11,
            &ErrorKind::BodyTooLarge,
            true,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(str_op(&out).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(str_op(&out).ends_with(r#""code":"BODY_TOO_LARGE"}"#));
    }
}
