//! Handlers that take over the TCP connection after the request head.
//!
//! A raw route skips body buffering: the handler reads whatever it needs
//! from [`RawReader`] and writes through [`RawWriter`]. The connection is
//! closed when the handler returns.

use crate::{
    errors::BoxError,
    http::types::Version,
    lifecycle::CancelSignal,
    routing::table::RawRoute,
    server::{
        connection::writer::{self, WriteOptions},
        server_impl::Shared,
    },
    BoxFuture, IntoResponse, Request,
};
use std::{
    fmt,
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};

/// A handler that owns the connection.
///
/// Implemented for every `Fn(RawConnection) -> impl Future<Output =
/// Result<(), BoxError>>`.
pub trait RawHandler: Send + Sync + 'static {
    fn call(&self, conn: RawConnection) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> RawHandler for F
where
    F: Fn(RawConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn call(&self, conn: RawConnection) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(self(conn))
    }
}

/// The request head plus both halves of the socket.
///
/// ```no_run
/// use dispatch_web::{BoxError, RawConnection, RawRoute};
///
/// let echo = RawRoute::new("/echo", |mut conn: RawConnection| async move {
///     conn.writer().write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
///     let mut buf = [0u8; 1024];
///     loop {
///         let n = conn.reader().read(&mut buf).await?;
///         if n == 0 {
///             return Ok::<(), BoxError>(());
///         }
///         conn.writer().write_all(&buf[..n]).await?;
///     }
/// });
/// # let _ = echo;
/// ```
pub struct RawConnection {
    request: Request,
    reader: RawReader,
    writer: RawWriter,
    pub(crate) shared: Arc<Shared>,
}

impl RawConnection {
    pub(crate) fn new(
        request: Request,
        halves: (OwnedReadHalf, OwnedWriteHalf),
        leftover: Vec<u8>,
        shared: Arc<Shared>,
    ) -> Self {
        let conn_limits = &shared.limits.conn;
        let writer = RawWriter {
            half: halves.1,
            version: request.version(),
            timeout: conn_limits.socket_write_timeout,
            chunk_size: shared.limits.cache.stream_chunk_size,
            shutdown: shared.shutdown.clone(),
            grace: shared.limits.server.shutdown_grace,
        };
        let reader = RawReader {
            half: halves.0,
            leftover,
            pos: 0,
        };

        Self {
            request,
            reader,
            writer,
            shared,
        }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[inline]
    pub fn reader(&mut self) -> &mut RawReader {
        &mut self.reader
    }

    #[inline]
    pub fn writer(&mut self) -> &mut RawWriter {
        &mut self.writer
    }

    /// Writes a complete response, `Connection: close` included.
    pub async fn send(&mut self, response: impl IntoResponse) -> io::Result<()> {
        self.writer.send(response).await
    }

    /// Server-wide shutdown flag, for handlers that loop.
    pub fn shutdown_signal(&self) -> &CancelSignal {
        &self.shared.shutdown
    }

    pub fn into_parts(self) -> (Request, RawReader, RawWriter) {
        (self.request, self.reader, self.writer)
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("method", &self.request.method())
            .field("path", &self.request.path())
            .finish()
    }
}

/// Read half of a raw connection.
///
/// Bytes that arrived together with the request head are returned first.
#[derive(Debug)]
pub struct RawReader {
    half: OwnedReadHalf,
    leftover: Vec<u8>,
    pos: usize,
}

impl RawReader {
    /// Reads into `buf`, `Ok(0)` on end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.leftover.len() {
            let n = buf.len().min(self.leftover.len() - self.pos);
            buf[..n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.leftover.len() {
                self.leftover = Vec::new();
                self.pos = 0;
            }
            return Ok(n);
        }

        self.half.read(buf).await
    }
}

/// Write half of a raw connection; every write honours the socket write
/// timeout.
#[derive(Debug)]
pub struct RawWriter {
    half: OwnedWriteHalf,
    version: Version,
    timeout: Duration,
    chunk_size: usize,
    shutdown: CancelSignal,
    grace: Duration,
}

impl RawWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        writer::write_bytes(&mut self.half, data, self.timeout).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.half.flush().await
    }

    /// Writes a complete response, `Connection: close` included.
    pub async fn send(&mut self, response: impl IntoResponse) -> io::Result<()> {
        let opts = WriteOptions {
            version: self.version,
            keep_alive: false,
            head_only: false,
            timeout: self.timeout,
            chunk_size: self.chunk_size,
            shutdown: &self.shutdown,
            grace: self.grace,
        };
        writer::write_response(&mut self.half, response.into_response(), &opts).await
    }

    /// HTTP version of the request that opened the connection.
    #[inline]
    pub const fn version(&self) -> Version {
        self.version
    }
}

// STREAM UPLOAD

const FALLBACK_FILE_NAME: &str = "upload.bin";

/// A request body read straight from the socket instead of buffered.
///
/// The body length is the request's `Content-Length`; without one the body
/// is empty.
#[derive(Debug)]
pub struct StreamUpload {
    request: Request,
    file_name: String,
    reader: RawReader,
    remaining: u64,
}

impl StreamUpload {
    pub(crate) fn new(request: Request, reader: RawReader) -> Self {
        let file_name = upload_file_name(&request);
        let remaining = request.content_length().unwrap_or(0) as u64;

        Self {
            request,
            file_name,
            reader,
            remaining,
        }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// `X-File-Name` header or the last path segment, reduced to a bare
    /// file name.
    #[inline]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[inline]
    pub fn content_length(&self) -> Option<usize> {
        self.request.content_length()
    }

    /// Next piece of the body, `Ok(0)` once it is fully read.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed the upload early",
            ));
        }

        self.remaining -= n as u64;
        Ok(n)
    }

    /// Streams the body into `dir/<file_name>`, creating `dir` if needed.
    pub async fn save_to(&mut self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(&self.file_name);
        let mut file = tokio::fs::File::create(&path).await?;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = self.read_chunk(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;

        tracing::debug!(path = %path.display(), "Upload saved");
        Ok(path)
    }
}

fn upload_file_name(request: &Request) -> String {
    let raw = match request.header("x-file-name") {
        Some(name) => urlencoding::decode(name)
            .map(|name| name.into_owned())
            .unwrap_or_else(|_| name.to_string()),
        None => request
            .path()
            .rsplit('/')
            .next()
            .map(|segment| {
                urlencoding::decode(segment)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| segment.to_string())
            })
            .unwrap_or_default(),
    };

    sanitize_file_name(&raw)
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    match base {
        "" | "." | ".." => FALLBACK_FILE_NAME.to_string(),
        base => base.chars().filter(|c| !c.is_control()).collect(),
    }
}

impl RawRoute {
    /// A route whose body is streamed to `handler` instead of buffered.
    ///
    /// ```no_run
    /// use dispatch_web::{RawRoute, StatusCode, StreamUpload};
    ///
    /// let upload = RawRoute::upload("/upload", |mut up: StreamUpload| async move {
    ///     match up.save_to("uploads").await {
    ///         Ok(path) => (StatusCode::Created, format!("saved {}", path.display())),
    ///         Err(_) => (StatusCode::InternalServerError, "upload failed".to_string()),
    ///     }
    /// });
    /// # let _ = upload;
    /// ```
    pub fn upload<F, Fut>(prefix: &str, handler: F) -> Self
    where
        F: Fn(StreamUpload) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoResponse,
    {
        let handler = Arc::new(handler);

        Self::new(prefix, move |conn: RawConnection| {
            let handler = Arc::clone(&handler);
            async move {
                let (request, reader, mut writer) = conn.into_parts();
                let response = handler(StreamUpload::new(request, reader))
                    .await
                    .into_response();

                writer.send(response).await?;
                Ok::<(), BoxError>(())
            }
        })
    }
}
