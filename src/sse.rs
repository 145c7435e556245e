//! Server-sent event streams.
//!
//! An event-stream route is a raw route: every connection becomes an
//! [`SseClient`] registered in the server's [`SseBroadcaster`] until the
//! client goes away, the handler fails or the server shuts down.
//!
//! ```no_run
//! use dispatch_web::{BoxError, Server, SseContext};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), dispatch_web::ServerError> {
//! let server = Server::builder().bind(([127, 0, 0, 1], 8080)).build()?;
//!
//! server.add_sse_route("/events", Some(Duration::from_secs(15)), |ctx: SseContext| async move {
//!     ctx.send("welcome", "hello").await?;
//!     Ok::<(), BoxError>(())
//! });
//!
//! let pusher = server.clone();
//! tokio::spawn(async move {
//!     loop {
//!         tokio::time::sleep(Duration::from_secs(1)).await;
//!         pusher.sse().broadcast("/events", "tick", "1").await;
//!     }
//! });
//!
//! server.launch().await
//! # }
//! ```

use crate::{
    errors::BoxError,
    http::types::{StatusCode, Version},
    lifecycle::{spawn_supervised, CancelSignal},
    routing::table::{normalize_path, RawRoute},
    server::raw::{RawConnection, RawReader, RawWriter},
    BoxFuture, Request, Response,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    fmt::{self, Write as _},
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    sync::Mutex as AsyncMutex,
    task::{JoinError, JoinHandle, JoinSet},
};
use uuid::Uuid;

type SseHook =
    Arc<dyn Fn(Arc<SseClient>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

const STREAM_HEADERS: &[u8] = b"content-type: text/event-stream\r\n\
    cache-control: no-cache\r\n\
    connection: keep-alive\r\n\
    access-control-allow-origin: *\r\n\
    x-accel-buffering: no\r\n";

// WRITER

/// Writes events to one client.
///
/// Response headers go out with the first write, so
/// [`reject`](Self::reject) can still answer with a plain error until then.
/// Any failed write closes the stream and cancels the client.
#[derive(Clone)]
pub struct SseWriter {
    state: Arc<AsyncMutex<WriterState>>,
    cancel: CancelSignal,
}

struct WriterState {
    raw: RawWriter,
    headers_sent: bool,
    closed: bool,
    chunked: bool,
    next_id: u64,
}

impl SseWriter {
    pub(crate) fn new(raw: RawWriter, first_id: u64, cancel: CancelSignal) -> Self {
        let chunked = raw.version() == Version::Http11;
        Self {
            state: Arc::new(AsyncMutex::new(WriterState {
                raw,
                headers_sent: false,
                closed: false,
                chunked,
                next_id: first_id,
            })),
            cancel,
        }
    }

    /// Sends one event and returns its `id:`.
    ///
    /// Multi-line `data` becomes several `data:` lines; an empty `event`
    /// omits the `event:` line.
    pub async fn send(&self, event: &str, data: &str) -> io::Result<u64> {
        let mut state = self.state.lock().await;
        let id = state.next_id;

        let frame = format_event(Some(id), event, data);
        self.write(&mut state, frame.as_bytes()).await?;
        state.next_id += 1;
        Ok(id)
    }

    /// Serializes `value` and sends it as the event data.
    pub async fn send_json<T: Serialize + ?Sized>(&self, event: &str, value: &T) -> io::Result<u64> {
        let data = serde_json::to_string(value).map_err(io::Error::other)?;
        self.send(event, &data).await
    }

    /// Sends several events in a single write, returning how many were sent.
    pub async fn send_batch<'a, I>(&self, events: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut state = self.state.lock().await;
        let mut frame = String::new();
        let mut count = 0;

        for (event, data) in events {
            frame.push_str(&format_event(Some(state.next_id + count as u64), event, data));
            count += 1;
        }
        if count == 0 {
            return Ok(0);
        }

        self.write(&mut state, frame.as_bytes()).await?;
        state.next_id += count as u64;
        Ok(count)
    }

    /// Comment line that keeps proxies from timing the stream out.
    pub async fn ping(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        self.write(&mut state, b": heartbeat\n\n").await
    }

    /// Tells the browser how long to wait before reconnecting.
    pub async fn set_retry(&self, retry: Duration) -> io::Result<()> {
        let frame = format!("retry: {}\n\n", retry.as_millis());
        let mut state = self.state.lock().await;
        self.write(&mut state, frame.as_bytes()).await
    }

    /// Answers with a plain response instead of an event stream.
    ///
    /// Returns `false` when events were already sent.
    pub async fn reject(&self, status: StatusCode, reason: &str) -> io::Result<bool> {
        let mut state = self.state.lock().await;
        if state.headers_sent || state.closed {
            return Ok(false);
        }

        state.closed = true;
        self.cancel.trigger();
        state.raw.send(Response::text(status, reason)).await?;
        Ok(true)
    }

    /// Sends the response headers if nothing was written yet.
    pub(crate) async fn open(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        self.write(&mut state, b"").await
    }

    /// Terminates the chunked body. Errors are irrelevant at this point.
    pub(crate) async fn finish(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;

        if state.headers_sent && state.chunked {
            let _ = state.raw.write_all(b"0\r\n\r\n").await;
        }
        let _ = state.raw.flush().await;
    }

    async fn write(&self, state: &mut WriterState, frame: &[u8]) -> io::Result<()> {
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "event stream closed"));
        }

        let result = write_frame(state, frame).await;
        if result.is_err() {
            state.closed = true;
            self.cancel.trigger();
        }
        result
    }
}

async fn write_frame(state: &mut WriterState, frame: &[u8]) -> io::Result<()> {
    let mut out = Vec::with_capacity(frame.len() + 256);

    if !state.headers_sent {
        let version = state.raw.version();
        out.extend_from_slice(StatusCode::Ok.status_line(version));
        out.extend_from_slice(b"date: ");
        out.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(STREAM_HEADERS);
        if state.chunked {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }

    if !frame.is_empty() {
        match state.chunked {
            true => {
                out.extend_from_slice(format!("{:X}\r\n", frame.len()).as_bytes());
                out.extend_from_slice(frame);
                out.extend_from_slice(b"\r\n");
            }
            false => out.extend_from_slice(frame),
        }
    }

    if out.is_empty() {
        return Ok(());
    }
    state.raw.write_all(&out).await?;
    state.headers_sent = true;
    Ok(())
}

fn format_event(id: Option<u64>, event: &str, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + event.len() + 32);

    if let Some(id) = id {
        let _ = writeln!(out, "id: {id}");
    }
    if !event.is_empty() {
        let _ = writeln!(out, "event: {}", event.replace(['\r', '\n'], " "));
    }
    for line in data.split('\n') {
        let _ = writeln!(out, "data: {}", line.strip_suffix('\r').unwrap_or(line));
    }
    out.push('\n');
    out
}

// CLIENT

/// One connected event-stream subscriber.
pub struct SseClient {
    id: Uuid,
    path: String,
    remote_addr: SocketAddr,
    connected_at: SystemTime,
    writer: SseWriter,
    cancel: CancelSignal,
    done: CancelSignal,
}

impl SseClient {
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Prefix of the event-stream route the client connected through;
    /// broadcasts address clients by it.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    #[inline]
    pub fn writer(&self) -> &SseWriter {
        &self.writer
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_triggered()
    }

    /// Resolves once the client is cancelled for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Asks the stream to end; cleanup happens on the connection's task.
    pub fn close(&self) {
        self.cancel.trigger();
    }
}

impl fmt::Debug for SseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseClient")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What an event-stream handler receives.
pub struct SseContext {
    client: Arc<SseClient>,
    request: Request,
}

impl SseContext {
    #[inline]
    pub fn client(&self) -> &Arc<SseClient> {
        &self.client
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[inline]
    pub fn writer(&self) -> &SseWriter {
        &self.client.writer
    }

    pub async fn send(&self, event: &str, data: &str) -> io::Result<u64> {
        self.client.writer.send(event, data).await
    }

    pub async fn closed(&self) {
        self.client.closed().await
    }
}

// BROADCASTER

/// Registry of connected event-stream clients.
#[derive(Default)]
pub struct SseBroadcaster {
    clients: DashMap<Uuid, Arc<SseClient>>,
    on_connect: RwLock<Option<SseHook>>,
    on_disconnect: RwLock<Option<SseHook>>,
}

impl SseBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `hook` in the background for every new client.
    pub fn on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<SseClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        *self.on_connect.write() = Some(Arc::new(move |client| Box::pin(hook(client))));
    }

    /// Runs `hook` in the background after a client is fully cleaned up.
    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<SseClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        *self.on_disconnect.write() = Some(Arc::new(move |client| Box::pin(hook(client))));
    }

    fn register(&self, client: Arc<SseClient>) {
        tracing::info!(
            client = %client.id,
            path = client.path,
            remote = %client.remote_addr,
            "Event-stream client connected"
        );
        self.clients.insert(client.id, Arc::clone(&client));

        let hook = self.on_connect.read().clone();
        if let Some(hook) = hook {
            spawn_supervised("sse connect hook", hook(client));
        }
    }

    /// Sends to every client subscribed on `path`, returning the number of
    /// successful deliveries.
    pub async fn broadcast(&self, path: &str, event: &str, data: &str) -> usize {
        fan_out(self.clients(Some(path)), event, data).await
    }

    pub async fn broadcast_all(&self, event: &str, data: &str) -> usize {
        fan_out(self.clients(None), event, data).await
    }

    /// Serializes once and broadcasts to `path`, or to everyone with `None`.
    pub async fn broadcast_json<T: Serialize + ?Sized>(
        &self,
        path: Option<&str>,
        event: &str,
        value: &T,
    ) -> Result<usize, serde_json::Error> {
        let data = serde_json::to_string(value)?;
        Ok(fan_out(self.clients(path), event, &data).await)
    }

    /// Sends to a single client; `false` if it is unknown or the write failed.
    pub async fn send_to(&self, id: Uuid, event: &str, data: &str) -> bool {
        match self.client(id) {
            Some(client) => client.writer.send(event, data).await.is_ok(),
            None => false,
        }
    }

    /// Cancels the client and waits until its connection task has
    /// unregistered it, joined its handler and fired the disconnect hook.
    ///
    /// Returns `false` if the client was already gone. Inside the client's
    /// own handler use [`SseClient::close`] instead; awaiting this there
    /// never completes.
    pub async fn disconnect(&self, id: Uuid) -> bool {
        let Some(client) = self.client(id) else {
            return false;
        };

        client.cancel.trigger();
        client.done.cancelled().await;
        true
    }

    /// Runs on the connection task once the client is cancelled.
    async fn cleanup(
        &self,
        client: Arc<SseClient>,
        background: Vec<JoinHandle<()>>,
        handler: Option<JoinHandle<Result<(), BoxError>>>,
    ) {
        client.cancel.trigger();
        self.clients.remove(&client.id);

        for task in background {
            let _ = task.await;
        }
        if let Some(handler) = handler {
            log_handler_outcome(&client, handler.await);
        }
        client.writer.finish().await;

        tracing::info!(client = %client.id, path = client.path, "Event-stream client disconnected");

        let hook = self.on_disconnect.read().clone();
        if let Some(hook) = hook {
            spawn_supervised("sse disconnect hook", hook(Arc::clone(&client)));
        }
        client.done.trigger();
    }

    /// Disconnects everyone, or only the clients on `path`.
    pub async fn disconnect_all(&self, path: Option<&str>) -> usize {
        let mut count = 0;
        for client in self.clients(path) {
            if self.disconnect(client.id).await {
                count += 1;
            }
        }
        count
    }

    pub fn client(&self, id: Uuid) -> Option<Arc<SseClient>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Connected clients, optionally only those on `path`.
    pub fn clients(&self, path: Option<&str>) -> Vec<Arc<SseClient>> {
        self.clients
            .iter()
            .filter(|entry| path.map_or(true, |path| entry.path.eq_ignore_ascii_case(path)))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn count_on(&self, path: &str) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.path.eq_ignore_ascii_case(path))
            .count()
    }
}

impl fmt::Debug for SseBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseBroadcaster")
            .field("clients", &self.clients.len())
            .finish()
    }
}

async fn fan_out(targets: Vec<Arc<SseClient>>, event: &str, data: &str) -> usize {
    if targets.is_empty() {
        return 0;
    }

    let event: Arc<str> = Arc::from(event);
    let data: Arc<str> = Arc::from(data);
    let mut set = JoinSet::new();

    for client in targets {
        let (event, data) = (Arc::clone(&event), Arc::clone(&data));
        set.spawn(async move {
            match client.writer.send(&event, &data).await {
                Ok(_) => true,
                Err(err) => {
                    tracing::debug!(client = %client.id, error = %err, "Event delivery failed");
                    false
                }
            }
        });
    }

    let mut delivered = 0;
    while let Some(result) = set.join_next().await {
        if matches!(result, Ok(true)) {
            delivered += 1;
        }
    }
    delivered
}

// CONNECTION LIFECYCLE

/// Cancels the client on end of stream or server shutdown.
async fn watch_client(mut reader: RawReader, cancel: CancelSignal, shutdown: CancelSignal) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }
    cancel.trigger();
}

async fn heartbeat(client: Arc<SseClient>, every: Duration) {
    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {
                if client.writer.ping().await.is_err() {
                    return;
                }
            }
        }
    }
}

fn log_handler_outcome(client: &SseClient, outcome: Result<Result<(), BoxError>, JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(client = %client.id, error = %err, "Event-stream handler failed"),
        Err(err) if err.is_panic() => tracing::error!(client = %client.id, "Event-stream handler panicked"),
        Err(_) => {}
    }
}

async fn serve_stream<F, Fut>(
    conn: RawConnection,
    route_path: Arc<str>,
    heartbeat_every: Option<Duration>,
    handler: Arc<F>,
) -> Result<(), BoxError>
where
    F: Fn(SseContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let shared = Arc::clone(&conn.shared);
    let (request, reader, writer) = conn.into_parts();

    let first_id = request
        .last_event_id()
        .and_then(|id| id.trim().parse::<u64>().ok())
        .map_or(1, |id| id.saturating_add(1));
    let cancel = CancelSignal::new();

    let client = Arc::new(SseClient {
        id: Uuid::new_v4(),
        path: route_path.to_string(),
        remote_addr: request.peer_addr(),
        connected_at: SystemTime::now(),
        writer: SseWriter::new(writer, first_id, cancel.clone()),
        cancel,
        done: CancelSignal::new(),
    });

    let mut background = vec![tokio::spawn(watch_client(
        reader,
        client.cancel.clone(),
        shared.shutdown.clone(),
    ))];
    if let Some(every) = heartbeat_every.filter(|every| !every.is_zero()) {
        background.push(tokio::spawn(heartbeat(Arc::clone(&client), every)));
    }

    shared.sse.register(Arc::clone(&client));

    let ctx = SseContext {
        client: Arc::clone(&client),
        request,
    };
    let mut handler = tokio::spawn(handler(ctx));

    let finished = tokio::select! {
        outcome = &mut handler => Some(outcome),
        _ = client.closed() => None,
    };

    let pending = match finished {
        Some(outcome) => {
            let subscribed = matches!(outcome, Ok(Ok(())));
            log_handler_outcome(&client, outcome);
            if subscribed && client.writer.open().await.is_ok() {
                client.closed().await;
            }
            None
        }
        None => Some(handler),
    };

    shared.sse.cleanup(client, background, pending).await;
    Ok(())
}

impl RawRoute {
    /// An event-stream route; see the [module docs](crate::sse).
    ///
    /// With `heartbeat` set, a `: heartbeat` comment is sent at that
    /// interval. After `handler` returns `Ok`, the client stays subscribed
    /// until it disconnects.
    pub fn sse<F, Fut>(prefix: &str, heartbeat: Option<Duration>, handler: F) -> Self
    where
        F: Fn(SseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let route_path: Arc<str> = Arc::from(normalize_path(prefix));
        Self::new(prefix, move |conn: RawConnection| {
            serve_stream(conn, Arc::clone(&route_path), heartbeat, Arc::clone(&handler))
        })
    }
}

#[cfg(test)]
mod sse_tests {
    use super::*;

    #[rustfmt::skip]
    #[test]
    fn event_format() {
        let cases = [
            (Some(1), "",        "hello",        "id: 1\ndata: hello\n\n"),
            (Some(7), "update",  "a\nb",         "id: 7\nevent: update\ndata: a\ndata: b\n\n"),
            (Some(2), "x",       "crlf\r\nline", "id: 2\nevent: x\ndata: crlf\ndata: line\n\n"),
            (None,    "bad\nev", "",             "event: bad ev\ndata: \n\n"),
        ];

        for (id, event, data, expected) in cases {
            assert_eq!(format_event(id, event, data), expected);
        }
    }

    #[tokio::test]
    async fn empty_registry() {
        let sse = SseBroadcaster::new();

        assert_eq!(sse.broadcast("/events", "e", "d").await, 0);
        assert_eq!(sse.broadcast_all("e", "d").await, 0);
        assert!(!sse.send_to(Uuid::new_v4(), "e", "d").await);
        assert!(!sse.disconnect(Uuid::new_v4()).await);
        assert_eq!(sse.count(), 0);
    }
}
