//! Admission control between the listener and the handlers.
//!
//! ```text
//! accept -> intake (bounded, drop-oldest) -> consumers -> gate permit -> jobs -> workers
//!               \-> shed -> 503 responders
//! ```
//!
//! A job is one request. The worker holds the gate permit for the whole
//! job, including the per-message delay floor, then hands keep-alive
//! connections back to the intake once their next request is readable.

use crate::{
    errors::{is_client_disconnect, ErrorKind},
    http::{
        response::{Body, Response, Upgrade},
        types::{Method, Version},
    },
    lifecycle::CancelSignal,
    server::{
        connection::{
            writer::{self, WriteOptions},
            Connection, ConnectionInfo,
        },
        pipeline,
        raw::RawConnection,
        server_impl::Shared,
    },
};
use crossbeam::queue::ArrayQueue;
use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::{sleep, Instant},
};

/// Bounded queue that wakes one waiter per push.
pub(crate) struct WorkQueue<T> {
    items: ArrayQueue<T>,
    ready: Notify,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            ready: Notify::new(),
        }
    }

    /// Pushes `item`, returning the oldest item if the queue was full.
    pub(crate) fn push_displacing(&self, item: T) -> Option<T> {
        let displaced = self.items.force_push(item);
        self.ready.notify_one();
        displaced
    }

    /// Next item, or `None` once `shutdown` is triggered.
    pub(crate) async fn pop(&self, shutdown: &CancelSignal) -> Option<T> {
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }

            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A push between the first check and `enable` is not lost
            if let Some(item) = self.items.pop() {
                return Some(item);
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

pub(crate) struct Job {
    conn: Connection,
    permit: OwnedSemaphorePermit,
}

/// Queues and the admission gate shared by every stage.
pub(crate) struct Dispatcher {
    intake: WorkQueue<Connection>,
    shed: WorkQueue<Connection>,
    jobs: WorkQueue<Job>,
    pub(crate) gate: Arc<Semaphore>,
    pub(crate) permits: usize,
}

impl Dispatcher {
    pub(crate) fn new(intake_capacity: usize, max_in_flight: usize) -> Self {
        let permits = max_in_flight.max(1);
        Self {
            intake: WorkQueue::new(intake_capacity),
            shed: WorkQueue::new(intake_capacity),
            jobs: WorkQueue::new(permits),
            gate: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Queues a connection; a full intake sheds its oldest entry.
    fn admit(&self, conn: Connection, responders: usize) {
        let Some(oldest) = self.intake.push_displacing(conn) else {
            return;
        };

        tracing::warn!(client = %oldest.peer_addr, "Intake queue full, shedding oldest connection");
        if responders > 0 {
            // Shed queue overflow just closes the socket
            let _ = self.shed.push_displacing(oldest);
        }
    }

    /// Requests currently holding a gate permit.
    pub(crate) fn in_flight(&self) -> usize {
        self.permits - self.gate.available_permits()
    }

    pub(crate) fn queued(&self) -> usize {
        self.intake.len()
    }
}

/// Spawns consumers, workers and 503 responders for `shared`.
pub(crate) fn spawn_stages(shared: &Arc<Shared>) {
    let limits = &shared.limits.server;

    for _ in 0..limits.intake_consumers.max(1) {
        tokio::spawn(consumer(Arc::clone(shared)));
    }
    for _ in 0..limits.workers.max(1) {
        tokio::spawn(worker(Arc::clone(shared)));
    }
    for _ in 0..limits.count_503_handlers {
        tokio::spawn(overflow_responder(Arc::clone(shared)));
    }
}

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let addr = listener.local_addr().ok();
    tracing::debug!(addr = ?addr, "Accept loop started");

    loop {
        let accepted = tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(value) => value,
            Err(err) => {
                // Usually descriptor exhaustion: back off instead of spinning
                tracing::warn!(error = %err, "Accept failed");
                sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        match Connection::new(stream, peer) {
            Ok(conn) => shared
                .dispatcher
                .admit(conn, shared.limits.server.count_503_handlers),
            Err(err) => tracing::debug!(client = %peer, error = %err, "Dropped connection"),
        }
    }

    tracing::debug!(addr = ?addr, "Accept loop stopped");
}

async fn consumer(shared: Arc<Shared>) {
    let dispatcher = &shared.dispatcher;

    while let Some(conn) = dispatcher.intake.pop(&shared.shutdown).await {
        let permit = tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&dispatcher.gate).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let _ = dispatcher.jobs.push_displacing(Job { conn, permit });
    }
}

async fn worker(shared: Arc<Shared>) {
    while let Some(job) = shared.dispatcher.jobs.pop(&shared.shutdown).await {
        let Job { conn, permit } = job;
        let started = Instant::now();

        let keep = serve_request(&shared, conn).await;

        let floor = shared.per_message_delay();
        let elapsed = started.elapsed();
        if floor > elapsed {
            sleep(floor - elapsed).await;
        }
        drop(permit);

        if let Some(conn) = keep {
            requeue(&shared, conn);
        }
    }
}

async fn overflow_responder(shared: Arc<Shared>) {
    let json = shared.limits.server.json_errors;
    let write_timeout = shared.limits.conn.socket_write_timeout;

    while let Some(mut conn) = shared.dispatcher.shed.pop(&shared.shutdown).await {
        let _ = writer::send_error(
            &mut conn.stream,
            Version::Http11,
            &ErrorKind::ServiceUnavailable,
            json,
            write_timeout,
        )
        .await;
    }
}

/// Puts a keep-alive connection back in line once it has data, or closes
/// it after the idle timeout.
fn requeue(shared: &Arc<Shared>, conn: Connection) {
    let responders = shared.limits.server.count_503_handlers;
    if conn.has_buffered() {
        shared.dispatcher.admit(conn, responders);
        return;
    }

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let idle = shared.limits.conn.keep_alive_timeout;
        let readable = tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => false,
            ready = conn.stream.readable() => ready.is_ok(),
            _ = sleep(idle) => {
                tracing::debug!(client = %conn.peer_addr, "Idle keep-alive connection closed");
                false
            }
        };

        if readable {
            shared.dispatcher.admit(conn, responders);
        }
    });
}

/// Serves one request, returning the connection if it stays open.
async fn serve_request(shared: &Arc<Shared>, mut conn: Connection) -> Option<Connection> {
    let limits = &shared.limits;
    let read_timeout = limits.conn.socket_read_timeout;

    let mut request = match conn.read_head(&limits.req, read_timeout).await {
        Ok(Some(request)) => request,
        Ok(None) => return None,
        Err(err) => {
            report(shared, &mut conn, Version::Http11, err).await;
            return None;
        }
    };

    // Raw routes read the body themselves
    let raw_path = shared.routes.has_raw_routes() && shared.routes.match_raw(request.path()).is_some();
    if !raw_path {
        if let Err(err) = conn.read_body(&mut request, &limits.req, read_timeout).await {
            report(shared, &mut conn, request.version(), err).await;
            return None;
        }
    }

    let version = request.version();
    let head_only = request.method() == Method::Head;
    let wants_keep_alive = request.is_keep_alive();
    let client = request.client_ip();

    let info = Arc::new(ConnectionInfo::new(&conn, &request));
    let response = pipeline::run(shared, request, info).await;
    conn.requests_served += 1;

    let response = match response.body {
        Body::Upgrade(upgrade) => {
            start_raw(shared, conn, upgrade).await;
            return None;
        }
        body => Response { body, ..response },
    };

    let keep_alive = wants_keep_alive
        && !raw_path
        && !shared.shutdown.is_triggered()
        && !conn.is_expired(&limits.conn);

    let opts = WriteOptions {
        version,
        keep_alive,
        head_only,
        timeout: limits.conn.socket_write_timeout,
        chunk_size: limits.cache.stream_chunk_size,
        shutdown: &shared.shutdown,
        grace: limits.server.shutdown_grace,
    };

    if let Err(err) = writer::write_response(&mut conn.stream, response, &opts).await {
        match is_client_disconnect(&err) {
            true => tracing::debug!(client = %client, error = %err, "Client went away mid-response"),
            false => tracing::warn!(client = %client, error = %err, "Failed to write response"),
        }
        return None;
    }

    keep_alive.then_some(conn)
}

/// Answers a protocol error; I/O failures just close the connection.
async fn report(shared: &Shared, conn: &mut Connection, version: Version, err: ErrorKind) {
    let peer: SocketAddr = conn.peer_addr;

    if let ErrorKind::Io(io) = &err {
        match is_client_disconnect(&io.0) {
            true => tracing::debug!(client = %peer, "Client disconnected"),
            false => tracing::warn!(client = %peer, error = %io.0, "Connection read failed"),
        }
        return;
    }

    tracing::debug!(client = %peer, error = %err, status = err.status().as_u16(), "Rejected request");
    let _ = writer::send_error(
        &mut conn.stream,
        version,
        &err,
        shared.limits.server.json_errors,
        shared.limits.conn.socket_write_timeout,
    )
    .await;
}

/// Gives the socket to a raw handler on its own task.
async fn start_raw(shared: &Arc<Shared>, mut conn: Connection, upgrade: Upgrade) {
    let Upgrade { handler, request } = upgrade;
    let path = request.path().to_string();

    // Raw handlers read the body themselves
    if let Err(err) = conn.send_continue(&request).await {
        tracing::debug!(path, error = %err, "Failed to send 100 Continue");
        return;
    }
    let (stream, leftover) = conn.into_parts();

    let raw = RawConnection::new(*request, stream.into_split(), leftover, Arc::clone(shared));
    let shared = Arc::clone(shared);
    shared.active_streams.fetch_add(1, Ordering::AcqRel);

    tokio::spawn(async move {
        match tokio::spawn(handler.call(raw)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(path, error = %err, "Raw handler failed"),
            Err(_) => tracing::error!(path, "Raw handler panicked"),
        }
        shared.active_streams.fetch_sub(1, Ordering::AcqRel);
    });
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;

    #[tokio::test]
    async fn drop_oldest() {
        let queue = WorkQueue::new(2);
        let signal = CancelSignal::new();

        assert_eq!(queue.push_displacing(1), None);
        assert_eq!(queue.push_displacing(2), None);
        assert_eq!(queue.push_displacing(3), Some(1));

        assert_eq!(queue.pop(&signal).await, Some(2));
        assert_eq!(queue.pop(&signal).await, Some(3));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new(4));
        let signal = CancelSignal::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let signal = signal.clone();
            tokio::spawn(async move { queue.pop(&signal).await })
        };

        sleep(Duration::from_millis(20)).await;
        queue.push_displacing("job");
        assert_eq!(waiter.await.unwrap(), Some("job"));
    }

    #[tokio::test]
    async fn pop_ends_on_shutdown() {
        let queue: Arc<WorkQueue<u8>> = Arc::new(WorkQueue::new(1));
        let signal = CancelSignal::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let signal = signal.clone();
            tokio::spawn(async move { queue.pop(&signal).await })
        };

        signal.trigger();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn gate_accounting() {
        let dispatcher = Dispatcher::new(8, 2);
        assert_eq!(dispatcher.in_flight(), 0);

        let first = Arc::clone(&dispatcher.gate).acquire_owned().await.unwrap();
        let _second = Arc::clone(&dispatcher.gate).acquire_owned().await.unwrap();
        assert_eq!(dispatcher.in_flight(), 2);
        assert!(dispatcher.gate.try_acquire().is_err());

        drop(first);
        assert_eq!(dispatcher.in_flight(), 1);
    }
}
