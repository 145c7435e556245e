//! Server configuration limits and timeouts
//!
//! Every structure here has a `Default` implementation with conservative values;
//! override only the fields you need with struct update syntax.
//!
//! # Examples
//!
//! ```no_run
//! use dispatch_web::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dispatch_web::ServerError> {
//!     let server = Server::builder()
//!         .prefix("http://127.0.0.1:8080/")
//!         .server_limits(ServerLimits {
//!             max_in_flight: 200, // More simultaneous requests
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             body_size: 64 * 1024 * 1024, // Large uploads
//!             ..ReqLimits::default()
//!         })
//!         .build()?;
//!
//!     server.launch().await
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing and shutdown behaviour.
///
/// # Dispatch pipeline
/// ```text
///                     [------------]
///                     [ Tcp accept ]
///                     [------------]
///                           ||
///                           \/
///  [-----------------------------------------------]  oldest shed   [-------------]
///  [ Intake queue (intake_capacity, drop-oldest)   ] =============> [ Sending 503 ]
///  [-----------------------------------------------]                [-------------]
///                           ||
///                           || intake_consumers
///                           \/
///  [-----------------------------------------------]
///  [ Admission gate (max_in_flight permits)        ]
///  [-----------------------------------------------]
///                           ||
///                           \/
///  [-----------------------------------------------]
///  [ Worker pool (workers): one request per job    ]
///  [ then sleep up to per_message_delay            ]
///  [-----------------------------------------------]
/// ```
///
/// A job is a single request. Keep-alive connections go back into the intake
/// queue once their next request becomes readable.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Capacity of the intake queue fed by the listener loop (default: `1000`).
    ///
    /// When full, the oldest waiting connection is displaced to make room and
    /// is answered with `503 Service Unavailable`.
    pub intake_capacity: usize,

    /// Maximum number of requests handled at the same time (default: `100`).
    ///
    /// Every job holds one permit of the admission gate from the moment it is
    /// taken off the intake queue until its response is written and the
    /// per-message delay floor has elapsed.
    pub max_in_flight: usize,

    /// Number of tasks draining the intake queue (default: available parallelism).
    pub intake_consumers: usize,

    /// Number of worker tasks in the fixed pool (default: `100`).
    ///
    /// Workers are spawned once at launch and loop until shutdown.
    pub workers: usize,

    /// Minimum wall time each request occupies its worker (default: `0`).
    ///
    /// Handling that completes faster is padded with a sleep before the
    /// admission permit is released. Adjustable at runtime with
    /// [`Server::set_per_message_delay`](crate::Server::set_per_message_delay).
    pub per_message_delay: Duration,

    /// Dedicated responders for shed connections (default: `1`).
    ///
    /// Set to 0 to close shed connections silently.
    pub count_503_handlers: usize,

    /// Format for protocol error responses (default: `true`)
    ///
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, the body is empty and `content-length: 0` is sent.
    pub json_errors: bool,

    /// Time in-flight work gets to finish after shutdown is requested (default: `5 seconds`).
    pub shutdown_grace: Duration,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            intake_capacity: 1000,
            max_in_flight: 100,
            intake_consumers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            workers: 100,
            per_message_delay: Duration::ZERO,
            count_503_handlers: 1,
            json_errors: true,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Connection-level limits and timeouts
///
/// Controls individual TCP connection behavior including timeouts,
/// lifetime, and request limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for the rest of a request once it started (default: `5 seconds`)
    ///
    /// Prevents `slowloris` clients from holding a worker.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single socket write (default: `10 seconds`)
    pub socket_write_timeout: Duration,

    /// Idle time allowed between requests on a keep-alive connection (default: `30 seconds`)
    pub keep_alive_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// Checked between requests; an active streamed response is not cut short.
    pub connection_lifetime: Duration,
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),
        }
    }
}

/// HTTP request parsing limits
///
/// Requests that exceed any of them are rejected before reaching middleware:
/// - `413 Payload Too Large` for oversized bodies
/// - `414 URI Too Long` for long request targets
/// - `431 Request Header Fields Too Large` for oversized heads
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line plus headers (default: `16 KB`)
    pub head_size: usize,

    /// Maximum request target length, path and query (default: `2048 B`)
    pub url_size: usize,

    /// Maximum number of query parameters (default: `64`)
    pub url_query_parts: usize,

    /// Maximum number of headers per request (default: `64`)
    pub header_count: usize,

    /// Maximum request body size in bytes (default: `10 MB`)
    ///
    /// Applies to buffered bodies. Raw and stream-upload routes read the body
    /// themselves and are not bound by it.
    pub body_size: usize,

    /// Maximum number of fields plus files in a form body (default: `256`)
    pub form_parts: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            head_size: 16 * 1024,
            url_size: 2048,
            url_query_parts: 64,
            header_count: 64,
            body_size: 10 * 1024 * 1024,
            form_parts: 256,
        }
    }
}

/// Sizes and lifetimes of the server's internal caches and stream buffers.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Entries kept by the route match cache (default: `2048`)
    ///
    /// When exceeded, the least recently used quarter is evicted.
    pub route_cache_capacity: usize,

    /// Distinct paths whose middleware list is memoized (default: `4096`)
    pub middleware_cache_capacity: usize,

    /// Static files up to this size are kept in memory (default: `512 KB`)
    pub static_small_file: u64,

    /// Buffer used when hashing larger static files (default: `80 KB`)
    pub static_hash_buffer: usize,

    /// `max-age` for static responses; `None` sends `no-cache` (default: `None`)
    pub static_max_age: Option<u32>,

    /// Chunk size for streamed file bodies (default: `256 KB`)
    pub stream_chunk_size: usize,

    /// Idle time after which a rate limit bucket is discarded (default: `5 minutes`)
    pub bucket_idle_ttl: Duration,

    /// Interval of the rate limit bucket sweep (default: `1 minute`)
    pub bucket_sweep_interval: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            route_cache_capacity: 2048,
            middleware_cache_capacity: 4096,
            static_small_file: 512 * 1024,
            static_hash_buffer: 80 * 1024,
            static_max_age: None,
            stream_chunk_size: 256 * 1024,
            bucket_idle_ttl: Duration::from_secs(300),
            bucket_sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) cache: CacheLimits,
}
