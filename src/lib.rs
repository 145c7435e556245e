//! dispatch_web - hand-built HTTP/1.1 server engine
//!
//! A Tokio-based server that owns its whole request path: socket listeners,
//! a bounded intake queue with an admission gate and a fixed worker pool,
//! templated routing with a match cache, ordered middleware, token-bucket
//! rate limiting, an ETag static content cache, server-sent events and a
//! drift-corrected periodic ticker.
//!
//! # Request path
//!
//! ```text
//! listener -> intake queue -> admission gate -> worker
//!          -> middleware -> file route | raw route | route | static file | 404
//!          -> response writer
//! ```
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use dispatch_web::{Request, Route, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dispatch_web::ServerError> {
//!     let server = Server::builder().bind(([127, 0, 0, 1], 8080)).build()?;
//!
//!     server.add_route(Route::get("/", |_req: Request| async { "Hello World!" }))?;
//!     server.launch().await
//! }
//! ```
//! Routes, middleware, rate limits and events:
//! ```no_run
//! use dispatch_web::{
//!     lifecycle, BoxError, Json, Middleware, Next, RateLimit, Request, Route, Server,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dispatch_web::ServerError> {
//!     dispatch_web::logging::init();
//!
//!     let server = Server::builder()
//!         .prefix("http://+:8080/")
//!         .file_root("public")
//!         .build()?;
//!
//!     server.set_rate_limit(600, 1, "minutes")?;
//!     server.add_middleware(Middleware::request(|req: Request, next: Next| async move {
//!         let path = req.path().to_string();
//!         let resp = next.run(req).await;
//!         tracing::info!(path, status = resp.status().as_u16(), "handled");
//!         resp
//!     }));
//!
//!     server.add_route(
//!         Route::get("/api/items/{id}", |req: Request| async move {
//!             Json(serde_json::json!({ "id": req.param("id") }))
//!         })
//!         .rate_limit(RateLimit::new(10, Duration::from_secs(1))),
//!     )?;
//!
//!     server.add_sse_route("/events", Some(Duration::from_secs(15)), |ctx| async move {
//!         ctx.send("hello", "connected").await?;
//!         Ok::<(), BoxError>(())
//!     });
//!
//!     let events = server.clone();
//!     server.ticker().every_async(Duration::from_secs(1), move || {
//!         let events = events.clone();
//!         async move {
//!             events.sse().broadcast("/events", "tick", "1s").await;
//!             Ok::<(), BoxError>(())
//!         }
//!     })?;
//!
//!     server.launch_with_signal(lifecycle::shutdown_signal()).await
//! }
//! ```
//! Advanced configuration:
//! ```no_run
//! use dispatch_web::{limits::{ConnLimits, ReqLimits, ServerLimits}, Server};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), dispatch_web::ServerError> {
//! let server = Server::builder()
//!     .bind(([0, 0, 0, 0], 8080))
//!     .server_limits(ServerLimits {
//!         max_in_flight: 250,
//!         per_message_delay: Duration::from_millis(5),
//!         ..ServerLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         keep_alive_timeout: Duration::from_secs(10),
//!         ..ConnLimits::default()
//!     })
//!     .request_limits(ReqLimits {
//!         body_size: 64 * 1024 * 1024, // 64MB uploads
//!         ..ReqLimits::default()
//!     })
//!     .build()?;
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

pub(crate) mod http {
    pub(crate) mod form;
    pub mod mime;
    pub mod query;
    pub mod range;
    pub(crate) mod request;
    pub mod response;
    pub(crate) mod types;
}
pub(crate) mod routing {
    pub(crate) mod cache;
    pub(crate) mod table;
    pub(crate) mod template;

    pub use template::Params;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod dispatcher;
    pub(crate) mod pipeline;
    pub(crate) mod raw;
    pub(crate) mod server_impl;
}
pub mod errors;
pub mod lifecycle;
pub mod limits;
pub mod logging;
pub mod middleware;
pub mod rate_limit;
pub mod sse;
pub mod static_files;
pub mod ticker;

pub use crate::{
    errors::{BoxError, ServerError},
    http::{
        form::{Form, UploadedFile},
        mime, query,
        range::{self, ByteRange},
        request::{Request, RequestBuilder},
        response::{self, write::WriteBuffer, FileOptions, IntoResponse, Json, Response},
        types::{Header, Method, StatusCode, Version},
    },
    middleware::{Middleware, Next},
    rate_limit::{OverrideContext, RateLimit, RateLimitEvent},
    routing::{
        cache::RouteCacheStats,
        table::{RawRoute, Route},
        Params,
    },
    server::{
        connection::ConnectionInfo,
        raw::{RawConnection, RawHandler, RawReader, RawWriter, StreamUpload},
        server_impl::{from_sync, BoxFuture, FromSync, Handler, Server, ServerBuilder},
    },
    sse::{SseBroadcaster, SseClient, SseContext, SseWriter},
    static_files::{StaticContentCache, StaticEntry},
    ticker::{Ticker, TickerHandle},
};

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub fn pair(value: &(String, String)) -> (&str, &str) {
        (&value.0, &value.1)
    }
}
