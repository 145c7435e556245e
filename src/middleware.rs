//! Ordered interceptors wrapped around the final handler.
//!
//! Two flavours exist:
//! - request middleware receives the [`Request`] and a [`Next`] continuation
//!   and may answer without calling it;
//! - connection middleware only observes [`ConnectionInfo`] and always falls
//!   through, its errors are logged.
//!
//! For each request path, global middleware and middleware whose scope is a
//! case-insensitive prefix of the path run sorted by priority (lower first),
//! then by registration order. Scoped middleware defaults to priority `100`,
//! global to `0`; [`Middleware::override_global`] runs before everything.
//!
//! ```
//! use dispatch_web::{BoxError, Middleware, Next, Request, Response, StatusCode};
//!
//! let auth = Middleware::request(|req: Request, next: Next| async move {
//!     if req.header("authorization").is_none() {
//!         return Response::text(StatusCode::Unauthorized, "Unauthorized");
//!     }
//!     next.run(req).await
//! })
//! .scope("/admin");
//!
//! let audit = Middleware::connection(|info| async move {
//!     println!("{} {}", info.client_ip(), info.path());
//!     Ok::<_, BoxError>(())
//! });
//! # let _ = (auth, audit);
//! ```

use crate::{
    errors::BoxError, routing::table::starts_with_ignore_case, server::connection::ConnectionInfo,
    BoxFuture, Request, Response,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::{fmt, future::Future, sync::Arc};

type RequestFn = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;
type ConnectionFn =
    Arc<dyn Fn(Arc<ConnectionInfo>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// The handler at the end of a chain.
pub(crate) type Endpoint = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

const GLOBAL_PRIORITY: i32 = 0;
const SCOPED_PRIORITY: i32 = 100;

#[derive(Clone)]
enum Kind {
    Request(RequestFn),
    Connection(ConnectionFn),
}

/// A middleware registration, see the [module docs](self).
#[derive(Clone)]
pub struct Middleware {
    kind: Kind,
    scope: Option<String>,
    priority: Option<i32>,
    override_global: bool,
}

impl Middleware {
    /// Middleware that sees the request and decides whether to call `next`.
    pub fn request<F, Fut>(f: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self::with_kind(Kind::Request(Arc::new(move |req, next| Box::pin(f(req, next)))))
    }

    /// Middleware that observes connection metadata and always falls through.
    pub fn connection<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<ConnectionInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::with_kind(Kind::Connection(Arc::new(move |info| Box::pin(f(info)))))
    }

    fn with_kind(kind: Kind) -> Self {
        Self {
            kind,
            scope: None,
            priority: None,
            override_global: false,
        }
    }

    /// Restricts the middleware to paths starting with `prefix`.
    pub fn scope(mut self, prefix: &str) -> Self {
        self.scope = Some(prefix.to_string());
        self
    }

    /// Explicit priority; lower runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Runs before every other middleware regardless of priorities.
    pub fn override_global(mut self) -> Self {
        self.override_global = true;
        self
    }

    fn effective_priority(&self) -> i32 {
        match (self.override_global, self.priority, &self.scope) {
            (true, ..) => i32::MIN,
            (false, Some(priority), _) => priority,
            (false, None, Some(_)) => SCOPED_PRIORITY,
            (false, None, None) => GLOBAL_PRIORITY,
        }
    }

    fn applies_to(&self, path: &str) -> bool {
        match &self.scope {
            Some(scope) => starts_with_ignore_case(path, scope),
            None => true,
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Request(_) => "request",
            Kind::Connection(_) => "connection",
        };
        f.debug_struct("Middleware")
            .field("kind", &kind)
            .field("scope", &self.scope)
            .field("priority", &self.effective_priority())
            .finish()
    }
}

/// The rest of the chain, passed to request middleware.
pub struct Next {
    chain: Arc<[Arc<Middleware>]>,
    index: usize,
    info: Arc<ConnectionInfo>,
    endpoint: Endpoint,
}

impl Next {
    /// Runs the remaining middleware and the final handler.
    pub fn run(self, request: Request) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            let mut next = self;
            loop {
                let Some(middleware) = next.chain.get(next.index).cloned() else {
                    return (next.endpoint)(request).await;
                };
                next.index += 1;

                match &middleware.kind {
                    Kind::Request(f) => return f(request, next).await,
                    Kind::Connection(f) => {
                        if let Err(err) = f(Arc::clone(&next.info)).await {
                            tracing::warn!(
                                error = %err,
                                path = next.info.path(),
                                "Connection middleware failed"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Connection metadata of the current request.
    pub fn connection(&self) -> &ConnectionInfo {
        &self.info
    }
}

/// Registered middleware with a memoized list per request path.
pub(crate) struct MiddlewareChain {
    sorted: RwLock<Vec<Arc<Middleware>>>,
    per_path: DashMap<String, Arc<[Arc<Middleware>]>>,
    capacity: usize,
}

impl MiddlewareChain {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            sorted: RwLock::new(Vec::new()),
            per_path: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn add(&self, middleware: Middleware) {
        tracing::info!(
            scope = middleware.scope.as_deref().unwrap_or("*"),
            priority = middleware.effective_priority(),
            "Middleware added"
        );

        let mut sorted = self.sorted.write();
        sorted.push(Arc::new(middleware));
        // Stable sort keeps registration order among equal priorities
        sorted.sort_by_key(|m| m.effective_priority());
        self.per_path.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sorted.read().is_empty()
    }

    fn for_path(&self, path: &str) -> Arc<[Arc<Middleware>]> {
        if let Some(chain) = self.per_path.get(path) {
            return Arc::clone(chain.value());
        }

        // Holding the read lock until the insert keeps a concurrent `add`
        // from being overtaken by a stale list
        let sorted = self.sorted.read();
        let chain: Arc<[Arc<Middleware>]> = sorted
            .iter()
            .filter(|m| m.applies_to(path))
            .cloned()
            .collect();

        if self.per_path.len() >= self.capacity {
            self.per_path.clear();
        }
        self.per_path.insert(path.to_string(), Arc::clone(&chain));
        chain
    }

    /// Runs the chain for the request's path, ending in `endpoint`.
    pub(crate) fn run(
        &self,
        request: Request,
        info: Arc<ConnectionInfo>,
        endpoint: Endpoint,
    ) -> BoxFuture<'static, Response> {
        let chain = match self.is_empty() {
            true => Arc::from(Vec::new()),
            false => self.for_path(request.path()),
        };

        Next {
            chain,
            index: 0,
            info,
            endpoint,
        }
        .run(request)
    }
}

#[cfg(test)]
mod middleware_tests {
    use super::*;
    use crate::{Method, StatusCode};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(log: &Log, name: &'static str) -> Middleware {
        let log = Arc::clone(log);
        Middleware::request(move |req, next: Next| {
            log.lock().push(name);
            next.run(req)
        })
    }

    fn endpoint(log: &Log) -> Endpoint {
        let log = Arc::clone(log);
        Arc::new(move |_req| -> BoxFuture<'static, Response> {
            log.lock().push("handler");
            Box::pin(async { Response::text(StatusCode::Ok, "done") })
        })
    }

    fn info(path: &str) -> Arc<ConnectionInfo> {
        Arc::new(ConnectionInfo::for_tests(path))
    }

    async fn call(chain: &MiddlewareChain, log: &Log, path: &str) -> Response {
        let req = Request::builder(Method::Get, path).build();
        chain.run(req, info(path), endpoint(log)).await
    }

    #[tokio::test]
    async fn priority_order() {
        let log: Log = Arc::default();
        let chain = MiddlewareChain::new(16);

        chain.add(recorder(&log, "A"));
        chain.add(recorder(&log, "B").scope("/api"));
        chain.add(recorder(&log, "C").scope("/api").override_global());

        call(&chain, &log, "/API/users").await;
        assert_eq!(*log.lock(), ["C", "A", "B", "handler"]);

        log.lock().clear();
        call(&chain, &log, "/home").await;
        assert_eq!(*log.lock(), ["A", "handler"]);
    }

    #[tokio::test]
    async fn explicit_priorities_and_ties() {
        let log: Log = Arc::default();
        let chain = MiddlewareChain::new(16);

        chain.add(recorder(&log, "late").priority(50));
        chain.add(recorder(&log, "first"));
        chain.add(recorder(&log, "second"));
        chain.add(recorder(&log, "early").priority(-5));

        call(&chain, &log, "/").await;
        assert_eq!(*log.lock(), ["early", "first", "second", "late", "handler"]);
    }

    #[tokio::test]
    async fn short_circuit() {
        let log: Log = Arc::default();
        let chain = MiddlewareChain::new(16);

        chain.add(Middleware::request(|req: Request, next: Next| async move {
            if req.header("authorization").is_none() {
                return Response::text(StatusCode::Unauthorized, "no");
            }
            next.run(req).await
        }));
        chain.add(recorder(&log, "after"));

        let resp = call(&chain, &log, "/secret").await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn connection_middleware_falls_through() {
        let log: Log = Arc::default();
        let chain = MiddlewareChain::new(16);

        let seen = Arc::clone(&log);
        chain.add(Middleware::connection(move |info: Arc<ConnectionInfo>| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(info.path(), "/x");
                seen.lock().push("conn");
                Err::<(), BoxError>("ignored".into())
            }
        }));

        let resp = call(&chain, &log, "/x").await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(*log.lock(), ["conn", "handler"]);
    }

    #[tokio::test]
    async fn path_cache_is_bounded_and_reset() {
        let log: Log = Arc::default();
        let chain = MiddlewareChain::new(2);
        chain.add(recorder(&log, "A"));

        for path in ["/1", "/2", "/3", "/4"] {
            call(&chain, &log, path).await;
            assert!(chain.per_path.len() <= 2);
        }

        chain.add(recorder(&log, "B").scope("/4"));
        assert_eq!(chain.per_path.len(), 0);

        log.lock().clear();
        call(&chain, &log, "/4").await;
        assert_eq!(*log.lock(), ["A", "B", "handler"]);
    }
}
