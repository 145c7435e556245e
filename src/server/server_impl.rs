use crate::{
    errors::{BoxError, ServerError},
    http::response::IntoResponse,
    lifecycle::CancelSignal,
    limits::{AllLimits, CacheLimits, ConnLimits, ReqLimits, ServerLimits},
    middleware::{Middleware, MiddlewareChain},
    rate_limit::{notify_hook, RateLimit, RateLimitEvent, RateLimiter},
    routing::{
        cache::RouteCacheStats,
        table::{RawRoute, Route, RouteTable},
    },
    server::{
        dispatcher::{self, Dispatcher},
        raw::StreamUpload,
    },
    sse::{SseBroadcaster, SseContext},
    static_files::StaticContentCache,
    ticker::Ticker,
    Request, Response,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};

/// A pinned, boxed future, as returned by handlers and middleware.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request handler for a templated [`Route`].
///
/// Implemented for every async closure `Fn(Request) -> impl Future` whose
/// output implements [`IntoResponse`]. Synchronous closures are wrapped
/// with [`from_sync`].
///
/// # Examples
///
/// ```
/// use dispatch_web::{from_sync, Json, Request, Route, StatusCode};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct User {
///     id: u64,
/// }
///
/// let by_id = Route::get("/users/{id}", |req: Request| async move {
///     match req.param("id").and_then(|id| id.parse().ok()) {
///         Some(id) => Ok(Json(User { id })),
///         None => Err("id must be a number"),
///     }
/// });
///
/// let health = Route::get("/health", from_sync(|_req| (StatusCode::Ok, "up")));
/// # let _ = (by_id, health);
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> BoxFuture<'static, Response>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoResponse,
{
    fn call(&self, request: Request) -> BoxFuture<'static, Response> {
        let fut = self(request);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// A synchronous closure used as a [`Handler`], see [`from_sync`].
#[derive(Debug, Clone, Copy)]
pub struct FromSync<F>(F);

impl<F, R> Handler for FromSync<F>
where
    F: Fn(Request) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    fn call(&self, request: Request) -> BoxFuture<'static, Response> {
        let resp = (self.0)(request).into_response();
        Box::pin(std::future::ready(resp))
    }
}

/// Wraps a synchronous closure as a [`Handler`].
///
/// The closure runs on the worker task; keep it short.
#[inline]
pub fn from_sync<F, R>(f: F) -> FromSync<F>
where
    F: Fn(Request) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    FromSync(f)
}

/// Directories consulted after routing fails.
#[derive(Debug, Clone, Default)]
pub(crate) struct Roots {
    pub(crate) file_root: Option<PathBuf>,
    pub(crate) view_root: Option<PathBuf>,
    pub(crate) not_found_page: Option<PathBuf>,
}

enum Listener {
    Std(std::net::TcpListener),
    Tokio(TcpListener),
}

impl Listener {
    fn into_tokio(self) -> io::Result<TcpListener> {
        match self {
            Listener::Std(listener) => TcpListener::from_std(listener),
            Listener::Tokio(listener) => Ok(listener),
        }
    }
}

/// State shared by the listener loops, dispatcher stages and handlers.
pub(crate) struct Shared {
    pub(crate) limits: AllLimits,
    pub(crate) shutdown: CancelSignal,

    pub(crate) routes: RouteTable,
    pub(crate) middleware: MiddlewareChain,
    pub(crate) limiter: RateLimiter,
    pub(crate) statics: StaticContentCache,
    pub(crate) sse: SseBroadcaster,
    pub(crate) ticker: Ticker,
    pub(crate) roots: ArcSwap<Roots>,

    pub(crate) dispatcher: Dispatcher,
    pub(crate) active_streams: AtomicUsize,
    pub(crate) trust_forwarded: bool,
    delay_micros: AtomicU64,

    listeners: Mutex<Vec<Listener>>,
    addrs: Vec<SocketAddr>,
    running: AtomicBool,
}

impl Shared {
    #[inline]
    pub(crate) fn per_message_delay(&self) -> Duration {
        Duration::from_micros(self.delay_micros.load(Ordering::Relaxed))
    }
}

/// The HTTP server: registries, runtime settings and the listener loops.
///
/// `Server` is a cheap handle; clones share the same state, so routes can be
/// added and settings changed while [`launch`](Self::launch) runs on another
/// task.
///
/// # Examples
///
/// ```no_run
/// use dispatch_web::{lifecycle, Request, Route, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), dispatch_web::ServerError> {
///     let server = Server::builder()
///         .prefix("http://+:8080/")
///         .file_root("public")
///         .build()?;
///
///     server.add_route(Route::get("/hello/{name}", |req: Request| async move {
///         format!("Hello, {}!", req.param("name").unwrap_or("stranger"))
///     }))?;
///
///     server.launch_with_signal(lifecycle::shutdown_signal()).await
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    // REGISTRATION

    /// Registers a templated route. Fails if the template does not compile.
    pub fn add_route(&self, route: Route) -> Result<(), ServerError> {
        self.shared.routes.add_route(route)
    }

    pub fn add_raw_route(&self, route: RawRoute) {
        self.shared.routes.add_raw(route);
    }

    /// Registers a prefix route whose body is streamed to `handler`.
    ///
    /// ```no_run
    /// # fn run(server: &dispatch_web::Server) {
    /// use dispatch_web::StreamUpload;
    ///
    /// server.add_stream_upload_route("/upload", |mut upload: StreamUpload| async move {
    ///     upload.save_to("uploads").await.map(|path| path.display().to_string())
    /// });
    /// # }
    /// ```
    pub fn add_stream_upload_route<F, Fut>(&self, prefix: &str, handler: F)
    where
        F: Fn(StreamUpload) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoResponse,
    {
        self.add_raw_route(RawRoute::upload(prefix, handler));
    }

    /// Registers an event-stream route, see [`sse`](crate::sse).
    pub fn add_sse_route<F, Fut>(&self, prefix: &str, heartbeat: Option<Duration>, handler: F)
    where
        F: Fn(SseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add_raw_route(RawRoute::sse(prefix, heartbeat, handler));
    }

    /// Serves files below `root` under `prefix`, with range support.
    ///
    /// `root` is created if it does not exist.
    pub fn add_file_route(&self, prefix: &str, root: impl AsRef<Path>) -> Result<(), ServerError> {
        let root = root.as_ref();
        create_dir(root)?;
        self.shared.routes.add_file(prefix, root);
        Ok(())
    }

    pub fn add_middleware(&self, middleware: Middleware) {
        self.shared.middleware.add(middleware);
    }

    // RATE LIMITING

    /// Sets the server-wide limit applied to routes without their own.
    ///
    /// `unit` is one of `seconds`, `minutes`, `hours` or `days`.
    pub fn set_rate_limit(&self, max_requests: u32, value: u64, unit: &str) -> Result<(), ServerError> {
        let limit = RateLimit::per(max_requests, value, unit)?;
        tracing::info!(max_requests, window_secs = limit.window().as_secs(), "Global rate limit set");
        self.shared.limiter.set_global(Some(limit));
        Ok(())
    }

    pub fn clear_rate_limit(&self) {
        self.shared.limiter.set_global(None);
    }

    /// Notified (in the background) whenever the global limit denies a request.
    pub fn on_global_rate_limited<F, Fut>(&self, hook: F)
    where
        F: Fn(RateLimitEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.shared.limiter.set_global_hook(notify_hook(hook));
    }

    /// Notified (in the background) whenever a route-level limit denies a request.
    pub fn on_route_rate_limited<F, Fut>(&self, hook: F)
    where
        F: Fn(RateLimitEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.shared.limiter.set_route_hook(notify_hook(hook));
    }

    /// Tokens left for `ip` on `route_key` (global bucket for `None`).
    ///
    /// Route keys are `ROUTE:{METHOD}:{template}` or `RAW:{prefix}`.
    pub fn available_tokens(&self, ip: IpAddr, route_key: Option<&str>) -> Option<f64> {
        self.shared.limiter.available_tokens(ip, route_key)
    }

    // RUNTIME SETTINGS

    /// Minimum time each request occupies its worker and admission permit.
    pub fn set_per_message_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.shared.delay_micros.store(micros, Ordering::Relaxed);
    }

    #[inline]
    pub fn per_message_delay(&self) -> Duration {
        self.shared.per_message_delay()
    }

    /// `Cache-Control: public, max-age=N` for static content, `no-cache` for `None`.
    pub fn set_static_max_age(&self, seconds: Option<u32>) {
        self.shared.statics.set_max_age(seconds);
    }

    pub fn set_file_root(&self, root: impl Into<PathBuf>) -> Result<(), ServerError> {
        let root = root.into();
        create_dir(&root)?;
        self.shared.roots.rcu(|roots| Roots {
            file_root: Some(root.clone()),
            ..Roots::clone(roots)
        });
        Ok(())
    }

    pub fn set_view_root(&self, root: impl Into<PathBuf>) -> Result<(), ServerError> {
        let root = root.into();
        create_dir(&root)?;
        self.shared.roots.rcu(|roots| Roots {
            view_root: Some(root.clone()),
            ..Roots::clone(roots)
        });
        Ok(())
    }

    /// HTML file sent with every `404`; `None` restores the plain text body.
    pub fn set_not_found_page(&self, page: Option<PathBuf>) {
        self.shared.roots.rcu(|roots| Roots {
            not_found_page: page.clone(),
            ..Roots::clone(roots)
        });
    }

    // ACCESSORS

    #[inline]
    pub fn sse(&self) -> &SseBroadcaster {
        &self.shared.sse
    }

    /// Periodic callbacks tied to this server's lifetime.
    #[inline]
    pub fn ticker(&self) -> &Ticker {
        &self.shared.ticker
    }

    #[inline]
    pub fn static_cache(&self) -> &StaticContentCache {
        &self.shared.statics
    }

    pub fn route_cache_stats(&self) -> RouteCacheStats {
        self.shared.routes.cache_stats()
    }

    /// Addresses the listeners are bound to (useful with port `0`).
    #[inline]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.shared.addrs
    }

    /// Requests currently holding an admission permit.
    pub fn in_flight(&self) -> usize {
        self.shared.dispatcher.in_flight()
    }

    /// Connections waiting in the intake queue.
    pub fn queued(&self) -> usize {
        self.shared.dispatcher.queued()
    }

    // LIFECYCLE

    /// Asks every loop to stop; [`launch`](Self::launch) returns once
    /// in-flight work finished or the grace period elapsed.
    pub fn shutdown(&self) {
        self.shared.shutdown.trigger();
    }

    #[inline]
    pub fn shutdown_signal(&self) -> &CancelSignal {
        &self.shared.shutdown
    }

    /// Starts accepting connections and runs until [`shutdown`](Self::shutdown).
    ///
    /// Can be called once per server.
    pub async fn launch(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }

        let pending = std::mem::take(&mut *shared.listeners.lock());
        let mut listeners = Vec::with_capacity(pending.len());
        for listener in pending {
            listeners.push(listener.into_tokio()?);
        }

        dispatcher::spawn_stages(shared);
        tokio::spawn(sweep_buckets(Arc::clone(shared)));
        shared.ticker.start();
        for listener in listeners {
            tokio::spawn(dispatcher::accept_loop(Arc::clone(shared), listener));
        }

        tracing::info!(addrs = ?shared.addrs, "Server started");
        shared.shutdown.cancelled().await;

        tracing::info!("Shutting down");
        self.drain().await;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Like [`launch`](Self::launch), shutting down when `signal` resolves.
    ///
    /// ```no_run
    /// # async fn run(server: dispatch_web::Server) -> Result<(), dispatch_web::ServerError> {
    /// server.launch_with_signal(dispatch_web::lifecycle::shutdown_signal()).await
    /// # }
    /// ```
    pub async fn launch_with_signal<S>(&self, signal: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let launch = self.launch();
        let trigger = async {
            signal.await;
            self.shutdown();
        };
        tokio::pin!(launch, trigger);

        tokio::select! {
            result = &mut launch => return result,
            _ = &mut trigger => {}
        }
        launch.await
    }

    async fn drain(&self) {
        let shared = &self.shared;
        let idle = async {
            while shared.dispatcher.in_flight() > 0 || shared.active_streams.load(Ordering::Acquire) > 0 {
                sleep(Duration::from_millis(20)).await;
            }
        };

        if tokio::time::timeout(shared.limits.server.shutdown_grace, idle).await.is_err() {
            tracing::warn!(
                in_flight = shared.dispatcher.in_flight(),
                streams = shared.active_streams.load(Ordering::Acquire),
                "Shutdown grace period elapsed with work still running"
            );
        }
    }
}

async fn sweep_buckets(shared: Arc<Shared>) {
    let limits = &shared.limits.cache;
    let mut interval = tokio::time::interval(limits.bucket_sweep_interval.max(Duration::from_secs(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = shared.limiter.buckets.sweep(limits.bucket_idle_ttl);
                if removed > 0 {
                    tracing::debug!(removed, remaining = shared.limiter.buckets.len(), "Idle rate limit buckets removed");
                }
            }
        }
    }
}

fn create_dir(path: &Path) -> Result<(), ServerError> {
    std::fs::create_dir_all(path).map_err(|source| ServerError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// At least one of [`bind`](Self::bind), [`prefix`](Self::prefix) or
/// [`listener`](Self::listener) is required. Sockets are bound by
/// [`build`](Self::build), so bind errors surface there.
#[derive(Default)]
pub struct ServerBuilder {
    binds: Vec<SocketAddr>,
    prefixes: Vec<String>,
    listeners: Vec<TcpListener>,

    file_root: Option<PathBuf>,
    view_root: Option<PathBuf>,
    not_found_page: Option<PathBuf>,
    trust_forwarded: bool,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    cache_limits: Option<CacheLimits>,
}

impl ServerBuilder {
    /// Listens on `addr`; port `0` picks a free port.
    ///
    /// ```no_run
    /// use dispatch_web::Server;
    ///
    /// let server = Server::builder()
    ///     .bind(([127, 0, 0, 1], 8080))
    ///     .build()
    ///     .unwrap();
    /// ```
    #[inline(always)]
    pub fn bind(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.binds.push(addr.into());
        self
    }

    /// Listens on a URL prefix such as `http://+:8080/`, `http://*:80/` or
    /// `http://localhost:3000/`. Only the host and port are used.
    #[inline(always)]
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefixes.push(prefix.to_string());
        self
    }

    /// Uses an already bound listener.
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Directory for static assets and downloads; created on build.
    #[inline(always)]
    pub fn file_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.file_root = Some(root.into());
        self
    }

    /// Directory searched first for text-like assets (`html`, `css`, `js`, ...).
    #[inline(always)]
    pub fn view_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.view_root = Some(root.into());
        self
    }

    #[inline(always)]
    pub fn not_found_page(mut self, page: impl Into<PathBuf>) -> Self {
        self.not_found_page = Some(page.into());
        self
    }

    /// Keys rate limits on `X-Forwarded-For` / `X-Real-IP` instead of the
    /// TCP peer. Enable only behind a proxy that overwrites these headers.
    ///
    /// Default: `false`
    #[inline(always)]
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }

    /// Configures the dispatcher: queues, permits, workers and shutdown.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dispatch_web::{limits::ServerLimits, Server};
    ///
    /// let server = Server::builder()
    ///     .bind(([0, 0, 0, 0], 8080))
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_in_flight: 32,
    ///         workers: 32,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures timeouts and keep-alive behaviour.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dispatch_web::{limits::ConnLimits, Server};
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .bind(([0, 0, 0, 0], 8080))
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         socket_read_timeout: Duration::from_secs(2),
    ///         keep_alive_timeout: Duration::from_secs(10),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures cache sizes, bucket eviction and stream chunking.
    #[inline(always)]
    pub fn cache_limits(mut self, limits: CacheLimits) -> Self {
        self.cache_limits = Some(limits);
        self
    }

    /// Binds the listeners, creates the root directories and constructs the
    /// [`Server`]. Nothing is accepted until [`Server::launch`].
    pub fn build(self) -> Result<Server, ServerError> {
        let mut binds = self.binds;
        for prefix in &self.prefixes {
            binds.push(parse_prefix(prefix)?);
        }

        let mut listeners = Vec::with_capacity(binds.len() + self.listeners.len());
        let mut addrs = Vec::with_capacity(listeners.capacity());
        for addr in binds {
            let listener = bind_socket(addr).map_err(|source| ServerError::Bind { addr, source })?;
            addrs.push(listener.local_addr()?);
            listeners.push(Listener::Std(listener));
        }
        for listener in self.listeners {
            addrs.push(listener.local_addr()?);
            listeners.push(Listener::Tokio(listener));
        }
        if listeners.is_empty() {
            return Err(ServerError::NoListener);
        }

        for root in [&self.file_root, &self.view_root].into_iter().flatten() {
            create_dir(root)?;
        }

        let limits = AllLimits {
            server: self.server_limits.unwrap_or_default(),
            conn: self.connection_limits.unwrap_or_default(),
            req: self.request_limits.unwrap_or_default(),
            cache: self.cache_limits.unwrap_or_default(),
        };
        let shutdown = CancelSignal::new();
        let delay = u64::try_from(limits.server.per_message_delay.as_micros()).unwrap_or(u64::MAX);

        let shared = Shared {
            routes: RouteTable::new(limits.cache.route_cache_capacity),
            middleware: MiddlewareChain::new(limits.cache.middleware_cache_capacity),
            limiter: RateLimiter::default(),
            statics: StaticContentCache::new(&limits.cache),
            sse: SseBroadcaster::new(),
            ticker: Ticker::with_shutdown(shutdown.clone()),
            roots: ArcSwap::from_pointee(Roots {
                file_root: self.file_root,
                view_root: self.view_root,
                not_found_page: self.not_found_page,
            }),

            dispatcher: Dispatcher::new(limits.server.intake_capacity, limits.server.max_in_flight),
            active_streams: AtomicUsize::new(0),
            trust_forwarded: self.trust_forwarded,
            delay_micros: AtomicU64::new(delay),

            listeners: Mutex::new(listeners),
            addrs,
            running: AtomicBool::new(false),

            limits,
            shutdown,
        };

        Ok(Server {
            shared: Arc::new(shared),
        })
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// `http://host:port/...` to a socket address; `+` and `*` mean every
/// interface.
fn parse_prefix(prefix: &str) -> Result<SocketAddr, ServerError> {
    let invalid = || ServerError::InvalidPrefix(prefix.to_string());

    let rest = prefix
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("http://"))
        .map(|_| &prefix[7..])
        .ok_or_else(invalid)?;
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => (host, port.parse::<u16>().map_err(|_| invalid())?),
        _ => (authority, 80),
    };

    let ip: IpAddr = match host {
        "+" | "*" | "" => Ipv4Addr::UNSPECIFIED.into(),
        host if host.eq_ignore_ascii_case("localhost") => Ipv4Addr::LOCALHOST.into(),
        host => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| invalid())?,
    };

    Ok(SocketAddr::new(ip, port))
}
