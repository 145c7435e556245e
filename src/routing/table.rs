use crate::{
    errors::ServerError,
    rate_limit::{limit_callback, LimitCallback, OverrideContext, RateLimit},
    routing::{
        cache::{CachedMatch, RouteCacheStats, RouteMatchCache},
        template::Matcher,
        Params,
    },
    server::raw::RawHandler,
    BoxError, Handler, Method, Request, Response,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A templated route: method, path template and handler.
///
/// ```
/// use dispatch_web::{BoxError, RateLimit, Request, Response, Route, StatusCode};
/// use std::time::Duration;
///
/// let route = Route::get("/users/{id}", |req: Request| async move {
///     format!("user {}", req.param("id").unwrap_or_default())
/// })
/// .rate_limit(RateLimit::new(10, Duration::from_secs(1)))
/// .on_rate_limited(|triggered, _req, ctx| async move {
///     // Let the first few excess requests through with a warning
///     let resp = (triggered < 3).then(|| {
///         Response::text(StatusCode::Ok, format!("slow down ({})", ctx.max_requests))
///     });
///     Ok::<_, BoxError>(resp)
/// });
///
/// assert_eq!(route.template(), "/users/{id}");
/// ```
pub struct Route {
    pub(crate) method: Method,
    pub(crate) template: String,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) limit: Option<RateLimit>,
    pub(crate) on_limited: Option<LimitCallback>,
}

macro_rules! method_shorthands {
    ($($name:ident => $method:ident),* $(,)?) => {$(
        #[doc = concat!("Shorthand for `Route::new(Method::", stringify!($method), ", ..)`.")]
        pub fn $name(template: &str, handler: impl Handler) -> Self {
            Self::new(Method::$method, template, handler)
        }
    )*};
}

impl Route {
    pub fn new(method: Method, template: &str, handler: impl Handler) -> Self {
        Self {
            method,
            template: normalize_path(template),
            handler: Arc::new(handler),
            limit: None,
            on_limited: None,
        }
    }

    method_shorthands! {
        get => Get,
        post => Post,
        put => Put,
        delete => Delete,
        patch => Patch,
    }

    /// Route-level limit; takes precedence over the server-wide limit.
    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.limit = Some(limit).filter(RateLimit::is_active);
        self
    }

    /// Called when a request is denied by this route's limit.
    ///
    /// Receives the number of consecutive denials, the request and the limit.
    /// Returning `Ok(Some(response))` sends that response instead of `429`.
    pub fn on_rate_limited<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(u64, Request, OverrideContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Response>, BoxError>> + Send + 'static,
    {
        self.on_limited = Some(limit_callback(callback));
        self
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn template(&self) -> &str {
        &self.template
    }

    pub(crate) fn key(&self) -> String {
        format!("ROUTE:{}:{}", self.method, self.template)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("template", &self.template)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// A prefix route whose handler takes over the connection.
///
/// Matched case-insensitively with `starts_with`, before templated routes.
/// The request body is left unread for the handler.
pub struct RawRoute {
    pub(crate) prefix: String,
    pub(crate) handler: Arc<dyn RawHandler>,
    pub(crate) limit: Option<RateLimit>,
    pub(crate) on_limited: Option<LimitCallback>,
}

impl RawRoute {
    pub fn new(prefix: &str, handler: impl RawHandler) -> Self {
        Self::from_arc(prefix, Arc::new(handler))
    }

    pub(crate) fn from_arc(prefix: &str, handler: Arc<dyn RawHandler>) -> Self {
        Self {
            prefix: normalize_path(prefix),
            handler,
            limit: None,
            on_limited: None,
        }
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.limit = Some(limit).filter(RateLimit::is_active);
        self
    }

    /// See [`Route::on_rate_limited`].
    pub fn on_rate_limited<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(u64, Request, OverrideContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Response>, BoxError>> + Send + 'static,
    {
        self.on_limited = Some(limit_callback(callback));
        self
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn key(&self) -> String {
        format!("RAW:{}", self.prefix)
    }

    fn matches(&self, path: &str) -> bool {
        starts_with_ignore_case(path, &self.prefix)
    }
}

impl fmt::Debug for RawRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRoute")
            .field("prefix", &self.prefix)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// Download prefix mapped onto a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileRoute {
    pub(crate) prefix: String,
    pub(crate) root: PathBuf,
}

#[derive(Debug)]
pub(crate) struct CompiledRoute {
    pub(crate) route: Route,
    pub(crate) matcher: Matcher,
    pub(crate) key: String,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    by_method: HashMap<Method, Vec<Arc<CompiledRoute>>>,
    raw: Vec<Arc<RawRoute>>,
    files: Vec<Arc<FileRoute>>,
}

/// All registered routes.
///
/// Readers load an immutable snapshot; registration clones it, appends and
/// swaps it in under a writer lock, then clears the match cache.
pub(crate) struct RouteTable {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    cache: RouteMatchCache,
}

impl RouteTable {
    pub(crate) fn new(cache_capacity: usize) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            writer: Mutex::new(()),
            cache: RouteMatchCache::new(cache_capacity),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Snapshot)) {
        let _writer = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot.load_full());
        apply(&mut next);
        self.snapshot.store(Arc::new(next));
        self.cache.clear();
    }

    pub(crate) fn add_route(&self, route: Route) -> Result<(), ServerError> {
        let matcher =
            Matcher::compile(&route.template).map_err(|source| ServerError::InvalidTemplate {
                template: route.template.clone(),
                source,
            })?;

        tracing::info!(method = %route.method, template = %route.template, "Route added");

        let compiled = Arc::new(CompiledRoute {
            key: route.key(),
            route,
            matcher,
        });
        self.update(|snapshot| {
            snapshot
                .by_method
                .entry(compiled.route.method)
                .or_default()
                .push(compiled);
        });
        Ok(())
    }

    pub(crate) fn add_raw(&self, route: RawRoute) {
        tracing::info!(prefix = %route.prefix, "Raw route added");
        self.update(|snapshot| snapshot.raw.push(Arc::new(route)));
    }

    pub(crate) fn add_file(&self, prefix: &str, root: &Path) {
        let route = FileRoute {
            prefix: normalize_file_prefix(prefix),
            root: root.to_path_buf(),
        };
        tracing::info!(prefix = %route.prefix, root = %route.root.display(), "File route added");
        self.update(|snapshot| snapshot.files.push(Arc::new(route)));
    }

    /// First templated route of `method` matching `path`, with its parameters.
    ///
    /// `HEAD` falls back to `GET` routes.
    pub(crate) fn resolve(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(Arc<CompiledRoute>, Arc<Params>)> {
        match self.resolve_exact(method, path) {
            None if method == Method::Head => self.resolve_exact(Method::Get, path),
            found => found,
        }
    }

    fn resolve_exact(&self, method: Method, path: &str) -> Option<(Arc<CompiledRoute>, Arc<Params>)> {
        // Read the generation first: a result computed from an older
        // snapshot must not outlive the next registration
        let generation = self.cache.generation();
        let snapshot = self.snapshot.load();
        let routes = snapshot.by_method.get(&method).map(Vec::as_slice).unwrap_or_default();

        let outcome = match self.cache.get(method, path) {
            Some(outcome) => outcome,
            None => {
                let outcome = routes
                    .iter()
                    .enumerate()
                    .find_map(|(index, route)| {
                        route.matcher.extract(path).map(|params| CachedMatch::Found {
                            index,
                            params: Arc::new(params),
                        })
                    })
                    .unwrap_or(CachedMatch::NotFound);

                self.cache.insert(method, path, outcome.clone(), generation);
                outcome
            }
        };

        match outcome {
            CachedMatch::Found { index, params } => {
                routes.get(index).map(|route| (Arc::clone(route), params))
            }
            CachedMatch::NotFound => None,
        }
    }

    pub(crate) fn match_raw(&self, path: &str) -> Option<Arc<RawRoute>> {
        self.snapshot
            .load()
            .raw
            .iter()
            .find(|route| route.matches(path))
            .cloned()
    }

    /// File route whose prefix starts `path`, with the decoded remainder.
    pub(crate) fn match_file(&self, path: &str) -> Option<(Arc<FileRoute>, String)> {
        let snapshot = self.snapshot.load();
        let route = snapshot
            .files
            .iter()
            .find(|route| starts_with_ignore_case(path, &route.prefix))?;

        let rest = urlencoding::decode(&path[route.prefix.len()..]).ok()?;
        Some((Arc::clone(route), rest.into_owned()))
    }

    pub(crate) fn has_raw_routes(&self) -> bool {
        !self.snapshot.load().raw.is_empty()
    }

    pub(crate) fn cache_stats(&self) -> RouteCacheStats {
        self.cache.stats()
    }
}

#[inline]
pub(crate) fn starts_with_ignore_case(path: &str, prefix: &str) -> bool {
    path.len() >= prefix.len()
        && path.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

pub(crate) fn normalize_path(path: &str) -> String {
    let path = path.trim();
    match path.starts_with('/') {
        true => path.to_string(),
        false => format!("/{path}"),
    }
}

/// `downloads`, `/downloads` and `/downloads/` all become `/downloads/`.
fn normalize_file_prefix(prefix: &str) -> String {
    match prefix.trim().trim_matches('/') {
        "" => "/".to_string(),
        inner => format!("/{inner}/"),
    }
}
