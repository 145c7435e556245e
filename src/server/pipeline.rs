//! Per-request orchestration: middleware, then the first of file route, raw
//! route, templated route, static content and the not-found page.

use crate::{
    http::{
        mime,
        range::{parse_range, RangeError},
        response::content_disposition,
    },
    middleware::Endpoint,
    rate_limit::{too_many_requests, Decision, LimitCallback, OverrideContext, RateLimit, RateLimitEvent},
    routing::table::FileRoute,
    server::{connection::ConnectionInfo, server_impl::Shared},
    BoxFuture, Method, Request, Response, StatusCode,
};
use std::{
    net::IpAddr,
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Runs the middleware chain and the matching handler on a separate task
/// so a panic becomes a `500` instead of taking the worker down.
pub(crate) async fn run(shared: &Arc<Shared>, request: Request, info: Arc<ConnectionInfo>) -> Response {
    let method = request.method();
    let path = request.path().to_string();

    let endpoint: Endpoint = {
        let shared = Arc::clone(shared);
        Arc::new(move |req| -> BoxFuture<'static, Response> {
            Box::pin(handle(Arc::clone(&shared), req))
        })
    };
    let chain = shared.middleware.run(request, info, endpoint);

    match tokio::spawn(chain).await {
        Ok(resp) => resp,
        Err(err) => {
            match err.is_panic() {
                true => tracing::error!(%method, path, "Handler panicked"),
                false => tracing::error!(%method, path, "Handler task cancelled"),
            }
            Response::text(StatusCode::InternalServerError, "Internal Server Error")
        }
    }
}

async fn handle(shared: Arc<Shared>, mut request: Request) -> Response {
    if let Some((route, rest)) = shared.routes.match_file(request.path()) {
        return serve_file_route(&route, &rest, &request).await;
    }

    if let Some(raw) = shared.routes.match_raw(request.path()) {
        let key = raw.key();
        let limited = check_limit(&shared, &request, raw.limit, &key, raw.on_limited.as_ref());
        if let Some(resp) = limited.await {
            return resp;
        }
        return Response::upgrade(Arc::clone(&raw.handler), request);
    }

    if let Some((compiled, params)) = shared.routes.resolve(request.method(), request.path()) {
        let route = &compiled.route;
        let limited = check_limit(&shared, &request, route.limit, &compiled.key, route.on_limited.as_ref());
        if let Some(resp) = limited.await {
            return resp;
        }

        request.params = Arc::unwrap_or_clone(params);
        return route.handler.call(request).await;
    }

    let roots = shared.roots.load_full();

    let is_static = matches!(request.method(), Method::Get | Method::Head)
        && request.path().contains('.')
        && (roots.file_root.is_some() || roots.view_root.is_some());
    if is_static {
        let found = shared
            .statics
            .serve(&request, roots.view_root.as_deref(), roots.file_root.as_deref())
            .await;
        if let Some(resp) = found {
            return resp;
        }
    }

    not_found(roots.not_found_page.as_deref()).await
}

async fn not_found(page: Option<&Path>) -> Response {
    if let Some(page) = page {
        match tokio::fs::read_to_string(page).await {
            Ok(html) => return Response::html(StatusCode::NotFound, html),
            Err(err) => tracing::warn!(page = %page.display(), error = %err, "Failed to read not-found page"),
        }
    }
    Response::text(StatusCode::NotFound, "Not Found")
}

/// Applies the route limit, or the global one when the route has none.
///
/// Returns the response to send instead of running the handler.
async fn check_limit(
    shared: &Shared,
    request: &Request,
    route_limit: Option<RateLimit>,
    route_key: &str,
    callback: Option<&LimitCallback>,
) -> Option<Response> {
    let ip = client_key(shared, request);
    let limiter = &shared.limiter;

    let (decision, limit, scoped) = match route_limit.filter(RateLimit::is_active) {
        Some(limit) => (limiter.check_route(ip, route_key, limit), limit, true),
        None => {
            let limit = limiter.global()?;
            (limiter.check_global(ip)?, limit, false)
        }
    };

    let Decision::Denied { triggered, retry_after } = decision else {
        return None;
    };

    tracing::warn!(
        client = %ip,
        route = route_key,
        triggered,
        scope = if scoped { "route" } else { "global" },
        "Rate limit exceeded"
    );
    limiter.notify(RateLimitEvent {
        client_ip: ip,
        route_key: scoped.then(|| route_key.to_string()),
        triggered,
        method: request.method(),
        path: request.path().to_string(),
    });

    if let Some(callback) = callback {
        let ctx = OverrideContext {
            route_key: route_key.to_string(),
            max_requests: limit.max_requests(),
            window: limit.window(),
        };
        match callback(triggered, request.clone(), ctx).await {
            Ok(Some(resp)) => return Some(resp),
            Ok(None) => {}
            Err(err) => tracing::error!(client = %ip, route = route_key, error = %err, "Rate limit callback failed"),
        }
    }

    Some(too_many_requests(retry_after))
}

/// Bucket key: the TCP peer, or the proxy-supplied address when trusted.
fn client_key(shared: &Shared, request: &Request) -> IpAddr {
    match shared.trust_forwarded {
        true => request.forwarded_ip().unwrap_or_else(|| request.client_ip()),
        false => request.client_ip(),
    }
}

/// Serves `rest` below a file route's root as a download.
async fn serve_file_route(route: &FileRoute, rest: &str, request: &Request) -> Response {
    if !matches!(request.method(), Method::Get | Method::Head) {
        return Response::text(StatusCode::MethodNotAllowed, "Method Not Allowed")
            .header("Allow", "GET, HEAD");
    }
    if rest.contains("..") {
        return Response::text(StatusCode::BadRequest, "Invalid file path");
    }

    let rest = rest.trim_start_matches(['/', '\\']);
    if rest.is_empty() {
        return Response::text(StatusCode::NotFound, "File not found");
    }

    let path = route.root.join(rest);
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return Response::text(StatusCode::NotFound, "File not found"),
    };

    let len = meta.len();
    let modified = meta.modified().ok();
    let etag = download_etag(len, modified);

    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download");

    let mut resp = Response::new(StatusCode::Ok)
        .header("ETag", etag.as_str())
        .header("Cache-Control", "private, no-cache")
        .header("Accept-Ranges", "bytes");
    if let Some(modified) = modified {
        resp = resp.header("Last-Modified", httpdate::fmt_http_date(modified));
    }

    let not_modified = request
        .header("if-none-match")
        .is_some_and(|value| value.split(',').any(|tag| tag.trim() == etag || tag.trim() == "*"));
    if not_modified {
        return resp.with_status(StatusCode::NotModified);
    }

    let resp = resp
        .header("Content-Type", mime::from_path(&path))
        .header("Content-Disposition", content_disposition(name))
        .with_file(&path, 0, len, 0);

    match request.header("range").map(|value| parse_range(value, len)) {
        None | Some(Ok(None)) => resp,
        Some(Ok(Some(range))) => resp.with_range(range),
        Some(Err(RangeError::Malformed)) => Response::text(StatusCode::BadRequest, "Malformed Range header"),
        Some(Err(RangeError::Unsatisfiable)) => {
            Response::new(StatusCode::RangeNotSatisfiable).header("Content-Range", format!("bytes */{len}"))
        }
    }
}

/// Weak validator from size and mtime; downloads are not hashed.
fn download_etag(len: u64, modified: Option<SystemTime>) -> String {
    let mtime = modified
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |since| since.as_secs());
    format!("\"{len:x}-{mtime:x}\"")
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use std::io::Write;

    fn fixture(len: usize) -> (tempfile::TempDir, FileRoute) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("data.bin")).unwrap();
        file.write_all(&vec![7u8; len]).unwrap();

        let route = FileRoute {
            prefix: "/files/".to_string(),
            root: dir.path().to_path_buf(),
        };
        (dir, route)
    }

    fn get(range: Option<&str>) -> Request {
        let mut builder = Request::builder(Method::Get, "/files/data.bin");
        if let Some(range) = range {
            builder = builder.header("Range", range);
        }
        builder.build()
    }

    #[rustfmt::skip]
    #[tokio::test]
    async fn file_route_ranges() {
        let (_dir, route) = fixture(1000);

        let cases = [
            (None,                 StatusCode::Ok,                  Some("1000")),
            (Some("bytes=0-99"),   StatusCode::PartialContent,      Some("100")),
            (Some("bytes=-10"),    StatusCode::PartialContent,      Some("10")),
            (Some("bytes=900-"),   StatusCode::PartialContent,      Some("100")),
            (Some("bytes=0-1,5-9"), StatusCode::Ok,                 Some("1000")),
            (Some("bytes=5000-"),  StatusCode::RangeNotSatisfiable, None),
            (Some("bytes=x-y"),    StatusCode::BadRequest,          None),
        ];

        for (range, status, len) in cases {
            let resp = serve_file_route(&route, "data.bin", &get(range)).await;
            assert_eq!(resp.status(), status, "{range:?}");
            if let Some(len) = len {
                assert_eq!(resp.body_len().map(|n| n.to_string()).as_deref(), Some(len), "{range:?}");
            }
        }
    }

    #[tokio::test]
    async fn file_route_headers() {
        let (_dir, route) = fixture(10);
        let resp = serve_file_route(&route, "data.bin", &get(Some("bytes=0-4"))).await;

        assert_eq!(resp.header_value("content-range"), Some("bytes 0-4/10"));
        assert_eq!(resp.header_value("accept-ranges"), Some("bytes"));
        assert_eq!(resp.header_value("cache-control"), Some("private, no-cache"));
        assert!(resp
            .header_value("content-disposition")
            .is_some_and(|v| v.contains("data.bin")));

        let etag = resp.header_value("etag").unwrap().to_string();
        let again = Request::builder(Method::Get, "/files/data.bin")
            .header("If-None-Match", &etag)
            .build();
        let resp = serve_file_route(&route, "data.bin", &again).await;
        assert_eq!(resp.status(), StatusCode::NotModified);
    }

    #[rustfmt::skip]
    #[tokio::test]
    async fn file_route_rejections() {
        let (_dir, route) = fixture(10);

        let cases = [
            (Method::Get,  "../secret",   StatusCode::BadRequest),
            (Method::Get,  "",            StatusCode::NotFound),
            (Method::Get,  "missing.bin", StatusCode::NotFound),
            (Method::Post, "data.bin",    StatusCode::MethodNotAllowed),
        ];

        for (method, rest, status) in cases {
            let req = Request::builder(method, "/files/x").build();
            let resp = serve_file_route(&route, rest, &req).await;
            assert_eq!(resp.status(), status, "{method} {rest}");
        }
    }

    #[tokio::test]
    async fn custom_not_found_page() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("404.html");
        std::fs::write(&page, "<h1>gone</h1>").unwrap();

        let resp = not_found(Some(&page)).await;
        assert_eq!(resp.status(), StatusCode::NotFound);
        assert_eq!(resp.body_bytes(), Some(&b"<h1>gone</h1>"[..]));

        let resp = not_found(Some(&dir.path().join("missing.html"))).await;
        assert_eq!(resp.body_bytes(), Some(&b"Not Found"[..]));
    }
}
