use dispatch_web::{
    from_sync, lifecycle, BoxError, IntoResponse, Json, Middleware, Next, RateLimit, Request, Response, Route,
    Server, StatusCode, StreamUpload,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

#[derive(Serialize)]
struct Greeting {
    name: String,
    visits: u64,
}

#[derive(Deserialize)]
struct NewNote {
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), dispatch_web::ServerError> {
    dispatch_web::logging::init();

    let server = Server::builder()
        .prefix("http://+:8080/")
        .file_root("demo_files")
        .view_root("demo_views")
        .build()?;

    let visits = Arc::new(AtomicU64::new(0));

    // GET /hello/{name} -> JSON, at most 5 per second per client
    let counter = Arc::clone(&visits);
    server.add_route(
        Route::get("/hello/{name}", move |req: Request| {
            let visits = counter.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                Json(Greeting {
                    name: req.param("name").unwrap_or("stranger").to_string(),
                    visits,
                })
            }
        })
        .rate_limit(RateLimit::new(5, Duration::from_secs(1)))
        .on_rate_limited(|triggered, _req, ctx| async move {
            let body = format!("limit is {} per {:?} (denied {triggered}x)", ctx.max_requests, ctx.window);
            Ok::<_, BoxError>(Some(Response::text(StatusCode::TooManyRequests, body)))
        }),
    )?;

    // POST /notes {"text": "..."} -> 201
    server.add_route(Route::post("/notes", |req: Request| async move {
        match req.json::<NewNote>() {
            Ok(note) => (StatusCode::Created, format!("saved: {}", note.text)).into_response(),
            Err(err) => (StatusCode::BadRequest, err.to_string()).into_response(),
        }
    }))?;

    server.add_route(Route::get("/health", from_sync(|_req| "ok")))?;

    // curl -H 'X-File-Name: a.bin' --data-binary @a.bin localhost:8080/upload
    server.add_stream_upload_route("/upload", |mut upload: StreamUpload| async move {
        upload
            .save_to("demo_uploads")
            .await
            .map(|path| (StatusCode::Created, path.display().to_string()))
    });

    // curl -r 0-99 localhost:8080/download/<file>
    server.add_file_route("/download", "demo_files")?;

    // curl -N localhost:8080/clock
    server.add_sse_route("/clock", Some(Duration::from_secs(15)), |ctx| async move {
        ctx.send("welcome", "ticks follow every second").await?;
        Ok::<(), BoxError>(())
    });

    server.add_middleware(Middleware::request(|req: Request, next: Next| async move {
        let started = std::time::Instant::now();
        let method = req.method();
        let path = req.path().to_string();

        let resp = next.run(req).await;
        tracing::info!(%method, path, status = resp.status().as_u16(), elapsed = ?started.elapsed(), "request");
        resp
    }));

    let clock = server.clone();
    server.ticker().every_async(Duration::from_secs(1), move || {
        let clock = clock.clone();
        async move {
            let now = httpdate::fmt_http_date(std::time::SystemTime::now());
            clock.sse().broadcast("/clock", "tick", &now).await;
            Ok::<(), BoxError>(())
        }
    })?;

    server.launch_with_signal(lifecycle::shutdown_signal()).await
}
