//! Static content with SHA-256 ETags and conditional GET.
//!
//! Only requests whose path contains a dot and matched no route reach this
//! cache. Entries remember the file's size and modification time and are
//! recomputed when either changes. Small files are kept in memory, larger
//! ones are hashed by streaming and sent from disk.

use crate::{
    http::{mime, response::Body},
    limits::CacheLimits,
    Request, Response, StatusCode,
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::{
    fmt::Write as _,
    io,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{fs, io::AsyncReadExt};

/// Cached metadata of one file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEntry {
    path: PathBuf,
    etag: String,
    last_modified: SystemTime,
    len: u64,
    content_type: &'static str,
    bytes: Option<Arc<[u8]>>,
}

impl StaticEntry {
    /// Quoted upper-case hex SHA-256 of the content, e.g. `"9F86D0..."`.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// `true` when the content is served from memory.
    pub fn is_buffered(&self) -> bool {
        self.bytes.is_some()
    }
}

/// ETag cache keyed by resolved file path.
#[derive(Debug)]
pub struct StaticContentCache {
    entries: DashMap<PathBuf, Arc<StaticEntry>>,
    small_file: u64,
    hash_buffer: usize,
    /// `0` sends `no-cache`
    max_age: AtomicU32,
}

impl StaticContentCache {
    pub(crate) fn new(limits: &CacheLimits) -> Self {
        Self {
            entries: DashMap::new(),
            small_file: limits.static_small_file,
            hash_buffer: limits.static_hash_buffer.max(1024),
            max_age: AtomicU32::new(limits.static_max_age.unwrap_or(0)),
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drops the entry of one file, returning whether it was cached.
    pub fn invalidate(&self, path: impl AsRef<Path>) -> bool {
        self.entries.remove(path.as_ref()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Browser cache lifetime; `None` or `Some(0)` sends `no-cache`.
    pub fn set_max_age(&self, seconds: Option<u32>) {
        self.max_age.store(seconds.unwrap_or(0), Ordering::Relaxed);
    }

    fn cache_control(&self) -> String {
        match self.max_age.load(Ordering::Relaxed) {
            0 => "no-cache".to_string(),
            secs => format!("public, max-age={secs}"),
        }
    }

    /// Current entry for `path`, recomputed if the file changed.
    ///
    /// `Ok(None)` when `path` is not a regular file.
    pub async fn entry(&self, path: &Path) -> io::Result<Option<Arc<StaticEntry>>> {
        let meta = match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);

        if let Some(entry) = self.entries.get(path) {
            if entry.len == meta.len() && entry.last_modified == modified {
                return Ok(Some(Arc::clone(entry.value())));
            }
        }

        let (etag, bytes) = match meta.len() <= self.small_file {
            true => {
                let bytes = fs::read(path).await?;
                (etag_of(&bytes), Some(Arc::from(bytes)))
            }
            false => (self.hash_streaming(path).await?, None),
        };

        let entry = Arc::new(StaticEntry {
            path: path.to_path_buf(),
            etag,
            last_modified: modified,
            len: meta.len(),
            content_type: mime::from_path(path),
            bytes,
        });

        tracing::debug!(path = %path.display(), etag = %entry.etag, len = entry.len, "Static entry computed");
        self.entries.insert(path.to_path_buf(), Arc::clone(&entry));
        Ok(Some(entry))
    }

    async fn hash_streaming(&self, path: &Path) -> io::Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.hash_buffer];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(quoted_hex(&hasher.finalize()))
    }

    /// Serves `request` from the roots, `None` when no file matches.
    ///
    /// Text-like extensions look in `view_root` first, everything else in
    /// `file_root` first. A path containing `..` is answered with `403`.
    pub(crate) async fn serve(
        &self,
        request: &Request,
        view_root: Option<&Path>,
        file_root: Option<&Path>,
    ) -> Option<Response> {
        let decoded = urlencoding::decode(request.path()).ok()?;
        if decoded.contains("..") {
            return Some(Response::text(StatusCode::Forbidden, "Forbidden"));
        }
        let relative = safe_relative(&decoded)?;

        let text_like = relative
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(mime::is_text_like);
        let roots = match text_like {
            true => [view_root, file_root],
            false => [file_root, view_root],
        };

        for root in roots.into_iter().flatten() {
            let candidate = root.join(&relative);
            match self.entry(&candidate).await {
                Ok(Some(entry)) => return Some(self.respond(request, &entry)),
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(path = %candidate.display(), error = %err, "Failed to read static file");
                    continue;
                }
            }
        }

        None
    }

    fn respond(&self, request: &Request, entry: &StaticEntry) -> Response {
        let resp = match is_not_modified(request, entry) {
            true => Response::new(StatusCode::NotModified),
            false => {
                let resp = Response::new(StatusCode::Ok).header("Content-Type", entry.content_type);
                match &entry.bytes {
                    Some(bytes) => resp.with_body(Body::Shared(Arc::clone(bytes))),
                    None => resp.with_file(&entry.path, 0, entry.len, 0),
                }
            }
        };

        resp.header("ETag", entry.etag.as_str())
            .header("Last-Modified", httpdate::fmt_http_date(entry.last_modified))
            .header("Cache-Control", self.cache_control())
    }
}

/// `If-None-Match` wins over `If-Modified-Since`.
fn is_not_modified(request: &Request, entry: &StaticEntry) -> bool {
    if let Some(value) = request.header("if-none-match") {
        let ours = entry.etag.trim_matches('"');
        return value.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag).trim_matches('"') == ours
        });
    }

    let Some(since) = request
        .header("if-modified-since")
        .and_then(|v| httpdate::parse_http_date(v).ok())
    else {
        return false;
    };

    unix_secs(entry.last_modified) <= unix_secs(since)
}

#[inline]
fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn etag_of(bytes: &[u8]) -> String {
    quoted_hex(&Sha256::digest(bytes))
}

fn quoted_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2 + 2);
    out.push('"');
    for byte in digest {
        let _ = write!(out, "{byte:02X}");
    }
    out.push('"');
    out
}

/// Relative path made of normal components only.
fn safe_relative(url_path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(url_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}
