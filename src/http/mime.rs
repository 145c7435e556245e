//! File extension to `Content-Type` mapping.

use std::path::Path;

/// Returns the `Content-Type` for a file extension (without the dot, any case).
///
/// Text types carry `charset=utf-8`. Unknown extensions map to
/// `application/octet-stream`.
pub fn from_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "map" => "application/json",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// [`from_extension`] applied to a path.
pub fn from_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(from_extension)
        .unwrap_or("application/octet-stream")
}

/// Extensions of files normally authored next to views rather than assets.
///
/// Static lookups for these try the view root before the file root.
pub(crate) fn is_text_like(ext: &str) -> bool {
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "html" | "htm" | "css" | "js" | "json" | "txt" | "xml" | "svg" | "map"
    )
}

#[cfg(test)]
mod mime_tests {
    use super::*;

    #[test]
    fn lookups() {
        #[rustfmt::skip]
        let cases = [
            ("index.html", "text/html; charset=utf-8"),
            ("APP.JS", "application/javascript; charset=utf-8"),
            ("logo.svg", "image/svg+xml"),
            ("movie.mp4", "video/mp4"),
            ("archive.tar.gz", "application/gzip"),
            ("README", "application/octet-stream"),
            ("data.bin", "application/octet-stream"),
        ];

        for (path, expected) in cases {
            assert_eq!(from_path(Path::new(path)), expected, "{path}");
        }
    }

    #[test]
    fn text_like() {
        assert!(is_text_like("CSS"));
        assert!(is_text_like("map"));
        assert!(!is_text_like("png"));
        assert!(!is_text_like("mp4"));
    }
}
