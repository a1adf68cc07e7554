//! Serving files from a directory.
//!
//! The wildcard capture is percent-decoded and then resolved *lexically*
//! against the root: `.` segments vanish, `..` pops a segment but never past
//! the root, and nothing touches the filesystem until the path is clean.
//! Symlinks inside the root are followed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::StatusCode;
use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::handler::{Handler, handler};

/// A handler serving files under `root`, addressed by the route's `*` capture.
///
/// ```rust,no_run
/// use bough::{App, static_files};
///
/// let mut app = App::new();
/// app.get("/assets/*", static_files("./public")).unwrap();
/// ```
pub fn static_files(root: impl Into<PathBuf>) -> Handler {
    let root = Arc::new(root.into());
    handler(move |c| {
        let root = Arc::clone(&root);
        Box::pin(async move {
            let path = resolve(&root, c.param("*"))?;
            c.file(path).await
        })
    })
}

/// Joins the percent-encoded request path `raw` onto `root` without ever
/// leaving it.
///
/// ```rust
/// use std::path::Path;
/// use bough::static_files::resolve;
///
/// let p = resolve(Path::new("/var/www"), "css/../../../etc/passwd").unwrap();
/// assert_eq!(p, Path::new("/var/www/etc/passwd"));
/// ```
pub fn resolve(root: &Path, raw: &str) -> Result<PathBuf> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Error::http(StatusCode::BAD_REQUEST, "path is not valid UTF-8"))?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s if s.contains(['\0', ':']) => {
                return Err(Error::http(StatusCode::BAD_REQUEST, "invalid path segment"));
            }
            s => segments.push(s),
        }
    }

    let mut path = root.to_path_buf();
    path.extend(segments);
    Ok(path)
}

/// Content type for a file, guessed from its extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
