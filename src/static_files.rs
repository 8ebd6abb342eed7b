//! Static file service: safe path resolution, conditional requests, range
//! support, directory listing and a bounded LRU cache for small files.
//!
//! Files above the sendfile chunk size bypass the cache and are streamed by
//! the connection writer in configured chunks; everything else is served
//! from memory.

use crate::config::StaticConfig;
use crate::errors::{Error, Result};
use crate::http::request::Request;
use crate::http::response::{FileBody, Response};
use crate::http::types::Method;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Cache counters exposed through [`StaticService::cache_stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub total_memory: usize,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    mtime: SystemTime,
    last_access: Instant,
    loaded_at: Instant,
}

#[derive(Debug, Default)]
struct FileCache {
    entries: HashMap<PathBuf, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl FileCache {
    fn get(&mut self, path: &Path, mtime: SystemTime, ttl: Duration) -> Option<Arc<Vec<u8>>> {
        match self.entries.get_mut(path) {
            Some(entry) if entry.loaded_at.elapsed() <= ttl && entry.mtime == mtime => {
                entry.last_access = Instant::now();
                self.hits += 1;
                Some(entry.bytes.clone())
            }
            Some(_) => {
                // stale: evict now, the caller reloads
                let removed = self.entries.remove(path).unwrap();
                self.total_bytes -= removed.bytes.len();
                self.evictions += 1;
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, path: PathBuf, bytes: Arc<Vec<u8>>, mtime: SystemTime, max_bytes: usize, max_entries: usize) {
        if bytes.len() > max_bytes {
            return;
        }
        let now = Instant::now();
        self.total_bytes += bytes.len();
        if let Some(old) = self.entries.insert(
            path,
            CacheEntry {
                bytes,
                mtime,
                last_access: now,
                loaded_at: now,
            },
        ) {
            self.total_bytes -= old.bytes.len();
        }

        while self.total_bytes > max_bytes || self.entries.len() > max_entries {
            let lru = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match lru {
                Some(key) => {
                    let removed = self.entries.remove(&key).unwrap();
                    self.total_bytes -= removed.bytes.len();
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            total_memory: self.total_bytes,
            entry_count: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

enum RangeOutcome {
    /// No (usable) Range header: serve the whole file.
    Whole,
    /// Single satisfiable range.
    Partial { offset: u64, len: u64 },
    Unsatisfiable,
}

pub struct StaticService {
    config: StaticConfig,
    root: PathBuf,
    cache: Mutex<FileCache>,
}

impl StaticService {
    /// Resolves and pins the root directory. Fails when the root does not
    /// exist.
    pub(crate) fn new(config: StaticConfig) -> Result<Self> {
        let root = std::fs::canonicalize(&config.root)
            .map_err(|_| Error::Config("static root does not exist"))?;
        Ok(Self {
            config,
            root,
            cache: Mutex::new(FileCache::default()),
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    pub(crate) fn sendfile(&self) -> &crate::config::SendfileConfig {
        &self.config.sendfile
    }

    /// Serves `req` from the configured root, or returns
    /// [`Error::RouteNotFound`] so the caller can fall through to its 404
    /// handler.
    pub(crate) async fn handle(&self, req: &Request, resp: &mut Response) -> Result<()> {
        if !matches!(req.method(), Method::Get | Method::Head) {
            return Err(Error::MethodNotAllowed);
        }

        let resolved = self.resolve(req.path()).await?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| Error::RouteNotFound)?;

        if metadata.is_dir() {
            let index = resolved.join(&self.config.index_file);
            if tokio::fs::metadata(&index).await.map(|m| m.is_file()).unwrap_or(false) {
                return self.serve_file(req, resp, index).await;
            }
            if self.config.enable_directory_listing {
                return self.serve_listing(req, resp, &resolved).await;
            }
            return Err(Error::RouteNotFound);
        }

        self.serve_file(req, resp, resolved).await
    }

    /// Canonicalising join that refuses any resolution not strictly within
    /// the root: traversal segments, absolute targets and `//` are all
    /// rejected before the filesystem is consulted.
    pub(crate) async fn resolve(&self, request_path: &str) -> Result<PathBuf> {
        if !request_path.starts_with('/') || request_path.contains("//") || request_path.contains('\\') {
            return Err(Error::RouteNotFound);
        }
        let relative = request_path.trim_start_matches('/');
        let candidate = Path::new(relative);
        for component in candidate.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(Error::RouteNotFound),
            }
        }

        let joined = self.root.join(candidate);
        let resolved = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|_| Error::RouteNotFound)?;
        if !resolved.starts_with(&self.root) {
            return Err(Error::RouteNotFound);
        }
        Ok(resolved)
    }

    async fn serve_file(&self, req: &Request, resp: &mut Response, path: PathBuf) -> Result<()> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::RouteNotFound)?;
        let size = metadata.len();
        let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
        let etag = etag_for(mtime, size);

        resp.set_header("content-type", mime_for(&path))?;
        resp.set_header("last-modified", &httpdate::fmt_http_date(mtime))?;
        resp.set_header("cache-control", &self.config.cache_control)?;
        resp.set_header("accept-ranges", "bytes")?;
        if self.config.enable_etag {
            resp.set_header("etag", &etag)?;
        }

        if self.not_modified(req, &etag, mtime) {
            resp.set_status(304)?;
            resp.send();
            return Ok(());
        }

        match parse_range(req.header("range"), size) {
            RangeOutcome::Unsatisfiable => {
                resp.set_header("content-range", &format!("bytes */{size}"))?;
                resp.send_status(416)?;
                Ok(())
            }
            RangeOutcome::Partial { offset, len } => {
                resp.set_status(206)?;
                resp.set_header(
                    "content-range",
                    &format!("bytes {}-{}/{}", offset, offset + len - 1, size),
                )?;
                resp.set_file(FileBody { path, len, offset });
                resp.send();
                Ok(())
            }
            RangeOutcome::Whole => {
                resp.set_status(200)?;
                if size > self.config.sendfile.chunk_size as u64 {
                    resp.set_file(FileBody {
                        path,
                        len: size,
                        offset: 0,
                    });
                    resp.send();
                    return Ok(());
                }

                let cached = self.cache.lock().unwrap().get(&path, mtime, Duration::from_secs(self.config.cache_ttl));
                let bytes = match cached {
                    Some(bytes) => bytes,
                    None => {
                        let bytes = Arc::new(tokio::fs::read(&path).await.map_err(Error::Io)?);
                        self.cache.lock().unwrap().insert(
                            path,
                            bytes.clone(),
                            mtime,
                            self.config.max_cache_size,
                            self.config.max_cache_entries,
                        );
                        bytes
                    }
                };
                resp.set_cached_body(&bytes);
                resp.send();
                Ok(())
            }
        }
    }

    fn not_modified(&self, req: &Request, etag: &str, mtime: SystemTime) -> bool {
        if self.config.enable_etag {
            if let Some(candidates) = req.header("if-none-match") {
                return candidates == "*"
                    || candidates.split(',').any(|c| c.trim() == etag);
            }
        }
        if let Some(since) = req.header("if-modified-since") {
            if let Ok(since) = httpdate::parse_http_date(since) {
                let mtime_secs = mtime.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
                let since_secs = since.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
                return mtime_secs <= since_secs;
            }
        }
        false
    }

    async fn serve_listing(&self, req: &Request, resp: &mut Response, dir: &Path) -> Result<()> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|_| Error::RouteNotFound)?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let title = html_escape(req.path());
        let mut body = String::with_capacity(256 + names.len() * 64);
        body.push_str("<!DOCTYPE html><html><head><title>Index of ");
        body.push_str(&title);
        body.push_str("</title></head><body><h1>Index of ");
        body.push_str(&title);
        body.push_str("</h1><ul>");
        for name in &names {
            let escaped = html_escape(name);
            body.push_str("<li><a href=\"");
            body.push_str(&escaped);
            body.push_str("\">");
            body.push_str(&escaped);
            body.push_str("</a></li>");
        }
        body.push_str("</ul></body></html>");

        resp.set_status(200)?;
        resp.set_header("content-type", "text/html; charset=utf-8")?;
        resp.set_cached_body(body.as_bytes());
        resp.send();
        Ok(())
    }
}

/// Quoted ETag derived from mtime and size; identical inputs produce
/// byte-identical tags across runs.
fn etag_for(mtime: SystemTime, size: u64) -> String {
    let secs = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{secs:x}-{size:x}\"")
}

fn parse_range(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Whole;
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Whole;
    };
    // single range only; multi-range is out of scope
    if spec.contains(',') {
        return RangeOutcome::Whole;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return RangeOutcome::Whole;
    };

    let outcome = match (start.is_empty(), end.is_empty()) {
        // bytes=-N : final N bytes
        (true, false) => match end.parse::<u64>() {
            Ok(0) | Err(_) => return RangeOutcome::Unsatisfiable,
            Ok(n) => {
                let len = n.min(size);
                Some((size - len, len))
            }
        },
        // bytes=N- : from N to the end
        (false, true) => match start.parse::<u64>() {
            Ok(offset) if offset < size => Some((offset, size - offset)),
            _ => None,
        },
        (false, false) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(a), Ok(b)) if a <= b && a < size => Some((a, (b.min(size - 1)) - a + 1)),
            _ => None,
        },
        (true, true) => return RangeOutcome::Whole,
    };

    match outcome {
        Some((offset, len)) if len > 0 => RangeOutcome::Partial { offset, len },
        _ => RangeOutcome::Unsatisfiable,
    }
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Content type by extension; unknown extensions fall back to
/// `application/octet-stream`.
fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown",
        Some("xml") => "application/xml",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod resolve_tests {
    use super::*;

    #[test]
    fn etag_is_deterministic() {
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = etag_for(mtime, 1234);
        let b = etag_for(mtime, 1234);
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_ne!(a, etag_for(mtime, 1235));
        assert_ne!(a, etag_for(mtime + Duration::from_secs(1), 1234));
    }

    #[test]
    fn mime_lookup() {
        #[rustfmt::skip]
        let cases = [
            ("index.html",   "text/html; charset=utf-8"),
            ("app.JS",       "application/javascript"),
            ("logo.png",     "image/png"),
            ("data.json",    "application/json"),
            ("archive.bin",  "application/octet-stream"),
            ("no_extension", "application/octet-stream"),
        ];

        for (name, mime) in cases {
            assert_eq!(mime_for(Path::new(name)), mime, "{name}");
        }
    }

    #[test]
    fn html_escaping() {
        assert_eq!(
            html_escape(r#"<script>alert("x&y")</script>"#),
            "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;"
        );
        assert_eq!(html_escape("plain.txt"), "plain.txt");
    }

    #[test]
    fn range_parsing() {
        #[rustfmt::skip]
        let cases = [
            (None,                      (0, 100, false, true)),
            (Some("bytes=0-49"),        (0, 50, true, true)),
            (Some("bytes=50-99"),       (50, 50, true, true)),
            (Some("bytes=50-200"),      (50, 50, true, true)),
            (Some("bytes=90-"),         (90, 10, true, true)),
            (Some("bytes=-10"),         (90, 10, true, true)),
            (Some("bytes=0-0"),         (0, 1, true, true)),
            (Some("bytes=0-49,60-99"),  (0, 100, false, true)),  // multi-range ignored
            (Some("chars=0-49"),        (0, 100, false, true)),
        ];

        for (header, (offset, len, partial, ok)) in cases {
            match parse_range(header, 100) {
                RangeOutcome::Whole => assert!(!partial && ok, "{header:?}"),
                RangeOutcome::Partial { offset: o, len: l } => {
                    assert!(partial && ok, "{header:?}");
                    assert_eq!((o, l), (offset, len), "{header:?}");
                }
                RangeOutcome::Unsatisfiable => assert!(!ok, "{header:?}"),
            }
        }

        assert!(matches!(parse_range(Some("bytes=100-"), 100), RangeOutcome::Unsatisfiable));
        assert!(matches!(parse_range(Some("bytes=200-300"), 100), RangeOutcome::Unsatisfiable));
        assert!(matches!(parse_range(Some("bytes=-0"), 100), RangeOutcome::Unsatisfiable));
    }
}
