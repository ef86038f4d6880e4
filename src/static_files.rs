// src/static_files.rs
use crate::error::{UvhttpError, UvhttpResult};
use crate::http::{Method, Request, Response};
use crate::rate_limit::unix_now;
use crate::syscalls::{self, WriteOutcome};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const CACHE_SHARDS: usize = 8;

/// Static-file mount configuration.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub root_directory: PathBuf,
    /// Byte cap across all cached file contents.
    pub max_cache_size: u64,
    /// Seconds before a cache entry is revalidated against the filesystem.
    pub cache_ttl: u64,
    pub max_cache_entries: usize,
    pub sendfile_timeout_ms: u64,
    pub sendfile_max_retry: u32,
    /// Chunk size for streamed files; also the inline-cache threshold:
    /// anything larger streams instead of being held in memory.
    pub sendfile_chunk_size: usize,
    pub enable_directory_listing: bool,
    pub enable_etag: bool,
    pub enable_last_modified: bool,
    pub enable_sendfile: bool,
}

impl StaticConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: root.into(),
            max_cache_size: 64 * 1024 * 1024,
            cache_ttl: 300,
            max_cache_entries: 1024,
            sendfile_timeout_ms: 30_000,
            sendfile_max_retry: 3,
            sendfile_chunk_size: 256 * 1024,
            enable_directory_listing: false,
            enable_etag: true,
            enable_last_modified: true,
            enable_sendfile: true,
        }
    }
}

struct CacheEntry {
    size: u64,
    mtime_secs: u64,
    etag: String,
    content_type: String,
    bytes: Arc<[u8]>,
    /// Epoch seconds of insertion, refreshed in place on revalidation.
    inserted: AtomicU64,
    /// Monotonic use tick for LRU eviction.
    last_used: AtomicU64,
}

#[derive(Default)]
struct Shard {
    map: HashMap<PathBuf, Arc<CacheEntry>>,
    bytes: u64,
}

/// Sharded LRU content cache keyed by canonical path.
///
/// Entries hold their bytes behind `Arc`, so eviction only drops the map's
/// reference; responses still streaming the content keep it alive until
/// they complete.
struct FileCache {
    shards: Vec<Mutex<Shard>>,
    tick: AtomicU64,
    shard_max_bytes: u64,
    shard_max_entries: usize,
    ttl: u64,
}

impl FileCache {
    fn new(config: &StaticConfig) -> Self {
        let shards = (0..CACHE_SHARDS).map(|_| Mutex::new(Shard::default())).collect();
        Self {
            shards,
            tick: AtomicU64::new(0),
            shard_max_bytes: (config.max_cache_size / CACHE_SHARDS as u64).max(1),
            shard_max_entries: (config.max_cache_entries / CACHE_SHARDS).max(1),
            ttl: config.cache_ttl,
        }
    }

    fn shard_for(&self, path: &Path) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % CACHE_SHARDS]
    }

    /// Cached entry for `path`, revalidated against `mtime_secs` once its
    /// TTL has elapsed: unchanged files get a refreshed TTL in place,
    /// changed files drop out so the caller reloads.
    fn lookup(&self, path: &Path, mtime_secs: u64) -> Option<Arc<CacheEntry>> {
        let mut shard = self.shard_for(path).lock().ok()?;
        let entry = shard.map.get(path)?.clone();

        let now = unix_now();
        if now.saturating_sub(entry.inserted.load(Ordering::Relaxed)) >= self.ttl {
            if entry.mtime_secs == mtime_secs {
                entry.inserted.store(now, Ordering::Relaxed);
            } else {
                shard.bytes -= entry.size;
                shard.map.remove(path);
                return None;
            }
        }
        entry
            .last_used
            .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        Some(entry)
    }

    fn insert(&self, path: PathBuf, entry: Arc<CacheEntry>) {
        let Ok(mut shard) = self.shard_for(&path).lock() else {
            return;
        };
        if entry.size > self.shard_max_bytes {
            return;
        }
        entry
            .last_used
            .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        if let Some(old) = shard.map.insert(path, entry.clone()) {
            shard.bytes -= old.size;
        }
        shard.bytes += entry.size;

        // LRU eviction on whichever cap trips first.
        while shard.map.len() > self.shard_max_entries || shard.bytes > self.shard_max_bytes {
            let victim = shard
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(p, _)| p.clone());
            match victim {
                Some(p) => {
                    if let Some(e) = shard.map.remove(&p) {
                        shard.bytes -= e.size;
                    }
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().map.len()).sum()
    }
}

/// In-flight file transmission: one bounded chunk per write-ready cycle,
/// with a per-chunk deadline and bounded retries.
pub struct FileStream {
    file: File,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    chunk_size: usize,
    /// Bytes left in the chunk currently on the wire.
    chunk_left: usize,
    pub(crate) retries_left: u32,
    timeout_ms: u64,
    /// Epoch-millisecond deadline for the current chunk.
    pub(crate) deadline_ms: u64,
    use_sendfile: bool,
    /// Read-then-write staging for the non-sendfile path.
    buf: Vec<u8>,
    buf_pos: usize,
}

/// Progress report from driving a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProgress {
    /// Every byte of the file is on the wire.
    Finished,
    /// The socket stopped accepting; wait for write-ready.
    Pending,
}

impl FileStream {
    fn new(file: File, size: u64, config: &StaticConfig) -> Self {
        Self {
            file,
            offset: 0,
            size,
            chunk_size: config.sendfile_chunk_size.max(1),
            chunk_left: 0,
            retries_left: config.sendfile_max_retry,
            timeout_ms: config.sendfile_timeout_ms,
            deadline_ms: 0,
            use_sendfile: config.enable_sendfile,
            buf: Vec::new(),
            buf_pos: 0,
        }
    }

    /// Push bytes at the socket until the file completes or the socket
    /// blocks. Transient errors retry the current chunk up to the
    /// configured budget; an exhausted budget is fatal.
    pub(crate) fn drive(&mut self, socket_fd: i32) -> UvhttpResult<StreamProgress> {
        loop {
            if self.offset >= self.size {
                return Ok(StreamProgress::Finished);
            }
            if self.chunk_left == 0 && self.buf_pos >= self.buf.len() {
                // Begin the next chunk and arm its deadline.
                self.chunk_left = self.chunk_size.min((self.size - self.offset) as usize);
                self.deadline_ms = now_ms() + self.timeout_ms;
                if !self.use_sendfile {
                    self.fill_buf()?;
                }
            }

            let outcome = if self.use_sendfile {
                syscalls::sendfile_nonblocking(
                    socket_fd,
                    self.file.as_raw_fd(),
                    &mut self.offset,
                    self.chunk_left,
                )
            } else {
                let res = syscalls::write_nonblocking(socket_fd, &self.buf[self.buf_pos..]);
                if let Ok(WriteOutcome::Wrote(n)) = &res {
                    self.buf_pos += n;
                    self.offset += *n as u64;
                }
                res
            };

            match outcome {
                Ok(WriteOutcome::Wrote(0)) => {
                    // sendfile hit EOF early: the file shrank underneath us.
                    return Err(UvhttpError::Other("file truncated during stream".to_string()));
                }
                Ok(WriteOutcome::Wrote(n)) => {
                    if self.use_sendfile {
                        self.chunk_left -= n.min(self.chunk_left);
                    }
                }
                Ok(WriteOutcome::WouldBlock) => return Ok(StreamProgress::Pending),
                Err(e) => {
                    if self.retries_left == 0 {
                        return Err(e);
                    }
                    self.retries_left -= 1;
                    warn!(retries_left = self.retries_left, "file stream chunk error, retrying");
                }
            }
        }
    }

    /// Chunk deadline handling, called from the worker's sweep. `Ok` means
    /// the chunk was re-armed for another attempt; `Err` means the retry
    /// budget is exhausted.
    pub(crate) fn on_timeout(&mut self) -> UvhttpResult<()> {
        if self.retries_left == 0 {
            return Err(UvhttpError::Other("sendfile chunk timed out".to_string()));
        }
        self.retries_left -= 1;
        self.deadline_ms = now_ms() + self.timeout_ms;
        Ok(())
    }

    fn fill_buf(&mut self) -> UvhttpResult<()> {
        self.buf.clear();
        self.buf.resize(self.chunk_left, 0);
        self.buf_pos = 0;
        let mut filled = 0;
        while filled < self.buf.len() {
            let n = self.file.read(&mut self.buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.buf.truncate(filled);
        self.chunk_left = 0;
        if filled == 0 && self.offset < self.size {
            return Err(UvhttpError::Other("file truncated during stream".to_string()));
        }
        Ok(())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What the worker should do after a static-mount dispatch.
pub(crate) enum StaticOutcome {
    /// The response is complete (inline body, 304, 403, 404, listing).
    Done,
    /// Headers are set; drive this stream once they flush.
    Stream(FileStream),
}

/// One static mount: URL prefix → directory, with its own cache.
pub struct StaticService {
    prefix: String,
    config: StaticConfig,
    root: PathBuf,
    cache: FileCache,
}

impl StaticService {
    /// Create a mount. The root directory must exist; its canonical form
    /// anchors every path-safety check.
    pub fn new(prefix: &str, config: StaticConfig) -> UvhttpResult<Self> {
        if !prefix.starts_with('/') {
            return Err(UvhttpError::InvalidParam("mount prefix must start with '/'"));
        }
        let root = fs::canonicalize(&config.root_directory)?;
        if !root.is_dir() {
            return Err(UvhttpError::InvalidParam("static root is not a directory"));
        }
        let cache = FileCache::new(&config);
        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            config,
            root,
            cache,
        })
    }

    pub fn prefix(&self) -> &str {
        if self.prefix.is_empty() { "/" } else { &self.prefix }
    }

    pub(crate) fn matches(&self, path: &str) -> bool {
        path == self.prefix() || path.starts_with(&format!("{}/", self.prefix))
    }

    pub(crate) fn handle(&self, req: &Request, resp: &mut Response) -> StaticOutcome {
        let path = req.path();
        let suffix = path
            .strip_prefix(&self.prefix)
            .unwrap_or(path)
            .trim_start_matches('/');

        let Some(full) = self.resolve(suffix) else {
            resp.canned(403, "Forbidden");
            return StaticOutcome::Done;
        };

        let meta = match fs::metadata(&full) {
            Ok(m) => m,
            Err(_) => {
                resp.not_found();
                return StaticOutcome::Done;
            }
        };

        if meta.is_dir() {
            if self.config.enable_directory_listing {
                self.render_listing(&full, path, resp);
            } else {
                resp.canned(403, "Forbidden");
            }
            return StaticOutcome::Done;
        }

        let mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let etag = strong_etag(meta.size(), mtime_secs, meta.ino());

        if self.not_modified(req, &etag, mtime_secs) {
            let _ = resp.set_status(304);
            if self.config.enable_etag {
                let _ = resp.set_header("ETag", &etag);
            }
            let _ = resp.send();
            return StaticOutcome::Done;
        }

        let head_only = req.method == Method::Head;

        // Small files are served from the content cache; larger ones
        // bypass it and stream.
        if meta.size() <= self.config.sendfile_chunk_size as u64 {
            match self.cached_entry(&full, &meta, mtime_secs, &etag) {
                Ok(entry) => {
                    let _ = resp.set_status(200);
                    self.common_headers(resp, &entry.content_type, entry.size, &entry.etag, entry.mtime_secs);
                    if !head_only {
                        let _ = resp.set_shared_body(entry.bytes.clone());
                    }
                    let _ = resp.send();
                    StaticOutcome::Done
                }
                Err(_) => {
                    resp.not_found();
                    StaticOutcome::Done
                }
            }
        } else {
            let file = match File::open(&full) {
                Ok(f) => f,
                Err(_) => {
                    resp.not_found();
                    return StaticOutcome::Done;
                }
            };
            let content_type = content_type_for(&full);
            let _ = resp.set_status(200);
            self.common_headers(resp, &content_type, meta.size(), &etag, mtime_secs);
            let _ = resp.send();
            if head_only {
                StaticOutcome::Done
            } else {
                debug!(path = %full.display(), size = meta.size(), "streaming file");
                StaticOutcome::Stream(FileStream::new(file, meta.size(), &self.config))
            }
        }
    }

    /// Join the request suffix under the root and re-check the canonical
    /// result; anything escaping the root is rejected.
    fn resolve(&self, suffix: &str) -> Option<PathBuf> {
        let relative = Path::new(suffix);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return None;
        }
        let joined = self.root.join(relative);
        // Symlinks are followed, but the realpath must stay inside root.
        match fs::canonicalize(&joined) {
            Ok(canonical) if canonical.starts_with(&self.root) => Some(canonical),
            Ok(_) => None,
            // Nonexistent paths are reported as 404 by the caller, as long
            // as their parent chain did not try to escape.
            Err(_) => Some(joined),
        }
    }

    fn not_modified(&self, req: &Request, etag: &str, mtime_secs: u64) -> bool {
        if self.config.enable_etag {
            if let Some(inm) = req.header("If-None-Match") {
                return inm
                    .split(',')
                    .map(str::trim)
                    .any(|candidate| candidate == etag || candidate == "*");
            }
        }
        if self.config.enable_last_modified {
            if let Some(ims) = req.header("If-Modified-Since") {
                if let Ok(since) = httpdate::parse_http_date(ims) {
                    let since_secs = since
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    return mtime_secs <= since_secs;
                }
            }
        }
        false
    }

    fn common_headers(
        &self,
        resp: &mut Response,
        content_type: &str,
        size: u64,
        etag: &str,
        mtime_secs: u64,
    ) {
        let _ = resp.set_header("Content-Type", content_type);
        let mut len_buf = itoa::Buffer::new();
        let _ = resp.set_header("Content-Length", len_buf.format(size));
        if self.config.enable_etag {
            let _ = resp.set_header("ETag", etag);
        }
        if self.config.enable_last_modified {
            let mtime = UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs);
            let _ = resp.set_header("Last-Modified", &httpdate::fmt_http_date(mtime));
        }
    }

    fn cached_entry(
        &self,
        full: &Path,
        meta: &fs::Metadata,
        mtime_secs: u64,
        etag: &str,
    ) -> UvhttpResult<Arc<CacheEntry>> {
        if let Some(entry) = self.cache.lookup(full, mtime_secs) {
            return Ok(entry);
        }
        let bytes: Arc<[u8]> = fs::read(full)?.into();
        let entry = Arc::new(CacheEntry {
            size: meta.size(),
            mtime_secs,
            etag: etag.to_string(),
            content_type: content_type_for(full),
            bytes,
            inserted: AtomicU64::new(unix_now()),
            last_used: AtomicU64::new(0),
        });
        self.cache.insert(full.to_path_buf(), entry.clone());
        Ok(entry)
    }

    fn render_listing(&self, dir: &Path, url_path: &str, resp: &mut Response) {
        let mut names: Vec<String> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| {
                    let mut name = e.file_name().to_string_lossy().into_owned();
                    if e.path().is_dir() {
                        name.push('/');
                    }
                    name
                })
                .collect(),
            Err(_) => {
                resp.canned(403, "Forbidden");
                return;
            }
        };
        names.sort();

        let base = url_path.trim_end_matches('/');
        let mut html = String::with_capacity(256 + names.len() * 64);
        html.push_str("<!DOCTYPE html>\n<html><head><title>Index of ");
        html.push_str(url_path);
        html.push_str("</title></head><body><h1>Index of ");
        html.push_str(url_path);
        html.push_str("</h1><ul>\n");
        for name in &names {
            html.push_str("<li><a href=\"");
            html.push_str(base);
            html.push('/');
            html.push_str(name);
            html.push_str("\">");
            html.push_str(name);
            html.push_str("</a></li>\n");
        }
        html.push_str("</ul></body></html>\n");

        let _ = resp.set_status(200);
        let _ = resp.set_header("Content-Type", "text/html");
        let _ = resp.set_body(html);
        let _ = resp.send();
    }
}

fn strong_etag(size: u64, mtime_secs: u64, ino: u64) -> String {
    format!("\"{:x}-{:x}-{:x}\"", size, mtime_secs, ino)
}

fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
