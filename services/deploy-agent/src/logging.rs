//! Logging initialization.
//!
//! Logs go to stdout as JSON and into an in-memory cache of recent lines
//! that the status interface serves.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum cached lines.
pub const MAX_LOG_LINES: usize = 1000;

/// Maximum cached bytes (1 MB).
pub const MAX_LOG_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct CacheInner {
    lines: VecDeque<String>,
    bytes: usize,
}

/// Bounded cache of recent log lines; oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct LogCache {
    inner: Arc<Mutex<CacheInner>>,
    max_lines: usize,
    max_bytes: usize,
}

impl Default for LogCache {
    fn default() -> Self {
        Self::new(MAX_LOG_LINES, MAX_LOG_BYTES)
    }
}

impl LogCache {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            max_lines,
            max_bytes,
        }
    }

    /// Append one line.
    pub fn push(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bytes += line.len();
        inner.lines.push_back(line.to_string());
        while inner.lines.len() > self.max_lines || inner.bytes > self.max_bytes {
            match inner.lines.pop_front() {
                Some(old) => inner.bytes -= old.len(),
                None => break,
            }
        }
    }

    /// Cached lines joined with newlines.
    pub fn contents(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::with_capacity(inner.bytes + inner.lines.len());
        for line in &inner.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writer for one formatted event; lines land in the cache on drop.
pub struct LogCacheWriter {
    cache: LogCache,
    buf: Vec<u8>,
}

impl Write for LogCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogCacheWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|l| !l.is_empty()) {
            self.cache.push(line);
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCache {
    type Writer = LogCacheWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCacheWriter {
            cache: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Initialize logging; returns the cache fed by the subscriber.
pub fn init() -> anyhow::Result<LogCache> {
    let cache = LogCache::default();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().json();
    let cache_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(cache.clone());

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(cache_layer)
        .try_init()?;

    Ok(cache)
}
