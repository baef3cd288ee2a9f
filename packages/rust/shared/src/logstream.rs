//! Named, append-only line sinks.
//!
//! Each route gets its own stream (`<log_dir>/<route>.out`) for free-form
//! progress output, and the dispatcher writes its routing audit to one as
//! well. Lines are prefixed with an RFC 3339 UTC timestamp.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::error::{Result, RouterError};

enum Sink {
    /// Lines go through a background writer thread; the guard flushes it
    /// when the last handle is dropped.
    File {
        path: PathBuf,
        writer: NonBlocking,
        _guard: WorkerGuard,
    },
    Memory(Mutex<Vec<String>>),
}

/// Cheaply cloneable handle to a named line sink.
#[derive(Clone)]
pub struct LogStream {
    name: Arc<str>,
    sink: Arc<Sink>,
}

impl LogStream {
    /// Open (or create) `<dir>/<name>.out` in append mode.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| RouterError::io(dir, e))?;
        let file_name = format!("{name}.out");
        let path = dir.join(&file_name);
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name)
            .build(dir)
            .map_err(|e| RouterError::io(&path, std::io::Error::other(e)))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        Ok(Self {
            name: name.into(),
            sink: Arc::new(Sink::File {
                path,
                writer,
                _guard: guard,
            }),
        })
    }

    /// A stream that keeps its lines in memory. Used when embedding the
    /// router without a log directory, and in tests.
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.into(),
            sink: Arc::new(Sink::Memory(Mutex::new(Vec::new()))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one line without blocking on disk I/O. Write failures are
    /// reported through `tracing` only; logging must never take down a route.
    pub fn log(&self, msg: impl AsRef<str>) {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = format!("[{ts}] {}", msg.as_ref());

        match self.sink.as_ref() {
            Sink::File { path, writer, .. } => {
                if let Err(e) = writeln!(writer.clone(), "{line}") {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write log stream");
                }
            }
            Sink::Memory(lines) => lock(lines).push(line),
        }
    }

    /// Lines written so far (without timestamps) for in-memory streams;
    /// empty for file-backed streams.
    pub fn lines(&self) -> Vec<String> {
        match self.sink.as_ref() {
            Sink::Memory(lines) => lock(lines)
                .iter()
                .map(|l| match l.split_once("] ") {
                    Some((_, msg)) => msg.to_string(),
                    None => l.clone(),
                })
                .collect(),
            Sink::File { .. } => Vec::new(),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        match self.sink.as_ref() {
            Sink::File { path, .. } => Some(path),
            Sink::Memory(_) => None,
        }
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("name", &self.name)
            .field("path", &self.path())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_collects_lines() {
        let log = LogStream::in_memory("gan");
        log.log("first");
        log.clone().log("second");
        assert_eq!(log.name(), "gan");
        assert_eq!(log.lines(), vec!["first", "second"]);
        assert!(log.path().is_none());
    }

    #[test]
    fn file_stream_appends() {
        let dir = std::env::temp_dir().join(format!("esr-log-test-{}", uuid::Uuid::now_v7()));
        let log = LogStream::open(&dir, "routerlog").unwrap();
        assert_eq!(log.path(), Some(dir.join("routerlog.out").as_path()));
        log.log("Routing to a: Foo@enwiki");
        log.clone().log("Routing to b: Bar@enwiki");
        // Dropping the last handle flushes the background writer.
        drop(log);

        let reopened = LogStream::open(&dir, "routerlog").unwrap();
        reopened.log("third");
        drop(reopened);

        let content = std::fs::read_to_string(dir.join("routerlog.out")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("Routing to a: Foo@enwiki"));
        assert!(lines[0].starts_with('['));
        assert!(lines[2].ends_with("third"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
