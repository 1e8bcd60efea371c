//! Bounded in-memory log ring with an append-only file mirror.
//!
//! The ring keeps the most recent `capacity` lines for the logs API; the
//! file mirror keeps everything written during the process lifetime so
//! `/api/logs/all` can recover lines that fell out of the ring. The mirror
//! is a temp file removed when the buffer is closed.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::sync::{read_or_recover, write_or_recover};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// One captured line of application output.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: Stream,
    pub line: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub total_lines: u64,
    pub buffered_lines: usize,
    pub capacity: usize,
    pub buffer_full: bool,
}

struct Inner {
    ring: VecDeque<LogEntry>,
    capacity: usize,
    total: u64,
    file: Option<NamedTempFile>,
}

pub struct LogBuffer {
    inner: RwLock<Inner>,
}

impl LogBuffer {
    /// Creates a buffer with the given ring capacity and opens the mirror
    /// file. A zero capacity falls back to the default; a failure to create
    /// the mirror file disables it with a warning rather than failing.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let file = match tempfile::Builder::new()
            .prefix("hubproxy-")
            .suffix(".log")
            .tempfile()
        {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(error = %err, "failed to create log mirror file, continuing without it");
                None
            }
        };

        Self {
            inner: RwLock::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                total: 0,
                file,
            }),
        }
    }

    /// Appends an entry, overwriting the oldest one when the ring is full,
    /// and mirrors it to the log file.
    pub fn append(&self, entry: LogEntry) {
        let mut inner = write_or_recover(&self.inner);

        if let Some(file) = inner.file.as_ref() {
            let line = format!(
                "[{}] [{}] {}\n",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                entry.stream.as_str(),
                entry.line
            );
            let mut f = file.as_file();
            if let Err(err) = f.write_all(line.as_bytes()) {
                warn!(error = %err, "failed to write log mirror");
            }
            let _ = f.sync_data();
        }

        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(entry);
        inner.total += 1;
    }

    /// The most recent `n` entries in append order. `n == 0` means all
    /// buffered entries.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let inner = read_or_recover(&self.inner);
        let n = if n == 0 || n > inner.ring.len() {
            inner.ring.len()
        } else {
            n
        };
        inner
            .ring
            .iter()
            .skip(inner.ring.len() - n)
            .cloned()
            .collect()
    }

    /// All buffered entries with a timestamp strictly after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        let inner = read_or_recover(&self.inner);
        inner
            .ring
            .iter()
            .filter(|entry| entry.timestamp > since)
            .cloned()
            .collect()
    }

    /// The most recent `n` entries on one stream.
    pub fn by_stream(&self, stream: Stream, n: usize) -> Vec<LogEntry> {
        let inner = read_or_recover(&self.inner);
        let mut filtered: Vec<LogEntry> = inner
            .ring
            .iter()
            .filter(|entry| entry.stream == stream)
            .cloned()
            .collect();
        if n > 0 && filtered.len() > n {
            filtered.drain(..filtered.len() - n);
        }
        filtered
    }

    pub fn stats(&self) -> LogStats {
        let inner = read_or_recover(&self.inner);
        LogStats {
            total_lines: inner.total,
            buffered_lines: inner.ring.len(),
            capacity: inner.capacity,
            buffer_full: inner.total >= inner.capacity as u64,
        }
    }

    /// Resets the in-memory ring. The mirror file is left untouched.
    pub fn clear(&self) {
        let mut inner = write_or_recover(&self.inner);
        inner.ring.clear();
        inner.total = 0;
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        let inner = read_or_recover(&self.inner);
        inner.file.as_ref().map(|f| f.path().to_path_buf())
    }

    /// Re-reads the whole mirror file. Lines that have fallen out of the
    /// ring are still present here.
    pub fn all_from_file(&self) -> std::io::Result<Vec<String>> {
        let path = self.file_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no log file available")
        })?;
        let file = std::fs::File::open(path)?;
        BufReader::new(file).lines().collect()
    }

    /// Closes the buffer, removing the mirror file (best effort).
    pub fn close(&self) {
        let mut inner = write_or_recover(&self.inner);
        // NamedTempFile unlinks on drop.
        inner.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(line: &str, stream: Stream) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            stream,
            line: line.to_string(),
            pid: 42,
        }
    }

    #[test]
    fn append_and_recent_preserve_order() {
        let buffer = LogBuffer::new(10);
        for i in 0..5 {
            buffer.append(entry(&format!("line {i}"), Stream::Stdout));
        }
        let recent = buffer.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].line, "line 2");
        assert_eq!(recent[2].line, "line 4");
    }

    #[test]
    fn overflow_drops_oldest() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.append(entry(&format!("line {i}"), Stream::Stdout));
        }
        let all = buffer.recent(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].line, "line 2");
        assert_eq!(all[2].line, "line 4");

        let stats = buffer.stats();
        assert_eq!(stats.total_lines, 5);
        assert_eq!(stats.buffered_lines, 3);
        assert_eq!(stats.capacity, 3);
        assert!(stats.buffer_full);
    }

    #[test]
    fn since_filters_strictly_after() {
        let buffer = LogBuffer::new(10);
        buffer.append(entry("old", Stream::Stdout));
        let cutoff = buffer.recent(1)[0].timestamp;
        std::thread::sleep(std::time::Duration::from_millis(5));
        buffer.append(entry("new", Stream::Stdout));

        let since = buffer.since(cutoff);
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].line, "new");
    }

    #[test]
    fn by_stream_filters_and_tails() {
        let buffer = LogBuffer::new(10);
        buffer.append(entry("out 1", Stream::Stdout));
        buffer.append(entry("err 1", Stream::Stderr));
        buffer.append(entry("out 2", Stream::Stdout));
        buffer.append(entry("out 3", Stream::Stdout));

        let errs = buffer.by_stream(Stream::Stderr, 10);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].line, "err 1");

        let outs = buffer.by_stream(Stream::Stdout, 2);
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].line, "out 2");
        assert_eq!(outs[1].line, "out 3");
    }

    #[test]
    fn clear_resets_ring() {
        let buffer = LogBuffer::new(10);
        buffer.append(entry("line", Stream::Stdout));
        buffer.clear();
        assert!(buffer.recent(0).is_empty());
        assert_eq!(buffer.stats().total_lines, 0);
    }

    #[test]
    fn mirror_file_retains_overflowed_lines() {
        let buffer = LogBuffer::new(2);
        for i in 0..4 {
            buffer.append(entry(&format!("line {i}"), Stream::Stdout));
        }
        let lines = buffer.all_from_file().unwrap();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("[stdout] line 0"));
        assert!(lines[3].contains("[stdout] line 3"));
    }

    #[test]
    fn close_removes_mirror_file() {
        let buffer = LogBuffer::new(2);
        buffer.append(entry("line", Stream::Stdout));
        let path = buffer.file_path().unwrap();
        assert!(path.exists());
        buffer.close();
        assert!(!path.exists());
        assert!(buffer.all_from_file().is_err());
    }
}
