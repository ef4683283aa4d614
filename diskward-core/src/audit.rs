//! The append-only audit trail of every action and outcome.
//!
//! Each entry is persisted as one line of the form
//! `<RFC 3339 timestamp> - <message>` through an [`AuditSink`] before it is
//! visible in memory. Terminal escape sequences are removed from messages
//! first, so a colorized message from a front-end is stored as plain text.
//!
//! Timestamps never go backwards: if the wall clock steps back between two
//! entries, the later entry reuses the previous timestamp.
use crate::error::{DiskError, DiskResult};
use chrono::{DateTime, Local, SecondsFormat};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub severity: Severity,
}

impl AuditEntry {
    /// The persisted form of this entry, without a trailing newline.
    pub fn line(&self) -> String {
        format!(
            "{} - {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
            self.message
        )
    }
}

/// Where audit lines are persisted.
pub trait AuditSink: Send {
    fn append(&mut self, line: &str) -> io::Result<()>;
}

/// An append-only log file, created if absent.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        // One write per line so concurrent readers never see two entries interleaved.
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.file.write_all(buf.as_bytes())?;
        self.file.flush()
    }
}

/// An in-memory sink. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for MemorySink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::other("audit buffer poisoned"))?
            .push(line.to_string());
        Ok(())
    }
}

type Clock = Box<dyn Fn() -> DateTime<Local> + Send>;

pub struct AuditLog {
    sink: Box<dyn AuditSink>,
    entries: Vec<AuditEntry>,
    clock: Clock,
}

impl AuditLog {
    pub fn new(sink: impl AuditSink + 'static) -> Self {
        Self::with_clock(sink, Local::now)
    }

    pub fn with_clock(
        sink: impl AuditSink + 'static,
        clock: impl Fn() -> DateTime<Local> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            entries: Vec::new(),
            clock: Box::new(clock),
        }
    }

    /// Appends an entry, persisting it before it becomes visible in [`entries`](Self::entries).
    pub fn record(&mut self, severity: Severity, message: impl AsRef<str>) -> DiskResult<()> {
        let message = console::strip_ansi_codes(message.as_ref()).into_owned();
        let now = (self.clock)();
        let timestamp = match self.entries.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let entry = AuditEntry {
            timestamp,
            message,
            severity,
        };

        self.sink.append(&entry.line()).map_err(DiskError::Audit)?;

        match severity {
            Severity::Info | Severity::Success => {
                tracing::info!(target: "audit", severity = %severity, "{}", entry.message)
            }
            Severity::Warning => tracing::warn!(target: "audit", "{}", entry.message),
            Severity::Error => tracing::error!(target: "audit", "{}", entry.message),
        }

        self.entries.push(entry);
        Ok(())
    }

    pub fn info(&mut self, message: impl AsRef<str>) -> DiskResult<()> {
        self.record(Severity::Info, message)
    }

    pub fn success(&mut self, message: impl AsRef<str>) -> DiskResult<()> {
        self.record(Severity::Success, message)
    }

    pub fn warn(&mut self, message: impl AsRef<str>) -> DiskResult<()> {
        self.record(Severity::Warning, message)
    }

    pub fn error(&mut self, message: impl AsRef<str>) -> DiskResult<()> {
        self.record(Severity::Error, message)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }
}

/// Reads back a persisted audit log.
pub fn read_log(path: impl AsRef<Path>) -> io::Result<String> {
    std::fs::read_to_string(path)
}
