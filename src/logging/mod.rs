//! Session logging
//!
//! Console output goes through `tracing`; each session additionally gets a
//! newline-delimited JSON `debug.log` under its session directory, rotated
//! by size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::utils::error::Result;

/// Install the global tracing subscriber for console output.
pub fn init_tracing(level: &str, verbose: bool) {
    let directive = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// One line of a session debug log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

/// Appends NDJSON entries to `debug.log` with size-based rotation.
pub struct SessionLogger {
    path: PathBuf,
    max_size_bytes: u64,
    max_backups: u32,
    file: Mutex<Option<File>>,
}

impl SessionLogger {
    pub fn new(session_dir: &Path, max_size_mb: u64, max_backups: u32) -> Self {
        Self {
            path: session_dir.join("debug.log"),
            max_size_bytes: max_size_mb.max(1) * 1024 * 1024,
            max_backups,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, level: &str, target: &str, message: &str) {
        self.log_with_fields(level, target, message, serde_json::Value::Null)
    }

    pub fn log_with_fields(
        &self,
        level: &str,
        target: &str,
        message: &str,
        fields: serde_json::Value,
    ) {
        let entry = LogEntry {
            ts: Utc::now(),
            level: level.to_string(),
            target: target.to_string(),
            message: message.to_string(),
            fields,
        };
        if let Err(e) = self.append(&entry) {
            tracing::warn!("failed to append session log entry: {}", e);
        }
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut guard = self.file.lock().expect("log file lock");
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }

        if self.path.exists() && fs::metadata(&self.path)?.len() >= self.max_size_bytes {
            *guard = None;
            self.rotate()?;
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }

        let file = guard.as_mut().expect("log file open");
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Shift `debug.log` -> `debug.log.1` -> ... -> `debug.log.N`, dropping
    /// the oldest.
    fn rotate(&self) -> Result<()> {
        if self.max_backups == 0 {
            fs::remove_file(&self.path)?;
            return Ok(());
        }
        let backup = |n: u32| PathBuf::from(format!("{}.{}", self.path.display(), n));
        let oldest = backup(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_backups).rev() {
            let from = backup(n);
            if from.exists() {
                fs::rename(&from, backup(n + 1))?;
            }
        }
        fs::rename(&self.path, backup(1))?;
        Ok(())
    }
}

/// Filter for reading a session log back.
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    /// Minimum level (error > warn > info > debug > trace).
    pub level: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub grep: Option<regex::Regex>,
    /// Keep only the last N entries after filtering.
    pub tail: Option<usize>,
}

fn level_rank(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "error" => 4,
        "warn" => 3,
        "info" => 2,
        "debug" => 1,
        _ => 0,
    }
}

/// Read and filter a debug log. Malformed lines are skipped.
pub fn read_log(path: &Path, filter: &LogFilter) -> Result<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let min_rank = filter.level.as_deref().map(level_rank).unwrap_or(0);

    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let Ok(entry) = serde_json::from_str::<LogEntry>(&line) else {
            continue;
        };
        if level_rank(&entry.level) < min_rank {
            continue;
        }
        if let Some(since) = filter.since {
            if entry.ts < since {
                continue;
            }
        }
        if let Some(re) = &filter.grep {
            if !re.is_match(&entry.message) {
                continue;
            }
        }
        entries.push(entry);
    }
    if let Some(tail) = filter.tail {
        if entries.len() > tail {
            entries.drain(..entries.len() - tail);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::new(dir.path(), 10, 2);
        logger.log("info", "orchestrator", "phase advanced");
        logger.log("warn", "instance", "stall detected");

        let entries = read_log(logger.path(), &LogFilter::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "phase advanced");
    }

    #[test]
    fn test_level_filter() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::new(dir.path(), 10, 2);
        logger.log("debug", "t", "noise");
        logger.log("error", "t", "boom");

        let filter = LogFilter {
            level: Some("warn".to_string()),
            ..Default::default()
        };
        let entries = read_log(logger.path(), &filter).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "boom");
    }

    #[test]
    fn test_grep_and_tail() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::new(dir.path(), 10, 2);
        for i in 0..10 {
            logger.log("info", "t", &format!("tick {}", i));
        }
        let filter = LogFilter {
            grep: Some(regex::Regex::new(r"tick [5-9]").unwrap()),
            tail: Some(3),
            ..Default::default()
        };
        let entries = read_log(logger.path(), &filter).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].message, "tick 9");
    }

    #[test]
    fn test_rotation_keeps_backups() {
        let dir = TempDir::new().unwrap();
        let mut logger = SessionLogger::new(dir.path(), 1, 2);
        // Shrink the threshold so a handful of entries trigger rotation.
        logger.max_size_bytes = 256;

        for i in 0..40 {
            logger.log("info", "t", &format!("entry number {}", i));
        }
        assert!(logger.path().exists());
        assert!(dir.path().join("debug.log.1").exists());
        assert!(!dir.path().join("debug.log.3").exists());
    }
}
