//! Append-only transaction log
//!
//! Every committed tree mutation is recorded as one JSON line of
//! `{op, path, value?, ts}`. On restart the log is replayed into an empty
//! tree before the input configuration is applied, which then overrides via
//! the normal timestamp rules.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Kind of a logged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOp {
    /// A leaf write
    Write,
    /// A subtree removal
    Remove,
}

/// One committed mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// What happened
    pub op: LogOp,
    /// The node path
    pub path: String,
    /// The written value (`None` for removals)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Write timestamp in milliseconds
    pub ts: u64,
}

/// Open handle to an append-only transaction log file
pub struct TransactionLog {
    file: File,
    path: PathBuf,
}

impl TransactionLog {
    /// Open (creating if needed) a transaction log for appending
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// The log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    /// Truncate the log to a fresh tail (after compaction)
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read every record from a log file
    ///
    /// A torn final line (crash mid-append) is tolerated: replay stops there
    /// with a warning. Corruption anywhere else is an error.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut lines = reader.lines().enumerate().peekable();
        while let Some((index, line)) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) if lines.peek().is_none() => {
                    warn!(
                        "dropping torn tail record at {}:{}: {}",
                        path.display(),
                        index + 1,
                        e
                    );
                    break;
                }
                Err(e) => {
                    return Err(Error::CorruptLog {
                        line: index + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("tlog");

        let mut log = TransactionLog::open(&log_path).unwrap();
        log.append(&LogRecord {
            op: LogOp::Write,
            path: "/services/main/version".to_string(),
            value: Some(json!("1.0")),
            ts: 10,
        })
        .unwrap();
        log.append(&LogRecord {
            op: LogOp::Remove,
            path: "/services/old".to_string(),
            value: None,
            ts: 11,
        })
        .unwrap();

        let records = TransactionLog::read_all(&log_path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, LogOp::Write);
        assert_eq!(records[0].value, Some(json!("1.0")));
        assert_eq!(records[1].op, LogOp::Remove);
        assert!(records[1].value.is_none());
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = TransactionLog::read_all(dir.path().join("absent")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("tlog");

        let mut log = TransactionLog::open(&log_path).unwrap();
        log.append(&LogRecord {
            op: LogOp::Write,
            path: "/k".to_string(),
            value: Some(json!(1)),
            ts: 1,
        })
        .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap()
            .write_all(b"{\"op\":\"write\",\"pa")
            .unwrap();

        let records = TransactionLog::read_all(&log_path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_corrupt_middle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("tlog");
        std::fs::write(&log_path, "not json\n{\"op\":\"remove\",\"path\":\"/k\",\"ts\":1}\n")
            .unwrap();

        assert!(matches!(
            TransactionLog::read_all(&log_path),
            Err(Error::CorruptLog { line: 1, .. })
        ));
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("tlog");

        let mut log = TransactionLog::open(&log_path).unwrap();
        log.append(&LogRecord {
            op: LogOp::Write,
            path: "/k".to_string(),
            value: Some(json!(1)),
            ts: 1,
        })
        .unwrap();
        log.truncate().unwrap();

        assert!(TransactionLog::read_all(&log_path).unwrap().is_empty());
    }
}
