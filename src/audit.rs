use crate::platform::WriteError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    pub community: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub link: String,
    pub details: Option<String>,
    pub automation_rule: Option<String>,
}

impl AuditRow {
    /// Spreadsheet cells in column order.
    pub fn cells(&self) -> Vec<String> {
        vec![
            self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.actor.clone(),
            self.action.clone(),
            self.link.clone(),
            self.details.clone().unwrap_or_default(),
            self.automation_rule.clone().unwrap_or_default(),
        ]
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, row: &AuditRow) -> Result<(), WriteError>;
    /// Timestamp of the newest row already in the sink.
    fn last_recorded(&self) -> anyhow::Result<Option<DateTime<Utc>>>;
}

/// Append-only JSON-lines file, one per audit sheet.
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(dir: impl AsRef<Path>, sheet: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{sheet}.jsonl")),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, row: &AuditRow) -> Result<(), WriteError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let line =
            serde_json::to_string(row).map_err(|e| WriteError::Rejected(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| WriteError::Transient(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WriteError::Transient(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| WriteError::Transient(e.to_string()))?;

        log::debug!("Appended audit row to {}: {:?}", self.path.display(), row.cells());
        Ok(())
    }

    fn last_recorded(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read audit file: {}", self.path.display()))?;

        match content.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => {
                let row: AuditRow = serde_json::from_str(line).with_context(|| {
                    format!("Malformed last row in audit file: {}", self.path.display())
                })?;
                Ok(Some(row.timestamp))
            }
            None => Ok(None),
        }
    }
}

/// An audit sink plus the newest timestamp it already holds, so rows
/// replayed after a restart are not written twice.
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    last_recorded: Option<DateTime<Utc>>,
}

impl AuditRecorder {
    /// Reads the sink's newest row once. If that fails, recording starts
    /// from `now` and anything older is skipped.
    pub fn new(sink: Arc<dyn AuditSink>, now: DateTime<Utc>) -> Self {
        let last_recorded = match sink.last_recorded() {
            Ok(last) => last,
            Err(e) => {
                log::warn!(
                    "Error reading audit trail ({e:#}). Initiating with current time, \
                     potentially missed mod actions."
                );
                Some(now)
            }
        };
        Self {
            sink,
            last_recorded,
        }
    }

    pub fn should_record(&self, row: &AuditRow) -> bool {
        self.last_recorded
            .map(|last| row.timestamp > last)
            .unwrap_or(true)
    }

    pub fn sink(&self) -> &dyn AuditSink {
        self.sink.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, MemoryAuditSink};

    fn row(secs: i64) -> AuditRow {
        AuditRow {
            community: "collapse".to_string(),
            timestamp: at(secs),
            actor: "alice".to_string(),
            action: "removelink".to_string(),
            link: "https://www.reddit.com/r/collapse/comments/abc123/".to_string(),
            details: Some("Rule 1".to_string()),
            automation_rule: None,
        }
    }

    #[test]
    fn test_cells_are_in_column_order() {
        let cells = row(1_700_000_000).cells();
        assert_eq!(cells[0], "2023-11-14 22:13:20");
        assert_eq!(cells[1], "alice");
        assert_eq!(cells[2], "removelink");
        assert_eq!(cells[4], "Rule 1");
        assert_eq!(cells[5], "");
    }

    #[test]
    fn test_jsonl_sink_appends_and_reads_last_row() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit"), "collapse");
        assert_eq!(sink.last_recorded().unwrap(), None);

        sink.append(&row(100)).unwrap();
        sink.append(&row(200)).unwrap();

        assert_eq!(sink.last_recorded().unwrap(), Some(at(200)));
        let lines = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn test_recorder_skips_rows_already_recorded() {
        let sink = Arc::new(MemoryAuditSink::with_last_recorded(at(150)));
        let recorder = AuditRecorder::new(sink, at(1_000));

        assert!(!recorder.should_record(&row(100)));
        assert!(!recorder.should_record(&row(150)));
        assert!(recorder.should_record(&row(151)));
    }

    #[test]
    fn test_recorder_with_unreadable_trail_starts_now() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("collapse.jsonl"), "not json\n").unwrap();

        let sink = JsonlAuditSink::new(dir.path(), "collapse");
        let recorder = AuditRecorder::new(Arc::new(sink), at(500));
        assert!(!recorder.should_record(&row(499)));
        assert!(recorder.should_record(&row(501)));
    }
}
