//! Append-only structured event log.
//!
//! Every event is written through `log_sync_event` as one JSON object per
//! line; this is the durable substrate the testable properties and the
//! completeness gate's warning count are checked against. There is no
//! separate `tracing`/`log` dependency — this *is* the logging layer, by the
//! same convention the rest of the workspace uses a `Reporter` trait for
//! operator-facing stderr output and a JSONL file for everything durable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use conveyor_types::{EventLevel, SyncEvent};
use uuid::Uuid;

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(run_state_dir: &Path) -> PathBuf {
    run_state_dir.join(EVENTS_FILE)
}

/// In-memory accumulator plus file sink for a run's event stream.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<SyncEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    /// Convenience constructor matching the `log_sync_event(run_id, level,
    /// message, details)` shape.
    pub fn log(&mut self, run_id: Uuid, level: EventLevel, message: impl Into<String>, details: serde_json::Value) {
        self.record(SyncEvent {
            run_id,
            level,
            message: message.into(),
            details,
            at: Utc::now(),
        });
    }

    pub fn info(&mut self, run_id: Uuid, message: impl Into<String>, details: serde_json::Value) {
        self.log(run_id, EventLevel::Info, message, details);
    }

    pub fn warn(&mut self, run_id: Uuid, message: impl Into<String>, details: serde_json::Value) {
        self.log(run_id, EventLevel::Warn, message, details);
    }

    pub fn error(&mut self, run_id: Uuid, message: impl Into<String>, details: serde_json::Value) {
        self.log(run_id, EventLevel::Error, message, details);
    }

    /// Append all events recorded since construction to `path` in JSONL form.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = File::open(path).with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from events file {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: SyncEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn all_events(&self) -> &[SyncEvent] {
        &self.events
    }

    pub fn events_for_run(&self, run_id: Uuid) -> Vec<&SyncEvent> {
        self.events.iter().filter(|e| e.run_id == run_id).collect()
    }

    /// Recompute `warning_count` per the completeness gate's whitelist
    /// rule: WARN events whose message is not in
    /// [`conveyor_types::WARNING_WHITELIST`].
    pub fn countable_warning_count(&self, run_id: Uuid) -> u32 {
        self.events
            .iter()
            .filter(|e| e.run_id == run_id)
            .filter(|e| e.level == EventLevel::Warn)
            .filter(|e| !conveyor_types::WARNING_WHITELIST.contains(&e.message.as_str()))
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn run_id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let td = tempdir().unwrap();
        let path = events_path(td.path());
        let run = run_id();

        let mut log = EventLog::new();
        log.info(run, "step_completed", json!({"step": "import_ftp"}));
        log.write_to_file(&path).unwrap();

        let loaded = EventLog::read_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.all_events()[0].message, "step_completed");
    }

    #[test]
    fn write_to_file_appends() {
        let td = tempdir().unwrap();
        let path = events_path(td.path());
        let run = run_id();

        let mut log1 = EventLog::new();
        log1.info(run, "a", json!({}));
        log1.write_to_file(&path).unwrap();

        let mut log2 = EventLog::new();
        log2.info(run, "b", json!({}));
        log2.write_to_file(&path).unwrap();

        let loaded = EventLog::read_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn read_missing_file_is_empty() {
        let td = tempdir().unwrap();
        let loaded = EventLog::read_from_file(&td.path().join("nope.jsonl")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn whitelisted_warnings_are_not_counted() {
        let run = run_id();
        let mut log = EventLog::new();
        log.warn(run, "lock_ownership_lost", json!({}));
        log.warn(run, "step_retry_scheduled", json!({}));
        log.warn(run, "invalid_stock_value", json!({"matnr": "X"}));
        assert_eq!(log.countable_warning_count(run), 1);
    }

    #[test]
    fn warning_count_is_scoped_per_run() {
        let run_a = run_id();
        let run_b = run_id();
        let mut log = EventLog::new();
        log.warn(run_a, "orphan_4255", json!({}));
        log.warn(run_b, "orphan_4255", json!({}));
        log.warn(run_b, "orphan_4255", json!({}));
        assert_eq!(log.countable_warning_count(run_a), 1);
        assert_eq!(log.countable_warning_count(run_b), 2);
    }

    #[test]
    fn events_for_run_filters_other_runs() {
        let run_a = run_id();
        let run_b = run_id();
        let mut log = EventLog::new();
        log.info(run_a, "x", json!({}));
        log.info(run_b, "y", json!({}));
        assert_eq!(log.events_for_run(run_a).len(), 1);
    }

    #[test]
    fn clear_removes_all_events() {
        let mut log = EventLog::new();
        log.info(run_id(), "x", json!({}));
        log.clear();
        assert!(log.is_empty());
    }
}
