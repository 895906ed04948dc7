//! Append-only JSONL compile event log, one file per node.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One entry in a node's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CompileEvent {
    CompileStarted {
        node: String,
        compile_id: String,
        mantle_version: String,
    },
    CompileFinished {
        node: String,
        compile_id: String,
        catalog_version: String,
        resources: usize,
        edges: usize,
        total_seconds: f64,
    },
    CompileFailed {
        node: String,
        compile_id: String,
        error: String,
    },
    CatalogPersisted {
        node: String,
        catalog_version: String,
        digest: String,
    },
    ExportsPublished {
        node: String,
        resources: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: CompileEvent,
}

/// Current UTC time as ISO 8601, second precision.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (year, month, day) = civil_from_days((secs / 86400) as i64);
    let time = secs % 86400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        time / 3600,
        (time % 3600) / 60,
        time % 60
    )
}

/// Days since 1970-01-01 to a (year, month, day) date.
fn civil_from_days(mut days: i64) -> (i64, u32, i64) {
    let mut year = 1970;
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if days < len {
            break;
        }
        days -= len;
        year += 1;
    }
    let feb = if is_leap(year) { 29 } else { 28 };
    let lengths = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1;
    for len in lengths {
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }
    (year, month, days + 1)
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Identifier tying the events of one compilation together.
pub fn generate_compile_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("c-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

pub fn event_log_path(log_dir: &Path, node: &str) -> PathBuf {
    log_dir.join(node).join("events.jsonl")
}

/// Append an event to the node's event log.
pub fn append_event(log_dir: &Path, node: &str, event: CompileEvent) -> Result<()> {
    let path = event_log_path(log_dir, node);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent.display().to_string(), e))?;
    }
    let entry = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&entry)
        .map_err(|e| Error::Config(format!("cannot serialize event: {}", e)))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::io(path.display().to_string(), e))?;
    writeln!(file, "{}", json).map_err(|e| Error::io(path.display().to_string(), e))?;
    Ok(())
}

/// Read back every event of a node, oldest first.
pub fn read_events(log_dir: &Path, node: &str) -> Result<Vec<TimestampedEvent>> {
    let path = event_log_path(log_dir, node);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        std::fs::read_to_string(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                Error::Config(format!("corrupt event log {}: {}", path.display(), e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventlog_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_eventlog_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(31), (1970, 2, 1));
        // 2000-02-29 is day 11016
        assert_eq!(civil_from_days(11016), (2000, 2, 29));
        assert_eq!(civil_from_days(11017), (2000, 3, 1));
    }

    #[test]
    fn test_eventlog_is_leap() {
        assert!(is_leap(2000));
        assert!(!is_leap(1900));
        assert!(is_leap(2024));
        assert!(!is_leap(2026));
    }

    #[test]
    fn test_eventlog_compile_id() {
        let id = generate_compile_id();
        assert!(id.starts_with("c-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_eventlog_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        append_event(
            dir.path(),
            "web01",
            CompileEvent::CompileStarted {
                node: "web01".into(),
                compile_id: "c-1".into(),
                mantle_version: "0.3.0".into(),
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            "web01",
            CompileEvent::CompileFailed {
                node: "web01".into(),
                compile_id: "c-1".into(),
                error: "boom".into(),
            },
        )
        .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("web01/events.jsonl")).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"event\":\"compile_started\""));
        let events = read_events(dir.path(), "web01").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].event, CompileEvent::CompileFailed { .. }));
        assert!(read_events(dir.path(), "other").unwrap().is_empty());
    }
}
