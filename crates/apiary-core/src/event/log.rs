//! Best-effort append-only event log.
//!
//! One JSON line per event. The log is an operator convenience, not a
//! store of record: write failures are logged and swallowed so a full
//! disk can never stall the dispatch pipeline.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::HubEvent;

/// Appends serialized events to a JSON Lines file.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Best-effort: failures are traced, never returned.
    pub fn append(&self, event: &HubEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event for log");
                return;
            }
        };

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            match self.open() {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to open event log"
                    );
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to append event");
                // Reopen on the next append in case the file was rotated away.
                *guard = None;
            }
        }
    }

    fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn appends_one_json_line_per_event() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("events.log");
        let log = EventLog::new(&path);

        for port in [3000u16, 3001] {
            log.append(&HubEvent::PortLeased {
                at: Utc::now(),
                port,
                agent_id: Uuid::new_v4(),
                purpose: "test".into(),
            });
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: HubEvent = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.kind(), "port_leased");
        }
    }

    #[test]
    fn append_to_unwritable_path_does_not_panic() {
        let log = EventLog::new("/proc/apiary-does-not-exist/events.log");
        log.append(&HubEvent::HubHeartbeat {
            at: Utc::now(),
            agents_running: 0,
        });
    }
}
