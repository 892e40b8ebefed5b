//! An audit sink writing JSON lines to a local file.
//!
//! Each process run writes to `<dir>/<app>-<YYYYmmdd_HHMMSS>.audit.log`. Older
//! audit files of the same application are removed when the sink opens, so
//! only the newest one is kept.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Local;
use glob::glob;

use crate::loggers::audit::AuditSink;
use crate::loggers::logrecord::LogRecord;

/// Appends audit records to a local file, one JSON document per line.
#[derive(Debug)]
pub struct LocalAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl LocalAuditSink {
    /// Creates `log_dir` if needed, removes older audit files of `app_name`
    /// and opens a fresh timestamped file.
    pub fn open(app_name: &str, log_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        Self::rotate(app_name, log_dir);

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = log_dir.join(format!("{app_name}-{timestamp}.audit.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Audit records go to {}", path.display());
        Ok(Self { path, file: Mutex::new(file) })
    }

    /// The file records are written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotate(app_name: &str, log_dir: &Path) {
        let pattern = format!("{}/{}-*.audit.log", log_dir.display(), app_name);
        let entries = match glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Bad audit rotation pattern {}: {}", pattern, e);
                return;
            }
        };
        for old_file in entries.flatten() {
            if let Err(e) = std::fs::remove_file(&old_file) {
                log::warn!("Error deleting old audit file {}: {}", old_file.display(), e);
            }
        }
    }
}

impl AuditSink for LocalAuditSink {
    fn record(&self, record: LogRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Dropping unserializable audit record: {}", e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{line}") {
            log::warn!("Failed to write audit record to {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::settings::LoggingSettings;
    use crate::core::peer::PeerIdentity;
    use crate::loggers::logrecord::LogEvent;

    #[test]
    fn writes_json_lines_and_drops_older_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("cad-20000101_000000.audit.log");
        std::fs::write(&stale, "old\n").unwrap();
        let other_app = dir.path().join("other-20000101_000000.audit.log");
        std::fs::write(&other_app, "keep\n").unwrap();

        let sink = LocalAuditSink::open("cad", dir.path()).unwrap();
        assert!(!stale.exists());
        assert!(other_app.exists());

        let settings = LoggingSettings { element_id: "el".into(), agency_id: "ag".into(), ..Default::default() };
        let peer = PeerIdentity::anonymous("127.0.0.1:9".parse().unwrap());
        sink.record(LogRecord::new(&settings, &peer, LogEvent::transmission_timeout("t1", "s1")));
        sink.record(LogRecord::new(&settings, &peer, LogEvent::transmission_timeout("t2", "s1")));

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["transactionId"], "t2");
        assert_eq!(lines[0]["logEventType"], "EidoTransmissionError");
    }
}
