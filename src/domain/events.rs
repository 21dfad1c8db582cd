//! Log events written by the progress reporter.
//!
//! The job log is append-only: one `[timestamp] message` line per event, in
//! the order the events were reported.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used in log lines
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Terminal marker written after a fully successful run
pub const DONE_MARKER: &str = "DONE";

/// A single line of the job log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the event was reported (UTC, second precision)
    pub timestamp: DateTime<Utc>,

    /// Human-readable message
    pub message: String,

    /// Job this event belongs to
    pub job_id: String,
}

impl LogEvent {
    /// Create a new event stamped with the current time
    pub fn new(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(Utc::now(), job_id, message)
    }

    pub fn at(timestamp: DateTime<Utc>, job_id: impl Into<String>, message: impl Into<String>) -> Self {
        // Drop sub-second precision so rendering and parsing agree.
        let timestamp = Utc
            .timestamp_opt(timestamp.timestamp(), 0)
            .single()
            .unwrap_or(timestamp);

        Self {
            timestamp,
            message: message.into(),
            job_id: job_id.into(),
        }
    }

    /// Render as a log line (without trailing newline)
    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp.format(TIMESTAMP_FORMAT), self.message)
    }

    /// Parse a rendered log line back into an event
    pub fn parse_line(job_id: &str, line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let (stamp, message) = rest.split_once("] ")?;
        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;

        Some(Self {
            timestamp: Utc.from_utc_datetime(&naive),
            message: message.to_string(),
            job_id: job_id.to_string(),
        })
    }

    /// Whether this event is the terminal success marker
    pub fn is_done_marker(&self) -> bool {
        self.message == DONE_MARKER
    }
}

/// Message vocabulary shared by the controller and the job monitor
pub mod messages {
    pub fn running(tool: &str, stage_id: &str) -> String {
        format!("Running {} [{}]", tool, stage_id)
    }

    pub fn completed(tool: &str, stage_id: &str, secs: f64) -> String {
        format!("{} completed [{}] in {:.1}s", tool, stage_id, secs)
    }

    pub fn skipped(tool: &str, stage_id: &str, reason: &str) -> String {
        format!("Skipping {} [{}]: {}", tool, stage_id, reason)
    }

    pub fn failed(stage_id: &str, error: &str) -> String {
        format!("FAILED [{}]: {}", stage_id, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse_line() {
        let event = LogEvent::new("t1", "Running FastQC [qc]");
        let line = event.render();

        assert!(line.starts_with('['));
        assert!(line.ends_with("] Running FastQC [qc]"));

        let parsed = LogEvent::parse_line("t1", &line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LogEvent::parse_line("t1", "no timestamp here").is_none());
        assert!(LogEvent::parse_line("t1", "[yesterday] hello").is_none());
    }

    #[test]
    fn test_message_vocabulary() {
        assert_eq!(messages::running("MEGAHIT", "assemble"), "Running MEGAHIT [assemble]");
        assert_eq!(
            messages::completed("MEGAHIT", "assemble", 12.0),
            "MEGAHIT completed [assemble] in 12.0s"
        );
        assert!(messages::failed("trim", "boom").starts_with("FAILED [trim]"));
    }

    #[test]
    fn test_done_marker() {
        assert!(LogEvent::new("t1", DONE_MARKER).is_done_marker());
        assert!(!LogEvent::new("t1", "DONE soon").is_done_marker());
    }
}
