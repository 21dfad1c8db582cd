//! Job monitor: status reconstructed from a job log.
//!
//! Only the log is consulted. Stage lines carry the stage id in brackets
//! (`Running MEGAHIT [assemble]`), which is what the per-stage state is keyed on.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::LogEvent;

/// Hourly price of a machine type in USD
pub fn hourly_rate(machine_type: &str) -> f64 {
    match machine_type {
        "n1-standard-16" => 0.38,
        "n1-highmem-16" => 0.47,
        _ => 0.50,
    }
}

/// Estimated cost in USD of running `machine_type` for `elapsed_secs`
pub fn estimate_cost(machine_type: &str, elapsed_secs: f64) -> f64 {
    elapsed_secs.max(0.0) / 3600.0 * hourly_rate(machine_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Complete,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No log lines yet
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub id: String,
    pub tool: String,
    pub state: StageState,
}

/// Derived view of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub stages: Vec<StageStatus>,
    pub current_stage: Option<String>,
    /// Percentage of stages complete or skipped
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub estimated_cost: f64,
}

/// Split a stage line into its state and stage id
fn stage_marker(message: &str) -> Option<(StageState, &str)> {
    let state = if message.starts_with("FAILED [") {
        StageState::Failed
    } else if message.starts_with("Skipping ") {
        StageState::Skipped
    } else if message.starts_with("Running ") {
        StageState::Running
    } else if message.contains(" completed [") {
        StageState::Complete
    } else {
        return None;
    };

    let open = message.find('[')?;
    let close = open + message[open..].find(']')?;
    Some((state, &message[open + 1..close]))
}

impl JobStatus {
    /// Build a status from log events and the (id, tool) stage catalog.
    ///
    /// `now` bounds the elapsed time of a job that is still running.
    pub fn from_events(
        job_id: &str,
        events: &[LogEvent],
        catalog: &[(String, String)],
        machine_type: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stages: Vec<StageStatus> = catalog
            .iter()
            .map(|(id, tool)| StageStatus {
                id: id.clone(),
                tool: tool.clone(),
                state: StageState::Pending,
            })
            .collect();

        let mut done = false;
        let mut failed = false;

        for event in events {
            if event.is_done_marker() {
                done = true;
                continue;
            }
            let Some((state, id)) = stage_marker(&event.message) else {
                continue;
            };
            if state == StageState::Failed {
                failed = true;
            }
            if let Some(stage) = stages.iter_mut().find(|s| s.id == id) {
                stage.state = state;
            }
        }

        let state = if failed {
            JobState::Failed
        } else if done {
            JobState::Complete
        } else if events.is_empty() {
            JobState::Pending
        } else {
            JobState::Running
        };

        let current_stage = if state == JobState::Running {
            stages
                .iter()
                .find(|s| s.state == StageState::Running)
                .map(|s| s.id.clone())
        } else {
            None
        };

        let finished = stages
            .iter()
            .filter(|s| matches!(s.state, StageState::Complete | StageState::Skipped))
            .count();
        let progress = if done {
            100
        } else if stages.is_empty() {
            0
        } else {
            (finished * 100 / stages.len()) as u8
        };

        let started_at = events.first().map(|e| e.timestamp);
        let last_update = events.last().map(|e| e.timestamp);
        let end = if state == JobState::Running { Some(now) } else { last_update };
        let elapsed_secs = match (started_at, end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        };

        Self {
            job_id: job_id.to_string(),
            state,
            stages,
            current_stage,
            progress,
            started_at,
            last_update,
            elapsed_secs,
            estimated_cost: estimate_cost(machine_type, elapsed_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn catalog() -> Vec<(String, String)> {
        [("qc", "FastQC"), ("trim", "Trimmomatic"), ("assemble", "MEGAHIT"), ("genePredict", "Prodigal")]
            .iter()
            .map(|(id, tool)| (id.to_string(), tool.to_string()))
            .collect()
    }

    fn events(start: DateTime<Utc>, lines: &[&str]) -> Vec<LogEvent> {
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| LogEvent::at(start + Duration::seconds(60 * i as i64), "t1", *line))
            .collect()
    }

    #[test]
    fn test_hourly_rates() {
        assert_eq!(hourly_rate("n1-standard-16"), 0.38);
        assert_eq!(hourly_rate("n1-highmem-16"), 0.47);
        assert_eq!(hourly_rate("e2-micro"), 0.50);
        assert!((estimate_cost("n1-standard-16", 7200.0) - 0.76).abs() < 1e-9);
    }

    #[test]
    fn test_running_job() {
        let start = Utc::now() - Duration::hours(1);
        let log = events(
            start,
            &[
                "Pipeline started",
                "Skipping FastQC [qc]: step not enabled",
                "Running Trimmomatic [trim]",
                "Trimmomatic completed [trim] in 60.0s",
                "Running MEGAHIT [assemble]",
            ],
        );

        let status = JobStatus::from_events("t1", &log, &catalog(), "n1-standard-16", start + Duration::hours(1));
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.current_stage.as_deref(), Some("assemble"));
        assert_eq!(status.progress, 50);
        assert_eq!(status.stages[0].state, StageState::Skipped);
        assert_eq!(status.stages[3].state, StageState::Pending);
        assert!((status.elapsed_secs - 3600.0).abs() < 1.0);
        assert!((status.estimated_cost - 0.38).abs() < 0.01);
    }

    #[test]
    fn test_failed_job() {
        let start = Utc::now();
        let log = events(
            start,
            &["Running Trimmomatic [trim]", "FAILED [trim]: trimmomatic exited with code 1"],
        );

        let status = JobStatus::from_events("t1", &log, &catalog(), "n1-standard-16", start);
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.stages[1].state, StageState::Failed);
        assert!(status.current_stage.is_none());
        assert_eq!(status.elapsed_secs, 60.0);
    }

    #[test]
    fn test_done_job_is_complete() {
        let start = Utc::now();
        let log = events(start, &["Running FastQC [qc]", "FastQC completed [qc] in 1.0s", "DONE"]);

        let status = JobStatus::from_events("t1", &log, &catalog(), "n1-standard-16", start);
        assert_eq!(status.state, JobState::Complete);
        assert_eq!(status.progress, 100);
    }

    #[test]
    fn test_empty_log_is_pending() {
        let status = JobStatus::from_events("t1", &[], &catalog(), "n1-standard-16", Utc::now());
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.progress, 0);
        assert_eq!(status.elapsed_secs, 0.0);
    }
}
