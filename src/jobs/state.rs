//! Job states, records, and the status shape returned to pollers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::pipeline::CrawlSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle of one crawl job. Only SUCCESS can carry a result and only
/// FAILURE can carry an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Progress,
    Success { result: CrawlSummary },
    Failure { error: JobError },
    Retry,
    Revoked,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Progress => "PROGRESS",
            JobState::Success { .. } => "SUCCESS",
            JobState::Failure { .. } => "FAILURE",
            JobState::Retry => "RETRY",
            JobState::Revoked => "REVOKED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success { .. } | JobState::Failure { .. } | JobState::Revoked
        )
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Success { .. } | Failure { .. } | Revoked, _) => false,
            (_, Pending) => false,
            (Pending | Retry, Started) => true,
            (_, Started) => false,
            (Retry, Retry) => false,
            _ => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// What the job store keeps per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    pub progress_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Pending,
            progress_text: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`, replacing the progress text when one is given.
    /// Terminal records never change.
    pub fn apply(
        &mut self,
        next: JobState,
        progress_text: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(&next) {
            return Err(TransitionError {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        if progress_text.is_some() {
            self.progress_text = progress_text;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Poller-facing view:
/// `{ jobId, state, progressText?, result?, error?, downloadUrl? }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    #[serde(flatten)]
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_text: Option<String>,
    /// Relative path serving the artifact; set only on SUCCESS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

pub fn download_path(id: &JobId) -> String {
    format!("/api/download/{id}")
}

impl From<JobRecord> for JobStatus {
    fn from(record: JobRecord) -> Self {
        let download_url = matches!(record.state, JobState::Success { .. })
            .then(|| download_path(&record.id));
        Self {
            job_id: record.id.to_string(),
            state: record.state,
            progress_text: record.progress_text,
            download_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary() -> CrawlSummary {
        CrawlSummary {
            artifact: "/out/a_comments.json".into(),
            video_title: "a".into(),
            bv_id: "BV1xx411c7mD".into(),
            total_comments: 3,
            root_comments: 2,
            complete: true,
        }
    }

    #[test]
    fn pending_may_finish_without_progress() {
        let mut record = JobRecord::new(JobId::new());
        record
            .apply(JobState::Success { result: summary() }, None)
            .unwrap();
        assert_eq!(record.state.name(), "SUCCESS");
    }

    #[test]
    fn normal_lifecycle_is_accepted() {
        let mut record = JobRecord::new(JobId::new());
        record.apply(JobState::Started, None).unwrap();
        record
            .apply(JobState::Progress, Some("page 1".into()))
            .unwrap();
        record
            .apply(JobState::Progress, Some("page 2".into()))
            .unwrap();
        record
            .apply(
                JobState::Failure {
                    error: JobError::new("EmptyResult", "nothing"),
                },
                None,
            )
            .unwrap();
        assert_eq!(record.progress_text.as_deref(), Some("page 2"));
    }

    #[test]
    fn terminal_states_are_immutable() {
        for terminal in [
            JobState::Success { result: summary() },
            JobState::Failure {
                error: JobError::new("X", "y"),
            },
            JobState::Revoked,
        ] {
            let mut record = JobRecord::new(JobId::new());
            record.apply(terminal.clone(), None).unwrap();
            for next in [JobState::Progress, JobState::Revoked, JobState::Retry] {
                let err = record.apply(next, Some("late".into())).unwrap_err();
                assert_eq!(err.from, terminal.name());
            }
            assert_eq!(record.state, terminal);
            assert!(record.progress_text.is_none());
        }
    }

    #[test]
    fn started_only_from_pending_or_retry() {
        assert!(JobState::Pending.can_transition_to(&JobState::Started));
        assert!(JobState::Retry.can_transition_to(&JobState::Started));
        assert!(!JobState::Progress.can_transition_to(&JobState::Started));
        assert!(!JobState::Started.can_transition_to(&JobState::Pending));
    }

    #[test]
    fn status_serializes_only_meaningful_fields() {
        let id: JobId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let mut record = JobRecord::new(id);
        assert_eq!(
            serde_json::to_value(JobStatus::from(record.clone())).unwrap(),
            json!({ "jobId": "550e8400-e29b-41d4-a716-446655440000", "state": "PENDING" })
        );

        record
            .apply(
                JobState::Failure {
                    error: JobError::new("EmptyResult", "no comments"),
                },
                Some("done".into()),
            )
            .unwrap();
        assert_eq!(
            serde_json::to_value(JobStatus::from(record)).unwrap(),
            json!({
                "jobId": "550e8400-e29b-41d4-a716-446655440000",
                "state": "FAILURE",
                "error": { "kind": "EmptyResult", "message": "no comments" },
                "progressText": "done"
            })
        );
    }

    #[test]
    fn success_status_links_the_download() {
        let id: JobId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let mut record = JobRecord::new(id);
        record
            .apply(JobState::Success { result: summary() }, Some("done".into()))
            .unwrap();
        let value = serde_json::to_value(JobStatus::from(record)).unwrap();
        assert_eq!(
            value["downloadUrl"],
            "/api/download/550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(value["state"], "SUCCESS");
        assert_eq!(value["result"]["bvId"], "BV1xx411c7mD");
    }
}
