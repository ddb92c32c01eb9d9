//! Error taxonomy shared by the crawl pipeline and the job tracker.

use serde::{Deserialize, Serialize};

/// Everything that can end a crawl. Each variant maps to a stable kind string
/// that is stored verbatim on a failed job.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("invalid video identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("remote page fetch failed: {0}")]
    RemotePageFetchFailed(String),

    #[error("no comments collected for {0}")]
    EmptyResult(String),

    #[error("crawl cancelled")]
    Cancelled,

    #[error("writing artifact failed: {0}")]
    ArtifactWriteFailed(String),
}

impl CrawlError {
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::InvalidIdentifier(_) => "InvalidIdentifier",
            CrawlError::CredentialUnavailable(_) => "CredentialUnavailable",
            CrawlError::RemotePageFetchFailed(_) => "RemotePageFetchFailed",
            CrawlError::EmptyResult(_) => "EmptyResult",
            CrawlError::Cancelled => "Cancelled",
            CrawlError::ArtifactWriteFailed(_) => "ArtifactWriteFailed",
        }
    }
}

/// Classified failure attached to a job in the FAILURE state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl JobError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&CrawlError> for JobError {
    fn from(err: &CrawlError) -> Self {
        JobError::new(err.kind(), err.to_string())
    }
}

impl From<CrawlError> for JobError {
    fn from(err: CrawlError) -> Self {
        JobError::from(&err)
    }
}

/// Returned by status queries when no trustworthy state can be reported.
/// Deliberately not a job state: callers must never read it as PENDING.
#[derive(Debug, thiserror::Error)]
pub enum StatusUnavailable {
    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("job store unreachable: {0}")]
    Backend(String),
}

impl StatusUnavailable {
    pub fn kind(&self) -> &'static str {
        "StatusUnavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_keeps_kind_and_message() {
        let err = CrawlError::EmptyResult("BV1xx411c7mD".into());
        let job_error = JobError::from(&err);
        assert_eq!(job_error.kind, "EmptyResult");
        assert_eq!(job_error.message, "no comments collected for BV1xx411c7mD");
    }

    #[test]
    fn cancelled_has_its_own_kind() {
        assert_eq!(CrawlError::Cancelled.kind(), "Cancelled");
        assert_eq!(
            StatusUnavailable::UnknownJob("x".into()).kind(),
            "StatusUnavailable"
        );
    }
}
