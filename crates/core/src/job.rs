//! The Job aggregate: one row per user request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub const MAX_MESSAGE_LEN: usize = 4096;
pub const MAX_REQUEST_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Running,
    RunningWithErrors,
    Paused,
    Previewing,
    Successful,
    CompleteWithErrors,
    Failed,
    Canceled,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Accepted
    }
}

impl JobStatus {
    /// Terminal statuses accept no further mutation; the reaper is the only
    /// thing allowed to touch a job's subordinate rows after this.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful
                | JobStatus::CompleteWithErrors
                | JobStatus::Failed
                | JobStatus::Canceled
        )
    }

    /// Statuses whose READY work items are eligible for dispatch.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            JobStatus::Accepted
                | JobStatus::Running
                | JobStatus::RunningWithErrors
                | JobStatus::Previewing
        )
    }

    /// Canonical user-facing message for a status, substituted whenever a
    /// job's message is empty or still the default for a *different* status.
    pub fn default_message(self) -> &'static str {
        match self {
            JobStatus::Accepted => "The job has been accepted and is waiting to be processed",
            JobStatus::Running => "The job is being processed",
            JobStatus::RunningWithErrors => "The job is running with errors",
            JobStatus::Paused => "The job is paused",
            JobStatus::Previewing => "The job is generating a preview before full processing",
            JobStatus::Successful => "The job has completed successfully",
            JobStatus::CompleteWithErrors => "The job has completed with errors",
            JobStatus::Failed => "The job failed with an unknown error",
            JobStatus::Canceled => "The job was canceled",
        }
    }

    /// True if `message` is the canonical default for *some* status (used to
    /// decide whether a transition is allowed to overwrite it).
    pub fn is_any_default_message(message: &str) -> bool {
        ALL_STATUSES.iter().any(|s| s.default_message() == message)
    }
}

const ALL_STATUSES: [JobStatus; 9] = [
    JobStatus::Accepted,
    JobStatus::Running,
    JobStatus::RunningWithErrors,
    JobStatus::Paused,
    JobStatus::Previewing,
    JobStatus::Successful,
    JobStatus::CompleteWithErrors,
    JobStatus::Failed,
    JobStatus::Canceled,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TemporalInterval {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// An output link of a job, persisted separately and keyed by jobID.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct JobLink {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub job_id: Uuid,
    pub href: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub rel: String,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub temporal: Option<TemporalInterval>,
}

impl JobLink {
    /// `rel = "s3-access"` links carry S3-native hrefs that must survive
    /// linkType rewriting untouched.
    pub fn is_s3_access(&self) -> bool {
        self.rel == "s3-access"
    }

    pub fn has_spatiotemporal_metadata(&self) -> bool {
        self.bbox.is_some() || self.temporal.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Job {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Externally visible UUID, equal to the original requestID.
    pub job_id: Uuid,
    pub username: String,
    pub status: JobStatus,
    pub message: String,
    pub progress: u8,
    pub num_input_granules: u32,
    pub collection_ids: Vec<String>,
    pub is_async: bool,
    pub ignore_errors: bool,
    pub request: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batches_completed: u32,
    #[serde(default)]
    pub links: Vec<JobLink>,
    /// Status as it was when this row was loaded, for optimistic-conflict
    /// detection. Transitions are always applied through `apply_event`
    /// against a row freshly re-read under `FOR UPDATE`, never by comparing
    /// a stale in-memory snapshot — see DESIGN.md.
    #[serde(skip)]
    pub original_status: JobStatus,
}

impl Job {
    pub fn new(job_id: Uuid, username: impl Into<String>, request: impl Into<String>) -> Self {
        let now = Utc::now();
        let request = truncate(request.into(), MAX_REQUEST_LEN);
        Job {
            id: None,
            job_id,
            username: username.into(),
            status: JobStatus::Accepted,
            message: JobStatus::Accepted.default_message().to_string(),
            progress: 0,
            num_input_granules: 0,
            collection_ids: Vec::new(),
            is_async: true,
            ignore_errors: false,
            request,
            created_at: now,
            updated_at: now,
            batches_completed: 0,
            links: Vec::new(),
            original_status: JobStatus::Accepted,
        }
    }

    /// Structural validation independent of the transition table; called by
    /// the repository before every write.
    pub fn validate(&self) -> CoreResult<()> {
        if self.progress > 100 {
            return Err(CoreError::validation("progress must be between 0 and 100"));
        }
        if !is_http_url(&self.request) {
            return Err(CoreError::validation(
                "request must be an http(s) URL",
            ));
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(CoreError::validation("message exceeds maximum length"));
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reject any mutation once a job has reached a terminal state, unless
    /// the caller is re-saving the exact state it already observed.
    pub fn check_mutable(&self) -> CoreResult<()> {
        if self.original_status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "job {} is in a terminal state ({:?}) and cannot be modified",
                self.job_id, self.original_status
            )));
        }
        Ok(())
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

pub fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        // Truncate on a char boundary, never mid-codepoint.
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults_to_accepted() {
        let job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.message, JobStatus::Accepted.default_message());
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn validate_rejects_non_http_request() {
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        job.request = "ftp://example.com".to_string();
        assert!(job.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_progress() {
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        job.progress = 101;
        assert!(job.validate().is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "a".repeat(MAX_REQUEST_LEN + 10);
        let t = truncate(s, MAX_REQUEST_LEN);
        assert_eq!(t.len(), MAX_REQUEST_LEN);
    }
}
