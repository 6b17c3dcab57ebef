//! A unit of work at one WorkflowStep, executed by one external worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Ready,
    Running,
    Successful,
    Failed,
    Canceled,
}

impl WorkItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Successful | WorkItemStatus::Failed | WorkItemStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct WorkItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub job_id: Uuid,
    pub service_id: String,
    pub workflow_step_index: u32,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// STAC catalog this item consumes as input, if any.
    #[serde(default)]
    pub stac_catalog_location: Option<String>,
    #[serde(default)]
    pub output_item_sizes: Vec<u64>,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub scroll_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(job_id: Uuid, service_id: impl Into<String>, workflow_step_index: u32) -> Self {
        let now = Utc::now();
        WorkItem {
            id: None,
            job_id,
            service_id: service_id.into(),
            workflow_step_index,
            status: WorkItemStatus::Ready,
            retry_count: 0,
            stac_catalog_location: None,
            output_item_sizes: Vec::new(),
            results: Vec::new(),
            scroll_id: None,
            error_message: None,
            started_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_input_catalog(mut self, location: impl Into<String>) -> Self {
        self.stac_catalog_location = Some(location.into());
        self
    }

    /// Transitions READY -> RUNNING, called exclusively by the dispatch
    /// engine's `get-work` handler under the job row lock.
    pub fn start(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != WorkItemStatus::Ready {
            return Err(CoreError::conflict(format!(
                "work item {:?} is not READY (status={:?})",
                self.id, self.status
            )));
        }
        self.status = WorkItemStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Resets a FAILED item back to READY, bumping retryCount. Bounded by
    /// `retry_limit`; the caller decides whether the limit has been reached.
    pub fn retry(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = WorkItemStatus::Ready;
        self.started_at = None;
        self.updated_at = now;
    }

    pub fn complete_successful(
        &mut self,
        results: Vec<String>,
        sizes: Vec<u64>,
        scroll_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.results = results;
        self.output_item_sizes = sizes;
        if scroll_id.is_some() {
            self.scroll_id = scroll_id;
        }
        self.status = WorkItemStatus::Successful;
        self.duration_ms = self.started_at.map(|s| (now - s).num_milliseconds());
        self.updated_at = now;
    }

    pub fn complete_failed(
        &mut self,
        error_message: Option<String>,
        scroll_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.error_message =
            Some(error_message.unwrap_or_else(|| "failed with an unknown error".to_string()));
        if scroll_id.is_some() {
            self.scroll_id = scroll_id;
        }
        self.status = WorkItemStatus::Failed;
        self.duration_ms = self.started_at.map(|s| (now - s).num_milliseconds());
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = WorkItemStatus::Canceled;
        self.updated_at = now;
    }

    /// A repeated `update-work` call carrying the same terminal status must
    /// be a no-op rather than an error.
    pub fn is_duplicate_terminal_update(&self, incoming: WorkItemStatus) -> bool {
        self.status.is_terminal() && self.status == incoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_requires_ready() {
        let mut item = WorkItem::new(Uuid::new_v4(), "svc", 1);
        let now = Utc::now();
        item.start(now).unwrap();
        assert!(item.start(now).is_err());
    }

    #[test]
    fn retry_resets_to_ready_and_increments_count() {
        let mut item = WorkItem::new(Uuid::new_v4(), "svc", 1);
        let now = Utc::now();
        item.start(now).unwrap();
        item.complete_failed(None, None, now);
        item.retry(now);
        assert_eq!(item.status, WorkItemStatus::Ready);
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn duplicate_terminal_update_detected() {
        let mut item = WorkItem::new(Uuid::new_v4(), "svc", 1);
        let now = Utc::now();
        item.start(now).unwrap();
        item.complete_successful(vec!["a".into()], vec![10], None, now);
        assert!(item.is_duplicate_terminal_update(WorkItemStatus::Successful));
        assert!(!item.is_duplicate_terminal_update(WorkItemStatus::Failed));
    }
}
