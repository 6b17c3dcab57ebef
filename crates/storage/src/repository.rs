//! The transactional read/write surface over Jobs, WorkflowSteps, WorkItems,
//! and Links. Every operation may fail with `CoreError::Service` wrapping a
//! persistence failure; no partial row is ever written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tessera_core::{CoreResult, Job, JobEvent, JobLink, JobStatus, WorkItem, WorkflowStep};

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    pub fn offset(&self) -> i64 {
        ((self.page.saturating_sub(1)) as i64) * self.limit as i64
    }
}

/// Outcome of attempting to transition a WorkItem to SUCCESSFUL.
#[derive(Debug, Clone)]
pub struct WorkSuccessOutcome {
    pub job: Job,
    pub step: WorkflowStep,
    pub item: WorkItem,
    /// False when this call was a no-op repeat of an already-recorded
    /// terminal update.
    pub applied: bool,
    /// True once every WorkItem belonging to `step` has reached a terminal
    /// status.
    pub step_exhausted: bool,
}

#[derive(Debug, Clone)]
pub enum WorkFailOutcome {
    /// retryCount was below the limit; item is back to READY.
    Retried { item: WorkItem },
    /// retryCount exhausted; item is FAILED and the job transition (and any
    /// sibling cancellation) has already been applied.
    Exhausted {
        job: Job,
        item: WorkItem,
        canceled_siblings: Vec<i64>,
    },
    /// Repeat of an already-recorded terminal update; no side effects.
    Duplicate { item: WorkItem },
}

#[async_trait]
pub trait Repository: Send + Sync {
    // ---- Jobs -------------------------------------------------------
    async fn find_job(&self, job_id: Uuid) -> CoreResult<Option<Job>>;
    async fn find_job_by_owner(&self, owner: &str, job_id: Uuid) -> CoreResult<Option<Job>>;
    async fn list_jobs(
        &self,
        owner: Option<&str>,
        statuses: Option<&[JobStatus]>,
        page: Pagination,
    ) -> CoreResult<(Vec<Job>, u64)>;
    async fn not_updated_for_minutes(&self, minutes: i64) -> CoreResult<Vec<Job>>;
    async fn insert_job(&self, job: &mut Job) -> CoreResult<()>;

    /// Loads the job row under a lock, runs it through `apply_event`, and
    /// persists the result in the same transaction. This is the only path
    /// by which `job.status` ever changes.
    async fn transition_job(
        &self,
        job_id: Uuid,
        event: JobEvent,
        requested_preview: bool,
    ) -> CoreResult<Job>;

    /// Appends `new_links`, advances `batches_completed` by one, and sets
    /// progress (clamped non-decreasing) — used when a terminal-step
    /// WorkItem succeeds. Does not change job status.
    async fn record_terminal_output(
        &self,
        job_id: Uuid,
        new_links: Vec<JobLink>,
        progress: u8,
        now: chrono::DateTime<Utc>,
    ) -> CoreResult<Job>;

    // ---- Links --------------------------------------------------------
    /// Shrinks `numInputGranules` when the query-index step reports fewer
    /// hits than originally estimated. Never used to grow the estimate.
    async fn shrink_num_input_granules(&self, job_id: Uuid, new_value: u32, now: DateTime<Utc>) -> CoreResult<()>;

    /// Applies `JobEvent::Fail` and overrides the resulting message with
    /// `message` verbatim — used for the handful of failures that carry a
    /// canonical explanation rather than a worker-supplied one (e.g. "could
    /// not create the next work items for the request").
    async fn fail_job_with_message(
        &self,
        job_id: Uuid,
        message: String,
        now: DateTime<Utc>,
    ) -> CoreResult<Job>;

    async fn append_links(&self, job_id: Uuid, links: Vec<JobLink>) -> CoreResult<()>;
    async fn links_for_job(
        &self,
        job_id: Uuid,
        page: Pagination,
        rel: Option<&str>,
        spatiotemporal_only: bool,
    ) -> CoreResult<(Vec<JobLink>, u64)>;

    // ---- WorkflowSteps --------------------------------------------------
    async fn insert_workflow_step(&self, step: &mut WorkflowStep) -> CoreResult<()>;
    async fn get_workflow_step(&self, job_id: Uuid, step_index: u32) -> CoreResult<Option<WorkflowStep>>;
    async fn workflow_steps_for_job(&self, job_id: Uuid) -> CoreResult<Vec<WorkflowStep>>;
    async fn set_workflow_step_item_count(
        &self,
        job_id: Uuid,
        step_index: u32,
        work_item_count: u32,
    ) -> CoreResult<()>;
    async fn delete_terminal_workflow_steps(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<i64>>;

    // ---- WorkItems ------------------------------------------------------
    async fn insert_work_items(&self, items: Vec<WorkItem>) -> CoreResult<Vec<WorkItem>>;
    async fn get_work_item(&self, id: i64) -> CoreResult<Option<WorkItem>>;
    async fn work_items_for_step(&self, job_id: Uuid, step_index: u32) -> CoreResult<Vec<WorkItem>>;
    async fn count_status_for_step(
        &self,
        job_id: Uuid,
        step_index: u32,
        status: tessera_core::WorkItemStatus,
    ) -> CoreResult<u32>;
    async fn successful_durations_ms(&self, job_id: Uuid, step_index: u32) -> CoreResult<Vec<i64>>;

    /// Read-only snapshot of READY items for `service_id`, joined with their
    /// owning job, restricted to dispatchable job statuses. Used by the
    /// fair-queue selector to pick a winner; the actual claim is a separate
    /// atomic compare-and-swap so two pollers never receive the same item.
    async fn ready_work_items_for_service(&self, service_id: &str) -> CoreResult<Vec<(WorkItem, Job)>>;

    /// Atomically flips one item from READY to RUNNING and touches its
    /// job's updated_at. Returns `None` if another poller claimed it first.
    async fn claim_work_item(&self, id: i64, now: DateTime<Utc>) -> CoreResult<Option<WorkItem>>;

    async fn complete_work_item_successful(
        &self,
        id: i64,
        results: Vec<String>,
        sizes: Vec<u64>,
        scroll_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkSuccessOutcome>;

    async fn complete_work_item_failed(
        &self,
        id: i64,
        error_message: Option<String>,
        scroll_id: Option<String>,
        retry_limit: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkFailOutcome>;

    async fn running_older_than(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<WorkItem>>;
    async fn delete_terminal_work_items(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<i64>>;
}
