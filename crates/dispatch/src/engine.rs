//! The two operations polling workers drive: `get-work` and `update-work`
//! (spec §4.3). Selection happens over a read-only snapshot in pure Rust
//! (`fair_queue`); the claim itself is a single atomic compare-and-swap so
//! two pollers never walk away with the same item.

use std::sync::Arc;

use chrono::Utc;
use tessera_clients::ObjectStore;
use tessera_core::{CoreError, CoreResult, OrchestratorConfig, WorkItem, WorkItemStatus};
use tessera_storage::{Repository, WorkFailOutcome};

use crate::chaining;
use crate::fair_queue::select_next;

pub struct GetWorkResponse {
    pub work_item: WorkItem,
    pub max_cmr_granules: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkItemUpdate {
    pub status: WorkItemStatus,
    pub results: Vec<String>,
    pub output_item_sizes: Vec<u64>,
    pub error_message: Option<String>,
    pub scroll_id: Option<String>,
    pub hits: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum UpdateWorkOutcome {
    /// The update was applied; no further action is owed to the caller.
    Applied,
    /// A repeat of an already-recorded terminal update; accepted as a no-op.
    Duplicate,
    /// The item was requeued to READY; `retry_count` reflects the new value.
    Retried { retry_count: u32 },
}

pub struct DispatchEngine {
    repo: Arc<dyn Repository>,
    store: Arc<dyn ObjectStore>,
    config: OrchestratorConfig,
}

impl DispatchEngine {
    pub fn new(repo: Arc<dyn Repository>, store: Arc<dyn ObjectStore>, config: OrchestratorConfig) -> Self {
        Self { repo, store, config }
    }

    /// Identifies the first-stage "query-index" step by convention: step 1
    /// of every job's pipeline is the granule-search stage.
    const GRANULE_INDEX_STEP: u32 = 1;

    pub async fn get_work(&self, service_id: &str) -> CoreResult<Option<GetWorkResponse>> {
        let mut candidates = self.repo.ready_work_items_for_service(service_id).await?;

        loop {
            let Some(idx) = select_next(&candidates) else {
                return Ok(None);
            };

            let (item, job) = candidates[idx].clone();
            let item_id = item.id.ok_or_else(|| CoreError::service("work item missing id"))?;

            let max_cmr_granules = if item.workflow_step_index == Self::GRANULE_INDEX_STEP {
                let produced = self.produced_stac_items(job.job_id, item.workflow_step_index).await?;
                let queued_downstream = self
                    .queued_downstream_items(job.job_id, item.workflow_step_index)
                    .await?;
                let accounted = produced.max(queued_downstream);
                let remaining = (job.num_input_granules as i64 - accounted as i64).max(0) as u32;
                if remaining == 0 {
                    candidates.remove(idx);
                    continue;
                }
                Some(remaining)
            } else {
                None
            };

            let now = Utc::now();
            match self.repo.claim_work_item(item_id, now).await? {
                Some(claimed) => {
                    return Ok(Some(GetWorkResponse {
                        work_item: claimed,
                        max_cmr_granules,
                    }))
                }
                None => {
                    // Another poller won the race; drop it from this
                    // snapshot and pick again.
                    candidates.remove(idx);
                    continue;
                }
            }
        }
    }

    async fn produced_stac_items(&self, job_id: uuid::Uuid, step_index: u32) -> CoreResult<u32> {
        let items = self.repo.work_items_for_step(job_id, step_index).await?;
        Ok(items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Successful)
            .map(|i| i.results.len() as u32)
            .sum())
    }

    /// Each granule-index WorkItem's success chains into exactly one
    /// downstream WorkItem per output catalog, so the downstream step's
    /// item count is a lower bound on granules already queued for
    /// processing — counted even before the upstream item's success is
    /// reflected in `produced_stac_items`. Without this, a second
    /// granule-index unit could be dispatched for granules the job has no
    /// remaining budget for, purely because the upstream item that already
    /// queued them hasn't finished yet.
    async fn queued_downstream_items(&self, job_id: uuid::Uuid, step_index: u32) -> CoreResult<u32> {
        let items = self.repo.work_items_for_step(job_id, step_index + 1).await?;
        Ok(items.len() as u32)
    }

    pub async fn update_work(&self, id: i64, update: WorkItemUpdate) -> CoreResult<UpdateWorkOutcome> {
        match update.status {
            WorkItemStatus::Successful => self.handle_success(id, update).await,
            WorkItemStatus::Failed => self.handle_failed(id, update).await,
            other => Err(CoreError::validation(format!(
                "worker may only report successful or failed terminal status, got {other:?}"
            ))),
        }
    }

    async fn handle_success(&self, id: i64, update: WorkItemUpdate) -> CoreResult<UpdateWorkOutcome> {
        let now = Utc::now();
        let outcome = self
            .repo
            .complete_work_item_successful(
                id,
                update.results,
                update.output_item_sizes,
                update.scroll_id,
                now,
            )
            .await?;

        if !outcome.applied {
            return Ok(UpdateWorkOutcome::Duplicate);
        }

        chaining::on_work_item_succeeded(&self.repo, &self.store, &self.config, &outcome, update.hits).await?;
        Ok(UpdateWorkOutcome::Applied)
    }

    async fn handle_failed(&self, id: i64, update: WorkItemUpdate) -> CoreResult<UpdateWorkOutcome> {
        let now = Utc::now();
        let outcome = self
            .repo
            .complete_work_item_failed(
                id,
                update.error_message,
                update.scroll_id,
                self.config.work_item_retry_limit,
                now,
            )
            .await?;

        match outcome {
            WorkFailOutcome::Duplicate { .. } => Ok(UpdateWorkOutcome::Duplicate),
            WorkFailOutcome::Retried { item } => Ok(UpdateWorkOutcome::Retried {
                retry_count: item.retry_count,
            }),
            WorkFailOutcome::Exhausted { .. } => Ok(UpdateWorkOutcome::Applied),
        }
    }
}
