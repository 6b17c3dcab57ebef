//! In-memory `Repository` used by unit tests and local/dev runs.
//!
//! A single `std::sync::Mutex` over the whole store stands in for row-level
//! locking: every method takes the lock for its whole body, which gives the
//! same serialization guarantees as `SELECT ... FOR UPDATE` without needing
//! a database. Not for production use — see `PostgresRepository`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tessera_core::{
    apply_event, CoreError, CoreResult, Job, JobEvent, JobLink, JobStatus, WorkItem,
    WorkItemStatus, WorkflowStep,
};

use crate::repository::{Pagination, Repository, WorkFailOutcome, WorkSuccessOutcome};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    steps: HashMap<(Uuid, u32), WorkflowStep>,
    work_items: HashMap<i64, WorkItem>,
    next_work_item_id: i64,
}

pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_work_item_id: 1,
                ..Default::default()
            }),
        }
    }
}

fn lock_err() -> CoreError {
    CoreError::service("in-memory repository mutex poisoned")
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_job(&self, job_id: Uuid) -> CoreResult<Option<Job>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn find_job_by_owner(&self, owner: &str, job_id: Uuid) -> CoreResult<Option<Job>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state
            .jobs
            .get(&job_id)
            .filter(|j| j.username == owner)
            .cloned())
    }

    async fn list_jobs(
        &self,
        owner: Option<&str>,
        statuses: Option<&[JobStatus]>,
        page: Pagination,
    ) -> CoreResult<(Vec<Job>, u64)> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| owner.map(|o| j.username == o).unwrap_or(true))
            .filter(|j| statuses.map(|s| s.contains(&j.status)).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = jobs.len() as u64;
        let start = page.offset() as usize;
        let end = (start + page.limit as usize).min(jobs.len());
        let page_jobs = if start < jobs.len() {
            jobs[start..end].to_vec()
        } else {
            vec![]
        };
        Ok((page_jobs, total))
    }

    async fn not_updated_for_minutes(&self, minutes: i64) -> CoreResult<Vec<Job>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &mut Job) -> CoreResult<()> {
        job.validate()?;
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        job.id = Some(state.jobs.len() as i64 + 1);
        state.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        event: JobEvent,
        requested_preview: bool,
    ) -> CoreResult<Job> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;
        apply_event(job, event, requested_preview)?;
        let result = job.clone();

        if matches!(event, JobEvent::Cancel { .. }) && result.status == JobStatus::Canceled {
            let now = Utc::now();
            for item in state.work_items.values_mut() {
                if item.job_id == job_id
                    && matches!(item.status, WorkItemStatus::Ready | WorkItemStatus::Running)
                {
                    item.cancel(now);
                }
            }
        }
        Ok(result)
    }

    async fn record_terminal_output(
        &self,
        job_id: Uuid,
        new_links: Vec<JobLink>,
        progress: u8,
        now: DateTime<Utc>,
    ) -> CoreResult<Job> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;
        job.links.extend(new_links);
        job.batches_completed += 1;
        job.progress = job.progress.max(progress);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn shrink_num_input_granules(&self, job_id: Uuid, new_value: u32, now: DateTime<Utc>) -> CoreResult<()> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if new_value < job.num_input_granules {
                job.num_input_granules = new_value;
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn fail_job_with_message(
        &self,
        job_id: Uuid,
        message: String,
        now: DateTime<Utc>,
    ) -> CoreResult<Job> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        {
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;
            apply_event(job, JobEvent::Fail, false)?;
            job.message = message;
            job.updated_at = now;
        }
        for item in state.work_items.values_mut() {
            if item.job_id == job_id
                && matches!(item.status, WorkItemStatus::Ready | WorkItemStatus::Running)
            {
                item.cancel(now);
            }
        }
        Ok(state.jobs.get(&job_id).cloned().unwrap())
    }

    async fn append_links(&self, job_id: Uuid, links: Vec<JobLink>) -> CoreResult<()> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;
        job.links.extend(links);
        Ok(())
    }

    async fn links_for_job(
        &self,
        job_id: Uuid,
        page: Pagination,
        rel: Option<&str>,
        spatiotemporal_only: bool,
    ) -> CoreResult<(Vec<JobLink>, u64)> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        let all: Vec<JobLink> = state
            .jobs
            .get(&job_id)
            .map(|j| j.links.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|l| rel.map(|r| l.rel == r).unwrap_or(true))
            .filter(|l| !spatiotemporal_only || l.has_spatiotemporal_metadata())
            .collect();
        let total = all.len() as u64;
        let start = page.offset() as usize;
        let end = (start + page.limit as usize).min(all.len());
        let page_links = if start < all.len() {
            all[start..end].to_vec()
        } else {
            vec![]
        };
        Ok((page_links, total))
    }

    async fn insert_workflow_step(&self, step: &mut WorkflowStep) -> CoreResult<()> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        step.id = Some(state.steps.len() as i64 + 1);
        state
            .steps
            .insert((step.job_id, step.step_index), step.clone());
        Ok(())
    }

    async fn get_workflow_step(
        &self,
        job_id: Uuid,
        step_index: u32,
    ) -> CoreResult<Option<WorkflowStep>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state.steps.get(&(job_id, step_index)).cloned())
    }

    async fn workflow_steps_for_job(&self, job_id: Uuid) -> CoreResult<Vec<WorkflowStep>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        let mut steps: Vec<WorkflowStep> = state
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn set_workflow_step_item_count(
        &self,
        job_id: Uuid,
        step_index: u32,
        work_item_count: u32,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        if let Some(step) = state.steps.get_mut(&(job_id, step_index)) {
            step.work_item_count = work_item_count;
        }
        Ok(())
    }

    async fn delete_terminal_workflow_steps(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<i64>> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let terminal_jobs: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.updated_at < older_than)
            .map(|j| j.job_id)
            .collect();
        let mut deleted = Vec::new();
        state.steps.retain(|(job_id, _), step| {
            if terminal_jobs.contains(job_id) {
                if let Some(id) = step.id {
                    deleted.push(id);
                }
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn insert_work_items(&self, items: Vec<WorkItem>) -> CoreResult<Vec<WorkItem>> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let mut saved = Vec::with_capacity(items.len());
        for mut item in items {
            let id = state.next_work_item_id;
            state.next_work_item_id += 1;
            item.id = Some(id);
            state.work_items.insert(id, item.clone());
            saved.push(item);
        }
        Ok(saved)
    }

    async fn get_work_item(&self, id: i64) -> CoreResult<Option<WorkItem>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state.work_items.get(&id).cloned())
    }

    async fn work_items_for_step(&self, job_id: Uuid, step_index: u32) -> CoreResult<Vec<WorkItem>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state
            .work_items
            .values()
            .filter(|w| w.job_id == job_id && w.workflow_step_index == step_index)
            .cloned()
            .collect())
    }

    async fn count_status_for_step(
        &self,
        job_id: Uuid,
        step_index: u32,
        status: WorkItemStatus,
    ) -> CoreResult<u32> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state
            .work_items
            .values()
            .filter(|w| {
                w.job_id == job_id && w.workflow_step_index == step_index && w.status == status
            })
            .count() as u32)
    }

    async fn successful_durations_ms(&self, job_id: Uuid, step_index: u32) -> CoreResult<Vec<i64>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state
            .work_items
            .values()
            .filter(|w| {
                w.job_id == job_id
                    && w.workflow_step_index == step_index
                    && w.status == WorkItemStatus::Successful
            })
            .filter_map(|w| w.duration_ms)
            .collect())
    }

    async fn ready_work_items_for_service(&self, service_id: &str) -> CoreResult<Vec<(WorkItem, Job)>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        let mut out = Vec::new();
        for item in state.work_items.values() {
            if item.service_id != service_id || item.status != WorkItemStatus::Ready {
                continue;
            }
            if let Some(job) = state.jobs.get(&item.job_id) {
                if job.status.is_dispatchable() {
                    out.push((item.clone(), job.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn claim_work_item(&self, id: i64, now: DateTime<Utc>) -> CoreResult<Option<WorkItem>> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let job_id = match state.work_items.get(&id) {
            Some(item) if item.status == WorkItemStatus::Ready => item.job_id,
            _ => return Ok(None),
        };
        let item = state.work_items.get_mut(&id).unwrap();
        item.start(now)?;
        let claimed = item.clone();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.updated_at = now;
        }
        Ok(Some(claimed))
    }

    async fn complete_work_item_successful(
        &self,
        id: i64,
        results: Vec<String>,
        sizes: Vec<u64>,
        scroll_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkSuccessOutcome> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let item = state
            .work_items
            .get(&id)
            .ok_or_else(|| CoreError::not_found(format!("work item {id} not found")))?
            .clone();

        if item.is_duplicate_terminal_update(WorkItemStatus::Successful) {
            let job = state.jobs.get(&item.job_id).cloned().unwrap();
            let step = state
                .steps
                .get(&(item.job_id, item.workflow_step_index))
                .cloned()
                .unwrap();
            return Ok(WorkSuccessOutcome {
                job,
                step,
                item,
                applied: false,
                step_exhausted: false,
            });
        }

        let mut item = item;
        item.complete_successful(results, sizes, scroll_id, now);
        state.work_items.insert(id, item.clone());

        let job = state
            .jobs
            .get(&item.job_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("job {} not found", item.job_id)))?;
        let step = state
            .steps
            .get(&(item.job_id, item.workflow_step_index))
            .cloned()
            .ok_or_else(|| CoreError::not_found("workflow step not found"))?;

        let step_exhausted = state
            .work_items
            .values()
            .filter(|w| {
                w.job_id == item.job_id && w.workflow_step_index == item.workflow_step_index
            })
            .all(|w| w.status.is_terminal());

        Ok(WorkSuccessOutcome {
            job,
            step,
            item,
            applied: true,
            step_exhausted,
        })
    }

    async fn complete_work_item_failed(
        &self,
        id: i64,
        error_message: Option<String>,
        scroll_id: Option<String>,
        retry_limit: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkFailOutcome> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let item = state
            .work_items
            .get(&id)
            .ok_or_else(|| CoreError::not_found(format!("work item {id} not found")))?
            .clone();

        if item.is_duplicate_terminal_update(WorkItemStatus::Failed) {
            return Ok(WorkFailOutcome::Duplicate { item });
        }

        let mut item = item;
        if item.retry_count < retry_limit {
            item.retry(now);
            state.work_items.insert(id, item.clone());
            return Ok(WorkFailOutcome::Retried { item });
        }

        item.complete_failed(error_message, scroll_id, now);
        state.work_items.insert(id, item.clone());

        let job = state
            .jobs
            .get(&item.job_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("job {} not found", item.job_id)))?;

        let event = JobEvent::WorkFailed {
            ignore_errors: job.ignore_errors,
        };
        let job_after = {
            let job_mut = state.jobs.get_mut(&item.job_id).unwrap();
            apply_event(job_mut, event, false)?;
            job_mut.clone()
        };

        let mut canceled = Vec::new();
        if job_after.status == JobStatus::Failed {
            for other in state.work_items.values_mut() {
                if other.job_id == item.job_id
                    && matches!(other.status, WorkItemStatus::Ready | WorkItemStatus::Running)
                {
                    other.cancel(now);
                    if let Some(oid) = other.id {
                        canceled.push(oid);
                    }
                }
            }
        }

        Ok(WorkFailOutcome::Exhausted {
            job: job_after,
            item,
            canceled_siblings: canceled,
        })
    }

    async fn running_older_than(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<WorkItem>> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state
            .work_items
            .values()
            .filter(|w| {
                w.status == WorkItemStatus::Running
                    && w.updated_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn delete_terminal_work_items(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<i64>> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        let terminal_jobs: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.updated_at < older_than)
            .map(|j| j.job_id)
            .collect();
        let mut deleted = Vec::new();
        state.work_items.retain(|id, item| {
            if terminal_jobs.contains(&item.job_id) {
                deleted.push(*id);
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> InMemoryRepository {
        InMemoryRepository::new()
    }

    #[tokio::test]
    async fn find_job_by_owner_rejects_a_mismatched_username() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();

        assert!(repo.find_job_by_owner("alice", job.job_id).await.unwrap().is_some());
        assert!(repo.find_job_by_owner("bob", job.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_jobs_filters_by_owner_and_status_and_paginates_newest_first() {
        let repo = repo();
        for username in ["alice", "alice", "bob"] {
            let mut job = Job::new(Uuid::new_v4(), username, "https://example.com/req");
            repo.insert_job(&mut job).await.unwrap();
        }

        let (alice_jobs, alice_total) = repo
            .list_jobs(Some("alice"), None, Pagination::new(1, 10))
            .await
            .unwrap();
        assert_eq!(alice_total, 2);
        assert_eq!(alice_jobs.len(), 2);

        let (page1, total) = repo.list_jobs(None, None, Pagination::new(1, 2)).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page1.len(), 2);
        let (page2, _) = repo.list_jobs(None, None, Pagination::new(2, 2)).await.unwrap();
        assert_eq!(page2.len(), 1);

        let (none, _) = repo
            .list_jobs(None, Some(&[JobStatus::Failed]), Pagination::new(1, 10))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn transition_job_cancel_also_cancels_ready_and_running_siblings() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();
        repo.transition_job(job.job_id, JobEvent::Dispatch, false).await.unwrap();

        let items = repo
            .insert_work_items(vec![
                WorkItem::new(job.job_id, "svc-1", 1),
                WorkItem::new(job.job_id, "svc-1", 1),
            ])
            .await
            .unwrap();
        let running_id = items[0].id.unwrap();
        repo.claim_work_item(running_id, Utc::now()).await.unwrap();

        let job_after = repo
            .transition_job(job.job_id, JobEvent::Cancel { ignore_repeats: false }, false)
            .await
            .unwrap();
        assert_eq!(job_after.status, JobStatus::Canceled);

        for item in &items {
            let current = repo.get_work_item(item.id.unwrap()).await.unwrap().unwrap();
            assert_eq!(current.status, WorkItemStatus::Canceled);
        }
    }

    #[tokio::test]
    async fn shrink_num_input_granules_only_ever_decreases() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        job.num_input_granules = 10;
        repo.insert_job(&mut job).await.unwrap();

        repo.shrink_num_input_granules(job.job_id, 4, Utc::now()).await.unwrap();
        let after = repo.find_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(after.num_input_granules, 4);

        repo.shrink_num_input_granules(job.job_id, 8, Utc::now()).await.unwrap();
        let unchanged = repo.find_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(unchanged.num_input_granules, 4);
    }

    #[tokio::test]
    async fn fail_job_with_message_overrides_the_default_message_and_cancels_open_items() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();
        repo.transition_job(job.job_id, JobEvent::Dispatch, false).await.unwrap();

        let items = repo
            .insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
            .await
            .unwrap();

        let failed = repo
            .fail_job_with_message(job.job_id, "could not create next work items".to_string(), Utc::now())
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.message, "could not create next work items");

        let item = repo.get_work_item(items[0].id.unwrap()).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Canceled);
    }

    #[tokio::test]
    async fn links_for_job_filters_by_rel_and_spatiotemporal_metadata() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();

        repo.append_links(
            job.job_id,
            vec![
                JobLink {
                    id: None,
                    job_id: job.job_id,
                    href: "https://example.com/a.json".to_string(),
                    title: None,
                    mime_type: Some("application/json".to_string()),
                    rel: "data".to_string(),
                    bbox: None,
                    temporal: None,
                },
                JobLink {
                    id: None,
                    job_id: job.job_id,
                    href: "s3://bucket/b.json".to_string(),
                    title: None,
                    mime_type: Some("application/json".to_string()),
                    rel: "s3-access".to_string(),
                    bbox: Some(tessera_core::BoundingBox {
                        west: -1.0,
                        south: -1.0,
                        east: 1.0,
                        north: 1.0,
                    }),
                    temporal: None,
                },
            ],
        )
        .await
        .unwrap();

        let (data_only, total) = repo
            .links_for_job(job.job_id, Pagination::new(1, 10), Some("data"), false)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(data_only[0].rel, "data");

        let (spatiotemporal, _) = repo
            .links_for_job(job.job_id, Pagination::new(1, 10), None, true)
            .await
            .unwrap();
        assert_eq!(spatiotemporal.len(), 1);
        assert_eq!(spatiotemporal[0].rel, "s3-access");
    }

    #[tokio::test]
    async fn workflow_steps_for_job_are_returned_in_step_order() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();

        let mut step2 = WorkflowStep::new(job.job_id, 2, "svc-2", 0, false, tessera_core::DataOperation::default());
        repo.insert_workflow_step(&mut step2).await.unwrap();
        let mut step1 = WorkflowStep::new(job.job_id, 1, "svc-1", 1, false, tessera_core::DataOperation::default());
        repo.insert_workflow_step(&mut step1).await.unwrap();

        let steps = repo.workflow_steps_for_job(job.job_id).await.unwrap();
        assert_eq!(steps.iter().map(|s| s.step_index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn delete_terminal_work_items_leaves_non_terminal_jobs_untouched() {
        let repo = repo();
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();
        repo.transition_job(job.job_id, JobEvent::Dispatch, false).await.unwrap();
        repo.insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
            .await
            .unwrap();

        let deleted = repo.delete_terminal_work_items(Utc::now() + chrono::Duration::days(1)).await.unwrap();
        assert!(deleted.is_empty());
    }
}
