//! Work-failer (spec §4.5): periodically reclaims WorkItems stuck RUNNING
//! past a per-step timeout. Modeled on the stale-task reclamation loop a
//! worker pool runs alongside its heartbeat.

use std::sync::Arc;

use chrono::Utc;
use tessera_core::{CoreResult, OrchestratorConfig};
use tessera_storage::{Repository, WorkFailOutcome};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default)]
pub struct FailerReport {
    pub work_item_ids: Vec<i64>,
    pub job_ids: Vec<uuid::Uuid>,
}

pub struct WorkFailer {
    repo: Arc<dyn Repository>,
    config: OrchestratorConfig,
}

impl WorkFailer {
    pub fn new(repo: Arc<dyn Repository>, config: OrchestratorConfig) -> Self {
        Self { repo, config }
    }

    /// Runs one pass: finds RUNNING items whose per-(job, service, step)
    /// timeout has elapsed, and for each either requeues it to READY or, if
    /// the retry limit is exhausted, fails it and runs the normal FAILED
    /// handling (including any downstream job transition).
    pub async fn run_once(&self) -> CoreResult<FailerReport> {
        let mut report = FailerReport::default();
        let now = Utc::now();

        // Fetch every RUNNING item regardless of age here; the per-item
        // fail duration computed below can be far shorter than the global
        // default (outlier detection is supposed to fail fast steps
        // sooner), so pre-filtering on the global default would silently
        // drop exactly the items outlier detection exists to catch.
        let candidates = self.repo.running_older_than(now).await?;

        for item in candidates {
            let Some(id) = item.id else { continue };
            let fail_duration_ms = self.fail_duration_for(&item).await?;
            let item_cutoff = now - chrono::Duration::milliseconds(fail_duration_ms);
            if item.updated_at >= item_cutoff {
                continue;
            }

            let outcome = self
                .repo
                .complete_work_item_failed(id, None, None, self.config.work_item_retry_limit, now)
                .await?;

            report.work_item_ids.push(id);
            match outcome {
                WorkFailOutcome::Retried { .. } => {
                    debug!(work_item_id = id, "failer requeued stuck work item");
                }
                WorkFailOutcome::Exhausted { job, .. } => {
                    // The job-level transition (and any sibling cancellation)
                    // already happened inside `complete_work_item_failed`;
                    // an item exhausted while RUNNING never produced
                    // results, so there's nothing for result chaining here.
                    report.job_ids.push(job.job_id);
                }
                WorkFailOutcome::Duplicate { .. } => {}
            }
        }

        if !report.work_item_ids.is_empty() {
            info!(count = report.work_item_ids.len(), "failer reclaimed stuck work items");
        }
        Ok(report)
    }

    /// `2 × max(duration)` over the step's at-least-two successful items;
    /// falls back to the global default when there aren't enough samples.
    async fn fail_duration_for(&self, item: &tessera_core::WorkItem) -> CoreResult<i64> {
        let durations = self
            .repo
            .successful_durations_ms(item.job_id, item.workflow_step_index)
            .await?;
        if durations.len() < 2 {
            return Ok(self.config.default_fail_duration.as_millis() as i64);
        }
        let max = durations.into_iter().max().unwrap_or(0);
        Ok(max * 2)
    }

    /// Spawns the periodic tick loop; returns the handle so callers can
    /// await or abort it at shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let period = self.config.failer_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "failer pass errored");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("failer loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tessera_core::{DataOperation, Job, JobEvent, WorkItem, WorkflowStep};
    use tessera_storage::InMemoryRepository;
    use uuid::Uuid;

    async fn running_item(config: OrchestratorConfig) -> (Arc<dyn Repository>, i64, Uuid) {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();
        repo.transition_job(job.job_id, JobEvent::Dispatch, false).await.unwrap();

        let mut step = WorkflowStep::new(job.job_id, 1, "svc-1", 1, false, DataOperation::default());
        repo.insert_workflow_step(&mut step).await.unwrap();

        let items = repo
            .insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
            .await
            .unwrap();
        let id = items[0].id.unwrap();
        repo.claim_work_item(id, Utc::now()).await.unwrap();

        // Let real time pass so the item's updated_at falls behind a
        // millisecond-scale fail duration without mocking the clock.
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        let _ = config;
        (repo, id, job.job_id)
    }

    #[tokio::test]
    async fn run_once_ignores_items_within_the_timeout() {
        let config = OrchestratorConfig::default(); // default_fail_duration is hours
        let (repo, _id, _job_id) = running_item(config.clone()).await;
        let failer = WorkFailer::new(repo, config);

        let report = failer.run_once().await.unwrap();
        assert!(report.work_item_ids.is_empty());
    }

    #[tokio::test]
    async fn run_once_requeues_a_stuck_item_under_the_retry_limit() {
        let mut config = OrchestratorConfig::default();
        config.default_fail_duration = StdDuration::from_millis(1);
        config.work_item_retry_limit = 3;
        let (repo, id, _job_id) = running_item(config.clone()).await;
        let failer = WorkFailer::new(repo.clone(), config);

        let report = failer.run_once().await.unwrap();
        assert_eq!(report.work_item_ids, vec![id]);
        assert!(report.job_ids.is_empty());

        let reclaimed = repo.get_work_item(id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, tessera_core::WorkItemStatus::Ready);
    }

    #[tokio::test]
    async fn run_once_fails_the_job_once_the_retry_limit_is_exhausted() {
        let mut config = OrchestratorConfig::default();
        config.default_fail_duration = StdDuration::from_millis(1);
        config.work_item_retry_limit = 0;
        let (repo, id, job_id) = running_item(config.clone()).await;
        let failer = WorkFailer::new(repo.clone(), config);

        let report = failer.run_once().await.unwrap();
        assert_eq!(report.work_item_ids, vec![id]);
        assert_eq!(report.job_ids, vec![job_id]);

        let job = repo.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, tessera_core::JobStatus::Failed);
    }

    /// Regression: a long global `default_fail_duration` must not mask a
    /// much shorter per-step outlier threshold. Two prior successful items
    /// on the same step with tiny durations make `fail_duration_for` return
    /// well under a millisecond-scale sleep, while `default_fail_duration`
    /// stays at hours — the candidate query must still surface the item.
    #[tokio::test]
    async fn run_once_uses_the_outlier_threshold_even_with_a_long_default() {
        let mut config = OrchestratorConfig::default();
        config.work_item_retry_limit = 3;
        // Deliberately much longer than the sleep below, so a buggy
        // pre-filter keyed on this value alone would never surface the item.
        config.default_fail_duration = StdDuration::from_secs(3600);

        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();
        repo.transition_job(job.job_id, JobEvent::Dispatch, false).await.unwrap();

        let mut step = WorkflowStep::new(job.job_id, 1, "svc-1", 3, false, DataOperation::default());
        repo.insert_workflow_step(&mut step).await.unwrap();

        // Two already-successful items with ~0ms duration establish a
        // per-step outlier threshold of `2 * max(duration)`, far below the
        // hour-scale global default.
        for _ in 0..2 {
            let items = repo
                .insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
                .await
                .unwrap();
            let id = items[0].id.unwrap();
            let now = Utc::now();
            repo.claim_work_item(id, now).await.unwrap();
            repo.complete_work_item_successful(id, vec![], vec![], None, now)
                .await
                .unwrap();
        }

        let items = repo
            .insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
            .await
            .unwrap();
        let id = items[0].id.unwrap();
        repo.claim_work_item(id, Utc::now()).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(30)).await;

        let failer = WorkFailer::new(repo.clone(), config);
        let report = failer.run_once().await.unwrap();

        assert_eq!(report.work_item_ids, vec![id]);
        let reclaimed = repo.get_work_item(id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, tessera_core::WorkItemStatus::Ready);
    }
}
