//! Work-reaper (spec §4.6): periodically deletes WorkItems and
//! WorkflowSteps belonging to jobs that reached a terminal state and have
//! sat idle past `reapAge`. Jobs themselves are retained.

use std::sync::Arc;

use chrono::Utc;
use tessera_core::{CoreResult, OrchestratorConfig};
use tessera_storage::Repository;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default)]
pub struct ReaperReport {
    pub deleted_work_items: usize,
    pub deleted_workflow_steps: usize,
}

pub struct WorkReaper {
    repo: Arc<dyn Repository>,
    config: OrchestratorConfig,
}

impl WorkReaper {
    pub fn new(repo: Arc<dyn Repository>, config: OrchestratorConfig) -> Self {
        Self { repo, config }
    }

    pub async fn run_once(&self) -> CoreResult<ReaperReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.reap_age).unwrap_or(chrono::Duration::days(7));

        let deleted_items = self.repo.delete_terminal_work_items(cutoff).await?;
        let deleted_steps = self.repo.delete_terminal_workflow_steps(cutoff).await?;

        let report = ReaperReport {
            deleted_work_items: deleted_items.len(),
            deleted_workflow_steps: deleted_steps.len(),
        };
        if report.deleted_work_items > 0 || report.deleted_workflow_steps > 0 {
            info!(
                work_items = report.deleted_work_items,
                workflow_steps = report.deleted_workflow_steps,
                "reaper deleted subordinate rows of idle terminal jobs"
            );
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let period = self.config.reaper_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "reaper pass errored");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reaper loop shutting down");
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

    async fn terminal_job_with_rows() -> (Arc<dyn Repository>, Uuid) {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
        repo.insert_job(&mut job).await.unwrap();

        let mut step = WorkflowStep::new(job.job_id, 1, "svc-1", 1, false, DataOperation::default());
        repo.insert_workflow_step(&mut step).await.unwrap();
        repo.insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
            .await
            .unwrap();

        repo.transition_job(job.job_id, JobEvent::Fail, false).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        (repo, job.job_id)
    }

    #[tokio::test]
    async fn run_once_leaves_recently_terminal_jobs_alone() {
        let (repo, _job_id) = terminal_job_with_rows().await;
        let config = OrchestratorConfig::default(); // reap_age is days
        let reaper = WorkReaper::new(repo, config);

        let report = reaper.run_once().await.unwrap();
        assert_eq!(report.deleted_work_items, 0);
        assert_eq!(report.deleted_workflow_steps, 0);
    }

    #[tokio::test]
    async fn run_once_deletes_subordinate_rows_of_idle_terminal_jobs() {
        let (repo, job_id) = terminal_job_with_rows().await;
        let mut config = OrchestratorConfig::default();
        config.reap_age = StdDuration::from_millis(1);
        let reaper = WorkReaper::new(repo.clone(), config);

        let report = reaper.run_once().await.unwrap();
        assert_eq!(report.deleted_work_items, 1);
        assert_eq!(report.deleted_workflow_steps, 1);

        // The job row itself is retained; only its subordinate rows go.
        let job = repo.find_job(job_id).await.unwrap();
        assert!(job.is_some());
        assert!(repo.work_items_for_step(job_id, 1).await.unwrap().is_empty());
    }
}
