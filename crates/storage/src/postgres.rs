//! PostgreSQL-backed `Repository`.
//!
//! Status mutations take row-level locks with `SELECT ... FOR UPDATE` inside
//! a single transaction per call; the fair-queue claim uses a conditional
//! `UPDATE ... WHERE status = 'ready'` so two concurrent pollers can never
//! walk away with the same WorkItem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use tessera_core::{
    apply_event, CoreError, CoreResult, Job, JobEvent, JobLink, JobStatus, WorkItem,
    WorkItemStatus, WorkflowStep,
};

use crate::repository::{Pagination, Repository, WorkFailOutcome, WorkSuccessOutcome};

#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| CoreError::service(format!("failed to connect to database: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::service(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::service(format!("database error: {e}"))
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Accepted => "accepted",
        JobStatus::Running => "running",
        JobStatus::RunningWithErrors => "running_with_errors",
        JobStatus::Paused => "paused",
        JobStatus::Previewing => "previewing",
        JobStatus::Successful => "successful",
        JobStatus::CompleteWithErrors => "complete_with_errors",
        JobStatus::Failed => "failed",
        JobStatus::Canceled => "canceled",
    }
}

fn parse_job_status(s: &str) -> CoreResult<JobStatus> {
    Ok(match s {
        "accepted" => JobStatus::Accepted,
        "running" => JobStatus::Running,
        "running_with_errors" => JobStatus::RunningWithErrors,
        "paused" => JobStatus::Paused,
        "previewing" => JobStatus::Previewing,
        "successful" => JobStatus::Successful,
        "complete_with_errors" => JobStatus::CompleteWithErrors,
        "failed" => JobStatus::Failed,
        "canceled" => JobStatus::Canceled,
        other => return Err(CoreError::service(format!("unknown job status '{other}'"))),
    })
}

fn work_item_status_str(s: WorkItemStatus) -> &'static str {
    match s {
        WorkItemStatus::Ready => "ready",
        WorkItemStatus::Running => "running",
        WorkItemStatus::Successful => "successful",
        WorkItemStatus::Failed => "failed",
        WorkItemStatus::Canceled => "canceled",
    }
}

fn parse_work_item_status(s: &str) -> CoreResult<WorkItemStatus> {
    Ok(match s {
        "ready" => WorkItemStatus::Ready,
        "running" => WorkItemStatus::Running,
        "successful" => WorkItemStatus::Successful,
        "failed" => WorkItemStatus::Failed,
        "canceled" => WorkItemStatus::Canceled,
        other => {
            return Err(CoreError::service(format!(
                "unknown work item status '{other}'"
            )))
        }
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> CoreResult<Job> {
    let status = parse_job_status(row.get::<String, _>("status").as_str())?;
    let collection_ids: serde_json::Value = row.get("collection_ids");
    let collection_ids: Vec<String> = serde_json::from_value(collection_ids).unwrap_or_default();
    Ok(Job {
        id: Some(row.get::<i64, _>("id")),
        job_id: row.get("job_id"),
        username: row.get("username"),
        status,
        message: row.get("message"),
        progress: row.get::<i32, _>("progress") as u8,
        num_input_granules: row.get::<i32, _>("num_input_granules") as u32,
        collection_ids,
        is_async: row.get("is_async"),
        ignore_errors: row.get("ignore_errors"),
        request: row.get("request"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        batches_completed: row.get::<i32, _>("batches_completed") as u32,
        links: Vec::new(),
        original_status: status,
    })
}

fn row_to_work_item(row: &sqlx::postgres::PgRow) -> CoreResult<WorkItem> {
    let status = parse_work_item_status(row.get::<String, _>("status").as_str())?;
    let results: serde_json::Value = row.get("results");
    let results: Vec<String> = serde_json::from_value(results).unwrap_or_default();
    let sizes: serde_json::Value = row.get("output_item_sizes");
    let sizes: Vec<i64> = serde_json::from_value(sizes).unwrap_or_default();
    Ok(WorkItem {
        id: Some(row.get::<i64, _>("id")),
        job_id: row.get("job_id"),
        service_id: row.get("service_id"),
        workflow_step_index: row.get::<i32, _>("workflow_step_index") as u32,
        status,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        stac_catalog_location: row.get("stac_catalog_location"),
        output_item_sizes: sizes.into_iter().map(|v| v as u64).collect(),
        results,
        scroll_id: row.get("scroll_id"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_workflow_step(row: &sqlx::postgres::PgRow) -> CoreResult<WorkflowStep> {
    let operation: serde_json::Value = row.get("operation");
    let operation = serde_json::from_value(operation)
        .map_err(|e| CoreError::service(format!("corrupt operation json: {e}")))?;
    Ok(WorkflowStep {
        id: Some(row.get::<i64, _>("id")),
        job_id: row.get("job_id"),
        step_index: row.get::<i32, _>("step_index") as u32,
        service_id: row.get("service_id"),
        work_item_count: row.get::<i32, _>("work_item_count") as u32,
        has_aggregated_output: row.get("has_aggregated_output"),
        operation,
    })
}

fn row_to_job_link(row: &sqlx::postgres::PgRow) -> JobLink {
    let bbox: Option<serde_json::Value> = row.get("bbox");
    let temporal: Option<serde_json::Value> = row.get("temporal");
    JobLink {
        id: Some(row.get::<i64, _>("id")),
        job_id: row.get("job_id"),
        href: row.get("href"),
        title: row.get("title"),
        mime_type: row.get("mime_type"),
        rel: row.get("rel"),
        bbox: bbox.and_then(|v| serde_json::from_value(v).ok()),
        temporal: temporal.and_then(|v| serde_json::from_value(v).ok()),
    }
}

async fn lock_job<'t>(tx: &mut Transaction<'t, Postgres>, job_id: Uuid) -> CoreResult<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;
    row_to_job(&row)
}

async fn save_job_row<'t>(tx: &mut Transaction<'t, Postgres>, job: &Job) -> CoreResult<()> {
    job.validate()?;
    let collection_ids = serde_json::to_value(&job.collection_ids).unwrap();
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = $2, message = $3, progress = $4, num_input_granules = $5,
            collection_ids = $6, is_async = $7, ignore_errors = $8, request = $9,
            updated_at = $10, batches_completed = $11
        WHERE job_id = $1
        "#,
    )
    .bind(job.job_id)
    .bind(job_status_str(job.status))
    .bind(&job.message)
    .bind(job.progress as i32)
    .bind(job.num_input_granules as i32)
    .bind(&collection_ids)
    .bind(job.is_async)
    .bind(job.ignore_errors)
    .bind(&job.request)
    .bind(job.updated_at)
    .bind(job.batches_completed as i32)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn cancel_ready_and_running<'t>(
    tx: &mut Transaction<'t, Postgres>,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> CoreResult<Vec<i64>> {
    let rows = sqlx::query(
        r#"
        UPDATE work_items SET status = 'canceled', updated_at = $2
        WHERE job_id = $1 AND status IN ('ready', 'running')
        RETURNING id
        "#,
    )
    .bind(job_id)
    .bind(now)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn find_job(&self, job_id: Uuid) -> CoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_job_by_owner(&self, owner: &str, job_id: Uuid) -> CoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1 AND username = $2")
            .bind(job_id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(
        &self,
        owner: Option<&str>,
        statuses: Option<&[JobStatus]>,
        page: Pagination,
    ) -> CoreResult<(Vec<Job>, u64)> {
        let status_strs: Option<Vec<&'static str>> =
            statuses.map(|s| s.iter().map(|s| job_status_str(*s)).collect());

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR username = $1)
              AND ($2::text[] IS NULL OR status = ANY($2))
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(owner)
        .bind(status_strs.as_deref())
        .bind(page.limit as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM jobs
            WHERE ($1::text IS NULL OR username = $1)
              AND ($2::text[] IS NULL OR status = ANY($2))
            "#,
        )
        .bind(owner)
        .bind(status_strs.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("count");

        let jobs = rows.iter().map(row_to_job).collect::<CoreResult<Vec<_>>>()?;
        Ok((jobs, total as u64))
    }

    async fn not_updated_for_minutes(&self, minutes: i64) -> CoreResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'running' AND updated_at < NOW() - ($1 || ' minutes')::interval",
        )
        .bind(minutes.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn insert_job(&self, job: &mut Job) -> CoreResult<()> {
        job.validate()?;
        let collection_ids = serde_json::to_value(&job.collection_ids).unwrap();
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, username, status, message, progress, num_input_granules,
                collection_ids, is_async, ignore_errors, request, created_at, updated_at,
                batches_completed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(job.job_id)
        .bind(&job.username)
        .bind(job_status_str(job.status))
        .bind(&job.message)
        .bind(job.progress as i32)
        .bind(job.num_input_granules as i32)
        .bind(&collection_ids)
        .bind(job.is_async)
        .bind(job.ignore_errors)
        .bind(&job.request)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.batches_completed as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        job.id = Some(row.get("id"));
        Ok(())
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        event: JobEvent,
        requested_preview: bool,
    ) -> CoreResult<Job> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = lock_job(&mut tx, job_id).await?;
        apply_event(&mut job, event, requested_preview)?;
        save_job_row(&mut tx, &job).await?;

        if matches!(event, JobEvent::Cancel { .. }) && job.status == JobStatus::Canceled {
            cancel_ready_and_running(&mut tx, job_id, job.updated_at).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn record_terminal_output(
        &self,
        job_id: Uuid,
        new_links: Vec<JobLink>,
        progress: u8,
        now: DateTime<Utc>,
    ) -> CoreResult<Job> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = lock_job(&mut tx, job_id).await?;
        job.progress = job.progress.max(progress);
        job.batches_completed += 1;
        job.updated_at = now;
        save_job_row(&mut tx, &job).await?;

        for link in &new_links {
            insert_link(&mut tx, job_id, link).await?;
        }
        tx.commit().await.map_err(db_err)?;
        job.links = new_links;
        Ok(job)
    }

    async fn shrink_num_input_granules(&self, job_id: Uuid, new_value: u32, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE jobs SET num_input_granules = $2, updated_at = $3 WHERE job_id = $1 AND num_input_granules > $2")
            .bind(job_id)
            .bind(new_value as i32)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn fail_job_with_message(
        &self,
        job_id: Uuid,
        message: String,
        now: DateTime<Utc>,
    ) -> CoreResult<Job> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = lock_job(&mut tx, job_id).await?;
        apply_event(&mut job, JobEvent::Fail, false)?;
        job.message = message;
        job.updated_at = now;
        save_job_row(&mut tx, &job).await?;
        cancel_ready_and_running(&mut tx, job_id, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn append_links(&self, job_id: Uuid, links: Vec<JobLink>) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for link in &links {
            insert_link(&mut tx, job_id, link).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn links_for_job(
        &self,
        job_id: Uuid,
        page: Pagination,
        rel: Option<&str>,
        spatiotemporal_only: bool,
    ) -> CoreResult<(Vec<JobLink>, u64)> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_links
            WHERE job_id = $1
              AND ($2::text IS NULL OR rel = $2)
              AND (NOT $3 OR bbox IS NOT NULL OR temporal IS NOT NULL)
            ORDER BY id ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(job_id)
        .bind(rel)
        .bind(spatiotemporal_only)
        .bind(page.limit as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM job_links
            WHERE job_id = $1
              AND ($2::text IS NULL OR rel = $2)
              AND (NOT $3 OR bbox IS NOT NULL OR temporal IS NOT NULL)
            "#,
        )
        .bind(job_id)
        .bind(rel)
        .bind(spatiotemporal_only)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("count");

        Ok((rows.iter().map(row_to_job_link).collect(), total as u64))
    }

    async fn insert_workflow_step(&self, step: &mut WorkflowStep) -> CoreResult<()> {
        let operation = serde_json::to_value(&step.operation)
            .map_err(|e| CoreError::service(format!("failed to serialize operation: {e}")))?;
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_steps (
                job_id, step_index, service_id, work_item_count, has_aggregated_output, operation
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(step.job_id)
        .bind(step.step_index as i32)
        .bind(&step.service_id)
        .bind(step.work_item_count as i32)
        .bind(step.has_aggregated_output)
        .bind(&operation)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        step.id = Some(row.get("id"));
        Ok(())
    }

    async fn get_workflow_step(
        &self,
        job_id: Uuid,
        step_index: u32,
    ) -> CoreResult<Option<WorkflowStep>> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE job_id = $1 AND step_index = $2")
            .bind(job_id)
            .bind(step_index as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_workflow_step).transpose()
    }

    async fn workflow_steps_for_job(&self, job_id: Uuid) -> CoreResult<Vec<WorkflowStep>> {
        let rows = sqlx::query("SELECT * FROM workflow_steps WHERE job_id = $1 ORDER BY step_index")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_workflow_step).collect()
    }

    async fn set_workflow_step_item_count(
        &self,
        job_id: Uuid,
        step_index: u32,
        work_item_count: u32,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE workflow_steps SET work_item_count = $3 WHERE job_id = $1 AND step_index = $2",
        )
        .bind(job_id)
        .bind(step_index as i32)
        .bind(work_item_count as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_terminal_workflow_steps(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM workflow_steps
            WHERE job_id IN (
                SELECT job_id FROM jobs
                WHERE status IN ('successful', 'complete_with_errors', 'failed', 'canceled')
                  AND updated_at < $1
            )
            RETURNING id
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn insert_work_items(&self, items: Vec<WorkItem>) -> CoreResult<Vec<WorkItem>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut saved = Vec::with_capacity(items.len());
        for mut item in items {
            let results = serde_json::to_value(&item.results).unwrap();
            let sizes: Vec<i64> = item.output_item_sizes.iter().map(|s| *s as i64).collect();
            let sizes = serde_json::to_value(&sizes).unwrap();
            let row = sqlx::query(
                r#"
                INSERT INTO work_items (
                    job_id, service_id, workflow_step_index, status, retry_count,
                    stac_catalog_location, output_item_sizes, results, scroll_id,
                    error_message, started_at, duration_ms, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                RETURNING id
                "#,
            )
            .bind(item.job_id)
            .bind(&item.service_id)
            .bind(item.workflow_step_index as i32)
            .bind(work_item_status_str(item.status))
            .bind(item.retry_count as i32)
            .bind(&item.stac_catalog_location)
            .bind(&sizes)
            .bind(&results)
            .bind(&item.scroll_id)
            .bind(&item.error_message)
            .bind(item.started_at)
            .bind(item.duration_ms)
            .bind(item.created_at)
            .bind(item.updated_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            item.id = Some(row.get("id"));
            saved.push(item);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(saved)
    }

    async fn get_work_item(&self, id: i64) -> CoreResult<Option<WorkItem>> {
        let row = sqlx::query("SELECT * FROM work_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_work_item).transpose()
    }

    async fn work_items_for_step(&self, job_id: Uuid, step_index: u32) -> CoreResult<Vec<WorkItem>> {
        let rows = sqlx::query(
            "SELECT * FROM work_items WHERE job_id = $1 AND workflow_step_index = $2",
        )
        .bind(job_id)
        .bind(step_index as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_work_item).collect()
    }

    async fn count_status_for_step(
        &self,
        job_id: Uuid,
        step_index: u32,
        status: WorkItemStatus,
    ) -> CoreResult<u32> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM work_items WHERE job_id = $1 AND workflow_step_index = $2 AND status = $3",
        )
        .bind(job_id)
        .bind(step_index as i32)
        .bind(work_item_status_str(status))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("count");
        Ok(count as u32)
    }

    async fn successful_durations_ms(&self, job_id: Uuid, step_index: u32) -> CoreResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT duration_ms FROM work_items WHERE job_id = $1 AND workflow_step_index = $2 AND status = 'successful' AND duration_ms IS NOT NULL",
        )
        .bind(job_id)
        .bind(step_index as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("duration_ms")).collect())
    }

    async fn ready_work_items_for_service(&self, service_id: &str) -> CoreResult<Vec<(WorkItem, Job)>> {
        let rows = sqlx::query(
            r#"
            SELECT w.*, j.id as j_id, j.job_id as j_job_id, j.username as j_username,
                   j.status as j_status, j.message as j_message, j.progress as j_progress,
                   j.num_input_granules as j_num_input_granules, j.collection_ids as j_collection_ids,
                   j.is_async as j_is_async, j.ignore_errors as j_ignore_errors, j.request as j_request,
                   j.created_at as j_created_at, j.updated_at as j_updated_at,
                   j.batches_completed as j_batches_completed
            FROM work_items w
            JOIN jobs j ON j.job_id = w.job_id
            WHERE w.service_id = $1 AND w.status = 'ready'
              AND j.status IN ('accepted', 'running', 'running_with_errors', 'previewing')
            "#,
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let item = row_to_work_item(&row)?;
            let status = parse_job_status(row.get::<String, _>("j_status").as_str())?;
            let collection_ids: serde_json::Value = row.get("j_collection_ids");
            let collection_ids: Vec<String> =
                serde_json::from_value(collection_ids).unwrap_or_default();
            let job = Job {
                id: Some(row.get::<i64, _>("j_id")),
                job_id: row.get("j_job_id"),
                username: row.get("j_username"),
                status,
                message: row.get("j_message"),
                progress: row.get::<i32, _>("j_progress") as u8,
                num_input_granules: row.get::<i32, _>("j_num_input_granules") as u32,
                collection_ids,
                is_async: row.get("j_is_async"),
                ignore_errors: row.get("j_ignore_errors"),
                request: row.get("j_request"),
                created_at: row.get("j_created_at"),
                updated_at: row.get("j_updated_at"),
                batches_completed: row.get::<i32, _>("j_batches_completed") as u32,
                links: Vec::new(),
                original_status: status,
            };
            out.push((item, job));
        }
        Ok(out)
    }

    async fn claim_work_item(&self, id: i64, now: DateTime<Utc>) -> CoreResult<Option<WorkItem>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            r#"
            UPDATE work_items SET status = 'running', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'ready'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };
        let item = row_to_work_item(&row)?;

        sqlx::query("UPDATE jobs SET updated_at = $2 WHERE job_id = $1")
            .bind(item.job_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(item))
    }

    async fn complete_work_item_successful(
        &self,
        id: i64,
        results: Vec<String>,
        sizes: Vec<u64>,
        scroll_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkSuccessOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM work_items WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::not_found(format!("work item {id} not found")))?;
        let item = row_to_work_item(&row)?;

        let mut job = lock_job(&mut tx, item.job_id).await?;
        let step = {
            let row = sqlx::query(
                "SELECT * FROM workflow_steps WHERE job_id = $1 AND step_index = $2 FOR UPDATE",
            )
            .bind(item.job_id)
            .bind(item.workflow_step_index as i32)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::not_found("workflow step not found"))?;
            row_to_workflow_step(&row)?
        };

        if item.is_duplicate_terminal_update(WorkItemStatus::Successful) {
            tx.commit().await.map_err(db_err)?;
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
        let results_json = serde_json::to_value(&item.results).unwrap();
        let sizes: Vec<i64> = item.output_item_sizes.iter().map(|s| *s as i64).collect();
        let sizes_json = serde_json::to_value(&sizes).unwrap();
        sqlx::query(
            r#"
            UPDATE work_items SET status = 'successful', results = $2, output_item_sizes = $3,
                duration_ms = $4, updated_at = $5, scroll_id = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&results_json)
        .bind(&sizes_json)
        .bind(item.duration_ms)
        .bind(now)
        .bind(&item.scroll_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        job.updated_at = now;
        save_job_row(&mut tx, &job).await?;

        let remaining: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM work_items
            WHERE job_id = $1 AND workflow_step_index = $2
              AND status NOT IN ('successful', 'failed', 'canceled')
            "#,
        )
        .bind(item.job_id)
        .bind(item.workflow_step_index as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("count");

        tx.commit().await.map_err(db_err)?;

        Ok(WorkSuccessOutcome {
            job,
            step,
            item,
            applied: true,
            step_exhausted: remaining == 0,
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM work_items WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::not_found(format!("work item {id} not found")))?;
        let item = row_to_work_item(&row)?;

        if item.is_duplicate_terminal_update(WorkItemStatus::Failed) {
            tx.commit().await.map_err(db_err)?;
            return Ok(WorkFailOutcome::Duplicate { item });
        }

        let mut item = item;
        if item.retry_count < retry_limit {
            item.retry(now);
            sqlx::query(
                "UPDATE work_items SET status = 'ready', retry_count = $2, started_at = NULL, updated_at = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(item.retry_count as i32)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            return Ok(WorkFailOutcome::Retried { item });
        }

        item.complete_failed(error_message, scroll_id, now);
        sqlx::query(
            "UPDATE work_items SET status = 'failed', error_message = $2, duration_ms = $3, updated_at = $4, scroll_id = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(&item.error_message)
        .bind(item.duration_ms)
        .bind(now)
        .bind(&item.scroll_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut job = lock_job(&mut tx, item.job_id).await?;
        let ignore_errors = job.ignore_errors;
        apply_event(
            &mut job,
            JobEvent::WorkFailed { ignore_errors },
            false,
        )?;
        save_job_row(&mut tx, &job).await?;

        let mut canceled = Vec::new();
        if job.status == JobStatus::Failed {
            canceled = cancel_ready_and_running(&mut tx, item.job_id, now).await?;
        }

        tx.commit().await.map_err(db_err)?;

        Ok(WorkFailOutcome::Exhausted {
            job,
            item,
            canceled_siblings: canceled,
        })
    }

    async fn running_older_than(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<WorkItem>> {
        let rows = sqlx::query("SELECT * FROM work_items WHERE status = 'running' AND updated_at < $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_work_item).collect()
    }

    async fn delete_terminal_work_items(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM work_items
            WHERE job_id IN (
                SELECT job_id FROM jobs
                WHERE status IN ('successful', 'complete_with_errors', 'failed', 'canceled')
                  AND updated_at < $1
            )
            RETURNING id
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }
}

async fn insert_link<'t>(
    tx: &mut Transaction<'t, Postgres>,
    job_id: Uuid,
    link: &JobLink,
) -> CoreResult<()> {
    let bbox = link.bbox.as_ref().map(|b| serde_json::to_value(b).unwrap());
    let temporal = link
        .temporal
        .as_ref()
        .map(|t| serde_json::to_value(t).unwrap());
    sqlx::query(
        r#"
        INSERT INTO job_links (job_id, href, title, mime_type, rel, bbox, temporal)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job_id)
    .bind(&link.href)
    .bind(&link.title)
    .bind(&link.mime_type)
    .bind(&link.rel)
    .bind(&bbox)
    .bind(&temporal)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_its_db_string() {
        for status in [
            JobStatus::Accepted,
            JobStatus::Running,
            JobStatus::RunningWithErrors,
            JobStatus::Paused,
            JobStatus::Previewing,
            JobStatus::Successful,
            JobStatus::CompleteWithErrors,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            let parsed = parse_job_status(job_status_str(status)).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn work_item_status_round_trips_through_its_db_string() {
        for status in [
            WorkItemStatus::Ready,
            WorkItemStatus::Running,
            WorkItemStatus::Successful,
            WorkItemStatus::Failed,
            WorkItemStatus::Canceled,
        ] {
            let parsed = parse_work_item_status(work_item_status_str(status)).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn parse_job_status_rejects_an_unknown_string() {
        assert!(parse_job_status("bogus").is_err());
    }

    #[test]
    fn parse_work_item_status_rejects_an_unknown_string() {
        assert!(parse_work_item_status("bogus").is_err());
    }
}
