//! Job status and lifecycle-action routes (§6 "Job status", §4.2).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_clients::PermissionClient;
use tessera_core::{CoreError, JobEvent, JobLink, JobStatus};
use tessera_storage::Repository;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::common::{authorize_read, parse_job_id, ListResponse, PageQuery, ReadAuth};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub permission_client: Arc<dyn PermissionClient>,
    pub default_limit: u32,
}

/// No per-endpoint cap is documented for job listing; reuse the STAC
/// endpoints' `limit ∈ [1,10000]` bound (§6) for consistency.
const MAX_LIMIT: i64 = 10_000;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
        .route("/jobs/:job_id/pause", post(pause_job))
        .route("/jobs/:job_id/resume", post(resume_job))
        .route("/jobs/:job_id/skip-preview", post(skip_preview_job))
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Http,
    Https,
    S3,
    None,
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    #[serde(rename = "requestingUser")]
    pub requesting_user: Option<String>,
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
    #[serde(rename = "linkType")]
    pub link_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default, rename = "ignoreRepeats")]
    pub ignore_repeats: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobLinkView {
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub mime_type: Option<String>,
    pub rel: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub username: String,
    pub status: JobStatus,
    pub message: String,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub links: Vec<JobLinkView>,
    pub request: String,
    pub num_input_granules: u32,
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
}

fn parse_link_type(raw: Option<&str>) -> Result<LinkType, ApiError> {
    match raw {
        None => Ok(LinkType::Https),
        Some("http") => Ok(LinkType::Http),
        Some("https") => Ok(LinkType::Https),
        Some("s3") => Ok(LinkType::S3),
        Some("none") => Ok(LinkType::None),
        Some(other) => Err(CoreError::validation(format!("invalid linkType '{other}'")).into()),
    }
}

/// Rewrites a link's href for the requested `linkType`. `s3-access` links
/// carry the S3-native URI and are never touched (§6).
fn rewrite_href(link: &JobLink, link_type: LinkType) -> Option<String> {
    if link.is_s3_access() {
        return Some(link.href.clone());
    }
    match link_type {
        LinkType::None => None,
        LinkType::Http => Some(link.href.replacen("https://", "http://", 1)),
        LinkType::Https => Some(link.href.replacen("http://", "https://", 1)),
        LinkType::S3 => Some(link.href.clone()),
    }
}

fn render_job(job: &tessera_core::Job, link_type: LinkType) -> JobView {
    let links = job
        .links
        .iter()
        .filter_map(|l| {
            rewrite_href(l, link_type).map(|href| JobLinkView {
                href,
                title: l.title.clone(),
                mime_type: l.mime_type.clone(),
                rel: l.rel.clone(),
            })
        })
        .collect();

    JobView {
        username: job.username.clone(),
        status: job.status,
        message: job.message.clone(),
        progress: job.progress,
        created_at: job.created_at,
        updated_at: job.updated_at,
        links,
        request: job.request.clone(),
        num_input_granules: job.num_input_granules,
        job_id: job.job_id,
    }
}

/// GET /jobs/{jobID}?linkType=&requestingUser=&isAdmin=
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    params(("job_id" = String, Path, description = "job UUID")),
    responses(
        (status = 200, description = "job status", body = JobView),
        (status = 404, description = "job not found"),
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(auth): Query<AuthQuery>,
) -> Result<Json<JobView>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let link_type = parse_link_type(auth.link_type.as_deref())?;

    let job = state
        .repo
        .find_job(job_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;

    authorize_read(
        &state.permission_client,
        &job,
        ReadAuth {
            requesting_user: auth.requesting_user.as_deref().unwrap_or(""),
            is_admin: auth.is_admin,
        },
    )
    .await?;

    Ok(Json(render_job(&job, link_type)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub owner: Option<String>,
    #[serde(flatten)]
    pub page: PageQuery,
}

/// GET /jobs?owner=&page=&limit=
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListResponse<JobView>>, ApiError> {
    let pagination = query.page.validate(state.default_limit as i64, MAX_LIMIT)?;
    let (jobs, total) = state
        .repo
        .list_jobs(query.owner.as_deref(), None, pagination)
        .await?;
    let views = jobs.iter().map(|j| render_job(j, LinkType::Https)).collect();
    Ok(Json(ListResponse::new(views, total)))
}

async fn apply_action(
    state: &AppState,
    job_id: &str,
    event: JobEvent,
    preview: bool,
) -> Result<Json<JobView>, ApiError> {
    let job_id = parse_job_id(job_id)?;
    let job = state.repo.transition_job(job_id, event, preview).await?;
    Ok(Json(render_job(&job, LinkType::Https)))
}

/// POST /jobs/{jobID}/cancel?ignoreRepeats=
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<JobView>, ApiError> {
    apply_action(
        &state,
        &job_id,
        JobEvent::Cancel {
            ignore_repeats: query.ignore_repeats,
        },
        false,
    )
    .await
}

/// POST /jobs/{jobID}/pause
pub async fn pause_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<JobView>, ApiError> {
    apply_action(&state, &job_id, JobEvent::Pause, false).await
}

/// POST /jobs/{jobID}/resume
pub async fn resume_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<JobView>, ApiError> {
    apply_action(&state, &job_id, JobEvent::Resume, false).await
}

/// POST /jobs/{jobID}/skip-preview
pub async fn skip_preview_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    apply_action(&state, &job_id, JobEvent::SkipPreview, false).await
}
