//! STAC catalog/item routes (§6 "STAC endpoints").

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tessera_clients::PermissionClient;
use tessera_core::CoreError;
use tessera_dispatch::stac::{StacCatalog, STAC_VERSION};
use tessera_storage::Repository;

use crate::error::ApiError;
use crate::routes::common::{authorize_read, parse_job_id, ReadAuth};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub permission_client: Arc<dyn PermissionClient>,
    pub default_limit: u32,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/stac/:job_id", get(get_catalog))
        .route("/stac/:job_id/:index", get(get_item))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StacPageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    pub limit: Option<i64>,
    #[serde(rename = "requestingUser")]
    pub requesting_user: Option<String>,
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
}

fn default_page() -> i64 {
    1
}

async fn load_authorized_job(
    state: &AppState,
    job_id: &str,
    requesting_user: Option<&str>,
    is_admin: bool,
) -> Result<tessera_core::Job, ApiError> {
    let job_id = parse_job_id(job_id)?;
    let job = state
        .repo
        .find_job(job_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("job {job_id} not found")))?;

    authorize_read(
        &state.permission_client,
        &job,
        ReadAuth {
            requesting_user: requesting_user.unwrap_or(""),
            is_admin,
        },
    )
    .await?;

    Ok(job)
}

fn bounds_error() -> ApiError {
    CoreError::validation("The requested paging parameters were out of bounds").into()
}

/// GET /stac/{jobID}?page=&limit=
#[utoipa::path(
    get,
    path = "/stac/{job_id}",
    params(("job_id" = String, Path, description = "job UUID")),
    responses(
        (status = 200, description = "STAC catalog"),
        (status = 400, description = "paging parameters out of bounds"),
    ),
    tag = "stac"
)]
pub async fn get_catalog(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<StacPageQuery>,
) -> Result<Json<StacCatalog>, ApiError> {
    let limit = query.limit.unwrap_or(state.default_limit as i64);
    if query.page < 1 || limit < 1 || limit > 10_000 {
        return Err(bounds_error());
    }

    let job = load_authorized_job(
        &state,
        &job_id,
        query.requesting_user.as_deref(),
        query.is_admin,
    )
    .await?;

    let hrefs: Vec<String> = job.links.iter().map(|l| l.href.clone()).collect();
    let start = ((query.page - 1) * limit) as usize;
    if !hrefs.is_empty() && start >= hrefs.len() {
        return Err(bounds_error());
    }
    if hrefs.is_empty() && start > 0 {
        return Err(bounds_error());
    }
    let end = (start + limit as usize).min(hrefs.len());
    let page_items = hrefs[start..end].to_vec();

    Ok(Json(StacCatalog {
        stac_version: STAC_VERSION.to_string(),
        id: job.job_id.to_string(),
        links: Vec::new(),
        item_hrefs: page_items,
    }))
}

/// GET /stac/{jobID}/{index}
#[utoipa::path(
    get,
    path = "/stac/{job_id}/{index}",
    params(
        ("job_id" = String, Path, description = "job UUID"),
        ("index" = usize, Path, description = "0-based item index"),
    ),
    responses(
        (status = 200, description = "STAC item href"),
        (status = 400, description = "index out of bounds"),
    ),
    tag = "stac"
)]
pub async fn get_item(
    State(state): State<AppState>,
    Path((job_id, index)): Path<(String, usize)>,
    Query(query): Query<AuthOnlyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_authorized_job(
        &state,
        &job_id,
        query.requesting_user.as_deref(),
        query.is_admin,
    )
    .await?;

    let href = job
        .links
        .get(index)
        .ok_or_else(|| CoreError::validation("The requested paging parameters were out of bounds"))?
        .href
        .clone();

    Ok(Json(serde_json::json!({ "href": href })))
}

#[derive(Debug, Deserialize)]
pub struct AuthOnlyQuery {
    #[serde(rename = "requestingUser")]
    pub requesting_user: Option<String>,
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
}
