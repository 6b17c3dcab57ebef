//! Worker poll/update routes (§6 "Worker poll" / "Worker update").

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tessera_core::{CoreError, WorkItemStatus};
use tessera_dispatch::engine::{DispatchEngine, UpdateWorkOutcome, WorkItemUpdate};
use tessera_storage::Repository;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub repo: Arc<dyn Repository>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/service/work", get(get_work))
        .route("/service/work/:id", put(update_work))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GetWorkQuery {
    #[serde(rename = "serviceID")]
    pub service_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemWire {
    pub id: i64,
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    #[serde(rename = "serviceID")]
    pub service_id: String,
    pub workflow_step_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stac_catalog_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "scrollID")]
    pub scroll_id: Option<String>,
    pub operation: tessera_core::DataOperation,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetWorkResponseWire {
    pub work_item: WorkItemWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cmr_granules: Option<u32>,
}

/// GET /service/work?serviceID=<string>
#[utoipa::path(
    get,
    path = "/service/work",
    params(("serviceID" = String, Query, description = "identifier a worker presents to claim work")),
    responses(
        (status = 200, description = "work available", body = GetWorkResponseWire),
        (status = 404, description = "no work available"),
    ),
    tag = "worker"
)]
pub async fn get_work(
    State(state): State<AppState>,
    Query(query): Query<GetWorkQuery>,
) -> Result<Json<GetWorkResponseWire>, ApiError> {
    let Some(response) = state.engine.get_work(&query.service_id).await? else {
        return Err(CoreError::not_found("no work available").into());
    };

    let step = state
        .repo
        .get_workflow_step(response.work_item.job_id, response.work_item.workflow_step_index)
        .await?
        .ok_or_else(|| CoreError::service("claimed work item has no owning workflow step"))?;

    Ok(Json(GetWorkResponseWire {
        work_item: WorkItemWire {
            id: response.work_item.id.ok_or_else(|| CoreError::service("work item missing id"))?,
            job_id: response.work_item.job_id,
            service_id: response.work_item.service_id,
            workflow_step_index: response.work_item.workflow_step_index,
            stac_catalog_location: response.work_item.stac_catalog_location,
            scroll_id: response.work_item.scroll_id,
            operation: step.operation,
        },
        max_cmr_granules: response.max_cmr_granules,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateWorkRequest {
    pub status: WorkItemStatus,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default, rename = "outputGranuleSizes")]
    pub output_granule_sizes: Vec<u64>,
    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(default, rename = "scrollID")]
    pub scroll_id: Option<String>,
    #[serde(default)]
    pub hits: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkResponseWire {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

/// PUT /service/work/{id}
#[utoipa::path(
    put,
    path = "/service/work/{id}",
    request_body = UpdateWorkRequest,
    responses((status = 200, description = "update applied", body = UpdateWorkResponseWire)),
    tag = "worker"
)]
pub async fn update_work(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateWorkRequest>,
) -> Result<Json<UpdateWorkResponseWire>, ApiError> {
    let update = WorkItemUpdate {
        status: body.status,
        results: body.results,
        output_item_sizes: body.output_granule_sizes,
        error_message: body.error_message,
        scroll_id: body.scroll_id,
        hits: body.hits,
    };

    let outcome = state.engine.update_work(id, update).await?;
    Ok(Json(match outcome {
        UpdateWorkOutcome::Applied => UpdateWorkResponseWire {
            status: "applied",
            retry_count: None,
        },
        UpdateWorkOutcome::Duplicate => UpdateWorkResponseWire {
            status: "duplicate",
            retry_count: None,
        },
        UpdateWorkOutcome::Retried { retry_count } => UpdateWorkResponseWire {
            status: "retried",
            retry_count: Some(retry_count),
        },
    }))
}
