//! OpenAPI document assembly, grounded on the same `#[derive(OpenApi)]`
//! aggregation the control plane uses.

use utoipa::OpenApi;

use crate::error::ApiErrorBody;
use crate::routes::jobs::JobLinkView;
use crate::routes::jobs::JobView;
use crate::routes::worker::{GetWorkResponseWire, UpdateWorkRequest, UpdateWorkResponseWire, WorkItemWire};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::worker::get_work,
        crate::routes::worker::update_work,
        crate::routes::jobs::get_job,
        crate::routes::stac::get_catalog,
        crate::routes::stac::get_item,
    ),
    components(schemas(
        ApiErrorBody,
        JobView,
        JobLinkView,
        GetWorkResponseWire,
        WorkItemWire,
        UpdateWorkRequest,
        UpdateWorkResponseWire,
    )),
    tags(
        (name = "worker", description = "Endpoints polled by external service workers"),
        (name = "jobs", description = "Job status and lifecycle-action endpoints"),
        (name = "stac", description = "STAC catalog and item endpoints"),
    ),
    info(
        title = "Tessera Orchestrator API",
        version = "0.1.0",
        description = "Data-transformation request orchestrator: job lifecycle, work dispatch, and result retrieval",
        license(name = "Apache-2.0")
    )
)]
pub struct ApiDoc;
