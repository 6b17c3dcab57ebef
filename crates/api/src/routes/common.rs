//! Shared DTOs used across more than one route module.

use serde::{Deserialize, Serialize};
use tessera_clients::PermissionClient;
use tessera_dispatch::share_gate::{can_read, ShareGateRequest};
use utoipa::ToSchema;
use uuid::Uuid;

use tessera_core::CoreError;
use crate::error::ApiError;

/// List endpoints wrap their payload in a `data` field alongside the total
/// row count, so pagination can be driven without a second request.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: u64,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>, total: u64) -> Self {
        Self { data, total }
    }
}

/// `page`/`limit` as they arrive on the wire, before bounds checking.
/// `limit` is left unset rather than defaulted here, since its default
/// value is `defaultResultPageSize`, a deployment-configured value rather
/// than a wire-protocol constant.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    pub limit: Option<i64>,
}

fn default_page() -> i64 {
    1
}

impl PageQuery {
    /// §6: `limit ∈ [1,10000]`; page must be a positive integer. Anything
    /// else is the documented "paging parameters were out of bounds" 400.
    /// An absent `limit` falls back to `default_limit` (the deployment's
    /// `defaultResultPageSize`).
    pub fn validate(self, default_limit: i64, max_limit: i64) -> Result<tessera_storage::Pagination, CoreError> {
        let limit = self.limit.unwrap_or(default_limit);
        if self.page < 1 || limit < 1 || limit > max_limit {
            return Err(CoreError::validation(
                "The requested paging parameters were out of bounds",
            ));
        }
        Ok(tessera_storage::Pagination::new(self.page as u32, limit as u32))
    }
}

pub fn parse_job_id(raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw).map_err(|_| {
        CoreError::validation(format!(
            "Invalid format for Job ID '{raw}'. Job ID must be a UUID."
        ))
    })
}

/// Who is asking, resolved from whatever auth context the surrounding
/// request carries; evaluated by the share-gate (§4.7) against `job`.
pub struct ReadAuth<'a> {
    pub requesting_user: &'a str,
    pub is_admin: bool,
}

/// Non-owners of a non-shareable job see 404, never 403 — existence of
/// other users' jobs is not disclosed (§7).
pub async fn authorize_read(
    permission_client: &std::sync::Arc<dyn PermissionClient>,
    job: &tessera_core::Job,
    auth: ReadAuth<'_>,
) -> Result<(), ApiError> {
    let allowed = can_read(
        permission_client,
        ShareGateRequest {
            job,
            requesting_user: auth.requesting_user,
            is_admin: auth.is_admin,
        },
    )
    .await;
    if allowed {
        Ok(())
    } else {
        Err(CoreError::not_found(format!("job {} not found", job.job_id)).into())
    }
}
