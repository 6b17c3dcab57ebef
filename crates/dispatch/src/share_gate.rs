//! Share-gate (spec §4.7): decides whether a non-owner may read a job's
//! status or results. Permission-client failures are treated as deny —
//! never as "unknown, let it through".

use std::sync::Arc;

use tessera_clients::PermissionClient;
use tessera_core::Job;

pub struct ShareGateRequest<'a> {
    pub job: &'a Job,
    pub requesting_user: &'a str,
    pub is_admin: bool,
}

pub async fn can_read(client: &Arc<dyn PermissionClient>, req: ShareGateRequest<'_>) -> bool {
    if req.is_admin {
        return true;
    }
    if req.requesting_user == req.job.username {
        return true;
    }
    if req.job.collection_ids.is_empty() {
        return false;
    }

    let eula_flags = match client.has_eula(&req.job.collection_ids).await {
        Ok(flags) => flags,
        Err(_) => return false,
    };
    let all_eula_clear = req
        .job
        .collection_ids
        .iter()
        .all(|c| eula_flags.get(c) == Some(&false));
    if !all_eula_clear {
        return false;
    }

    match client.all_guest_readable(&req.job.collection_ids).await {
        Ok(readable) => readable,
        Err(_) => false,
    }
}
