//! Pure selection logic for `get-work`: fair per-user queuing with
//! synchronous priority. Takes a snapshot of candidate (WorkItem, Job) pairs
//! and picks a single winner; the caller is responsible for the atomic claim
//! that actually flips it to RUNNING.

use tessera_core::{Job, WorkItem};

/// Picks the next item to dispatch from a snapshot of READY candidates,
/// already restricted to one serviceID and to dispatchable job statuses.
///
/// Algorithm (spec §4.3):
/// 1. Group by owning user; the user whose jobs have waited longest for
///    dispatch attention (oldest max(job.updatedAt) across their jobs with
///    READY items here) goes first.
/// 2. Within that user, synchronous jobs outrank asynchronous ones
///    regardless of age; among same-kind jobs the oldest (by updatedAt)
///    wins.
/// 3. Within that job, the oldest READY item (by updatedAt) wins.
pub fn select_next(candidates: &[(WorkItem, Job)]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let winning_user = {
        let mut by_user: std::collections::BTreeMap<&str, chrono::DateTime<chrono::Utc>> =
            std::collections::BTreeMap::new();
        for (_, job) in candidates {
            let entry = by_user.entry(job.username.as_str());
            entry
                .and_modify(|max| *max = (*max).max(job.updated_at))
                .or_insert(job.updated_at);
        }
        by_user
            .into_iter()
            .min_by_key(|(username, max_updated)| (*max_updated, *username))
            .map(|(username, _)| username)?
    };

    let winning_job_id = {
        let user_candidates: Vec<&(WorkItem, Job)> = candidates
            .iter()
            .filter(|(_, job)| job.username == winning_user)
            .collect();

        let mut by_job: std::collections::BTreeMap<
            uuid::Uuid,
            (bool, chrono::DateTime<chrono::Utc>),
        > = std::collections::BTreeMap::new();
        for (_, job) in &user_candidates {
            by_job.insert(job.job_id, (!job.is_async, job.updated_at));
        }

        let any_sync = by_job.values().any(|(is_sync, _)| *is_sync);
        by_job
            .into_iter()
            .filter(|(_, (is_sync, _))| !any_sync || *is_sync)
            .min_by_key(|(job_id, (_, updated_at))| (*updated_at, *job_id))
            .map(|(job_id, _)| job_id)?
    };

    candidates
        .iter()
        .enumerate()
        .filter(|(_, (item, job))| job.job_id == winning_job_id && item.status == tessera_core::WorkItemStatus::Ready)
        .min_by_key(|(_, (item, _))| (item.updated_at, item.id))
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn job(username: &str, is_async: bool, updated_at: chrono::DateTime<Utc>) -> Job {
        let mut j = Job::new(Uuid::new_v4(), username, "https://example.com/req");
        j.is_async = is_async;
        j.updated_at = updated_at;
        j
    }

    fn item(job_id: Uuid, updated_at: chrono::DateTime<Utc>) -> WorkItem {
        let mut w = WorkItem::new(job_id, "svc", 1);
        w.id = Some(updated_at.timestamp_millis());
        w.updated_at = updated_at;
        w
    }

    #[test]
    fn picks_longest_waiting_user() {
        let now = Utc::now();
        let waited_long = job("alice", true, now - Duration::minutes(10));
        let waited_short = job("bob", true, now - Duration::minutes(1));
        let candidates = vec![
            (item(waited_long.job_id, now - Duration::minutes(10)), waited_long.clone()),
            (item(waited_short.job_id, now - Duration::minutes(1)), waited_short),
        ];
        let idx = select_next(&candidates).unwrap();
        assert_eq!(candidates[idx].1.username, "alice");
    }

    #[test]
    fn sync_job_outranks_async_for_same_user() {
        let now = Utc::now();
        let async_job = job("alice", true, now - Duration::minutes(30));
        let sync_job = job("alice", false, now);
        let candidates = vec![
            (item(async_job.job_id, now - Duration::minutes(30)), async_job.clone()),
            (item(sync_job.job_id, now), sync_job.clone()),
        ];
        let idx = select_next(&candidates).unwrap();
        assert_eq!(candidates[idx].1.job_id, sync_job.job_id);
    }

    #[test]
    fn oldest_item_within_job_wins() {
        let now = Utc::now();
        let j = job("alice", true, now);
        let older = item(j.job_id, now - Duration::minutes(5));
        let newer = item(j.job_id, now - Duration::minutes(1));
        let candidates = vec![(newer.clone(), j.clone()), (older.clone(), j)];
        let idx = select_next(&candidates).unwrap();
        assert_eq!(candidates[idx].0.id, older.id);
    }

    #[test]
    fn empty_candidates_returns_none() {
        assert!(select_next(&[]).is_none());
    }
}
