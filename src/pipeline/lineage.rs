//! Job lineage arena
//!
//! Events never hold a reference to their job; they carry the job id and
//! the classifier resolves it here. The event source owns the lifecycle
//! (`track` on every event it forwards); the drain scheduler prunes jobs
//! that have gone quiet.

use super::types::{FirstEventType, JobLineage};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

/// Concurrent store of `JobLineage` records keyed by job id
#[derive(Debug, Default)]
pub struct LineageStore {
    lineages: DashMap<String, JobLineage>,
}

impl LineageStore {
    pub fn new() -> Self {
        Self {
            lineages: DashMap::new(),
        }
    }

    /// Register a job on first sight, or refresh its `last_seen`
    pub fn track(&self, job_id: &str, seen_at: DateTime<Utc>) {
        self.lineages
            .entry(job_id.to_string())
            .and_modify(|lineage| {
                if seen_at > lineage.last_seen {
                    lineage.last_seen = seen_at;
                }
            })
            .or_insert_with(|| JobLineage::new(job_id, seen_at));
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lineages.contains_key(job_id)
    }

    /// Current first-event classification, `None` for unknown jobs
    pub fn first_event_type(&self, job_id: &str) -> Option<FirstEventType> {
        self.lineages.get(job_id).map(|l| l.first_event_type)
    }

    /// Decide a job's first-event classification.
    ///
    /// Returns `true` only when this call moved the lineage out of `Unset`.
    pub fn mark_first_event(&self, job_id: &str, kind: FirstEventType) -> bool {
        match self.lineages.get_mut(job_id) {
            Some(mut lineage) => lineage.set_first_event_type(kind),
            None => false,
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobLineage> {
        self.lineages.get(job_id).map(|l| l.clone())
    }

    /// Drop lineages not touched within `ttl` of `now`, except those in `keep`
    ///
    /// `ttl` is the horizon after which a job counts as finished. Its
    /// first-event decision goes with it, so a later event under the same id
    /// starts a new lineage. Returns the number of pruned jobs.
    pub fn prune_idle(&self, now: DateTime<Utc>, ttl: Duration, keep: &HashSet<String>) -> usize {
        let cutoff = now - ttl;
        let before = self.lineages.len();
        self.lineages
            .retain(|job_id, lineage| lineage.last_seen >= cutoff || keep.contains(job_id));
        before.saturating_sub(self.lineages.len())
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }
}
