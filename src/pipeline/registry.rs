//! Aggregate registry - concurrent (feed, processor) → aggregate store
//!
//! Creation-on-first-use: the first event for a key creates its aggregate,
//! and that instance is never replaced for the life of the registry.
//! Aggregates are fully independent; `drain_all` visits them one at a time
//! without holding any map lock while an aggregate drains.

use super::aggregate::{system_clock, Clock, DrainReport, EventRejected, FeedProcessorAggregate};
use super::classifier::Classification;
use super::config::AggregateSettings;
use super::lineage::LineageStore;
use super::stats::EventStatsDelta;
use super::types::{AggregateKey, ProvenanceEvent};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

pub struct AggregateRegistry {
    aggregates: DashMap<AggregateKey, Arc<FeedProcessorAggregate>>,
    settings: AggregateSettings,
    lineages: Arc<LineageStore>,
    clock: Clock,
}

impl AggregateRegistry {
    pub fn new(settings: AggregateSettings, lineages: Arc<LineageStore>) -> Self {
        Self::new_with_clock(settings, lineages, system_clock())
    }

    /// Create a registry whose aggregates share a custom clock
    pub fn new_with_clock(
        settings: AggregateSettings,
        lineages: Arc<LineageStore>,
        clock: Clock,
    ) -> Self {
        Self {
            aggregates: DashMap::new(),
            settings,
            lineages,
            clock,
        }
    }

    /// Get the aggregate for a key, creating it on first use
    pub fn get_or_create(&self, key: &AggregateKey) -> Arc<FeedProcessorAggregate> {
        if let Some(existing) = self.aggregates.get(key) {
            return existing.value().clone();
        }

        self.aggregates
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(FeedProcessorAggregate::new_with_clock(
                    key.clone(),
                    self.settings,
                    self.lineages.clone(),
                    self.clock.clone(),
                ))
            })
            .value()
            .clone()
    }

    pub fn get(&self, key: &AggregateKey) -> Option<Arc<FeedProcessorAggregate>> {
        self.aggregates.get(key).map(|a| a.value().clone())
    }

    /// Route an event to its aggregate and classify it
    pub fn add_event(
        &self,
        event: ProvenanceEvent,
        delta: &EventStatsDelta,
    ) -> Result<Classification, EventRejected> {
        let aggregate = self.get_or_create(&event.aggregate_key());
        aggregate.add_event(event, delta)
    }

    /// Drain every aggregate, skipping keys with nothing to report
    pub fn drain_all(&self) -> Vec<(AggregateKey, DrainReport)> {
        self.drain_each(FeedProcessorAggregate::drain_cycle)
    }

    /// Shutdown drain: also flushes provisional events still inside the window
    pub fn drain_all_final(&self) -> Vec<(AggregateKey, DrainReport)> {
        self.drain_each(FeedProcessorAggregate::drain_final)
    }

    fn drain_each(
        &self,
        drain: impl Fn(&FeedProcessorAggregate) -> DrainReport,
    ) -> Vec<(AggregateKey, DrainReport)> {
        let aggregates: Vec<Arc<FeedProcessorAggregate>> =
            self.aggregates.iter().map(|entry| entry.value().clone()).collect();

        let mut reports: Vec<(AggregateKey, DrainReport)> = aggregates
            .iter()
            .map(|aggregate| (aggregate.key().clone(), drain(aggregate)))
            .filter(|(_, report)| !report.is_empty())
            .collect();
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        reports
    }

    /// Prune idle lineages, keeping any job a buffered event still points at
    pub fn prune_lineages(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let aggregates: Vec<Arc<FeedProcessorAggregate>> =
            self.aggregates.iter().map(|entry| entry.value().clone()).collect();

        let referenced: HashSet<String> = aggregates
            .iter()
            .flat_map(|aggregate| aggregate.referenced_jobs())
            .collect();

        self.lineages.prune_idle(now, ttl, &referenced)
    }

    pub fn keys(&self) -> Vec<AggregateKey> {
        let mut keys: Vec<AggregateKey> = self.aggregates.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn lineages(&self) -> &Arc<LineageStore> {
        &self.lineages
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }
}
