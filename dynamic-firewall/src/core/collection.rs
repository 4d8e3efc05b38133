/*!
Collection pipeline: fetch every feed, merge the results into the record store as one batch
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures::future::join_all;
use threat_database::{StoreError, StoreStats};
use tracing::{error, info, warn};

use crate::collectors::Collector;
use crate::core::SharedStore;

/// How one collector fared in a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorOutcome {
    pub name: String,
    pub fetched: usize,
    /// Set when the collector failed, timed out or panicked
    pub error: Option<String>,
}

impl CollectorOutcome {
    fn fetched(name: String, fetched: usize) -> Self {
        Self { name, fetched, error: None }
    }

    fn failed(name: String, error: String) -> Self {
        Self { name, fetched: 0, error: Some(error) }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    pub collectors: Vec<CollectorOutcome>,
    /// Entries handed to the store, duplicates included
    pub total_fetched: usize,
    /// Records in the store after the merge (and purge)
    pub total_after_merge: usize,
    pub purged: usize,
    pub stats: StoreStats,
}

pub struct CollectionPipeline {
    collectors: Vec<Arc<dyn Collector>>,
    store: SharedStore,
    fetch_timeout: Duration,
    retention: Option<TimeDelta>,
}

impl CollectionPipeline {
    pub fn new(
        collectors: Vec<Arc<dyn Collector>>,
        store: SharedStore,
        fetch_timeout: Duration,
        retention: Option<TimeDelta>,
    ) -> Self {
        Self {
            collectors,
            store,
            fetch_timeout,
            retention,
        }
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }

    /// Run every enabled collector and merge their entries in a single batch.
    ///
    /// Collectors run concurrently and independently: one that errors, times
    /// out or panics contributes nothing and the others carry on. Only a store
    /// write failure fails the cycle.
    pub async fn run(&self) -> Result<CollectionReport, StoreError> {
        info!("Starting IP collection cycle...");

        let (names, tasks): (Vec<String>, Vec<_>) = self
            .collectors
            .iter()
            .filter(|collector| collector.is_enabled())
            .map(|collector| {
                let collector = Arc::clone(collector);
                let timeout = self.fetch_timeout;
                let name = collector.name().to_string();
                let task = tokio::spawn(async move {
                    tokio::time::timeout(timeout, collector.fetch()).await
                });
                (name, task)
            })
            .unzip();

        let mut batch = Vec::new();
        let mut outcomes = Vec::with_capacity(names.len());

        for (name, result) in names.into_iter().zip(join_all(tasks).await) {
            let outcome = match result {
                Ok(Ok(Ok(entries))) => {
                    info!("Collected {} IPs from {}", entries.len(), name);
                    let fetched = entries.len();
                    batch.extend(entries);
                    CollectorOutcome::fetched(name, fetched)
                }
                Ok(Ok(Err(e))) => {
                    error!("Error collecting from {}: {}", name, e);
                    CollectorOutcome::failed(name, e.to_string())
                }
                Ok(Err(_)) => {
                    error!("Collector {} timed out after {:?}", name, self.fetch_timeout);
                    CollectorOutcome::failed(name, format!("timed out after {:?}", self.fetch_timeout))
                }
                Err(e) => {
                    error!("Collector {} task failed: {}", name, e);
                    CollectorOutcome::failed(name, e.to_string())
                }
            };
            outcomes.push(outcome);
        }

        if batch.is_empty() {
            warn!("No IPs collected in this cycle");
        }

        let mut store = self.store.lock().await;
        store.upsert_batch(&batch)?;

        // The batch is committed; a failed sweep or stats read only degrades the report
        let purged = match self.retention {
            Some(max_age) => store.purge_stale(max_age).unwrap_or_else(|e| {
                warn!("Retention sweep failed: {}", e);
                0
            }),
            None => 0,
        };
        let stats = store.stats().unwrap_or_else(|e| {
            warn!("Failed to read store stats: {}", e);
            StoreStats::default()
        });
        drop(store);

        let report = CollectionReport {
            collectors: outcomes,
            total_fetched: batch.len(),
            total_after_merge: stats.total_count,
            purged,
            stats,
        };

        info!(
            "Collection finished: {} fetched, {} records after merge, {} purged",
            report.total_fetched, report.total_after_merge, report.purged
        );
        for outcome in &report.collectors {
            info!("  {}: {}", outcome.name, outcome.fetched);
        }
        for (sources, count) in &report.stats.count_by_source_combination {
            info!("  [{}] {} records", sources, count);
        }

        Ok(report)
    }
}
