/*!
Reconciliation pipeline: push the qualifying address set to every firewall backend
*/

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::backends::Backend;
use crate::core::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutcome {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub target_count: usize,
    /// Backends were not contacted because there was nothing to push
    pub skipped: bool,
    pub backends: Vec<BackendOutcome>,
}

impl ReconciliationReport {
    pub fn succeeded(&self) -> usize {
        self.backends.iter().filter(|b| b.success).count()
    }

    pub fn failed(&self) -> usize {
        self.backends.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// Some backends converged and some did not.
    pub fn is_partial_failure(&self) -> bool {
        self.succeeded() > 0 && self.failed() > 0
    }

    /// Every contacted backend failed.
    pub fn is_total_failure(&self) -> bool {
        !self.backends.is_empty() && self.succeeded() == 0
    }
}

pub struct ReconciliationPipeline {
    backends: Vec<Arc<dyn Backend>>,
    store: SharedStore,
    min_score: u32,
    converge_timeout: Duration,
}

impl ReconciliationPipeline {
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        store: SharedStore,
        min_score: u32,
        converge_timeout: Duration,
    ) -> Self {
        Self {
            backends,
            store,
            min_score,
            converge_timeout,
        }
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Converge every enabled backend to the current qualifying address set.
    ///
    /// The set is read once. When it is empty, whether because the store holds
    /// nothing qualifying or because the read failed, no backend is contacted:
    /// pushing an empty group would unblock everything.
    pub async fn run(&self) -> ReconciliationReport {
        info!("Starting firewall sync cycle...");

        let targets = {
            let store = self.store.lock().await;
            store.qualifying_ips(self.min_score).unwrap_or_else(|e| {
                error!("Failed to read qualifying IPs: {}", e);
                Vec::new()
            })
        };

        if targets.is_empty() {
            warn!(
                "No IPs to sync (min_score={}), leaving {} backends untouched",
                self.min_score,
                self.backends.len()
            );
            return ReconciliationReport {
                target_count: 0,
                skipped: true,
                backends: Vec::new(),
            };
        }

        info!("Syncing {} IPs to firewalls...", targets.len());
        let target_count = targets.len();
        let targets = Arc::new(targets);

        let (names, tasks): (Vec<String>, Vec<_>) = self
            .backends
            .iter()
            .filter(|backend| backend.is_enabled())
            .map(|backend| {
                let backend = Arc::clone(backend);
                let targets = Arc::clone(&targets);
                let timeout = self.converge_timeout;
                let name = backend.name().to_string();
                let task = tokio::spawn(async move {
                    tokio::time::timeout(timeout, backend.converge(backend.group_name(), &targets))
                        .await
                });
                (name, task)
            })
            .unzip();

        let mut outcomes = Vec::with_capacity(names.len());
        for (name, result) in names.into_iter().zip(join_all(tasks).await) {
            let error = match result {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(_)) => Some(format!("timed out after {:?}", self.converge_timeout)),
                Err(e) => Some(e.to_string()),
            };

            match &error {
                None => info!("Successfully synced to {}", name),
                Some(e) => error!("Failed to sync to {}: {}", name, e),
            }

            outcomes.push(BackendOutcome {
                name,
                success: error.is_none(),
                error,
            });
        }

        let report = ReconciliationReport {
            target_count,
            skipped: false,
            backends: outcomes,
        };

        if report.is_partial_failure() {
            warn!(
                "Firewall sync partially failed: {} of {} backends synced",
                report.succeeded(),
                report.backends.len()
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendError;
    use crate::core::shared_store;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use threat_database::{CollectedEntry, RecordStore};

    struct RecordingBackend {
        name: &'static str,
        fail: bool,
        pushes: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingBackend {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                pushes: Mutex::new(Vec::new()),
            })
        }

        fn pushes(&self) -> Vec<(String, Vec<String>)> {
            self.pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn group_name(&self) -> &str {
            "blocklist"
        }

        async fn converge(&self, group_name: &str, target_ips: &[String]) -> Result<(), BackendError> {
            self.pushes
                .lock()
                .unwrap()
                .push((group_name.to_string(), target_ips.to_vec()));
            if self.fail {
                return Err(BackendError::Api("gateway rejected update".into()));
            }
            Ok(())
        }
    }

    async fn seeded_store(entries: &[(&str, u32)]) -> SharedStore {
        let store = shared_store(RecordStore::open_in_memory().unwrap());
        let now = Utc::now();
        let batch: Vec<_> = entries
            .iter()
            .map(|(ip, score)| CollectedEntry::new(*ip, "feed", *score, now))
            .collect();
        store.lock().await.upsert_batch(&batch).unwrap();
        store
    }

    #[tokio::test]
    async fn test_pushes_qualifying_set_to_every_backend() {
        let store = seeded_store(&[("10.0.0.1", 9), ("10.0.0.2", 2), ("10.0.0.3", 3)]).await;
        let first = RecordingBackend::new("first", false);
        let second = RecordingBackend::new("second", false);
        let pipeline = ReconciliationPipeline::new(
            vec![first.clone(), second.clone()],
            store,
            3,
            Duration::from_secs(5),
        );

        let report = pipeline.run().await;

        assert!(report.all_succeeded());
        assert_eq!(report.target_count, 2);
        let expected = vec![(
            "blocklist".to_string(),
            vec!["10.0.0.1".to_string(), "10.0.0.3".to_string()],
        )];
        assert_eq!(first.pushes(), expected);
        assert_eq!(second.pushes(), expected);
    }

    #[tokio::test]
    async fn test_empty_set_never_reaches_backends() {
        let store = seeded_store(&[("10.0.0.2", 2)]).await;
        let backend = RecordingBackend::new("gateway", false);
        let pipeline =
            ReconciliationPipeline::new(vec![backend.clone()], store, 3, Duration::from_secs(5));

        let report = pipeline.run().await;

        assert!(report.skipped);
        assert!(report.backends.is_empty());
        assert!(backend.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_store_read_failure_never_reaches_backends() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ips.db");
        let store = shared_store(RecordStore::open(&db_path).unwrap());
        store
            .lock()
            .await
            .upsert_batch(&[CollectedEntry::new("10.0.0.1", "feed", 9, Utc::now())])
            .unwrap();

        // The table disappears underneath the open store, so the read fails
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("DROP TABLE ip_records")
            .unwrap();
        assert!(store.lock().await.qualifying_ips(1).is_err());

        let backend = RecordingBackend::new("gateway", false);
        let pipeline =
            ReconciliationPipeline::new(vec![backend.clone()], store, 1, Duration::from_secs(5));

        let report = pipeline.run().await;

        assert!(report.skipped);
        assert_eq!(report.target_count, 0);
        assert!(report.backends.is_empty());
        assert!(backend.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_backend_is_partial_failure() {
        let store = seeded_store(&[("198.51.100.9", 10)]).await;
        let broken = RecordingBackend::new("broken", true);
        let healthy = RecordingBackend::new("healthy", false);
        let pipeline = ReconciliationPipeline::new(
            vec![broken.clone(), healthy.clone()],
            store,
            1,
            Duration::from_secs(5),
        );

        let report = pipeline.run().await;

        assert!(report.is_partial_failure());
        assert!(!report.is_total_failure());
        assert_eq!(healthy.pushes().len(), 1);
        let healthy_outcome = report.backends.iter().find(|b| b.name == "healthy").unwrap();
        assert!(healthy_outcome.success);
        let broken_outcome = report.backends.iter().find(|b| b.name == "broken").unwrap();
        assert!(!broken_outcome.success);
        assert!(broken_outcome.error.as_deref().unwrap().contains("gateway rejected"));
    }

    #[tokio::test]
    async fn test_repeated_runs_push_identical_lists() {
        let store = seeded_store(&[("203.0.113.1", 5), ("203.0.113.2", 6)]).await;
        let backend = RecordingBackend::new("gateway", false);
        let pipeline =
            ReconciliationPipeline::new(vec![backend.clone()], store, 1, Duration::from_secs(5));

        pipeline.run().await;
        pipeline.run().await;

        let pushes = backend.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0], pushes[1]);
    }
}
