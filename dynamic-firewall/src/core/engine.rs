/*!
Engine that owns the record store and schedules collection and reconciliation
*/

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use threat_database::{RecordStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

use crate::backends::build_backends;
use crate::collectors::build_collectors;
use crate::core::collection::{CollectionPipeline, CollectionReport};
use crate::core::config::FirewallConfig;
use crate::core::reconciliation::{ReconciliationPipeline, ReconciliationReport};
use crate::core::shared_store;

/// Roughly thirty years, as far ahead as a tick is ever scheduled
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Where the engine is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Collecting,
    Reconciling,
    /// Between scheduled runs
    Waiting,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Collecting => "collecting",
            EngineState::Reconciling => "reconciling",
            EngineState::Waiting => "waiting",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of one collect-then-reconcile pass.
#[derive(Debug)]
pub struct CycleReport {
    pub collection: Result<CollectionReport, StoreError>,
    pub reconciliation: ReconciliationReport,
}

impl CycleReport {
    /// The store rejected the batch, or every backend failed.
    pub fn is_failure(&self) -> bool {
        self.collection.is_err() || self.reconciliation.is_total_failure()
    }
}

pub struct Engine {
    collection: Arc<CollectionPipeline>,
    reconciliation: Arc<ReconciliationPipeline>,
    interval: Duration,
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    job_handles: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        collection: CollectionPipeline,
        reconciliation: ReconciliationPipeline,
        interval: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            collection: Arc::new(collection),
            reconciliation: Arc::new(reconciliation),
            interval,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            job_handles: Vec::new(),
        }
    }

    /// Open the store and register the configured collectors and backends.
    ///
    /// Failing to open the store is the one error that aborts startup;
    /// collectors or backends that cannot be built are logged and left out.
    pub fn from_config(config: &FirewallConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let global = &config.global;

        if let Some(parent) = global.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = shared_store(RecordStore::open(&global.db_path)?);

        let collectors = build_collectors(&config.collectors, global.fetch_timeout());
        let backends = build_backends(&config.backends, global.fetch_timeout());
        if collectors.is_empty() {
            warn!("No collectors enabled");
        }
        if backends.is_empty() {
            warn!("No backends enabled");
        }

        let collection = CollectionPipeline::new(
            collectors,
            store.clone(),
            global.fetch_timeout(),
            global.retention(),
        );
        let reconciliation = ReconciliationPipeline::new(
            backends,
            store,
            global.min_score,
            global.fetch_timeout(),
        );

        info!("Engine initialized successfully");
        Ok(Self::new(collection, reconciliation, global.update_interval()))
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_scheduled(&self) -> bool {
        !self.job_handles.is_empty()
    }

    /// Collect, then reconcile, once.
    pub async fn run_once(&self) -> CycleReport {
        info!("Running one-time collection and sync...");
        let collection = collect(&self.collection, &self.state_tx).await;
        let reconciliation = reconcile(&self.reconciliation, &self.state_tx).await;
        info!("One-time run completed");

        CycleReport {
            collection,
            reconciliation,
        }
    }

    /// Run a full cycle now, then keep both jobs running every interval.
    ///
    /// The collection and reconciliation jobs are scheduled independently, so a
    /// reconciliation may see data from before or after the latest collection.
    ///
    /// Returns `None` without running anything once the engine has been stopped.
    pub async fn start(&mut self) -> Option<CycleReport> {
        if self.state() == EngineState::Stopped {
            warn!("Engine already stopped, not starting again");
            return None;
        }

        info!("🚀 Starting dynamic-firewall engine...");
        let report = self.run_once().await;

        if self.is_scheduled() {
            return Some(report);
        }

        let collection = Arc::clone(&self.collection);
        let state_tx = Arc::clone(&self.state_tx);
        self.job_handles.push(tokio::spawn(run_job(
            "collect_ips",
            self.interval,
            self.shutdown_tx.subscribe(),
            move || {
                let collection = Arc::clone(&collection);
                let state_tx = Arc::clone(&state_tx);
                async move {
                    let _ = collect(&collection, &state_tx).await;
                }
            },
        )));

        let reconciliation = Arc::clone(&self.reconciliation);
        let state_tx = Arc::clone(&self.state_tx);
        self.job_handles.push(tokio::spawn(run_job(
            "sync_firewalls",
            self.interval,
            self.shutdown_tx.subscribe(),
            move || {
                let reconciliation = Arc::clone(&reconciliation);
                let state_tx = Arc::clone(&state_tx);
                async move {
                    reconcile(&reconciliation, &state_tx).await;
                }
            },
        )));

        info!("⏰ Scheduler started (interval: {}s)", self.interval.as_secs());
        Some(report)
    }

    /// Stop scheduling and wait for any job that is mid-run to finish.
    pub async fn shutdown(&mut self) {
        if self.state() == EngineState::Stopped && self.job_handles.is_empty() {
            return;
        }

        info!("🛑 Initiating graceful shutdown...");
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut self.job_handles);
        if !handles.is_empty() {
            info!("Waiting for {} jobs to finish", handles.len());
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Job ended abnormally during shutdown: {}", e);
            }
        }

        self.state_tx.send_replace(EngineState::Stopped);
        info!("✅ Engine stopped");
    }
}

async fn collect(
    pipeline: &CollectionPipeline,
    state_tx: &watch::Sender<EngineState>,
) -> Result<CollectionReport, StoreError> {
    enter(state_tx, EngineState::Collecting);
    let result = pipeline.run().await;
    if let Err(e) = &result {
        error!("Collection cycle failed: {}", e);
    }
    leave(state_tx, EngineState::Collecting);
    result
}

async fn reconcile(
    pipeline: &ReconciliationPipeline,
    state_tx: &watch::Sender<EngineState>,
) -> ReconciliationReport {
    enter(state_tx, EngineState::Reconciling);
    let report = pipeline.run().await;
    leave(state_tx, EngineState::Reconciling);
    report
}

fn enter(state_tx: &watch::Sender<EngineState>, phase: EngineState) {
    state_tx.send_if_modified(|state| {
        if *state == EngineState::Stopped {
            return false;
        }
        *state = phase;
        true
    });
}

/// Back to waiting, unless the other job has taken over the state meanwhile.
fn leave(state_tx: &watch::Sender<EngineState>, phase: EngineState) {
    state_tx.send_if_modified(|state| {
        if *state != phase {
            return false;
        }
        *state = EngineState::Waiting;
        true
    });
}

/// Fire `job` every `period`, first one `period` from now, until shutdown.
///
/// Shutdown is only observed between runs, so a run in progress always
/// completes. Late ticks are delayed rather than bunched up.
async fn run_job<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let now = Instant::now();
    let first_tick = now.checked_add(period).unwrap_or_else(|| {
        warn!("Job {} period {:?} is out of range, first run pushed to the far future", name, period);
        now + FAR_FUTURE
    });
    let mut timer = tokio::time::interval_at(first_tick, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(timer);

    if *shutdown_rx.borrow_and_update() {
        return;
    }

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            Some(_) = ticks.next() => {
                debug!("Job {} fired", name);
                job().await;
            }
        }
    }

    debug!("Job {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Backend, BackendError};
    use crate::collectors::{Collector, CollectorError};
    use crate::core::SharedStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use threat_database::CollectedEntry;

    struct CountingCollector {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Collector for CountingCollector {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch(&self) -> Result<Vec<CollectedEntry>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![CollectedEntry::new("192.0.2.44", "counting", 5, Utc::now())])
        }
    }

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn group_name(&self) -> &str {
            "blocklist"
        }

        async fn converge(&self, _group_name: &str, _target_ips: &[String]) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(
        interval: Duration,
        delay: Duration,
    ) -> (Engine, Arc<CountingCollector>, Arc<CountingBackend>, SharedStore) {
        let store = shared_store(RecordStore::open_in_memory().unwrap());
        let collector = Arc::new(CountingCollector {
            calls: AtomicUsize::new(0),
            delay,
        });
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });

        let collection = CollectionPipeline::new(
            vec![collector.clone()],
            store.clone(),
            Duration::from_secs(5),
            None,
        );
        let reconciliation =
            ReconciliationPipeline::new(vec![backend.clone()], store.clone(), 1, Duration::from_secs(5));

        (Engine::new(collection, reconciliation, interval), collector, backend, store)
    }

    #[tokio::test]
    async fn test_run_once_collects_then_reconciles() {
        let (engine, collector, backend, store) = engine(Duration::from_secs(3600), Duration::ZERO);

        let report = engine.run_once().await;

        assert!(!report.is_failure());
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.reconciliation.target_count, 1);
        assert!(store.lock().await.get("192.0.2.44").unwrap().is_some());
        assert!(!engine.is_scheduled());
        assert_eq!(engine.state(), EngineState::Waiting);
    }

    #[tokio::test]
    async fn test_start_runs_immediately_then_on_interval() {
        let (mut engine, collector, backend, _store) =
            engine(Duration::from_millis(50), Duration::ZERO);

        engine.start().await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert!(engine.is_scheduled());

        tokio::time::sleep(Duration::from_millis(180)).await;
        engine.shutdown().await;

        assert!(collector.calls.load(Ordering::SeqCst) >= 3);
        assert!(backend.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_scheduled());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_run() {
        let (mut engine, collector, _backend, _store) =
            engine(Duration::from_millis(20), Duration::from_millis(150));

        engine.start().await;
        // Let the scheduled collection start and block inside fetch
        tokio::time::sleep(Duration::from_millis(60)).await;
        let started = collector.calls.load(Ordering::SeqCst);
        assert!(started >= 2);

        engine.shutdown().await;
        let after_shutdown = collector.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), after_shutdown);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (mut engine, _collector, _backend, _store) =
            engine(Duration::from_secs(3600), Duration::ZERO);

        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_engine_cannot_be_restarted() {
        let (mut engine, collector, _backend, _store) =
            engine(Duration::from_millis(20), Duration::ZERO);

        assert!(engine.start().await.is_some());
        engine.shutdown().await;
        let calls = collector.calls.load(Ordering::SeqCst);

        assert!(engine.start().await.is_none());
        assert!(!engine.is_scheduled());
        engine.shutdown().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collector.calls.load(Ordering::SeqCst), calls);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_out_of_range_interval_keeps_jobs_waiting() {
        let (mut engine, collector, _backend, _store) =
            engine(Duration::from_secs(u64::MAX), Duration::ZERO);

        engine.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.job_handles.iter().all(|handle| !handle.is_finished()));
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_leave_keeps_other_phase() {
        let (tx, rx) = watch::channel(EngineState::Idle);
        enter(&tx, EngineState::Collecting);
        enter(&tx, EngineState::Reconciling);
        leave(&tx, EngineState::Collecting);
        assert_eq!(*rx.borrow(), EngineState::Reconciling);
        leave(&tx, EngineState::Reconciling);
        assert_eq!(*rx.borrow(), EngineState::Waiting);
    }
}
