// src/ingest/scheduler.rs
//! Scheduler/driver: fetch -> normalize -> dedup -> dispatch on a fixed period.
//!
//! Cycles never overlap: the loop awaits each cycle before the next tick, and
//! ticks missed while a cycle ran long are skipped. Every cycle runs in its own
//! task, so a panic inside it is reported like any other cycle error.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::dedup::{new_deals, DedupAborted, DedupFilter};
use crate::ingest::ensure_metrics_described;
use crate::ingest::normalize::normalize_batch;
use crate::ingest::types::{FeedSource, FetchError, RawEntry};
use crate::notify::operator::{AlertKind, OperatorAlerts};
use crate::notify::{DispatchReport, Dispatcher};
use crate::shutdown::ShutdownSignal;
use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Normalizing,
    Filtering,
    Dispatching,
    Stopped,
}

/// A feed that failed while others answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceError {
    pub source: String,
    pub message: String,
}

/// Observability record of one cycle. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub fetched: usize,
    pub source_errors: Vec<SourceError>,
    pub skipped: usize,
    pub new: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub suspended: usize,
    pub cancelled: usize,
    pub committed: usize,
    pub pruned: u64,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            fetched: 0,
            source_errors: Vec::new(),
            skipped: 0,
            new: 0,
            delivered: 0,
            dropped: 0,
            suspended: 0,
            cancelled: 0,
            committed: 0,
            pruned: 0,
            duration_ms: 0,
        }
    }

    fn absorb(&mut self, d: &DispatchReport) {
        self.delivered += d.delivered;
        self.dropped += d.dropped;
        self.suspended += d.suspended;
        self.cancelled += d.cancelled;
        self.committed += d.completed_ids.len();
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Fetch(e) if e.is_transient() => "fetch_transient",
            CycleError::Fetch(_) => "fetch_permanent",
            CycleError::Store(_) => "store",
            CycleError::Panicked(_) => "panic",
        }
    }

    fn alert_kind(&self) -> AlertKind {
        match self {
            CycleError::Fetch(_) => AlertKind::Fetch,
            CycleError::Store(_) => AlertKind::Store,
            CycleError::Panicked(_) => AlertKind::Panic,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub at: DateTime<Utc>,
    pub kind: &'static str,
    pub message: String,
}

/// What `/status` shows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub phase: CyclePhase,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<LastError>,
}

pub type SharedStatus = Arc<RwLock<SchedulerStatus>>;

/// One fetch/dispatch pass over injected collaborators.
pub struct Pipeline {
    sources: Vec<Arc<dyn FeedSource>>,
    store: Arc<dyn StateStore>,
    dedup: DedupFilter,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    retention: Option<chrono::Duration>,
    status: SharedStatus,
}

impl Pipeline {
    pub fn new(
        sources: Vec<Arc<dyn FeedSource>>,
        store: Arc<dyn StateStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sources,
            dedup: DedupFilter::new(Arc::clone(&store)),
            store,
            dispatcher,
            clock,
            retention: None,
            status: SharedStatus::default(),
        }
    }

    /// Committed seen ids older than `days` are pruned after each cycle. 0 keeps everything.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = (days > 0).then(|| chrono::Duration::days(i64::from(days)));
        self
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .phase = phase;
    }

    /// Fetches every source in turn. A failing source is logged and reported
    /// while the others still count; the cycle fails only if none answered.
    async fn fetch_all(&self, report: &mut CycleReport) -> Result<Vec<RawEntry>, FetchError> {
        let mut entries = Vec::new();
        let mut answered = 0usize;
        let mut first_err = None;

        for source in &self.sources {
            match source.fetch_latest().await {
                Ok(batch) => {
                    answered += 1;
                    entries.extend(batch);
                }
                Err(e) => {
                    warn!(target: "ingest", source = source.name(), error = %e, "feed fetch failed");
                    counter!("deal_source_errors_total", "source" => source.name().to_string())
                        .increment(1);
                    report.source_errors.push(SourceError {
                        source: source.name().to_string(),
                        message: e.to_string(),
                    });
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) if answered == 0 => Err(e),
            _ => Ok(entries),
        }
    }

    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> Result<CycleReport, CycleError> {
        ensure_metrics_described();
        let t0 = Instant::now();
        let mut report = CycleReport::new(self.clock.now());

        self.set_phase(CyclePhase::Fetching);
        let raw = self.fetch_all(&mut report).await?;
        report.fetched = raw.len();
        counter!("deal_fetched_total").increment(raw.len() as u64);

        self.set_phase(CyclePhase::Normalizing);
        let (deals, skipped) = normalize_batch(&raw);
        report.skipped = skipped;
        counter!("deal_skipped_total").increment(skipped as u64);

        // Read before anything is reserved: a failure here leaves the seen-set untouched.
        let subscribers = self.store.active_subscribers().await?;

        self.set_phase(CyclePhase::Filtering);
        let (fresh, aborted) = match self.dedup.filter(deals, self.clock.now()).await {
            Ok(classified) => (new_deals(classified), None),
            Err(DedupAborted { reserved, source }) => (reserved, Some(source)),
        };
        report.new = fresh.len();
        counter!("deal_new_total").increment(fresh.len() as u64);

        let mut commit_failed = None;
        if !fresh.is_empty() {
            self.set_phase(CyclePhase::Dispatching);
            let dispatched = self
                .dispatcher
                .dispatch_batch(&fresh, &subscribers, shutdown)
                .await;
            report.absorb(&dispatched);
            if !dispatched.completed_ids.is_empty() {
                if let Err(e) = self
                    .store
                    .commit_seen(&dispatched.completed_ids, self.clock.now())
                    .await
                {
                    report.committed = 0;
                    commit_failed = Some(e);
                }
            }
        }

        // Reserved deals were dispatched above; only now surface the store failure.
        if let Some(e) = aborted.or(commit_failed) {
            return Err(CycleError::Store(e));
        }

        if let Some(keep) = self.retention {
            let pruned = self.store.prune_seen_before(self.clock.now() - keep).await?;
            report.pruned = pruned;
            counter!("deal_seen_pruned_total").increment(pruned);
        }

        report.duration_ms = t0.elapsed().as_millis() as u64;
        counter!("deal_cycles_total").increment(1);
        histogram!("deal_cycle_duration_ms").record(report.duration_ms as f64);
        gauge!("deal_pipeline_last_run_ts").set(self.clock.now().timestamp() as f64);

        info!(
            target: "ingest",
            sources = self.sources.len(),
            failed_sources = report.source_errors.len(),
            fetched = report.fetched,
            skipped = report.skipped,
            new = report.new,
            delivered = report.delivered,
            dropped = report.dropped,
            "cycle finished"
        );
        Ok(report)
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    interval: Duration,
    alerts: Option<Arc<OperatorAlerts>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<OperatorAlerts>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn status(&self) -> SharedStatus {
        self.pipeline.status()
    }

    /// Runs one isolated cycle and records its outcome.
    pub async fn run_once(&self, shutdown: &ShutdownSignal) -> Result<CycleReport, CycleError> {
        let pipeline = Arc::clone(&self.pipeline);
        let signal = shutdown.clone();
        let result = match tokio::spawn(async move { pipeline.run_cycle(&signal).await }).await {
            Ok(r) => r,
            Err(e) => Err(CycleError::Panicked(panic_message(e))),
        };
        self.record(&result).await;
        result
    }

    async fn record(&self, result: &Result<CycleReport, CycleError>) {
        let now = self.pipeline.clock.now();
        match result {
            Ok(report) => {
                {
                    let mut st = self.pipeline.status.write().unwrap_or_else(|e| e.into_inner());
                    st.phase = CyclePhase::Idle;
                    st.cycles_ok += 1;
                    st.consecutive_failures = 0;
                    st.last_report = Some(report.clone());
                }
                if let Some(alerts) = &self.alerts {
                    if report.source_errors.is_empty() {
                        alerts.clear(AlertKind::Fetch);
                    } else {
                        let failed: Vec<String> = report
                            .source_errors
                            .iter()
                            .map(|e| format!("{}: {}", e.source, e.message))
                            .collect();
                        alerts
                            .alert(AlertKind::Fetch, &format!("feeds failing: {}", failed.join("; ")))
                            .await;
                    }
                    alerts.clear(AlertKind::Store);
                    alerts.clear(AlertKind::Panic);
                }
            }
            Err(e) => {
                counter!("deal_cycle_errors_total", "kind" => e.kind()).increment(1);
                match e {
                    CycleError::Fetch(f) if f.is_transient() => {
                        warn!(target: "ingest", error = %e, "cycle skipped, will retry next tick")
                    }
                    _ => error!(target: "ingest", kind = e.kind(), error = %e, "cycle failed"),
                }
                {
                    let mut st = self.pipeline.status.write().unwrap_or_else(|e| e.into_inner());
                    st.phase = CyclePhase::Idle;
                    st.cycles_failed += 1;
                    st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                    st.last_error = Some(LastError {
                        at: now,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                if let Some(alerts) = &self.alerts {
                    alerts.alert(e.alert_kind(), &e.to_string()).await;
                }
            }
        }
    }

    /// Loops until `shutdown` fires. The in-flight cycle always runs to its
    /// end; afterwards the store is closed and the phase becomes `Stopped`.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        ensure_metrics_described();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target: "ingest", interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            if shutdown.run_until(ticker.tick()).await.is_none() {
                break;
            }
            let _ = self.run_once(&shutdown).await;
        }

        self.pipeline.set_phase(CyclePhase::Stopped);
        match self.pipeline.store.close().await {
            Ok(()) => info!(target: "ingest", "scheduler stopped, store closed"),
            Err(e) => error!(target: "store", error = %e, "closing store failed"),
        }
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_alerts() {
        let transient = CycleError::Fetch(FetchError::Transient("timeout".into()));
        assert_eq!(transient.kind(), "fetch_transient");
        assert_eq!(transient.alert_kind(), AlertKind::Fetch);
        let store = CycleError::Store(StoreError::Closed);
        assert_eq!(store.kind(), "store");
        assert_eq!(store.alert_kind(), AlertKind::Store);
        assert_eq!(CycleError::Panicked("x".into()).alert_kind(), AlertKind::Panic);
    }

    #[tokio::test]
    async fn panic_payload_is_extracted() {
        let err = tokio::spawn(async { panic!("feed exploded") })
            .await
            .unwrap_err();
        assert_eq!(panic_message(err), "feed exploded");
    }
}
