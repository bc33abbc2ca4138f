//! Engine composition root
//!
//! Wires capture -> flow table -> inference pool -> suppressor ->
//! {alert manager, flow writer, statistics}. Each stateful component has a
//! single writer task; cross-component interaction is message passing over
//! bounded channels. Shutdown is cooperative: the capture thread stops,
//! every live flow gets a final scoring pass, and the queues drain under a
//! deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{AlertManager, AlertSink, TracingSink};
use crate::capture::{PacketSource, Poll};
use crate::config::Config;
use crate::core::flow::{FlowKey, FlowSummary};
use crate::core::packet::PacketSummary;
use crate::features;
use crate::flow::{FlowTable, ScoreReason, ScoreRequest};
use crate::model::{InferencePool, ModelEnsemble, Prediction, Severity};
use crate::query::QuerySurface;
use crate::stats::StatisticsTracker;
use crate::store::{FlowDatabase, FlowWriter, FlowWriterHandle, PersistedFlow, StoreEvent};
use crate::suppress::{AdaptiveBaseline, FilterCascade, Verdict};

/// Engine drop/throughput counters
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub packets_ingested: AtomicU64,
    pub scores_submitted: AtomicU64,
    pub alerts_created: AtomicU64,
    pub alerts_deduplicated: AtomicU64,
    pub suppressed: AtomicU64,
    pub shutdown_dropped: AtomicU64,
}

struct ScoredFlow {
    request: ScoreRequest,
    prediction: Prediction,
}

/// Cloneable trigger for cooperative shutdown
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// A running detection engine
pub struct Engine {
    query: QuerySurface,
    counters: Arc<EngineCounters>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    main_task: Option<JoinHandle<()>>,
    capture_thread: std::thread::JoinHandle<()>,
}

impl Engine {
    /// Start the pipeline. The capture source and model ensemble are
    /// opened by the caller so their fatal startup errors (exit codes 77
    /// and 65) surface before any storage is touched.
    pub async fn start(
        config: Config,
        ensemble: Arc<ModelEnsemble>,
        source: Box<dyn PacketSource>,
    ) -> Result<Self> {
        let counters = Arc::new(EngineCounters::default());

        // Storage (fatal 74 on failure)
        let (store_event_tx, store_event_rx) = mpsc::channel::<StoreEvent>(4);
        let (store, writer_handle) = if config.database.enabled {
            let db = FlowDatabase::open(&config.database.directory)?;
            let handle = FlowWriter::start(db.clone(), config.database.clone(), store_event_tx);
            (Some(db), Some(handle))
        } else {
            (None, None)
        };

        let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(TracingSink)];
        let alerts = Arc::new(AlertManager::new(config.alerts.clone(), sinks)?);

        let stats = Arc::new(RwLock::new(StatisticsTracker::load(
            config.statistics.snapshot_path.clone(),
            wall_now(),
        )));

        let baseline = AdaptiveBaseline::load(config.detection.adaptive_baseline.clone());
        if baseline.enabled() {
            info!(
                learning = baseline.is_learning(),
                fingerprints = baseline.fingerprint_count(),
                "adaptive baseline ready"
            );
        }
        let cascade = FilterCascade::new(&config.detection, config.whitelist_networks(), baseline);

        let pool = InferencePool::new(
            ensemble,
            config.runtime.inference_workers,
            Duration::from_secs(config.runtime.inference_timeout_secs),
        );

        let flows_snapshot = Arc::new(RwLock::new(Vec::<FlowSummary>::new()));
        let query = QuerySurface::new(
            alerts.clone(),
            stats.clone(),
            flows_snapshot.clone(),
            store,
            writer_handle.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Capture thread: kernel reads must not share a runtime thread
        let (packet_tx, packet_rx) = mpsc::unbounded_channel::<PacketSummary>();
        let capture_shutdown = shutdown_rx.clone();
        let capture_thread = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || capture_loop(source, packet_tx, capture_shutdown))
            .expect("spawn capture thread");

        let table = FlowTable::new(
            config.detection.score_packet_interval,
            config.detection.flow_idle_timeout_secs,
            config.detection.max_flows,
        );
        let main = MainLoop {
            config,
            table,
            cascade,
            pool,
            alerts,
            stats,
            writer: writer_handle,
            flows_snapshot,
            counters: counters.clone(),
            in_flight: Arc::new(AtomicU64::new(0)),
            last_processed: HashMap::new(),
        };

        let main_task = tokio::spawn(main.run(packet_rx, store_event_rx, shutdown_rx));

        Ok(Self {
            query,
            counters,
            shutdown_tx: Arc::new(shutdown_tx),
            main_task: Some(main_task),
            capture_thread,
        })
    }

    pub fn query(&self) -> QuerySurface {
        self.query.clone()
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Request cooperative shutdown.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Cloneable trigger usable from a signal handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Wait for the pipeline to finish (source exhausted or shutdown
    /// requested). Safe to race against a signal handler.
    pub async fn done(&mut self) {
        if let Some(task) = self.main_task.take() {
            let _ = task.await;
        }
    }

    /// Wait for the pipeline, then join the capture thread.
    pub async fn join(mut self) -> Result<()> {
        self.done().await;
        let _ = self.capture_thread.join();
        Ok(())
    }
}

fn capture_loop(
    mut source: Box<dyn PacketSource>,
    tx: mpsc::UnboundedSender<PacketSummary>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match source.poll_packet() {
            Ok(Poll::Packet(pkt)) => {
                if tx.send(pkt).is_err() {
                    break;
                }
            }
            Ok(Poll::Idle) => continue,
            Ok(Poll::Finished) => break,
            Err(e) => {
                warn!("capture error: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    source.close();
    let stats = source.stats();
    info!(
        received = stats.received,
        parse_dropped = stats.parse_dropped,
        "capture stopped"
    );
    // Dropping tx closes the packet channel and unblocks the main loop
}

struct MainLoop {
    config: Config,
    table: FlowTable,
    cascade: FilterCascade,
    pool: InferencePool,
    alerts: Arc<AlertManager>,
    stats: Arc<RwLock<StatisticsTracker>>,
    writer: Option<FlowWriterHandle>,
    flows_snapshot: Arc<RwLock<Vec<FlowSummary>>>,
    counters: Arc<EngineCounters>,
    in_flight: Arc<AtomicU64>,
    /// Per-flow packet count of the last processed scoring event, so a
    /// stale out-of-order result never overwrites a newer one.
    last_processed: HashMap<FlowKey, u64>,
}

impl MainLoop {
    async fn run(
        mut self,
        mut packet_rx: mpsc::UnboundedReceiver<PacketSummary>,
        mut store_event_rx: mpsc::Receiver<StoreEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (scored_tx, mut scored_rx) = mpsc::channel::<ScoredFlow>(1024);

        let mut evict_tick = tokio::time::interval(Duration::from_secs(1));
        let mut persist_tick = tokio::time::interval(Duration::from_secs(
            self.config.statistics.snapshot_interval_secs.max(1),
        ));
        evict_tick.tick().await;
        persist_tick.tick().await;

        // Eviction clock: capture-relative nanoseconds, advanced by wall
        // time when traffic pauses.
        let mut last_packet_ns = 0u64;
        let mut last_packet_at = Instant::now();

        loop {
            tokio::select! {
                pkt = packet_rx.recv() => {
                    match pkt {
                        Some(pkt) => {
                            last_packet_ns = last_packet_ns.max(pkt.mono_ns);
                            last_packet_at = Instant::now();
                            self.counters.packets_ingested.fetch_add(1, Ordering::Relaxed);
                            for request in self.table.ingest(&pkt) {
                                self.submit(request, &scored_tx);
                            }
                        }
                        None => break, // capture ended
                    }
                }
                Some(scored) = scored_rx.recv() => {
                    self.handle_scored(scored).await;
                }
                Some(event) = store_event_rx.recv() => {
                    self.handle_store_event(event).await;
                }
                _ = evict_tick.tick() => {
                    let now_ns = last_packet_ns
                        + last_packet_at.elapsed().as_nanos() as u64;
                    for request in self.table.evict_idle(now_ns) {
                        self.submit(request, &scored_tx);
                    }
                    for request in self.table.evict_to_capacity() {
                        self.submit(request, &scored_tx);
                    }
                    *self.flows_snapshot.write() = self.table.snapshot();
                }
                _ = persist_tick.tick() => {
                    self.persist_sidecars();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(scored_tx, scored_rx).await;
    }

    /// Final scoring for every live flow, then bounded queue draining.
    async fn drain(
        mut self,
        scored_tx: mpsc::Sender<ScoredFlow>,
        mut scored_rx: mpsc::Receiver<ScoredFlow>,
    ) {
        info!(flows = self.table.len(), "shutdown: finalizing flows");
        for request in self.table.drain_all() {
            self.submit(request, &scored_tx);
        }
        drop(scored_tx);

        let deadline =
            Instant::now() + Duration::from_secs(self.config.runtime.shutdown_deadline_secs);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let dropped = self.in_flight.load(Ordering::Acquire);
                self.counters
                    .shutdown_dropped
                    .fetch_add(dropped, Ordering::Relaxed);
                warn!(dropped, "shutdown deadline reached, dropping in-flight work");
                break;
            }
            match tokio::time::timeout(remaining, scored_rx.recv()).await {
                Ok(Some(scored)) => self.handle_scored(scored).await,
                Ok(None) => {
                    // Channel closed; any stragglers decrement in_flight as
                    // their sends fail.
                    if self.in_flight.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(_) => {}
            }
        }

        *self.flows_snapshot.write() = Vec::new();
        self.persist_sidecars();
        if let Some(writer) = &self.writer {
            writer.shutdown().await;
        }
        info!("engine stopped");
    }

    fn submit(&self, request: ScoreRequest, scored_tx: &mpsc::Sender<ScoredFlow>) {
        self.counters.scores_submitted.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let pool = self.pool.clone();
        let tx = scored_tx.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let prediction = pool.score(&request.snapshot).await;
            if tx.send(ScoredFlow { request, prediction }).await.is_err() {
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        });
    }

    async fn handle_scored(&mut self, scored: ScoredFlow) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        let snapshot = &scored.request.snapshot;
        let prediction = &scored.prediction;

        // Per-flow ordering: skip results older than one already handled
        let newest = self
            .last_processed
            .get(&snapshot.key)
            .copied()
            .unwrap_or(0);
        if snapshot.packet_count < newest {
            debug!(key = %snapshot.key, "skipping stale scoring result");
            return;
        }
        self.last_processed
            .insert(snapshot.key.clone(), snapshot.packet_count);

        let verdict = self.cascade.evaluate(snapshot, prediction);
        let now = wall_now();

        let emitted = match verdict {
            Verdict::Emit => {
                let context = format!(
                    "Packets: {}, Rate: {:.2}/s",
                    snapshot.packet_count,
                    snapshot.packet_rate()
                );
                let (id, created) = self
                    .alerts
                    .ingest(&snapshot.key, prediction, context, snapshot.packet_count, now)
                    .await;
                if created {
                    self.counters.alerts_created.fetch_add(1, Ordering::Relaxed);
                    if let Some(alert) = self.alerts.get(id) {
                        self.stats.write().record(&alert, now);
                    }
                } else {
                    self.counters
                        .alerts_deduplicated
                        .fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            Verdict::Suppress(reason) => {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %snapshot.key,
                    label = %prediction.label,
                    reason = reason.as_str(),
                    "suppressed detection"
                );
                false
            }
        };

        // One durable row per flow, written at its final scoring pass
        if scored.request.reason == ScoreReason::Final {
            if let Some(writer) = &self.writer {
                let features = features::extract(snapshot);
                writer.record(PersistedFlow::from_scoring(
                    snapshot, features, prediction, emitted, now,
                ));
            }
            self.last_processed.remove(&snapshot.key);
        }
    }

    async fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::BypassEntered {
                consecutive_failures,
            } => {
                self.alerts
                    .operational(
                        "StorageDegraded",
                        Severity::High,
                        format!(
                            "flow store entered bypass mode after {consecutive_failures} consecutive write failures"
                        ),
                    )
                    .await;
            }
        }
    }

    fn persist_sidecars(&self) {
        if let Err(e) = self.stats.read().save() {
            warn!("failed to persist statistics: {e}");
        }
        if self.cascade.baseline().enabled() {
            if let Err(e) = self.cascade.baseline().save() {
                warn!("failed to persist baseline: {e}");
            }
        }
    }
}

fn wall_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
