//! Decoupled flow store writer
//!
//! Scoring hands records to a bounded queue and never waits on storage.
//! The writer batches inserts, sweeps retention hourly, and after repeated
//! write failures flips to bypass mode: records are accepted and
//! discarded, capture and scoring stay live, and one operational event is
//! emitted upstream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::model::BENIGN_LABEL;

use super::{FlowDatabase, PersistedFlow};

/// Queue bound between scoring and the writer
const QUEUE_CAPACITY: usize = 10_000;
/// Flush when this many records are buffered
const FLUSH_BATCH: usize = 200;
/// Or at least this often
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Retention sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// Consecutive failures within the window before bypass
const BYPASS_FAILURES: u32 = 5;
const BYPASS_WINDOW: Duration = Duration::from_secs(60);

/// Events the writer reports upstream
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The store gave up after repeated failures; records are now discarded
    BypassEntered { consecutive_failures: u32 },
}

enum WriterMessage {
    Record(Box<PersistedFlow>),
    Flush,
    Shutdown,
}

/// Cloneable handle for submitting records
#[derive(Clone)]
pub struct FlowWriterHandle {
    tx: mpsc::Sender<WriterMessage>,
    config: Arc<DatabaseConfig>,
    saved: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    filtered: Arc<AtomicU64>,
    bypass: Arc<AtomicBool>,
}

impl FlowWriterHandle {
    /// Submit a scored flow. Applies the ingest filters; on queue overflow
    /// the record is dropped with a counter, never blocking the caller.
    pub fn record(&self, flow: PersistedFlow) {
        let benign = flow.predicted_label == BENIGN_LABEL;
        if benign && !self.config.save_benign_flows {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !benign && !self.config.save_attack_flows {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if flow.confidence < self.config.min_confidence_to_save {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.tx.try_send(WriterMessage::Record(Box::new(flow))).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Force a flush of buffered records
    pub async fn flush(&self) {
        let _ = self.tx.send(WriterMessage::Flush).await;
    }

    /// Drain and stop the writer
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriterMessage::Shutdown).await;
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Degraded accept-and-discard state
    pub fn is_bypass(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }
}

/// The writer task
pub struct FlowWriter {
    db: FlowDatabase,
    config: Arc<DatabaseConfig>,
    buffer: Vec<PersistedFlow>,
    saved: Arc<AtomicU64>,
    bypass: Arc<AtomicBool>,
    consecutive_failures: u32,
    failure_window_start: Option<Instant>,
    event_tx: mpsc::Sender<StoreEvent>,
}

impl FlowWriter {
    /// Spawn the writer task and return its handle.
    pub fn start(
        db: FlowDatabase,
        config: DatabaseConfig,
        event_tx: mpsc::Sender<StoreEvent>,
    ) -> FlowWriterHandle {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let config = Arc::new(config);

        let saved = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let filtered = Arc::new(AtomicU64::new(0));
        let bypass = Arc::new(AtomicBool::new(false));

        let handle = FlowWriterHandle {
            tx,
            config: config.clone(),
            saved: saved.clone(),
            dropped,
            filtered,
            bypass: bypass.clone(),
        };

        let writer = Self {
            db,
            config,
            buffer: Vec::with_capacity(FLUSH_BATCH),
            saved,
            bypass,
            consecutive_failures: 0,
            failure_window_start: None,
            event_tx,
        };

        tokio::spawn(writer.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WriterMessage>) {
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick of an interval fires immediately
        flush_tick.tick().await;
        sweep_tick.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(WriterMessage::Record(flow)) => {
                            self.buffer.push(*flow);
                            if self.buffer.len() >= FLUSH_BATCH {
                                self.flush().await;
                            }
                        }
                        Some(WriterMessage::Flush) => self.flush().await,
                        Some(WriterMessage::Shutdown) | None => {
                            info!("flow writer shutting down, flushing {} records", self.buffer.len());
                            self.flush().await;
                            break;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                }
                _ = sweep_tick.tick() => {
                    self.sweep();
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.bypass.load(Ordering::Relaxed) {
            self.buffer.clear();
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        match self.db.insert_batch(&batch) {
            Ok(written) => {
                self.saved.fetch_add(written, Ordering::Relaxed);
                self.consecutive_failures = 0;
                self.failure_window_start = None;
                debug!(written, "flushed flow records");
            }
            Err(e) => {
                // The batch is lost; no retry queue
                warn!("flow store write failed: {e}");
                let now = Instant::now();
                match self.failure_window_start {
                    Some(start) if now.duration_since(start) <= BYPASS_WINDOW => {
                        self.consecutive_failures += 1;
                    }
                    _ => {
                        self.failure_window_start = Some(now);
                        self.consecutive_failures = 1;
                    }
                }

                if self.consecutive_failures >= BYPASS_FAILURES {
                    error!(
                        failures = self.consecutive_failures,
                        "flow store entering bypass mode"
                    );
                    self.bypass.store(true, Ordering::Relaxed);
                    let _ = self
                        .event_tx
                        .send(StoreEvent::BypassEntered {
                            consecutive_failures: self.consecutive_failures,
                        })
                        .await;
                }
            }
        }
    }

    fn sweep(&self) {
        if self.config.retention_days == 0 || self.bypass.load(Ordering::Relaxed) {
            return;
        }
        match self.db.prune(self.config.retention_days) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "retention sweep removed aged flow records"),
            Err(e) => warn!("retention sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::sample_flow;

    fn config() -> DatabaseConfig {
        DatabaseConfig::default()
    }

    #[tokio::test]
    async fn test_records_flow_through_to_db() {
        let db = FlowDatabase::open_memory().unwrap();
        let (event_tx, _event_rx) = mpsc::channel(4);
        let handle = FlowWriter::start(db.clone(), config(), event_tx);

        for i in 0..5 {
            handle.record(sample_flow("DDoS-SYN_Flood", 0.99, true, 1000.0 + i as f64));
        }
        handle.flush().await;
        handle.shutdown().await;
        // Give the task a moment to drain
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(db.count().unwrap(), 5);
        assert_eq!(handle.saved(), 5);
        assert_eq!(handle.dropped(), 0);
        assert!(!handle.is_bypass());
    }

    #[tokio::test]
    async fn test_ingest_filters() {
        let db = FlowDatabase::open_memory().unwrap();
        let (event_tx, _event_rx) = mpsc::channel(4);
        let cfg = DatabaseConfig {
            save_benign_flows: false,
            min_confidence_to_save: 0.5,
            ..Default::default()
        };
        let handle = FlowWriter::start(db.clone(), cfg, event_tx);

        handle.record(sample_flow("BenignTraffic", 0.9, false, 1000.0));
        handle.record(sample_flow("DDoS-SYN_Flood", 0.3, true, 1000.0));
        handle.record(sample_flow("DDoS-SYN_Flood", 0.99, true, 1000.0));
        handle.flush().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(handle.filtered(), 2);
    }
}
