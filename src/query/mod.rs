//! Read-only query and subscription surface
//!
//! The shape external transports consume: alert queries, the two write
//! operations (acknowledge, set_status), flow snapshots, statistics, and
//! push subscriptions. No transport mechanics live here.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::alert::{Alert, AlertFilter, AlertManager, AlertStatus};
use crate::core::flow::FlowSummary;
use crate::stats::{StatisticsTracker, StatsWindow, WindowSummary};
use crate::store::{FlowDatabase, FlowWriterHandle, PersistedFlow};

/// Errors surfaced to transports
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unavailable")]
    Unavailable,
}

/// Facade over the long-lived components
#[derive(Clone)]
pub struct QuerySurface {
    alerts: Arc<AlertManager>,
    stats: Arc<RwLock<StatisticsTracker>>,
    flows: Arc<RwLock<Vec<FlowSummary>>>,
    store: Option<FlowDatabase>,
    store_handle: Option<FlowWriterHandle>,
}

impl QuerySurface {
    pub fn new(
        alerts: Arc<AlertManager>,
        stats: Arc<RwLock<StatisticsTracker>>,
        flows: Arc<RwLock<Vec<FlowSummary>>>,
        store: Option<FlowDatabase>,
        store_handle: Option<FlowWriterHandle>,
    ) -> Self {
        Self {
            alerts,
            stats,
            flows,
            store,
            store_handle,
        }
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.alerts.query(filter)
    }

    pub fn alert(&self, id: u64) -> Result<Alert, QueryError> {
        self.alerts.get(id).ok_or(QueryError::NotFound)
    }

    pub fn acknowledge(
        &self,
        id: u64,
        user: &str,
        notes: Option<&str>,
    ) -> Result<Alert, QueryError> {
        if user.trim().is_empty() {
            return Err(QueryError::InvalidInput("user must not be empty".into()));
        }
        self.alerts
            .acknowledge(id, user, notes)
            .ok_or(QueryError::NotFound)
    }

    pub fn set_status(
        &self,
        id: u64,
        status: &str,
        notes: Option<&str>,
    ) -> Result<Alert, QueryError> {
        let status: AlertStatus = status
            .parse()
            .map_err(|_| QueryError::InvalidInput(format!("unknown status {status:?}")))?;
        self.alerts
            .set_status(id, status, notes)
            .ok_or(QueryError::NotFound)
    }

    /// Current aggregator snapshot (copy-on-read, refreshed each tick)
    pub fn list_flows(&self, limit: usize) -> Vec<FlowSummary> {
        let flows = self.flows.read();
        flows.iter().take(limit).cloned().collect()
    }

    pub fn statistics(&self, window: &str) -> Result<WindowSummary, QueryError> {
        let window: StatsWindow = window
            .parse()
            .map_err(|_| QueryError::InvalidInput(format!("unknown window {window:?}")))?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(self.stats.read().summary(window, now))
    }

    /// Persisted flow records, newest first. `Unavailable` while the store
    /// is disabled or in bypass mode.
    pub fn recent_flows(&self, limit: usize) -> Result<Vec<PersistedFlow>, QueryError> {
        let store = self.store.as_ref().ok_or(QueryError::Unavailable)?;
        if self
            .store_handle
            .as_ref()
            .map(|h| h.is_bypass())
            .unwrap_or(false)
        {
            return Err(QueryError::Unavailable);
        }
        store.recent(limit, None).map_err(|_| QueryError::Unavailable)
    }

    /// Server-push stream of newly created alerts, in id order
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Periodic flow snapshot stream (default 1 Hz)
    pub fn subscribe_flows(&self, interval: Duration) -> mpsc::Receiver<Vec<FlowSummary>> {
        let (tx, rx) = mpsc::channel(8);
        let flows = self.flows.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let snapshot = flows.read().clone();
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

/// Subscription wire format: the persisted alert record plus a `new`
/// marker on first appearance.
pub fn alert_wire_json(alert: &Alert, first_appearance: bool) -> serde_json::Value {
    let mut value = serde_json::to_value(alert).unwrap_or_else(|_| json!({}));
    if first_appearance {
        if let Some(obj) = value.as_object_mut() {
            obj.insert("new".to_string(), json!(true));
        }
    }
    value
}
