//! Side-effect sinks invoked for every newly created alert
//!
//! Notification delivery (mail, webhooks) and automated response plug in
//! here; the core ships only a logging sink. Sink failures are logged and
//! never propagate into the alert path.

use async_trait::async_trait;
use tracing::{info, warn};

use super::Alert;
use crate::model::Severity;

/// A delivery target for new alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Default sink: structured log lines
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            Severity::High => warn!(
                id = alert.id,
                threat = %alert.threat,
                src = %alert.src_ip,
                dst = %alert.dst_ip,
                confidence = alert.confidence,
                "high severity alert"
            ),
            _ => info!(
                id = alert.id,
                threat = %alert.threat,
                src = %alert.src_ip,
                dst = %alert.dst_ip,
                confidence = alert.confidence,
                "alert"
            ),
        }
        Ok(())
    }
}
