//! Durable flow store
//!
//! Every scored flow lands in an append-only `network_flows` table: the
//! full 37-column feature vector in canonical order plus identification
//! and prediction fields. The table doubles as training data, so `export`
//! emits the canonical header and `import` accepts it back.

pub mod writer;

use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params_from_iter, Connection};

use crate::core::flow::FlowSnapshot;
use crate::error::StartupError;
use crate::features::{FeatureVector, FEATURE_NAMES, NUM_FEATURES};
use crate::model::{Prediction, Severity};

pub use writer::{FlowWriter, FlowWriterHandle, StoreEvent};

/// One scored flow, as persisted
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedFlow {
    pub id: i64,
    /// Scoring wall time, epoch seconds
    pub timestamp: f64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub features: FeatureVector,
    pub predicted_label: String,
    pub severity: Severity,
    pub confidence: f64,
    pub method: String,
    /// Whether the suppressor let this detection through
    pub emitted: bool,
    /// Ground-truth label, if later verified
    pub label: Option<String>,
    pub label_verified: bool,
}

impl PersistedFlow {
    pub fn from_scoring(
        snapshot: &FlowSnapshot,
        features: FeatureVector,
        prediction: &Prediction,
        emitted: bool,
        wall: f64,
    ) -> Self {
        Self {
            id: 0,
            timestamp: wall,
            src_ip: snapshot.key.src_ip,
            dst_ip: snapshot.key.dst_ip,
            src_port: snapshot.key.src_port,
            dst_port: snapshot.key.dst_port,
            protocol: snapshot.key.protocol,
            features,
            predicted_label: prediction.label.clone(),
            severity: prediction.severity,
            confidence: prediction.confidence,
            method: prediction.method.clone(),
            emitted,
            label: None,
            label_verified: false,
        }
    }
}

/// Aggregate store counts
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub total: u64,
    pub by_label: Vec<(String, u64)>,
    pub by_severity: Vec<(String, u64)>,
}

/// SQL-safe column name for a canonical feature name
fn feature_column(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

fn feature_columns() -> Vec<String> {
    FEATURE_NAMES.iter().map(|n| feature_column(n)).collect()
}

fn severity_from_str(s: &str) -> Severity {
    match s {
        "low" => Severity::Low,
        "medium" => Severity::Medium,
        _ => Severity::High,
    }
}

/// Thread-safe sqlite wrapper for the flow table
#[derive(Clone)]
pub struct FlowDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl FlowDatabase {
    /// Open or create the database under the configured directory.
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .map_err(|e| StartupError::Storage(format!("flow store dir: {e}")))?;
        let path = directory.join("flows.db");
        let conn = Connection::open(&path)
            .map_err(|e| StartupError::Storage(format!("flow store {}: {e}", path.display())))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()
            .map_err(|e| StartupError::Storage(format!("flow store schema: {e}")))?;
        Ok(db)
    }

    /// In-memory database for tests
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let feature_defs: Vec<String> = feature_columns()
            .iter()
            .map(|c| format!("{c} REAL NOT NULL DEFAULT 0"))
            .collect();

        let create = format!(
            "CREATE TABLE IF NOT EXISTS network_flows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                src_port INTEGER,
                dst_port INTEGER,
                protocol INTEGER NOT NULL,
                {},
                predicted_label TEXT,
                severity TEXT,
                confidence REAL,
                method TEXT,
                emitted INTEGER NOT NULL DEFAULT 0,
                label TEXT,
                label_verified INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_flows_ts_label ON network_flows(timestamp, predicted_label);
            CREATE INDEX IF NOT EXISTS idx_flows_src_dst ON network_flows(src_ip, dst_ip);
            CREATE INDEX IF NOT EXISTS idx_flows_label ON network_flows(label);",
            feature_defs.join(",\n                ")
        );

        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&create)?;
        Ok(())
    }

    /// Insert a batch of records in one transaction. Returns rows written.
    pub fn insert_batch(&self, flows: &[PersistedFlow]) -> Result<u64> {
        if flows.is_empty() {
            return Ok(0);
        }

        let columns = insert_columns();
        let placeholders: Vec<&str> = std::iter::repeat("?").take(columns.len()).collect();
        let sql = format!(
            "INSERT INTO network_flows ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN TRANSACTION", [])?;
        let mut written = 0u64;
        {
            let mut stmt = conn.prepare_cached(&sql)?;
            for flow in flows {
                let mut values: Vec<rusqlite::types::Value> = vec![
                    flow.timestamp.into(),
                    flow.src_ip.to_string().into(),
                    flow.dst_ip.to_string().into(),
                    (flow.src_port as i64).into(),
                    (flow.dst_port as i64).into(),
                    (flow.protocol as i64).into(),
                ];
                for v in flow.features.values.iter() {
                    values.push((*v).into());
                }
                values.push(flow.predicted_label.clone().into());
                values.push(flow.severity.as_str().to_string().into());
                values.push(flow.confidence.into());
                values.push(flow.method.clone().into());
                values.push((flow.emitted as i64).into());
                values.push(match &flow.label {
                    Some(l) => l.clone().into(),
                    None => rusqlite::types::Value::Null,
                });
                values.push((flow.label_verified as i64).into());

                stmt.execute(params_from_iter(values))?;
                written += 1;
            }
        }
        conn.execute("COMMIT", [])?;
        Ok(written)
    }

    /// Newest-first records, optionally bounded to `since` (epoch seconds)
    pub fn recent(&self, limit: usize, since: Option<f64>) -> Result<Vec<PersistedFlow>> {
        let sql = format!(
            "SELECT {} FROM network_flows WHERE timestamp >= ? ORDER BY timestamp DESC, id DESC LIMIT ?",
            select_columns().join(", ")
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![since.unwrap_or(0.0), limit as i64],
            row_to_flow,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Records for one predicted label, newest first
    pub fn by_attack(&self, label: &str, limit: usize) -> Result<Vec<PersistedFlow>> {
        let sql = format!(
            "SELECT {} FROM network_flows WHERE predicted_label = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
            select_columns().join(", ")
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params![label, limit as i64], row_to_flow)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Aggregate counts over the trailing `hours`
    pub fn statistics(&self, hours: u32) -> Result<StoreStatistics> {
        let since = wall_now() - hours as f64 * 3600.0;
        let conn = self.conn.lock().unwrap();

        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM network_flows WHERE timestamp >= ?",
            [since],
            |row| row.get::<_, i64>(0),
        )? as u64;

        let mut by_label = Vec::new();
        {
            let mut stmt = conn.prepare_cached(
                "SELECT predicted_label, COUNT(*) FROM network_flows
                 WHERE timestamp >= ? GROUP BY predicted_label ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                by_label.push(row?);
            }
        }

        let mut by_severity = Vec::new();
        {
            let mut stmt = conn.prepare_cached(
                "SELECT severity, COUNT(*) FROM network_flows
                 WHERE timestamp >= ? GROUP BY severity ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                by_severity.push(row?);
            }
        }

        Ok(StoreStatistics {
            total,
            by_label,
            by_severity,
        })
    }

    /// Delete rows older than `retention_days`. Zero disables sweeping.
    pub fn prune(&self, retention_days: u32) -> Result<u64> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = wall_now() - retention_days as f64 * 86_400.0;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM network_flows WHERE timestamp < ?", [cutoff])?;
        Ok(deleted as u64)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM network_flows", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Stream records as CSV with the canonical training header,
    /// optionally restricted to one predicted label.
    pub fn export<W: Write>(&self, out: &mut W, label: Option<&str>) -> Result<u64> {
        writeln!(out, "{}", export_header())?;

        let sql = format!(
            "SELECT {} FROM network_flows WHERE (?1 IS NULL OR predicted_label = ?1) ORDER BY id",
            select_columns().join(", ")
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params![label], row_to_flow)?;

        let mut exported = 0u64;
        for row in rows {
            let flow = row?;
            let mut fields: Vec<String> = vec![
                flow.id.to_string(),
                format_float(flow.timestamp),
                flow.src_ip.to_string(),
                flow.dst_ip.to_string(),
                flow.src_port.to_string(),
                flow.dst_port.to_string(),
                flow.protocol.to_string(),
            ];
            fields.extend(flow.features.values.iter().map(|v| format_float(*v)));
            fields.push(flow.predicted_label.clone());
            fields.push(flow.severity.as_str().to_string());
            fields.push(format_float(flow.confidence));
            fields.push(flow.method.clone());
            fields.push((flow.emitted as u8).to_string());
            fields.push(flow.label.clone().unwrap_or_default());
            fields.push((flow.label_verified as u8).to_string());
            writeln!(out, "{}", fields.join(","))?;
            exported += 1;
        }
        Ok(exported)
    }

    /// Import records previously produced by `export`.
    pub fn import<R: BufRead>(&self, reader: R) -> Result<u64> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .transpose()?
            .context("import source is empty")?;
        if header != export_header() {
            anyhow::bail!("import header does not match the canonical export header");
        }

        let mut flows = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 7 + NUM_FEATURES + 7 {
                anyhow::bail!("malformed import row: {} fields", fields.len());
            }

            let mut values = [0.0; NUM_FEATURES];
            for (i, v) in values.iter_mut().enumerate() {
                *v = fields[7 + i].parse().context("feature value")?;
            }

            let label_field = fields[7 + NUM_FEATURES + 5];
            flows.push(PersistedFlow {
                id: 0,
                timestamp: fields[1].parse().context("timestamp")?,
                src_ip: fields[2].parse().context("src_ip")?,
                dst_ip: fields[3].parse().context("dst_ip")?,
                src_port: fields[4].parse().context("src_port")?,
                dst_port: fields[5].parse().context("dst_port")?,
                protocol: fields[6].parse().context("protocol")?,
                features: FeatureVector { values },
                predicted_label: fields[7 + NUM_FEATURES].to_string(),
                severity: severity_from_str(fields[7 + NUM_FEATURES + 1]),
                confidence: fields[7 + NUM_FEATURES + 2].parse().context("confidence")?,
                method: fields[7 + NUM_FEATURES + 3].to_string(),
                emitted: fields[7 + NUM_FEATURES + 4] == "1",
                label: if label_field.is_empty() {
                    None
                } else {
                    Some(label_field.to_string())
                },
                label_verified: fields[7 + NUM_FEATURES + 6] == "1",
            });
        }

        self.insert_batch(&flows)
    }
}

fn insert_columns() -> Vec<String> {
    let mut cols = vec![
        "timestamp".to_string(),
        "src_ip".to_string(),
        "dst_ip".to_string(),
        "src_port".to_string(),
        "dst_port".to_string(),
        "protocol".to_string(),
    ];
    cols.extend(feature_columns());
    for c in [
        "predicted_label",
        "severity",
        "confidence",
        "method",
        "emitted",
        "label",
        "label_verified",
    ] {
        cols.push(c.to_string());
    }
    cols
}

fn select_columns() -> Vec<String> {
    let mut cols = vec!["id".to_string()];
    cols.extend(insert_columns());
    cols
}

/// CSV header: identification, the 37 canonical feature names, prediction
fn export_header() -> String {
    let mut fields = vec![
        "id".to_string(),
        "timestamp".to_string(),
        "src_ip".to_string(),
        "dst_ip".to_string(),
        "src_port".to_string(),
        "dst_port".to_string(),
        "protocol".to_string(),
    ];
    fields.extend(FEATURE_NAMES.iter().map(|n| n.to_string()));
    for c in [
        "predicted_label",
        "severity",
        "confidence",
        "method",
        "emitted",
        "label",
        "label_verified",
    ] {
        fields.push(c.to_string());
    }
    fields.join(",")
}

fn format_float(v: f64) -> String {
    // Shortest round-trippable form
    format!("{v}")
}

fn row_to_flow(row: &rusqlite::Row<'_>) -> std::result::Result<PersistedFlow, rusqlite::Error> {
    let mut values = [0.0; NUM_FEATURES];
    for (i, v) in values.iter_mut().enumerate() {
        *v = row.get::<_, f64>(7 + i)?;
    }

    let src_ip: String = row.get(2)?;
    let dst_ip: String = row.get(3)?;
    let severity: String = row.get(7 + NUM_FEATURES + 1)?;

    Ok(PersistedFlow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        src_ip: src_ip.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(2, "src_ip".into(), rusqlite::types::Type::Text)
        })?,
        dst_ip: dst_ip.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(3, "dst_ip".into(), rusqlite::types::Type::Text)
        })?,
        src_port: row.get::<_, i64>(4)? as u16,
        dst_port: row.get::<_, i64>(5)? as u16,
        protocol: row.get::<_, i64>(6)? as u8,
        features: FeatureVector { values },
        predicted_label: row.get(7 + NUM_FEATURES)?,
        severity: severity_from_str(&severity),
        confidence: row.get(7 + NUM_FEATURES + 2)?,
        method: row.get(7 + NUM_FEATURES + 3)?,
        emitted: row.get::<_, i64>(7 + NUM_FEATURES + 4)? != 0,
        label: row.get(7 + NUM_FEATURES + 5)?,
        label_verified: row.get::<_, i64>(7 + NUM_FEATURES + 6)? != 0,
    })
}

fn wall_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
