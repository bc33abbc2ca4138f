//! Flow table: single-writer aggregation of packets into bidirectional flows
//!
//! Keyed by canonical 5-tuple (first-seen direction). Readers never touch
//! the table directly; they get copy-on-read snapshots. Eviction is driven
//! by the engine's timer tick and by the capacity bound.

use std::collections::HashMap;

use crate::core::flow::{Flow, FlowKey, FlowSnapshot, FlowSummary};
use crate::core::packet::PacketSummary;

/// Why a flow is being scored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreReason {
    /// The per-flow packet interval was crossed
    Interval,
    /// The flow is being evicted (idle, capacity, or shutdown)
    Final,
}

/// A scoring submission produced by the table
#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub snapshot: FlowSnapshot,
    pub reason: ScoreReason,
}

/// Table counters
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub idle_evictions: u64,
    pub capacity_evictions: u64,
}

/// Flow hash table with idle and capacity eviction
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    score_interval: u64,
    idle_timeout_ns: u64,
    max_flows: usize,
    pub stats: TableStats,
}

impl FlowTable {
    pub fn new(score_interval: u64, idle_timeout_secs: u64, max_flows: usize) -> Self {
        Self {
            flows: HashMap::with_capacity(max_flows.min(100_000)),
            score_interval,
            idle_timeout_ns: idle_timeout_secs.saturating_mul(1_000_000_000),
            max_flows,
            stats: TableStats::default(),
        }
    }

    /// Ingest one packet. Returns scoring requests: at most one interval
    /// trigger for the packet's flow, plus a final request for a flow the
    /// capacity bound had to evict to make room.
    pub fn ingest(&mut self, pkt: &PacketSummary) -> Vec<ScoreRequest> {
        let mut requests = Vec::new();
        let key = FlowKey::from_packet(pkt);

        let canonical = if self.flows.contains_key(&key) {
            Some(key)
        } else {
            let reversed = key.reversed();
            if self.flows.contains_key(&reversed) {
                Some(reversed)
            } else {
                None
            }
        };

        let flow = match canonical {
            Some(k) => {
                self.stats.hits += 1;
                let flow = self.flows.get_mut(&k).expect("canonical key present");
                flow.update(pkt);
                flow
            }
            None => {
                self.stats.misses += 1;
                if self.flows.len() >= self.max_flows {
                    if let Some(evicted) = self.remove_lru() {
                        self.stats.capacity_evictions += 1;
                        if evicted.packet_count >= 2 {
                            requests.push(ScoreRequest {
                                snapshot: evicted.snapshot(),
                                reason: ScoreReason::Final,
                            });
                        }
                    }
                }
                self.stats.inserts += 1;
                let key = FlowKey::from_packet(pkt);
                self.flows.entry(key).or_insert_with(|| Flow::new(pkt))
            }
        };

        if flow.packets_since_scored() >= self.score_interval {
            flow.mark_scored();
            requests.push(ScoreRequest {
                snapshot: flow.snapshot(),
                reason: ScoreReason::Interval,
            });
        }
        requests
    }

    /// Remove flows idle longer than the timeout. Returns final scoring
    /// requests for the removed flows that qualify (>= 2 packets).
    pub fn evict_idle(&mut self, now_ns: u64) -> Vec<ScoreRequest> {
        let timeout = self.idle_timeout_ns;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| now_ns.saturating_sub(f.last_seen_ns) > timeout)
            .map(|(k, _)| k.clone())
            .collect();

        let mut requests = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(flow) = self.flows.remove(&key) {
                self.stats.idle_evictions += 1;
                if flow.packet_count >= 2 {
                    requests.push(ScoreRequest {
                        snapshot: flow.snapshot(),
                        reason: ScoreReason::Final,
                    });
                }
            }
        }
        requests
    }

    /// Enforce the capacity bound, least-recently-seen first.
    pub fn evict_to_capacity(&mut self) -> Vec<ScoreRequest> {
        let mut requests = Vec::new();
        while self.flows.len() > self.max_flows {
            if let Some(flow) = self.remove_lru() {
                self.stats.capacity_evictions += 1;
                if flow.packet_count >= 2 {
                    requests.push(ScoreRequest {
                        snapshot: flow.snapshot(),
                        reason: ScoreReason::Final,
                    });
                }
            } else {
                break;
            }
        }
        requests
    }

    /// Drain every flow for shutdown; all get a final scoring pass.
    pub fn drain_all(&mut self) -> Vec<ScoreRequest> {
        let mut requests = Vec::with_capacity(self.flows.len());
        for (_, flow) in self.flows.drain() {
            if flow.packet_count >= 2 {
                requests.push(ScoreRequest {
                    snapshot: flow.snapshot(),
                    reason: ScoreReason::Final,
                });
            }
        }
        requests
    }

    /// Copy-on-read view for the query surface
    pub fn snapshot(&self) -> Vec<FlowSummary> {
        self.flows.values().map(|f| f.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn remove_lru(&mut self) -> Option<Flow> {
        let oldest = self
            .flows
            .iter()
            .min_by_key(|(_, f)| f.last_seen_ns)
            .map(|(k, _)| k.clone())?;
        self.flows.remove(&oldest)
    }
}
