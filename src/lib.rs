//! flowsentry: ML-driven network intrusion detection
//!
//! Observes live traffic, aggregates packets into bidirectional flows,
//! extracts a fixed feature vector per flow, scores it with a frozen
//! two-model ensemble, and emits alerts through a multi-layer
//! false-positive suppression cascade. Every scored flow is persisted for
//! later training.
//!
//! Pipeline: capture -> flow table -> feature extraction -> ensemble ->
//! suppressor -> {alerts, flow store, statistics}.

pub mod alert;
pub mod capture;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod features;
pub mod flow;
pub mod model;
pub mod query;
pub mod stats;
pub mod store;
pub mod suppress;

// Synthetic traffic builders, shared by unit and integration tests
pub mod testutil;

pub use config::Config;
pub use engine::Engine;
pub use error::StartupError;
