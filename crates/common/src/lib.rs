//! Shared configuration, error types, identifiers, row batches and metrics for the
//! movie-analytics pipeline crates.
//!
//! Architecture role:
//! - defines the node configuration every worker reads at startup
//! - provides the common [`CqError`] / [`Result`] contracts
//! - defines the row batch carried in envelope bodies and spill files
//! - hosts metrics and the optional exporter
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`rows`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `metrics-http`: enables the metrics HTTP exporter.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "metrics-http")]
pub mod metrics_exporter;
pub mod rows;

pub use config::{BatchThresholds, NodeConfig};
pub use error::{CqError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
#[cfg(feature = "metrics-http")]
pub use metrics_exporter::run_metrics_exporter;
pub use rows::{Payload, RowBatch, EOF_MARKER};
