//! # sonance-observability
//!
//! Observability-Crate fuer Sonance:
//! - Prometheus-kompatible Pipeline-Metriken (als Anzeige-Kollaborateur)
//! - Structured Logging via tracing-subscriber (Text oder JSON)

pub mod logging;
pub mod metrics;

pub use logging::logging_initialisieren;
pub use metrics::PipelineMetrics;
