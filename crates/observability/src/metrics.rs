//! Prometheus-kompatible Metriken einer Pipeline
//!
//! Registrierte Metriken (alle mit Label `pipeline`):
//! - `sonance_bytes_transferred` – Gauge: In die Senke geschriebene Bytes
//! - `sonance_frames_transferred` – Gauge: In die Senke geschriebene Frames
//! - `sonance_elapsed_seconds` – Gauge: Laufzeit der Pipeline
//! - `sonance_memory_usage_bytes` – Gauge: Speicherverbrauch des Prozesses
//! - `sonance_latency_seconds` – Gauge: Geschaetzte Latenz
//! - `sonance_loudness_level` – Gauge: Letzter Lautstaerke-Pegel (0..=80)
//! - `sonance_loudness_dbfs` – Histogram: Pegel in dBFS
//! - `sonance_state_transitions_total` – Counter: Zustandswechsel (from, to)
//!
//! `PipelineMetrics` ist selbst ein `PipelineDisplay` und kann direkt an den
//! Pipeline-Builder uebergeben werden.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use sonance_audio::{LoudnessSample, PipelineDisplay, PipelineState, StatsSnapshot};

/// Alle Prometheus-Metriken einer Pipeline
#[derive(Clone)]
pub struct PipelineMetrics {
    pub registry: Arc<Registry>,

    // Durchsatz
    pub bytes_transferred: IntGauge,
    pub frames_transferred: IntGauge,
    pub elapsed_seconds: Gauge,

    // System
    pub memory_usage_bytes: IntGauge,
    pub latency_seconds: Gauge,

    // Lautstaerke
    pub loudness_level: IntGauge,
    pub loudness_dbfs: Histogram,

    pub state_transitions_total: IntCounterVec,
}

impl PipelineMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu(pipeline: &str) -> Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("pipeline", pipeline);

        let bytes_transferred = IntGauge::with_opts(opts(
            "sonance_bytes_transferred",
            "In die Senke geschriebene Bytes",
        ))?;
        registry.register(Box::new(bytes_transferred.clone()))?;

        let frames_transferred = IntGauge::with_opts(opts(
            "sonance_frames_transferred",
            "In die Senke geschriebene Frames",
        ))?;
        registry.register(Box::new(frames_transferred.clone()))?;

        let elapsed_seconds = Gauge::with_opts(opts(
            "sonance_elapsed_seconds",
            "Laufzeit der Pipeline in Sekunden",
        ))?;
        registry.register(Box::new(elapsed_seconds.clone()))?;

        let memory_usage_bytes = IntGauge::with_opts(opts(
            "sonance_memory_usage_bytes",
            "Speicherverbrauch des Prozesses in Bytes",
        ))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;

        let latency_seconds = Gauge::with_opts(opts(
            "sonance_latency_seconds",
            "Geschaetzte Latenz zwischen Quelle und Ausgabe",
        ))?;
        registry.register(Box::new(latency_seconds.clone()))?;

        let loudness_level = IntGauge::with_opts(opts(
            "sonance_loudness_level",
            "Letzter Lautstaerke-Pegel (0 bis 80)",
        ))?;
        registry.register(Box::new(loudness_level.clone()))?;

        let loudness_dbfs = Histogram::with_opts(
            HistogramOpts::new("sonance_loudness_dbfs", "Lautstaerke in dBFS")
                .const_label("pipeline", pipeline)
                .buckets(vec![-90.0, -60.0, -48.0, -36.0, -24.0, -12.0, -6.0, -3.0, 0.0]),
        )?;
        registry.register(Box::new(loudness_dbfs.clone()))?;

        let state_transitions_total = IntCounterVec::new(
            opts("sonance_state_transitions_total", "Zustandswechsel der Pipeline"),
            &["from", "to"],
        )?;
        registry.register(Box::new(state_transitions_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            bytes_transferred,
            frames_transferred,
            elapsed_seconds,
            memory_usage_bytes,
            latency_seconds,
            loudness_level,
            loudness_dbfs,
            state_transitions_total,
        })
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Schreibt den Export in eine Datei (z.B. fuer den node_exporter Textfile-Collector)
    pub fn in_datei_schreiben(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = self.exportieren()?;
        std::fs::write(path, text)
            .with_context(|| format!("Metriken nach {} schreiben", path.display()))?;
        tracing::debug!(datei = %path.display(), "Metriken exportiert");
        Ok(())
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PipelineDisplay for PipelineMetrics {
    fn show_stats(&self, stats: &StatsSnapshot) -> Result<()> {
        self.bytes_transferred.set(clamp_i64(stats.bytes_transferred));
        self.frames_transferred.set(clamp_i64(stats.frames_transferred));
        self.elapsed_seconds.set(stats.elapsed.as_secs_f64());
        self.memory_usage_bytes.set(clamp_i64(stats.process_memory));
        self.latency_seconds.set(stats.latency_estimate.as_secs_f64());
        Ok(())
    }

    fn show_loudness(&self, loudness: &LoudnessSample) -> Result<()> {
        self.loudness_level.set(i64::from(loudness.level));
        self.loudness_dbfs.observe(loudness.db());
        Ok(())
    }

    fn show_state(&self, from: PipelineState, to: PipelineState) -> Result<()> {
        let (from, to) = (from.to_string(), to.to_string());
        self.state_transitions_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        Ok(())
    }
}
