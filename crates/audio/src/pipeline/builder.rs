//! Aufbau einer Pipeline
//!
//! Alle Format- und Konfigurationsfehler werden hier synchron gemeldet,
//! bevor ein Thread gestartet wird.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::orchestrator::{Parts, Pipeline};
use super::state::RetryPolicy;
use crate::buffer::{FrameBuffer, DEFAULT_CAPACITY};
use crate::endpoint::{FrameSink, FrameSource};
use crate::error::{AudioError, AudioResult};
use crate::format::StreamFormat;
use crate::metering::MeteringStage;
use crate::observer::{LogDisplay, PipelineDisplay, OBSERVER_QUEUE};
use crate::stats::DEFAULT_INTERVAL;
use crate::transform::{TransformChain, TransformStage};

/// Standard-Timeout fuer das Leeren beim Stoppen
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Laufzeit-Parameter einer Pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Plaetze im Frame-Puffer zwischen Treiber und Senke
    pub buffer_capacity: usize,
    pub drain_timeout: Duration,
    pub stats_interval: Duration,
    pub retry: RetryPolicy,
    /// Plaetze in der Beobachter-Queue
    pub observer_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stats_interval: DEFAULT_INTERVAL,
            retry: RetryPolicy::default(),
            observer_queue: OBSERVER_QUEUE,
        }
    }
}

/// Verbindet Quelle, Stufen und Senke zu einer Pipeline
pub struct PipelineBuilder {
    name: String,
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FrameSink>>,
    chain: TransformChain,
    config: PipelineConfig,
    display: Option<Arc<dyn PipelineDisplay>>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            sink: None,
            chain: TransformChain::empty(),
            config: PipelineConfig::default(),
            display: None,
        }
    }

    pub fn source(mut self, source: impl FrameSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn boxed_source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn boxed_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Haengt eine Stufe an die Kette
    pub fn stage(mut self, stage: impl TransformStage + 'static) -> Self {
        self.chain.push(Box::new(stage));
        self
    }

    pub fn boxed_stage(mut self, stage: Box<dyn TransformStage>) -> Self {
        self.chain.push(stage);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn display(mut self, display: Arc<dyn PipelineDisplay>) -> Self {
        self.display = Some(display);
        self
    }

    /// Prueft Formate und Parameter und erstellt die Pipeline im Zustand Idle
    pub fn build(self) -> AudioResult<Pipeline> {
        let source = self
            .source
            .ok_or_else(|| AudioError::Konfiguration("Pipeline ohne Quelle".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| AudioError::Konfiguration("Pipeline ohne Senke".into()))?;

        if self.config.drain_timeout.is_zero() {
            return Err(AudioError::Konfiguration("Drain-Timeout muss > 0 sein".into()));
        }
        if self.config.stats_interval.is_zero() {
            return Err(AudioError::Konfiguration("Statistik-Intervall muss > 0 sein".into()));
        }

        let source_format = source.format();
        source_format.validieren()?;
        let output = self.chain.output_format(&StreamFormat::Pcm(source_format))?;
        sink.accepts(&output)?;

        let (producer, consumer) = FrameBuffer::new(self.config.buffer_capacity)?;

        let metering = match &output {
            StreamFormat::Pcm(format) => Some(MeteringStage::new(*format)),
            StreamFormat::Encoded { codec } => {
                debug!(%codec, "Kodierter Strom, keine Lautstaerke-Messung");
                None
            }
        };

        info!(
            pipeline = %self.name,
            quelle = source.name(),
            senke = sink.name(),
            stufen = ?self.chain.names(),
            eingang = %source_format,
            ausgang = %output,
            puffer = self.config.buffer_capacity,
            "Pipeline aufgebaut"
        );

        let display = self.display.unwrap_or_else(|| Arc::new(LogDisplay));
        Ok(Pipeline::new(
            self.name,
            Parts {
                source,
                sink,
                chain: self.chain,
                producer,
                consumer,
                metering,
            },
            source_format,
            output,
            self.config,
            display,
        ))
    }
}
