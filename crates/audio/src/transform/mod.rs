//! Transformations-Stufen
//!
//! Eine Stufe bildet einen Frame auf einen Frame ab. Stufen werden in einer
//! `TransformChain` in fester Reihenfolge hintereinander geschaltet; der
//! erste Fehler bricht die Kette ab und ist fuer die Pipeline fatal.

pub mod channels;
pub mod convert;
#[cfg(feature = "opus")]
pub mod opus;
pub mod passthrough;

use crate::error::{AudioError, AudioResult};
use crate::format::StreamFormat;
use crate::frame::Frame;

pub use channels::ChannelRemix;
pub use convert::FormatConversion;
#[cfg(feature = "opus")]
pub use opus::OpusEncodeStage;
pub use passthrough::Passthrough;

/// Gemeinsames Interface aller Stufen
pub trait TransformStage: Send {
    /// Name fuer Logs und Fehlermeldungen
    fn name(&self) -> &str;

    /// Ausgabe-Format fuer das gegebene Eingabe-Format.
    ///
    /// Wird beim Aufbau der Pipeline aufgerufen; ein nicht passendes
    /// Eingabe-Format ist ein `FormatMismatch`.
    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat>;

    /// Verarbeitet einen Frame
    fn apply(&mut self, frame: Frame) -> AudioResult<Frame>;

    /// Setzt internen Zustand zurueck. Nur beim Start, nie bei Pause/Resume.
    fn reset(&mut self) -> AudioResult<()> {
        Ok(())
    }
}

/// Geordnete Kette von Stufen
pub struct TransformChain {
    stages: Vec<Box<dyn TransformStage>>,
}

impl TransformChain {
    pub fn new(stages: Vec<Box<dyn TransformStage>>) -> Self {
        Self { stages }
    }

    /// Leere Kette, Frames passieren unveraendert
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Haengt eine Stufe ans Ende
    pub fn push(&mut self, stage: Box<dyn TransformStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Namen der Stufen in Reihenfolge
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Loest das Ausgabe-Format der ganzen Kette auf
    pub fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        self.stages
            .iter()
            .try_fold(input.clone(), |format, stage| stage.output_format(&format))
    }

    /// Schickt einen Frame durch alle Stufen.
    ///
    /// Fehler einer Stufe kommen immer als `TransformFailure` mit Stufenname
    /// zurueck.
    pub fn apply(&mut self, frame: Frame) -> AudioResult<Frame> {
        self.stages.iter_mut().try_fold(frame, |frame, stage| {
            stage.apply(frame).map_err(|e| match e {
                e @ AudioError::TransformFailure { .. } => e,
                other => AudioError::transform(stage.name(), other.to_string()),
            })
        })
    }

    /// Setzt alle Stufen zurueck
    pub fn reset_all(&mut self) -> AudioResult<()> {
        for stage in self.stages.iter_mut() {
            stage
                .reset()
                .map_err(|e| AudioError::transform(stage.name(), e.to_string()))?;
        }
        Ok(())
    }
}

impl Default for TransformChain {
    fn default() -> Self {
        Self::empty()
    }
}
