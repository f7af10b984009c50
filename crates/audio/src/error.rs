//! Fehlertypen fuer die Audio-Engine
//!
//! Konstruktionsfehler (`DeviceUnavailable`, `FormatMismatch`, `Konfiguration`)
//! werden synchron vom Builder zurueckgegeben. Laufzeitfehler beenden die
//! Pipeline im Zustand `Failed`.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Alle moeglichen Fehler der Audio-Engine
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio-Geraet nicht verfuegbar: {0}")]
    DeviceUnavailable(String),

    #[error("Formate inkompatibel: {0}")]
    FormatMismatch(String),

    #[error("Frame-Puffer voll")]
    Backpressure,

    #[error("Transformation '{stage}' fehlgeschlagen: {reason}")]
    TransformFailure { stage: String, reason: String },

    #[error("Endpunkt geschlossen: {0}")]
    EndpointClosed(String),

    #[error("Drain-Timeout nach {0:?} ueberschritten")]
    DrainTimeout(Duration),

    #[error("Geraete-Xrun: {0}")]
    Xrun(String),

    #[error("Ungueltiger Zustandswechsel: {from:?} -> {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] io::Error),

    #[error("Unerwarteter Fehler: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl AudioError {
    /// Kurzform fuer `TransformFailure`
    pub fn transform(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransformFailure {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Voruebergehende Fehler, die der Orchestrator erneut versuchen darf.
    ///
    /// Endpunkte selbst wiederholen nie; die Wiederholungs-Politik liegt
    /// ausschliesslich in der Pipeline.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Xrun(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Fehler, bei denen die Gegenseite weg ist (fuehrt zu Draining statt Failed)
    pub fn is_endpoint_closed(&self) -> bool {
        matches!(self, Self::EndpointClosed(_))
    }

    /// Bildet IO-Fehler eines Verbindungsabbruchs auf `EndpointClosed` ab
    pub fn from_connection(err: io::Error, context: &str) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => {
                Self::EndpointClosed(format!("{context}: {err}"))
            }
            _ => Self::Io(err),
        }
    }
}

pub type AudioResult<T> = Result<T, AudioError>;
