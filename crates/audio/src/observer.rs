//! Beobachter: Anzeige-Schnittstelle und nicht-blockierende Weitergabe
//!
//! Der Senken-Thread reicht nach jedem erfolgreichen Schreiben eine Kopie des
//! Frames per `try_send` weiter. Ist der Beobachter-Thread zu langsam, wird
//! der Frame fuer die Messung verworfen und gezaehlt; der Datenpfad wartet nie.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::error::{AudioError, AudioResult};
use crate::frame::Frame;
use crate::metering::{LoudnessSample, MeteringStage};
use crate::pipeline::PipelineState;
use crate::stats::StatsSnapshot;

/// Plaetze in der Beobachter-Queue
pub const OBSERVER_QUEUE: usize = 16;

/// Anzeige-Kollaborateur (Terminal, Metriken, ...)
///
/// Fehler werden geloggt und beenden die Pipeline nie.
pub trait PipelineDisplay: Send + Sync {
    fn show_stats(&self, stats: &StatsSnapshot) -> anyhow::Result<()>;

    fn show_loudness(&self, loudness: &LoudnessSample) -> anyhow::Result<()>;

    fn show_state(&self, _from: PipelineState, _to: PipelineState) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Anzeige, die nur ins Log schreibt
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl PipelineDisplay for LogDisplay {
    fn show_stats(&self, stats: &StatsSnapshot) -> anyhow::Result<()> {
        debug!(
            elapsed_ms = stats.elapsed.as_millis() as u64,
            bytes = stats.bytes_transferred,
            frames = stats.frames_transferred,
            speicher = stats.process_memory,
            latenz_ms = stats.latency_estimate.as_millis() as u64,
            "Pipeline-Statistik"
        );
        Ok(())
    }

    fn show_loudness(&self, loudness: &LoudnessSample) -> anyhow::Result<()> {
        trace!(frame = loudness.sequence, level = loudness.level, "Lautstaerke");
        Ok(())
    }
}

/// Zeigt an und loggt Fehler der Anzeige
pub(crate) fn report(result: anyhow::Result<()>, what: &str) {
    if let Err(e) = result {
        warn!("Anzeige ({what}) fehlgeschlagen: {e:#}");
    }
}

enum Observation {
    Frame(Frame),
    Paused(u64),
}

/// Sende-Seite zum Beobachter-Thread
#[derive(Clone)]
pub struct ObserverHub {
    tx: Sender<Observation>,
    dropped: Arc<AtomicU64>,
}

impl ObserverHub {
    /// Startet den Beobachter-Thread.
    ///
    /// Ohne `metering` (kodierter Strom) werden Frames nur entgegengenommen.
    /// Der Thread endet, sobald alle Klone des Hubs verworfen sind.
    pub fn spawn(
        display: Arc<dyn PipelineDisplay>,
        metering: Option<MeteringStage>,
        capacity: usize,
    ) -> AudioResult<(Self, JoinHandle<()>)> {
        Self::spawn_counted(display, metering, capacity, Arc::new(AtomicU64::new(0)))
    }

    /// Wie `spawn`, verworfene Frames landen in `dropped`
    pub fn spawn_counted(
        display: Arc<dyn PipelineDisplay>,
        metering: Option<MeteringStage>,
        capacity: usize,
        dropped: Arc<AtomicU64>,
    ) -> AudioResult<(Self, JoinHandle<()>)> {
        let (tx, rx) = bounded::<Observation>(capacity.max(1));
        let handle = thread::Builder::new()
            .name("sonance-observer".into())
            .spawn(move || {
                for observation in rx {
                    let sample = match observation {
                        Observation::Frame(frame) => match &metering {
                            Some(meter) => meter.observe(&frame),
                            None => continue,
                        },
                        Observation::Paused(sequence) => LoudnessSample::silent(sequence),
                    };
                    report(display.show_loudness(&sample), "Lautstaerke");
                }
                trace!("Beobachter-Thread beendet");
            })
            .map_err(|e| AudioError::Konfiguration(format!("Beobachter-Thread: {e}")))?;

        Ok((Self { tx, dropped }, handle))
    }

    /// Reicht eine Kopie weiter, ohne zu blockieren
    pub fn notify(&self, frame: &Frame) {
        self.offer(Observation::Frame(frame.clone()));
    }

    /// Meldet Stille fuer eine pausierte Pipeline
    pub fn paused(&self, sequence: u64) {
        self.offer(Observation::Paused(sequence));
    }

    /// Fuer die Messung verworfene Frames
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn offer(&self, observation: Observation) {
        match self.tx.try_send(observation) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
