//! Durchsatz-Statistik einer Pipeline
//!
//! Der Senken-Thread verbucht jeden erfolgreichen Schreibvorgang in den
//! gemeinsamen `StatsCounters`. Ein Snapshot wird unter dem Lock erstellt und
//! ist damit in sich konsistent.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, trace};

use crate::error::{AudioError, AudioResult};
use crate::observer::{report, PipelineDisplay};

/// Standard-Intervall des Statistik-Threads
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

/// Unveraenderliche Momentaufnahme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Zeit seit Start der Pipeline
    pub elapsed: Duration,
    pub bytes_transferred: u64,
    pub frames_transferred: u64,
    /// Aus der Quelle gelesene Bytes (vor den Stufen)
    pub bytes_read: u64,
    /// Resident Set Size des Prozesses in Bytes (0 wenn unbekannt)
    pub process_memory: u64,
    /// (gepufferte Frames + 1) * Frame-Dauer + Senken-Latenz
    pub latency_estimate: Duration,
}

impl StatsSnapshot {
    /// Uebertragene Bytes in MB (fuer Anzeigen)
    pub fn megabytes(&self) -> f64 {
        self.bytes_transferred as f64 / 1_000_000.0
    }

    pub fn memory_megabytes(&self) -> f64 {
        self.process_memory as f64 / 1_000_000.0
    }

    /// Gelesene zu geschriebenen Bytes; `None` solange nichts geschrieben wurde
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.bytes_transferred == 0 || self.bytes_read == 0 {
            return None;
        }
        Some(self.bytes_read as f64 / self.bytes_transferred as f64)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    started: Option<Instant>,
    stopped: Option<Instant>,
    bytes: u64,
    frames: u64,
    bytes_read: u64,
}

/// Gemeinsame Zaehler; billig klonbar
#[derive(Debug, Clone, Default)]
pub struct StatsCounters {
    state: Arc<Mutex<CounterState>>,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet die Zeitmessung
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.started = Some(Instant::now());
        state.stopped = None;
    }

    /// Friert `elapsed` ein (Pipeline beendet)
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.started.is_some() && state.stopped.is_none() {
            state.stopped = Some(Instant::now());
        }
    }

    /// Verbucht einen geschriebenen Frame
    pub fn record(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.bytes += bytes as u64;
        state.frames += 1;
    }

    /// Verbucht einen aus der Quelle gelesenen Frame
    pub fn record_read(&self, bytes: usize) {
        self.state.lock().bytes_read += bytes as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn frames(&self) -> u64 {
        self.state.lock().frames
    }

    /// Konsistente Momentaufnahme der Zaehler
    pub fn snapshot(&self, process_memory: u64, latency_estimate: Duration) -> StatsSnapshot {
        let state = self.state.lock();
        let elapsed = match (state.started, state.stopped) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        StatsSnapshot {
            elapsed,
            bytes_transferred: state.bytes,
            frames_transferred: state.frames,
            bytes_read: state.bytes_read,
            process_memory,
            latency_estimate,
        }
    }
}

/// Latenz-Schaetzung: `(buffered + 1) * frame_period + sink_latency`
pub fn latency_estimate(
    buffered: usize,
    frame_period: Duration,
    sink_latency: Option<Duration>,
) -> Duration {
    frame_period * (buffered as u32 + 1) + sink_latency.unwrap_or_default()
}

/// Liest den Speicherverbrauch des eigenen Prozesses
pub struct ProcessMemory {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("Prozess-ID nicht ermittelbar: {e}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Resident Set Size in Bytes, 0 wenn nicht ermittelbar
    pub fn resident(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

const NO_LATENCY: u64 = u64::MAX;

/// Werte fuer die Latenz-Schaetzung, vom Senken-Thread aktualisiert
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    inner: Arc<EstimatorInner>,
}

#[derive(Debug)]
struct EstimatorInner {
    frame_period: Duration,
    buffered: AtomicUsize,
    sink_latency_ns: AtomicU64,
}

impl LatencyEstimator {
    pub fn new(frame_period: Duration) -> Self {
        Self {
            inner: Arc::new(EstimatorInner {
                frame_period,
                buffered: AtomicUsize::new(0),
                sink_latency_ns: AtomicU64::new(NO_LATENCY),
            }),
        }
    }

    pub fn set_buffered(&self, frames: usize) {
        self.inner.buffered.store(frames, Ordering::Relaxed);
    }

    pub fn set_sink_latency(&self, latency: Option<Duration>) {
        let ns = latency.map_or(NO_LATENCY, |l| l.as_nanos().min(u64::MAX as u128 - 1) as u64);
        self.inner.sink_latency_ns.store(ns, Ordering::Relaxed);
    }

    pub fn estimate(&self) -> Duration {
        let ns = self.inner.sink_latency_ns.load(Ordering::Relaxed);
        let sink = (ns != NO_LATENCY).then(|| Duration::from_nanos(ns));
        latency_estimate(
            self.inner.buffered.load(Ordering::Relaxed),
            self.inner.frame_period,
            sink,
        )
    }
}

/// Periodischer Statistik-Thread
pub struct StatsReporter {
    counters: StatsCounters,
    latency: LatencyEstimator,
    memory: ProcessMemory,
    display: Arc<dyn PipelineDisplay>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(
        counters: StatsCounters,
        latency: LatencyEstimator,
        display: Arc<dyn PipelineDisplay>,
        interval: Duration,
    ) -> Self {
        Self {
            counters,
            latency,
            memory: ProcessMemory::new(),
            display,
            interval,
        }
    }

    /// Aktuelle Momentaufnahme inkl. Speicher und Latenz
    pub fn sample(&mut self) -> StatsSnapshot {
        let memory = self.memory.resident();
        self.counters.snapshot(memory, self.latency.estimate())
    }

    /// Startet den Thread. Er sendet im Intervall einen Snapshot an die
    /// Anzeige, bis `shutdown` getrennt wird, und liefert zum Schluss einen
    /// letzten Snapshot zurueck (der ebenfalls angezeigt wird).
    pub fn spawn(mut self, shutdown: Receiver<()>) -> AudioResult<JoinHandle<StatsSnapshot>> {
        thread::Builder::new()
            .name("sonance-stats".into())
            .spawn(move || {
                loop {
                    match shutdown.recv_timeout(self.interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let snapshot = self.sample();
                            report(self.display.show_stats(&snapshot), "Statistik");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let last = self.sample();
                report(self.display.show_stats(&last), "Statistik");
                trace!(bytes = last.bytes_transferred, "Statistik-Thread beendet");
                last
            })
            .map_err(|e| AudioError::Konfiguration(format!("Statistik-Thread: {e}")))
    }
}
