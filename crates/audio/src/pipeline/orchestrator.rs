//! Orchestrator: Lebenszyklus und Threads einer Pipeline
//!
//! Pro Pipeline laufen vier Threads:
//! - `sonance-pipeline`: liest die Quelle, wendet die Stufen an und legt die
//!   Frames in den Frame-Puffer. Einziger Schreiber von Zustandswechseln
//!   nach `start()`.
//! - `sonance-sink`: entnimmt Frames und schreibt sie in die Senke.
//! - `sonance-observer`: Lautstaerke-Messung auf Kopien.
//! - `sonance-stats`: periodische Statistik-Snapshots.
//!
//! Pause und Stop werden an der Lese-Grenze der Quelle beobachtet. Beim
//! Stoppen wird der Puffer in die Senke geleert, dann die Senke geschlossen
//! und zuletzt die Quelle freigegeben.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::builder::PipelineConfig;
use super::state::{PipelineEvent, PipelineOutcome, PipelineState, RetryPolicy, StateCell};
use crate::buffer::{FrameConsumer, FrameProducer, PopError, PushError};
use crate::endpoint::{EndpointCounters, FrameSink, FrameSource, ReadOutcome};
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, StreamFormat};
use crate::frame::Frame;
use crate::metering::MeteringStage;
use crate::observer::{ObserverHub, PipelineDisplay};
use crate::stats::{LatencyEstimator, ProcessMemory, StatsCounters, StatsReporter, StatsSnapshot};
use crate::transform::TransformChain;

/// Wartezeit der blockierenden Puffer-Aufrufe zwischen zwei Steuer-Pruefungen
const POLL: Duration = Duration::from_millis(20);

/// Bestandteile vor dem Start
pub(crate) struct Parts {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
    pub chain: TransformChain,
    pub producer: FrameProducer,
    pub consumer: FrameConsumer,
    pub metering: Option<MeteringStage>,
}

/// Eine Quelle, null oder mehr Stufen, eine Senke
pub struct Pipeline {
    name: String,
    cell: Arc<StateCell>,
    parts: Mutex<Option<Parts>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    input: AudioFormat,
    output: StreamFormat,
    config: PipelineConfig,
    display: Arc<dyn PipelineDisplay>,
    counters: StatsCounters,
    latency: LatencyEstimator,
    memory: Mutex<ProcessMemory>,
    source_counters: EndpointCounters,
    sink_counters: EndpointCounters,
    observer_dropped: Arc<AtomicU64>,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> super::PipelineBuilder {
        super::PipelineBuilder::new(name)
    }

    pub(crate) fn new(
        name: String,
        parts: Parts,
        input: AudioFormat,
        output: StreamFormat,
        config: PipelineConfig,
        display: Arc<dyn PipelineDisplay>,
    ) -> Self {
        let source_counters = parts.source.counters();
        let sink_counters = parts.sink.counters();
        Self {
            cell: Arc::new(StateCell::new(name.clone(), Arc::clone(&display))),
            name,
            parts: Mutex::new(Some(parts)),
            driver: Mutex::new(None),
            input,
            output,
            config,
            display,
            counters: StatsCounters::new(),
            latency: LatencyEstimator::new(input.frame_period()),
            memory: Mutex::new(ProcessMemory::new()),
            source_counters,
            sink_counters,
            observer_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        self.cell.get()
    }

    /// Format der Quelle
    pub fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    /// Format hinter der Stufen-Kette
    pub fn output_format(&self) -> &StreamFormat {
        &self.output
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Startet die Threads (`Idle -> Running`)
    pub fn start(&self) -> AudioResult<()> {
        let mut guard = self.parts.lock();
        let Some(mut parts) = guard.take() else {
            return Err(AudioError::InvalidTransition {
                from: self.cell.get(),
                to: PipelineState::Running,
            });
        };
        if let Err(e) = parts.chain.reset_all() {
            *guard = Some(parts);
            return Err(e);
        }
        if let Err(e) = self.cell.transition(PipelineState::Running) {
            *guard = Some(parts);
            return Err(e);
        }
        drop(guard);

        self.counters.start();
        let driver = Driver {
            name: self.name.clone(),
            cell: Arc::clone(&self.cell),
            source: parts.source,
            chain: parts.chain,
            producer: parts.producer,
            retry: self.config.retry,
            drain_timeout: self.config.drain_timeout,
            latency: self.latency.clone(),
            counters: self.counters.clone(),
            next_sequence: 0,
        };
        let launch = Launch {
            sink: parts.sink,
            consumer: parts.consumer,
            metering: parts.metering,
            config: self.config,
            display: Arc::clone(&self.display),
            counters: self.counters.clone(),
            observer_dropped: Arc::clone(&self.observer_dropped),
        };

        let cell = Arc::clone(&self.cell);
        let counters = self.counters.clone();
        let latency = self.latency.clone();
        let guard = DriverGuard {
            name: self.name.clone(),
            cell: Arc::clone(&self.cell),
            counters: self.counters.clone(),
            latency: self.latency.clone(),
        };
        let spawned = thread::Builder::new()
            .name("sonance-pipeline".into())
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| driver.run(launch))).is_err() {
                    guard.crashed();
                }
            });
        match spawned {
            Ok(handle) => {
                *self.driver.lock() = Some(handle);
                info!(pipeline = %self.name, "Pipeline gestartet");
                Ok(())
            }
            Err(e) => {
                error!(pipeline = %self.name, "Treiber-Thread konnte nicht starten: {e}");
                let _ = cell.transition(PipelineState::Failed);
                counters.stop();
                let error = AudioError::Io(e);
                let message = error.to_string();
                cell.finish(PipelineOutcome {
                    final_state: PipelineState::Failed,
                    error: Some(Arc::new(error)),
                    stats: counters.snapshot(0, latency.estimate()),
                });
                Err(AudioError::Konfiguration(message))
            }
        }
    }

    /// Fordert Pause an; wirksam an der naechsten Lese-Grenze
    pub fn pause(&self) -> AudioResult<()> {
        self.cell.update_control(|state, control| match state {
            PipelineState::Running if control.stop_requested.is_some() => {
                Err(AudioError::InvalidTransition {
                    from: PipelineState::Draining,
                    to: PipelineState::Paused,
                })
            }
            PipelineState::Running => {
                control.pause_requested = true;
                Ok(())
            }
            other => Err(AudioError::InvalidTransition {
                from: other,
                to: PipelineState::Paused,
            }),
        })
    }

    /// Setzt eine pausierte Pipeline fort (Stufen-Zustand bleibt erhalten)
    pub fn resume(&self) -> AudioResult<()> {
        self.cell.update_control(|state, control| match state {
            PipelineState::Paused => {
                control.pause_requested = false;
                Ok(())
            }
            PipelineState::Running if control.pause_requested => {
                control.pause_requested = false;
                Ok(())
            }
            other => Err(AudioError::InvalidTransition {
                from: other,
                to: PipelineState::Running,
            }),
        })
    }

    /// Fordert geordnetes Beenden an (`Running|Paused -> Draining -> Closed`).
    ///
    /// Ein zweiter Aufruf waehrend des Leerens ist wirkungslos.
    pub fn stop(&self) -> AudioResult<()> {
        self.cell.update_control(|state, control| match state {
            PipelineState::Running | PipelineState::Paused => {
                control.stop_requested.get_or_insert_with(Instant::now);
                Ok(())
            }
            PipelineState::Draining => Ok(()),
            other => Err(AudioError::InvalidTransition {
                from: other,
                to: PipelineState::Draining,
            }),
        })
    }

    /// Blockiert bis die Pipeline beendet ist
    pub fn wait(&self) -> AudioResult<PipelineOutcome> {
        if self.parts.lock().is_some() {
            return Err(AudioError::Konfiguration(format!(
                "Pipeline {} wurde nicht gestartet",
                self.name
            )));
        }
        let outcome = self.cell.wait_outcome();
        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                error!(pipeline = %self.name, "Treiber-Thread ist abgestuerzt");
            }
        }
        Ok(outcome)
    }

    /// Wartet hoechstens `timeout` auf einen Zustand
    pub fn wait_for_state(&self, state: PipelineState, timeout: Duration) -> bool {
        self.cell.wait_for_state(state, timeout)
    }

    /// Ergebnis, falls die Pipeline bereits beendet ist
    pub fn outcome(&self) -> Option<PipelineOutcome> {
        self.cell.outcome()
    }

    /// Ereignis-Kanal; `Finished` kommt genau einmal
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.cell.subscribe()
    }

    /// Aktuelle Statistik
    pub fn stats(&self) -> StatsSnapshot {
        let memory = self.memory.lock().resident();
        self.counters.snapshot(memory, self.latency.estimate())
    }

    pub fn source_counters(&self) -> &EndpointCounters {
        &self.source_counters
    }

    pub fn sink_counters(&self) -> &EndpointCounters {
        &self.sink_counters
    }

    /// Fuer die Messung verworfene Frames (nie aus dem Datenpfad)
    pub fn observer_dropped(&self) -> u64 {
        self.observer_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(mut parts) = self.parts.get_mut().take() {
            // Nie gestartet: Endpunkte trotzdem freigeben
            if let Err(e) = parts.sink.close() {
                warn!(pipeline = %self.name, "Senke schliessen: {e}");
            }
            if let Err(e) = parts.source.close() {
                warn!(pipeline = %self.name, "Quelle freigeben: {e}");
            }
            return;
        }
        let _ = self.stop();
        if let Some(handle) = self.driver.get_mut().take() {
            let _ = handle.join();
        }
    }
}

/// Beendet die Pipeline mit `Failed`, falls der Treiber-Thread abstuerzt.
/// Ohne ihn bliebe `wait()` fuer immer haengen.
struct DriverGuard {
    name: String,
    cell: Arc<StateCell>,
    counters: StatsCounters,
    latency: LatencyEstimator,
}

impl DriverGuard {
    fn crashed(self) {
        error!(pipeline = %self.name, "Treiber-Thread ist abgestuerzt");
        if !self.cell.get().is_terminal() {
            let _ = self.cell.transition(PipelineState::Failed);
        }
        self.counters.stop();
        self.cell.finish(PipelineOutcome {
            final_state: PipelineState::Failed,
            error: Some(Arc::new(AudioError::Konfiguration(
                "Treiber-Thread abgestuerzt".into(),
            ))),
            stats: self.counters.snapshot(0, self.latency.estimate()),
        });
    }
}

/// Was der Treiber-Thread beim Start zusaetzlich aufbaut
struct Launch {
    sink: Box<dyn FrameSink>,
    consumer: FrameConsumer,
    metering: Option<MeteringStage>,
    config: PipelineConfig,
    display: Arc<dyn PipelineDisplay>,
    counters: StatsCounters,
    observer_dropped: Arc<AtomicU64>,
}

/// Warum der Lese-Pfad endet
enum DriverExit {
    EndOfStream,
    Stopped,
    SourceClosed,
    SinkGone,
    Failed(AudioError),
}

/// Warum der Senken-Thread endet
#[derive(Debug)]
enum WriterExit {
    Drained,
    SinkClosed,
    Aborted,
    Failed(AudioError),
}

struct WriterHandle {
    done: Receiver<WriterExit>,
    abort: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WriterHandle {
    fn wait(&self, timeout: Duration) -> Option<WriterExit> {
        match self.done.recv_timeout(timeout) {
            Ok(exit) => Some(exit),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(WriterExit::Failed(AudioError::Konfiguration(
                "Senken-Thread ohne Ergebnis beendet".into(),
            ))),
        }
    }
}

struct Driver {
    name: String,
    cell: Arc<StateCell>,
    source: Box<dyn FrameSource>,
    chain: TransformChain,
    producer: FrameProducer,
    retry: RetryPolicy,
    drain_timeout: Duration,
    latency: LatencyEstimator,
    counters: StatsCounters,
    next_sequence: u64,
}

impl Driver {
    fn run(mut self, launch: Launch) {
        let Launch {
            sink,
            consumer,
            metering,
            config,
            display,
            counters,
            observer_dropped,
        } = launch;

        let (hub, observer) = match ObserverHub::spawn_counted(
            Arc::clone(&display),
            metering,
            config.observer_queue,
            observer_dropped,
        ) {
            Ok((hub, handle)) => (Some(hub), Some(handle)),
            Err(e) => {
                warn!(pipeline = %self.name, "Ohne Lautstaerke-Messung: {e}");
                (None, None)
            }
        };

        let (stats_tx, stats_rx) = bounded::<()>(1);
        let stats = StatsReporter::new(counters.clone(), self.latency.clone(), display, config.stats_interval)
            .spawn(stats_rx)
            .map_err(|e| warn!(pipeline = %self.name, "Ohne Statistik-Thread: {e}"))
            .ok();

        let writer = SinkWriter {
            name: self.name.clone(),
            sink,
            consumer,
            retry: config.retry,
            counters: counters.clone(),
            latency: self.latency.clone(),
            hub: hub.clone(),
            abort: Arc::new(AtomicBool::new(false)),
            cell: Arc::clone(&self.cell),
        };
        let writer = match writer.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                let outcome = self.finish_without_writer(e, &counters, stats_tx, stats);
                self.cell.finish(outcome);
                return;
            }
        };

        let exit = self.pump(hub.as_ref());
        drop(hub);
        let (error, writer_done) = self.settle(exit, &writer);

        if let Err(e) = self.source.close() {
            warn!(pipeline = %self.name, "Quelle freigeben fehlgeschlagen: {e}");
        }

        let final_state = match &error {
            Some(e) => {
                if self.cell.get() != PipelineState::Failed {
                    self.enter(PipelineState::Failed);
                }
                error!(pipeline = %self.name, "Pipeline fehlgeschlagen: {e}");
                PipelineState::Failed
            }
            None => {
                self.enter(PipelineState::Closed);
                PipelineState::Closed
            }
        };

        counters.stop();
        drop(stats_tx);
        let stats = stats
            .and_then(|h| h.join().ok())
            .unwrap_or_else(|| counters.snapshot(0, self.latency.estimate()));

        if writer_done {
            let _ = writer.thread.join();
            if let Some(observer) = observer {
                let _ = observer.join();
            }
        } else {
            warn!(pipeline = %self.name, "Senken-Thread haengt, wird abgekoppelt");
        }

        info!(
            pipeline = %self.name,
            zustand = %final_state,
            bytes = stats.bytes_transferred,
            frames = stats.frames_transferred,
            "Pipeline beendet"
        );
        self.cell.finish(PipelineOutcome {
            final_state,
            error: error.map(Arc::new),
            stats,
        });
    }

    /// Lese-Schleife bis Dateiende, Stop oder Fehler
    fn pump(&mut self, hub: Option<&ObserverHub>) -> DriverExit {
        loop {
            let control = self.cell.control();
            if control.stop_requested.is_some() {
                return DriverExit::Stopped;
            }
            if control.pause_requested {
                if let Err(e) = self.pause_here(hub) {
                    return DriverExit::Failed(e);
                }
                continue;
            }

            let sequence = self.next_sequence;
            let source = &mut self.source;
            let frame = match self.retry.run("Quelle lesen", || source.read(sequence)) {
                Ok(ReadOutcome::Frame(frame)) => frame,
                Ok(ReadOutcome::EndOfStream) => {
                    info!(pipeline = %self.name, frames = sequence, "Quelle am Ende");
                    return DriverExit::EndOfStream;
                }
                Err(e) if e.is_endpoint_closed() => {
                    info!(pipeline = %self.name, "Quelle geschlossen: {e}");
                    return DriverExit::SourceClosed;
                }
                Err(e) => return DriverExit::Failed(e),
            };
            self.next_sequence += 1;
            self.counters.record_read(frame.len());

            let frame = match self.chain.apply(frame) {
                Ok(frame) => frame,
                Err(e) => return DriverExit::Failed(e),
            };
            if let Some(exit) = self.admit(frame) {
                return exit;
            }
        }
    }

    /// Haelt die Quelle an und wartet auf Resume oder Stop
    fn pause_here(&mut self, hub: Option<&ObserverHub>) -> AudioResult<()> {
        self.source.pause()?;
        self.cell.transition(PipelineState::Paused)?;
        if let Some(hub) = hub {
            hub.paused(self.next_sequence);
        }
        let control = self.cell.wait_while_paused();
        if control.stop_requested.is_some() {
            return Ok(());
        }
        self.source.resume()?;
        self.cell.transition(PipelineState::Running)?;
        Ok(())
    }

    /// Legt den Frame in den Puffer; wartet bei vollem Puffer (Gegendruck)
    fn admit(&mut self, frame: Frame) -> Option<DriverExit> {
        let mut frame = frame;
        loop {
            match self.producer.push_blocking(frame, Some(POLL)) {
                Ok(()) => {
                    self.latency.set_buffered(self.producer.len());
                    return None;
                }
                Err(PushError::Closed(_)) => return Some(DriverExit::SinkGone),
                Err(PushError::Full(back)) => {
                    frame = back;
                    if let Some(since) = self.cell.control().stop_requested {
                        if since.elapsed() >= self.drain_timeout {
                            return Some(DriverExit::Failed(AudioError::DrainTimeout(
                                self.drain_timeout,
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Wertet das Ende des Lese-Pfads aus und leert bzw. verwirft den Puffer.
    /// Liefert den Fehler (falls einer) und ob der Senken-Thread fertig ist.
    fn settle(&mut self, exit: DriverExit, writer: &WriterHandle) -> (Option<AudioError>, bool) {
        match exit {
            DriverExit::Failed(e) => {
                error!(pipeline = %self.name, "Laufzeitfehler: {e}");
                self.enter(PipelineState::Failed);
                writer.abort.store(true, Ordering::Release);
                self.producer.close();
                let done = writer.wait(self.drain_timeout).is_some();
                (Some(e), done)
            }
            DriverExit::SinkGone => match writer.wait(self.drain_timeout) {
                Some(WriterExit::Failed(e)) => {
                    self.enter(PipelineState::Failed);
                    (Some(e), true)
                }
                Some(_) => {
                    info!(pipeline = %self.name, "Senke beendet, Pipeline wird geschlossen");
                    self.enter(PipelineState::Draining);
                    (None, true)
                }
                None => {
                    self.enter(PipelineState::Draining);
                    (Some(AudioError::DrainTimeout(self.drain_timeout)), false)
                }
            },
            DriverExit::EndOfStream | DriverExit::Stopped | DriverExit::SourceClosed => {
                self.enter(PipelineState::Draining);
                self.producer.close();
                match writer.wait(self.drain_timeout) {
                    Some(WriterExit::Failed(e)) => (Some(e), true),
                    Some(exit) => {
                        debug!(pipeline = %self.name, ?exit, "Puffer geleert");
                        (None, true)
                    }
                    None => {
                        writer.abort.store(true, Ordering::Release);
                        (Some(AudioError::DrainTimeout(self.drain_timeout)), false)
                    }
                }
            }
        }
    }

    fn finish_without_writer(
        &mut self,
        e: AudioError,
        counters: &StatsCounters,
        stats_tx: Sender<()>,
        stats: Option<JoinHandle<StatsSnapshot>>,
    ) -> PipelineOutcome {
        error!(pipeline = %self.name, "Senken-Thread konnte nicht starten: {e}");
        self.enter(PipelineState::Failed);
        if let Err(close) = self.source.close() {
            warn!(pipeline = %self.name, "Quelle freigeben fehlgeschlagen: {close}");
        }
        counters.stop();
        drop(stats_tx);
        let stats = stats
            .and_then(|h| h.join().ok())
            .unwrap_or_else(|| counters.snapshot(0, self.latency.estimate()));
        PipelineOutcome {
            final_state: PipelineState::Failed,
            error: Some(Arc::new(e)),
            stats,
        }
    }

    /// Zustandswechsel aus dem Treiber; Ablehnungen werden nur geloggt
    fn enter(&self, to: PipelineState) {
        if let Err(e) = self.cell.transition(to) {
            error!(pipeline = %self.name, "{e}");
        }
    }
}

struct SinkWriter {
    name: String,
    sink: Box<dyn FrameSink>,
    consumer: FrameConsumer,
    retry: RetryPolicy,
    counters: StatsCounters,
    latency: LatencyEstimator,
    hub: Option<ObserverHub>,
    abort: Arc<AtomicBool>,
    cell: Arc<StateCell>,
}

impl SinkWriter {
    fn spawn(self) -> AudioResult<WriterHandle> {
        let abort = Arc::clone(&self.abort);
        let (done_tx, done) = bounded::<WriterExit>(1);
        let thread = thread::Builder::new()
            .name("sonance-sink".into())
            .spawn(move || {
                let exit = self.run();
                let _ = done_tx.send(exit);
            })?;
        Ok(WriterHandle {
            done,
            abort,
            thread,
        })
    }

    /// Stop angefordert oder Lese-Pfad beendet: der Puffer wird geleert
    fn draining(&self) -> bool {
        self.consumer.is_producer_closed() || self.cell.control().stop_requested.is_some()
    }

    fn run(mut self) -> WriterExit {
        let exit = loop {
            if self.abort.load(Ordering::Acquire) {
                break WriterExit::Aborted;
            }
            match self.consumer.pop_blocking(Some(POLL)) {
                Ok(frame) => {
                    self.latency.set_buffered(self.consumer.len());
                    let sink = &mut self.sink;
                    match self.retry.run("Senke schreiben", || sink.write(&frame)) {
                        Ok(()) => {
                            self.counters.record(frame.len());
                            self.latency.set_sink_latency(self.sink.latency());
                            if let Some(hub) = &self.hub {
                                hub.notify(&frame);
                            }
                        }
                        Err(e) if e.is_endpoint_closed() => {
                            if self.draining() {
                                // Zugelassene Frames erreichen die Senke nicht mehr
                                error!(pipeline = %self.name, "Senke beim Leeren geschlossen: {e}");
                                break WriterExit::Failed(e);
                            }
                            info!(pipeline = %self.name, "Senke geschlossen: {e}");
                            break WriterExit::SinkClosed;
                        }
                        Err(e) => break WriterExit::Failed(e),
                    }
                }
                Err(PopError::Empty) => continue,
                Err(PopError::Closed) => break WriterExit::Drained,
            }
        };

        self.consumer.close();
        let discarded = self.consumer.discard();
        if discarded > 0 {
            warn!(pipeline = %self.name, frames = discarded, "Gepufferte Frames verworfen");
        }
        self.latency.set_buffered(0);
        drop(self.hub.take());

        let exit = match exit {
            WriterExit::Drained => match self.sink.flush() {
                Ok(()) => WriterExit::Drained,
                Err(e) => WriterExit::Failed(e),
            },
            other => other,
        };
        match self.sink.close() {
            Ok(()) => exit,
            Err(e) => {
                warn!(pipeline = %self.name, "Senke schliessen fehlgeschlagen: {e}");
                match exit {
                    WriterExit::Drained => WriterExit::Failed(e),
                    other => other,
                }
            }
        }
    }
}
