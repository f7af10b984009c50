//! Integration-Tests fuer den Pipeline-Lebenszyklus (Test-Endpunkte im Speicher)

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sonance_audio::{
    AudioError, AudioFormat, AudioResult, EndpointCounters, FileSource, Frame, FrameSink,
    FrameSource, LoudnessSample, Passthrough, Pipeline, PipelineDisplay, PipelineEvent,
    PipelineState, ReadOutcome, SampleFormat, StatsSnapshot, StreamFormat, TransformStage,
};

fn format() -> AudioFormat {
    AudioFormat::new(SampleFormat::S16, 1, 8000, 4).expect("gueltiges Format")
}

/// Endlose Quelle; zaehlt Lese-Aufrufe
struct Zaehler {
    format: AudioFormat,
    reads: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    delay: Duration,
    counters: EndpointCounters,
}

impl Zaehler {
    fn new(delay: Duration) -> Self {
        Self {
            format: format(),
            reads: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            delay,
            counters: EndpointCounters::new(),
        }
    }
}

impl FrameSource for Zaehler {
    fn name(&self) -> &str {
        "zaehler"
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, sequence: u64) -> AudioResult<ReadOutcome> {
        assert!(!self.paused.load(Ordering::SeqCst), "Lesen trotz Pause");
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::pcm(sequence, vec![sequence as u8; self.format.frame_len()], &self.format)?;
        self.counters.record(frame.len());
        Ok(ReadOutcome::Frame(frame))
    }

    fn pause(&mut self) -> AudioResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&mut self) -> AudioResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> AudioResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}

/// Senke, die Sequenznummern mitschreibt
#[derive(Clone)]
struct Protokoll {
    seen: Arc<Mutex<Vec<u64>>>,
    /// Solange gesetzt, blockiert `write`
    blocked: Arc<AtomicBool>,
    delay: Duration,
    /// Nach so vielen Frames meldet die Senke `EndpointClosed`
    close_after: Option<usize>,
    closed: Arc<AtomicU64>,
    counters: EndpointCounters,
}

impl Protokoll {
    fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            blocked: Arc::new(AtomicBool::new(false)),
            delay: Duration::ZERO,
            close_after: None,
            closed: Arc::new(AtomicU64::new(0)),
            counters: EndpointCounters::new(),
        }
    }

    fn sequences(&self) -> Vec<u64> {
        self.seen.lock().clone()
    }
}

impl FrameSink for Protokoll {
    fn name(&self) -> &str {
        "protokoll"
    }

    fn accepts(&self, _format: &StreamFormat) -> AudioResult<()> {
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> AudioResult<()> {
        while self.blocked.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        if let Some(limit) = self.close_after {
            if self.seen.lock().len() >= limit {
                return Err(AudioError::EndpointClosed("Gegenstelle weg".into()));
            }
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.seen.lock().push(frame.sequence());
        self.counters.record(frame.len());
        Ok(())
    }

    fn close(&mut self) -> AudioResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}

/// Stufe, die ab einer Sequenznummer scheitert
struct Kaputt {
    ab: u64,
}

impl TransformStage for Kaputt {
    fn name(&self) -> &str {
        "kaputt"
    }

    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        Ok(input.clone())
    }

    fn apply(&mut self, frame: Frame) -> AudioResult<Frame> {
        if frame.sequence() >= self.ab {
            return Err(AudioError::transform("kaputt", "Frame nicht verarbeitbar"));
        }
        Ok(frame)
    }
}

/// Stufe, die beim ersten Frame abstuerzt
struct Absturz;

impl TransformStage for Absturz {
    fn name(&self) -> &str {
        "absturz"
    }

    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        Ok(input.clone())
    }

    fn apply(&mut self, _frame: Frame) -> AudioResult<Frame> {
        panic!("Stufe abgestuerzt");
    }
}

#[derive(Default)]
struct Anzeige {
    stats: Mutex<Vec<StatsSnapshot>>,
    levels: Mutex<Vec<u8>>,
}

impl PipelineDisplay for Anzeige {
    fn show_stats(&self, stats: &StatsSnapshot) -> anyhow::Result<()> {
        self.stats.lock().push(*stats);
        Ok(())
    }

    fn show_loudness(&self, loudness: &LoudnessSample) -> anyhow::Result<()> {
        self.levels.lock().push(loudness.level);
        Ok(())
    }
}

fn assert_lueckenlos(seen: &[u64]) {
    for (i, seq) in seen.iter().enumerate() {
        assert_eq!(*seq, i as u64, "Sequenz {seen:?}");
    }
}

fn uebergaenge(events: &[PipelineEvent]) -> Vec<(PipelineState, PipelineState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged { from, to } => Some((*from, *to)),
            PipelineEvent::Finished(_) => None,
        })
        .collect()
}

#[test]
fn fuenf_stille_frames_in_datei_senke() {
    let format = AudioFormat::with_frame_duration(SampleFormat::S16, 1, 48_000, 40).unwrap();
    assert_eq!(format.frame_len(), 3840);

    let sink = Protokoll::new();
    let display = Arc::new(Anzeige::default());
    let pipeline = Pipeline::builder("stille")
        .source(FileSource::from_reader(
            "stille.raw",
            Cursor::new(vec![0u8; 5 * 3840]),
            format,
        ))
        .stage(Passthrough)
        .sink(sink.clone())
        .display(display.clone())
        .build()
        .unwrap();

    pipeline.start().unwrap();
    let outcome = pipeline.wait().unwrap();

    assert_eq!(outcome.final_state, PipelineState::Closed);
    assert!(outcome.is_success());
    assert_eq!(outcome.stats.bytes_transferred, 19_200);
    assert_eq!(outcome.stats.frames_transferred, 5);
    assert_eq!(outcome.stats.bytes_read, 19_200);
    assert_eq!(outcome.stats.compression_ratio(), Some(1.0));
    assert_eq!(sink.sequences(), vec![0, 1, 2, 3, 4]);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.sink_counters().bytes(), 19_200);
    assert_eq!(pipeline.source_counters().frames(), 5);

    // Letzter Snapshot geht auch an die Anzeige
    let last = *display.stats.lock().last().unwrap();
    assert_eq!(last.bytes_transferred, 19_200);
    assert!(display.levels.lock().iter().all(|level| *level == 0));
}

#[test]
fn reihenfolge_bleibt_erhalten() {
    let mut sink = Protokoll::new();
    sink.delay = Duration::from_millis(1);
    let pipeline = Pipeline::builder("reihenfolge")
        .source(FileSource::from_reader(
            "mem",
            Cursor::new(vec![7u8; 50 * 8]),
            format(),
        ))
        .sink(sink.clone())
        .buffer_capacity(2)
        .build()
        .unwrap();

    pipeline.start().unwrap();
    let outcome = pipeline.wait().unwrap();
    assert!(outcome.is_success());

    let seen = sink.sequences();
    assert_eq!(seen.len(), 50);
    assert_lueckenlos(&seen);
}

#[test]
fn gegendruck_haelt_quelle_an() {
    let source = Zaehler::new(Duration::ZERO);
    let reads = Arc::clone(&source.reads);
    let sink = Protokoll::new();
    sink.blocked.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::builder("gegendruck")
        .source(source)
        .sink(sink.clone())
        .buffer_capacity(2)
        .build()
        .unwrap();
    pipeline.start().unwrap();

    thread::sleep(Duration::from_millis(150));
    // Puffer voll + ein Frame in der Senke + einer im Treiber
    let gelesen = reads.load(Ordering::SeqCst);
    assert!(gelesen <= 4, "Quelle las {gelesen} Frames trotz blockierter Senke");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(reads.load(Ordering::SeqCst), gelesen);

    sink.blocked.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    pipeline.stop().unwrap();
    let outcome = pipeline.wait().unwrap();
    assert!(outcome.is_success());
    assert_lueckenlos(&sink.sequences());
}

#[test]
fn pause_und_fortsetzen_ohne_luecken() {
    let source = Zaehler::new(Duration::from_millis(1));
    let reads = Arc::clone(&source.reads);
    let paused = Arc::clone(&source.paused);
    let sink = Protokoll::new();

    let pipeline = Pipeline::builder("pause")
        .source(source)
        .sink(sink.clone())
        .build()
        .unwrap();
    let events = pipeline.subscribe();
    pipeline.start().unwrap();

    thread::sleep(Duration::from_millis(30));
    pipeline.pause().unwrap();
    assert!(pipeline.wait_for_state(PipelineState::Paused, Duration::from_secs(2)));
    assert!(paused.load(Ordering::SeqCst));

    let vorher = reads.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(reads.load(Ordering::SeqCst), vorher);

    // Doppelte Pause ist ein ungueltiger Uebergang
    assert!(matches!(
        pipeline.pause(),
        Err(AudioError::InvalidTransition {
            from: PipelineState::Paused,
            to: PipelineState::Paused
        })
    ));

    pipeline.resume().unwrap();
    assert!(pipeline.wait_for_state(PipelineState::Running, Duration::from_secs(2)));
    thread::sleep(Duration::from_millis(30));
    assert!(reads.load(Ordering::SeqCst) > vorher);

    pipeline.stop().unwrap();
    let outcome = pipeline.wait().unwrap();
    assert!(outcome.is_success());

    let seen = sink.sequences();
    assert_eq!(seen.len() as u64, reads.load(Ordering::SeqCst));
    assert_lueckenlos(&seen);

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        uebergaenge(&events),
        vec![
            (PipelineState::Idle, PipelineState::Running),
            (PipelineState::Running, PipelineState::Paused),
            (PipelineState::Paused, PipelineState::Running),
            (PipelineState::Running, PipelineState::Draining),
            (PipelineState::Draining, PipelineState::Closed),
        ]
    );
}

#[test]
fn stop_liefert_alle_gepufferten_frames() {
    let source = Zaehler::new(Duration::ZERO);
    let reads = Arc::clone(&source.reads);
    let closed = Arc::clone(&source.closed);
    let mut sink = Protokoll::new();
    sink.delay = Duration::from_millis(10);

    let pipeline = Pipeline::builder("drain")
        .source(source)
        .sink(sink.clone())
        .buffer_capacity(4)
        .build()
        .unwrap();
    pipeline.start().unwrap();

    thread::sleep(Duration::from_millis(100));
    pipeline.stop().unwrap();
    // Zweiter Stop waehrend des Leerens ist wirkungslos
    let _ = pipeline.stop();
    let outcome = pipeline.wait().unwrap();

    assert_eq!(outcome.final_state, PipelineState::Closed);
    let seen = sink.sequences();
    assert_eq!(seen.len() as u64, reads.load(Ordering::SeqCst));
    assert_lueckenlos(&seen);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    assert!(closed.load(Ordering::SeqCst));
}

#[test]
fn stop_aus_pause() {
    let sink = Protokoll::new();
    let pipeline = Pipeline::builder("pause-stop")
        .source(Zaehler::new(Duration::from_millis(1)))
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();
    pipeline.pause().unwrap();
    assert!(pipeline.wait_for_state(PipelineState::Paused, Duration::from_secs(2)));

    pipeline.stop().unwrap();
    let outcome = pipeline.wait().unwrap();
    assert!(outcome.is_success());
    assert_lueckenlos(&sink.sequences());
}

#[test]
fn nur_erlaubte_uebergaenge_und_ein_finished() {
    let pipeline = Pipeline::builder("ereignisse")
        .source(FileSource::from_reader("mem", Cursor::new(vec![0u8; 80]), format()))
        .sink(Protokoll::new())
        .build()
        .unwrap();
    let events = pipeline.subscribe();
    pipeline.start().unwrap();
    pipeline.wait().unwrap();

    let events: Vec<_> = events.iter().collect();
    let finished = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);
    assert!(matches!(events.last(), Some(PipelineEvent::Finished(_))));
    for (from, to) in uebergaenge(&events) {
        assert!(from.can_transition(to), "{from} -> {to}");
    }

    // Spaeter Abonnent bekommt nur das Ergebnis
    let late = pipeline.subscribe();
    assert!(matches!(late.recv(), Ok(PipelineEvent::Finished(o)) if o.is_success()));
}

#[test]
fn drain_timeout_bei_haengender_senke() {
    let sink = Protokoll::new();
    sink.blocked.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::builder("timeout")
        .source(Zaehler::new(Duration::ZERO))
        .sink(sink.clone())
        .buffer_capacity(2)
        .drain_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(30));

    pipeline.stop().unwrap();
    let outcome = pipeline.wait().unwrap();
    assert_eq!(outcome.final_state, PipelineState::Failed);
    assert!(matches!(
        outcome.error.as_deref(),
        Some(AudioError::DrainTimeout(_))
    ));

    // Abgekoppelten Senken-Thread freigeben
    sink.blocked.store(false, Ordering::SeqCst);
}

#[test]
fn transformations_fehler_beendet_mit_failed() {
    let sink = Protokoll::new();
    let source = Zaehler::new(Duration::ZERO);
    let closed = Arc::clone(&source.closed);
    let pipeline = Pipeline::builder("fehler")
        .source(source)
        .stage(Kaputt { ab: 3 })
        .sink(sink.clone())
        .build()
        .unwrap();
    let events = pipeline.subscribe();
    pipeline.start().unwrap();
    let outcome = pipeline.wait().unwrap();

    assert_eq!(outcome.final_state, PipelineState::Failed);
    assert!(!outcome.is_success());
    match outcome.error.as_deref() {
        Some(AudioError::TransformFailure { stage, .. }) => assert_eq!(stage, "kaputt"),
        other => panic!("unerwarteter Fehler: {other:?}"),
    }

    let seen = sink.sequences();
    assert!(seen.len() <= 3);
    assert_lueckenlos(&seen);
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);

    let events: Vec<_> = events.iter().collect();
    assert_eq!(
        uebergaenge(&events),
        vec![
            (PipelineState::Idle, PipelineState::Running),
            (PipelineState::Running, PipelineState::Failed),
        ]
    );
}

#[test]
fn geschlossene_senke_schliesst_pipeline() {
    let mut sink = Protokoll::new();
    sink.close_after = Some(3);
    let pipeline = Pipeline::builder("senke-weg")
        .source(Zaehler::new(Duration::ZERO))
        .sink(sink.clone())
        .build()
        .unwrap();
    let events = pipeline.subscribe();
    pipeline.start().unwrap();
    let outcome = pipeline.wait().unwrap();

    assert_eq!(outcome.final_state, PipelineState::Closed);
    assert!(outcome.error.is_none());
    assert_eq!(sink.sequences(), vec![0, 1, 2]);
    assert_eq!(outcome.stats.frames_transferred, 3);

    let events: Vec<_> = events.iter().collect();
    assert_eq!(
        uebergaenge(&events),
        vec![
            (PipelineState::Idle, PipelineState::Running),
            (PipelineState::Running, PipelineState::Draining),
            (PipelineState::Draining, PipelineState::Closed),
        ]
    );
}

#[test]
fn senke_schliesst_beim_leeren() {
    let mut sink = Protokoll::new();
    sink.close_after = Some(1);
    sink.blocked.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::builder("senke-weg-beim-leeren")
        .source(Zaehler::new(Duration::ZERO))
        .sink(sink.clone())
        .buffer_capacity(4)
        .build()
        .unwrap();
    let events = pipeline.subscribe();
    pipeline.start().unwrap();

    // Senke haelt Frame 0, Puffer voll, Treiber wartet mit dem naechsten
    thread::sleep(Duration::from_millis(50));
    pipeline.stop().unwrap();
    sink.blocked.store(false, Ordering::SeqCst);

    let outcome = pipeline.wait().unwrap();
    assert_eq!(outcome.final_state, PipelineState::Failed);
    assert!(matches!(
        outcome.error.as_deref(),
        Some(AudioError::EndpointClosed(_))
    ));
    assert_eq!(sink.sequences(), vec![0]);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);

    let events: Vec<_> = events.iter().collect();
    let uebergaenge = uebergaenge(&events);
    assert!(matches!(uebergaenge.last(), Some((_, PipelineState::Failed))));
    assert!(!uebergaenge.contains(&(PipelineState::Draining, PipelineState::Closed)));
}

#[test]
fn senke_schliesst_nach_dateiende() {
    let mut sink = Protokoll::new();
    sink.close_after = Some(2);
    sink.blocked.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::builder("senke-weg-nach-eof")
        .source(FileSource::from_reader("mem", Cursor::new(vec![1u8; 6 * 8]), format()))
        .sink(sink.clone())
        .buffer_capacity(8)
        .build()
        .unwrap();
    pipeline.start().unwrap();

    // Quelle ist am Ende, alle Frames liegen im Puffer
    assert!(pipeline.wait_for_state(PipelineState::Draining, Duration::from_secs(2)));
    sink.blocked.store(false, Ordering::SeqCst);

    let outcome = pipeline.wait().unwrap();
    assert_eq!(outcome.final_state, PipelineState::Failed);
    assert!(matches!(
        outcome.error.as_deref(),
        Some(AudioError::EndpointClosed(_))
    ));
    assert_eq!(sink.sequences(), vec![0, 1]);
}

#[test]
fn absturz_im_treiber_beendet_mit_failed() {
    let sink = Protokoll::new();
    let pipeline = Pipeline::builder("absturz")
        .source(Zaehler::new(Duration::ZERO))
        .stage(Absturz)
        .sink(sink.clone())
        .build()
        .unwrap();
    let events = pipeline.subscribe();
    pipeline.start().unwrap();

    let outcome = pipeline.wait().unwrap();
    assert_eq!(outcome.final_state, PipelineState::Failed);
    assert!(outcome.error.is_some());
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(sink.sequences().is_empty());

    let events: Vec<_> = events.iter().collect();
    let finished = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);
}

#[test]
fn ungueltige_aufrufe() {
    let pipeline = Pipeline::builder("idle")
        .source(Zaehler::new(Duration::ZERO))
        .sink(Protokoll::new())
        .build()
        .unwrap();

    assert!(matches!(pipeline.wait(), Err(AudioError::Konfiguration(_))));
    assert!(matches!(
        pipeline.pause(),
        Err(AudioError::InvalidTransition {
            from: PipelineState::Idle,
            to: PipelineState::Paused
        })
    ));
    assert!(matches!(
        pipeline.resume(),
        Err(AudioError::InvalidTransition { .. })
    ));
    assert!(matches!(
        pipeline.stop(),
        Err(AudioError::InvalidTransition {
            from: PipelineState::Idle,
            to: PipelineState::Draining
        })
    ));

    pipeline.start().unwrap();
    assert!(matches!(
        pipeline.start(),
        Err(AudioError::InvalidTransition { .. })
    ));
    pipeline.stop().unwrap();
    let outcome = pipeline.wait().unwrap();
    assert!(outcome.is_success());
    assert!(matches!(
        pipeline.pause(),
        Err(AudioError::InvalidTransition {
            from: PipelineState::Closed,
            ..
        })
    ));
}

#[test]
fn drop_ohne_start_schliesst_endpunkte() {
    let source = Zaehler::new(Duration::ZERO);
    let closed = Arc::clone(&source.closed);
    let sink = Protokoll::new();
    let pipeline = Pipeline::builder("verworfen")
        .source(source)
        .sink(sink.clone())
        .build()
        .unwrap();
    drop(pipeline);
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn drop_einer_laufenden_pipeline_stoppt() {
    let source = Zaehler::new(Duration::from_millis(1));
    let closed = Arc::clone(&source.closed);
    let sink = Protokoll::new();
    let pipeline = Pipeline::builder("drop")
        .source(source)
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    drop(pipeline);

    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    assert_lueckenlos(&sink.sequences());
}

#[test]
fn stop_von_anderem_thread() {
    let sink = Protokoll::new();
    let pipeline = Arc::new(
        Pipeline::builder("fern")
            .source(Zaehler::new(Duration::from_millis(1)))
            .sink(sink.clone())
            .build()
            .unwrap(),
    );
    pipeline.start().unwrap();

    let remote = Arc::clone(&pipeline);
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        remote.stop()
    });
    let outcome = pipeline.wait().unwrap();
    stopper.join().unwrap().unwrap();
    assert!(outcome.is_success());
    assert!(pipeline.outcome().is_some());
}
