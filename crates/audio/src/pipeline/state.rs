//! Zustandsmaschine und Ereignisse einer Pipeline
//!
//! Erlaubte Uebergaenge:
//! `Idle -> Running`, `Running <-> Paused`, `Running|Paused -> Draining`,
//! `Draining -> Closed` und `Running|Paused|Draining -> Failed`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::error::{AudioError, AudioResult};
use crate::observer::{report, PipelineDisplay};
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Draining,
    Closed,
    Failed,
}

impl PipelineState {
    /// Closed und Failed sind endgueltig
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn can_transition(self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Draining)
                | (Paused, Draining)
                | (Draining, Closed)
                | (Running, Failed)
                | (Paused, Failed)
                | (Draining, Failed)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Endergebnis einer Pipeline
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub final_state: PipelineState,
    /// Ursache bei `Failed`
    pub error: Option<Arc<AudioError>>,
    /// Letzter Statistik-Snapshot
    pub stats: StatsSnapshot,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.final_state == PipelineState::Closed && self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// Kommt genau einmal, als letztes Ereignis
    Finished(PipelineOutcome),
}

/// Wiederholungs-Politik fuer voruebergehende Endpunkt-Fehler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Versuche insgesamt (mindestens 1)
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    /// Keine Wiederholung
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Fuehrt `op` aus und wiederholt nur bei `is_transient()`
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> AudioResult<T>) -> AudioResult<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(attempt, max = attempts, "{what} voruebergehend fehlgeschlagen: {e}");
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
                result => return result,
            }
        }
    }
}

/// Steuer-Anforderungen an den Treiber-Thread
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Control {
    pub pause_requested: bool,
    pub stop_requested: Option<Instant>,
}

struct CellInner {
    state: PipelineState,
    control: Control,
    outcome: Option<PipelineOutcome>,
    subscribers: Vec<Sender<PipelineEvent>>,
}

/// Gemeinsamer, lock-geschuetzter Zustand einer Pipeline
pub(crate) struct StateCell {
    name: String,
    inner: Mutex<CellInner>,
    changed: Condvar,
    display: Arc<dyn PipelineDisplay>,
}

impl StateCell {
    pub fn new(name: impl Into<String>, display: Arc<dyn PipelineDisplay>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(CellInner {
                state: PipelineState::Idle,
                control: Control::default(),
                outcome: None,
                subscribers: Vec::new(),
            }),
            changed: Condvar::new(),
            display,
        }
    }

    pub fn get(&self) -> PipelineState {
        self.inner.lock().state
    }

    pub fn control(&self) -> Control {
        self.inner.lock().control
    }

    /// Fuehrt einen Uebergang aus oder lehnt ihn mit `InvalidTransition` ab
    pub fn transition(&self, to: PipelineState) -> AudioResult<PipelineState> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if !from.can_transition(to) {
            return Err(AudioError::InvalidTransition { from, to });
        }
        inner.state = to;
        inner
            .subscribers
            .retain(|tx| tx.send(PipelineEvent::StateChanged { from, to }).is_ok());
        drop(inner);
        self.changed.notify_all();

        info!(pipeline = %self.name, von = %from, nach = %to, "Zustandswechsel");
        report(self.display.show_state(from, to), "Zustand");
        Ok(from)
    }

    /// Aendert die Steuer-Anforderungen unter dem Lock; `f` sieht den Zustand
    pub fn update_control<T>(
        &self,
        f: impl FnOnce(PipelineState, &mut Control) -> AudioResult<T>,
    ) -> AudioResult<T> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let result = f(state, &mut inner.control);
        drop(inner);
        self.changed.notify_all();
        result
    }

    /// Wartet (Treiber-Thread im Zustand Paused) bis Resume oder Stop kommt
    pub fn wait_while_paused(&self) -> Control {
        let mut inner = self.inner.lock();
        while inner.control.pause_requested && inner.control.stop_requested.is_none() {
            self.changed.wait(&mut inner);
        }
        inner.control
    }

    /// Wartet hoechstens `timeout` auf `target`. Kehrt frueh mit `false`
    /// zurueck, wenn ein anderer Endzustand erreicht wurde.
    pub fn wait_for_state(&self, target: PipelineState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.state == target {
                return true;
            }
            if inner.state.is_terminal() {
                return false;
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == target;
            }
        }
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock();
        match &inner.outcome {
            // Spaete Abonnenten bekommen nur noch das Ergebnis
            Some(outcome) => {
                let _ = tx.send(PipelineEvent::Finished(outcome.clone()));
            }
            None => inner.subscribers.push(tx),
        }
        rx
    }

    /// Hinterlegt das Ergebnis und sendet `Finished`. Nur der erste Aufruf zaehlt.
    pub fn finish(&self, outcome: PipelineOutcome) {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            return;
        }
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(PipelineEvent::Finished(outcome.clone()));
        }
        inner.outcome = Some(outcome);
        drop(inner);
        self.changed.notify_all();
    }

    pub fn outcome(&self) -> Option<PipelineOutcome> {
        self.inner.lock().outcome.clone()
    }

    /// Blockiert bis das Ergebnis vorliegt
    pub fn wait_outcome(&self) -> PipelineOutcome {
        let mut inner = self.inner.lock();
        loop {
            if let Some(outcome) = &inner.outcome {
                return outcome.clone();
            }
            self.changed.wait(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::LogDisplay;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn nur_erlaubte_kanten() {
        use PipelineState::*;
        let all = [Idle, Running, Paused, Draining, Closed, Failed];
        let allowed = [
            (Idle, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, Draining),
            (Paused, Draining),
            (Draining, Closed),
            (Running, Failed),
            (Paused, Failed),
            (Draining, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn ungueltiger_uebergang_abgelehnt() {
        let cell = StateCell::new("test", Arc::new(LogDisplay));
        let err = cell.transition(PipelineState::Paused).unwrap_err();
        assert!(matches!(
            err,
            AudioError::InvalidTransition {
                from: PipelineState::Idle,
                to: PipelineState::Paused
            }
        ));
        assert_eq!(cell.get(), PipelineState::Idle);
    }

    #[test]
    fn ereignisse_und_finished_einmal() {
        let cell = StateCell::new("test", Arc::new(LogDisplay));
        let rx = cell.subscribe();
        cell.transition(PipelineState::Running).unwrap();
        cell.transition(PipelineState::Draining).unwrap();
        cell.transition(PipelineState::Closed).unwrap();
        let outcome = PipelineOutcome {
            final_state: PipelineState::Closed,
            error: None,
            stats: StatsSnapshot::default(),
        };
        cell.finish(outcome.clone());
        cell.finish(outcome);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[3], PipelineEvent::Finished(_)));
        assert!(cell.wait_outcome().is_success());

        let late = cell.subscribe();
        assert!(matches!(late.try_recv(), Ok(PipelineEvent::Finished(_))));
    }

    #[test]
    fn warten_auf_zustand() {
        let cell = Arc::new(StateCell::new("test", Arc::new(LogDisplay)));
        let remote = Arc::clone(&cell);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.transition(PipelineState::Running).unwrap();
        });
        assert!(cell.wait_for_state(PipelineState::Running, Duration::from_secs(2)));
        assert!(!cell.wait_for_state(PipelineState::Paused, Duration::from_millis(10)));
        t.join().unwrap();
    }

    #[test]
    fn retry_nur_bei_voruebergehenden_fehlern() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        };

        let calls = AtomicU32::new(0);
        let result = policy.run("lesen", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AudioError::Xrun("underrun".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: AudioResult<()> = policy.run("lesen", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AudioError::Xrun("underrun".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: AudioResult<()> = policy.run("schreiben", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AudioError::FormatMismatch("nein".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
