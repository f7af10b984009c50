//! FrameBuffer – begrenzter Frame-Puffer mit Gegendruck
//!
//! Lock-freier SPSC-Ring (`ringbuf`) fuer den schnellen Pfad. Nur die
//! blockierenden Varianten nehmen ein Mutex/Condvar-Paar, um auf
//! "nicht mehr voll" bzw. "nicht mehr leer" zu warten; die Laenge wird nach
//! jedem Aufwachen erneut geprueft.
//!
//! Genau ein Produzent und ein Konsument. Die Kapazitaet ist fest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::trace;

use crate::error::{AudioError, AudioResult};
use crate::frame::Frame;

/// Standard-Kapazitaet in Frames (klein halten, begrenzt die Latenz)
pub const DEFAULT_CAPACITY: usize = 3;

/// Gemeinsamer Zustand beider Puffer-Haelften
struct Shared {
    lock: Mutex<()>,
    changed: Condvar,
    producer_closed: AtomicBool,
    consumer_closed: AtomicBool,
    capacity: usize,
}

impl Shared {
    fn notify(&self) {
        // Lock nehmen, damit kein Warter zwischen Pruefung und wait() das Signal verpasst
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }
}

/// Warum ein blockierendes `push` nicht angenommen wurde
#[derive(Debug)]
pub enum PushError {
    /// Puffer blieb bis zum Timeout voll
    Full(Frame),
    /// Konsument ist weg
    Closed(Frame),
}

impl PushError {
    pub fn into_frame(self) -> Frame {
        match self {
            PushError::Full(frame) | PushError::Closed(frame) => frame,
        }
    }
}

/// Warum ein blockierendes `pop` nichts geliefert hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Puffer blieb bis zum Timeout leer
    Empty,
    /// Produzent geschlossen und Puffer leer
    Closed,
}

/// Konstruktor fuer ein Produzent/Konsument-Paar
pub struct FrameBuffer;

impl FrameBuffer {
    /// Erstellt einen Puffer mit fester Kapazitaet (in Frames)
    pub fn new(capacity: usize) -> AudioResult<(FrameProducer, FrameConsumer)> {
        if capacity == 0 {
            return Err(AudioError::Konfiguration(
                "Frame-Puffer braucht Kapazitaet > 0".into(),
            ));
        }

        let (producer, consumer) = HeapRb::<Frame>::new(capacity).split();
        let shared = Arc::new(Shared {
            lock: Mutex::new(()),
            changed: Condvar::new(),
            producer_closed: AtomicBool::new(false),
            consumer_closed: AtomicBool::new(false),
            capacity,
        });

        Ok((
            FrameProducer {
                inner: producer,
                shared: Arc::clone(&shared),
            },
            FrameConsumer {
                inner: consumer,
                shared,
            },
        ))
    }
}

/// Schreibende Haelfte
pub struct FrameProducer {
    inner: HeapProd<Frame>,
    shared: Arc<Shared>,
}

impl FrameProducer {
    /// Nicht-blockierend. Bei vollem Puffer kommt der Frame zurueck (Gegendruck).
    pub fn try_push(&mut self, frame: Frame) -> Result<(), Frame> {
        self.inner.try_push(frame)?;
        self.shared.notify();
        Ok(())
    }

    /// Wartet bis Platz frei ist, hoechstens `timeout` (None = unbegrenzt)
    pub fn push_blocking(&mut self, frame: Frame, timeout: Option<Duration>) -> Result<(), PushError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut frame = frame;

        loop {
            if self.shared.consumer_closed.load(Ordering::Acquire) {
                return Err(PushError::Closed(frame));
            }
            frame = match self.try_push(frame) {
                Ok(()) => return Ok(()),
                Err(frame) => frame,
            };

            let mut guard = self.shared.lock.lock();
            if !self.inner.is_full() || self.shared.consumer_closed.load(Ordering::Acquire) {
                continue;
            }
            trace!(capacity = self.shared.capacity, "Frame-Puffer voll, Produzent wartet");
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut guard, deadline).timed_out()
                        && self.inner.is_full()
                    {
                        return Err(PushError::Full(frame));
                    }
                }
                None => self.shared.changed.wait(&mut guard),
            }
        }
    }

    /// Markiert das Strom-Ende; der Konsument leert noch den Rest
    pub fn close(&mut self) {
        if !self.shared.producer_closed.swap(true, Ordering::AcqRel) {
            self.shared.notify();
        }
    }

    /// Ob der Konsument den Puffer aufgegeben hat
    pub fn is_consumer_closed(&self) -> bool {
        self.shared.consumer_closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lesende Haelfte
pub struct FrameConsumer {
    inner: HeapCons<Frame>,
    shared: Arc<Shared>,
}

impl FrameConsumer {
    /// Nicht-blockierend. `None` wenn leer.
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.inner.try_pop()?;
        self.shared.notify();
        Some(frame)
    }

    /// Wartet auf einen Frame, hoechstens `timeout` (None = unbegrenzt)
    pub fn pop_blocking(&mut self, timeout: Option<Duration>) -> Result<Frame, PopError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(frame) = self.pop() {
                return Ok(frame);
            }
            if self.shared.producer_closed.load(Ordering::Acquire) {
                // Produzent kann zwischen pop() und Pruefung noch geschrieben haben
                return self.pop().ok_or(PopError::Closed);
            }

            let mut guard = self.shared.lock.lock();
            if !self.inner.is_empty() || self.shared.producer_closed.load(Ordering::Acquire) {
                continue;
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut guard, deadline).timed_out()
                        && self.inner.is_empty()
                    {
                        return Err(PopError::Empty);
                    }
                }
                None => self.shared.changed.wait(&mut guard),
            }
        }
    }

    /// Gibt den Puffer auf; wartende Produzenten kehren mit `Closed` zurueck
    pub fn close(&mut self) {
        if !self.shared.consumer_closed.swap(true, Ordering::AcqRel) {
            self.shared.notify();
        }
    }

    /// Verwirft alle noch gepufferten Frames und liefert ihre Anzahl
    pub fn discard(&mut self) -> usize {
        let mut count = 0;
        while self.pop().is_some() {
            count += 1;
        }
        count
    }

    pub fn is_producer_closed(&self) -> bool {
        self.shared.producer_closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, vec![seq as u8; 4])
    }

    #[test]
    fn kapazitaet_null_abgelehnt() {
        assert!(FrameBuffer::new(0).is_err());
    }

    #[test]
    fn fifo_reihenfolge() {
        let (mut tx, mut rx) = FrameBuffer::new(4).unwrap();
        for i in 0..4 {
            tx.try_push(frame(i)).unwrap();
        }
        for i in 0..4 {
            assert_eq!(rx.pop().unwrap().sequence(), i);
        }
        assert!(rx.pop().is_none());
    }

    #[test]
    fn voller_puffer_gibt_frame_zurueck() {
        let (mut tx, rx) = FrameBuffer::new(2).unwrap();
        assert!(tx.try_push(frame(0)).is_ok());
        assert!(tx.try_push(frame(1)).is_ok());
        let rejected = tx.try_push(frame(2)).unwrap_err();
        assert_eq!(rejected.sequence(), 2, "Kein Frame-Verlust bei Gegendruck");
        assert_eq!(rx.len(), 2, "Kein unbegrenztes Wachstum");
    }

    #[test]
    fn push_blocking_timeout_bei_vollem_puffer() {
        let (mut tx, _rx) = FrameBuffer::new(1).unwrap();
        tx.try_push(frame(0)).unwrap();
        let err = tx
            .push_blocking(frame(1), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, PushError::Full(_)));
        assert_eq!(err.into_frame().sequence(), 1);
    }

    #[test]
    fn push_blocking_wacht_nach_pop_auf() {
        let (mut tx, mut rx) = FrameBuffer::new(1).unwrap();
        tx.try_push(frame(0)).unwrap();

        let handle = thread::spawn(move || {
            tx.push_blocking(frame(1), Some(Duration::from_secs(2))).is_ok()
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.pop().unwrap().sequence(), 0);
        assert!(handle.join().unwrap());
        assert_eq!(
            rx.pop_blocking(Some(Duration::from_secs(1))).unwrap().sequence(),
            1
        );
    }

    #[test]
    fn pop_blocking_leer_und_geschlossen() {
        let (mut tx, mut rx) = FrameBuffer::new(2).unwrap();
        assert_eq!(
            rx.pop_blocking(Some(Duration::from_millis(10))).unwrap_err(),
            PopError::Empty
        );
        tx.try_push(frame(5)).unwrap();
        tx.close();
        assert_eq!(rx.pop_blocking(None).unwrap().sequence(), 5);
        assert_eq!(rx.pop_blocking(None).unwrap_err(), PopError::Closed);
    }

    #[test]
    fn geschlossener_konsument_weckt_produzent() {
        let (mut tx, mut rx) = FrameBuffer::new(1).unwrap();
        tx.try_push(frame(0)).unwrap();

        let handle = thread::spawn(move || tx.push_blocking(frame(1), None));
        thread::sleep(Duration::from_millis(20));
        rx.close();
        assert!(matches!(handle.join().unwrap(), Err(PushError::Closed(_))));
    }

    #[test]
    fn discard_leert_puffer() {
        let (mut tx, mut rx) = FrameBuffer::new(3).unwrap();
        tx.try_push(frame(0)).unwrap();
        tx.try_push(frame(1)).unwrap();
        assert_eq!(rx.discard(), 2);
        assert!(rx.is_empty());
    }
}
