//! Strom-Endpunkte: Quellen und Senken von Frames
//!
//! Jede Variante (Geraet, Datei, Socket) fuehrt pro Aufruf genau einen
//! Versuch aus. Wiederholungen entscheidet die Pipeline, nie der Endpunkt.

pub mod device;
pub mod file;
pub mod socket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, StreamFormat};
use crate::frame::Frame;

pub use device::{DeviceSink, DeviceSource};
pub use file::{FileSink, FileSource};
pub use socket::{Connection, SocketSink, SocketSource};

/// Ergebnis eines Lese-Aufrufs
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    EndOfStream,
}

/// Produzent von Frames
pub trait FrameSource: Send {
    /// Anzeigename fuer Logs
    fn name(&self) -> &str;

    /// Format der gelieferten Frames
    fn format(&self) -> AudioFormat;

    /// Liest genau einen Frame; `sequence` vergibt der Treiber
    fn read(&mut self, sequence: u64) -> AudioResult<ReadOutcome>;

    /// Produktion anhalten (z.B. Geraete-Pause). Standard: nichts zu tun.
    fn pause(&mut self) -> AudioResult<()> {
        Ok(())
    }

    fn resume(&mut self) -> AudioResult<()> {
        Ok(())
    }

    /// Gibt die Quelle frei. Mehrfache Aufrufe sind wirkungslos.
    fn close(&mut self) -> AudioResult<()>;

    fn counters(&self) -> EndpointCounters;
}

/// Konsument von Frames
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    /// Prueft beim Aufbau, ob die Senke dieses Nutzlast-Format annimmt
    fn accepts(&self, format: &StreamFormat) -> AudioResult<()>;

    /// Schreibt genau einen Frame
    fn write(&mut self, frame: &Frame) -> AudioResult<()>;

    fn flush(&mut self) -> AudioResult<()> {
        Ok(())
    }

    /// Schliesst die Senke. Mehrfache Aufrufe sind wirkungslos.
    fn close(&mut self) -> AudioResult<()>;

    /// Latenz zwischen Annahme und Ausgabe, falls bekannt
    fn latency(&self) -> Option<Duration> {
        None
    }

    fn counters(&self) -> EndpointCounters;
}

/// Byte- und Frame-Zaehler eines Endpunkts.
///
/// Billig klonbar; alle Klone teilen dieselben Zaehler. Werte steigen
/// monoton.
#[derive(Debug, Clone, Default)]
pub struct EndpointCounters {
    inner: Arc<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    bytes: AtomicU64,
    frames: AtomicU64,
}

impl EndpointCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verbucht einen uebertragenen Frame
    pub fn record(&self, bytes: usize) {
        self.inner.bytes.fetch_add(bytes as u64, Ordering::Release);
        self.inner.frames.fetch_add(1, Ordering::Release);
    }

    pub fn bytes(&self) -> u64 {
        self.inner.bytes.load(Ordering::Acquire)
    }

    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Acquire)
    }
}

/// Annahme-Pruefung fuer Byte-Senken (Datei, Socket): jede Nutzlast ist erlaubt
pub(crate) fn accepts_any(_format: &StreamFormat) -> AudioResult<()> {
    Ok(())
}

/// Annahme-Pruefung fuer Senken mit festem PCM-Format
pub(crate) fn accepts_exact(own: &AudioFormat, format: &StreamFormat, name: &str) -> AudioResult<()> {
    match format {
        StreamFormat::Pcm(f) if f == own => Ok(()),
        other => Err(AudioError::FormatMismatch(format!(
            "{name} erwartet PCM {own}, bekommt {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    #[test]
    fn zaehler_teilen_zustand() {
        let counters = EndpointCounters::new();
        let clone = counters.clone();
        counters.record(100);
        counters.record(50);
        assert_eq!(clone.bytes(), 150);
        assert_eq!(clone.frames(), 2);
    }

    #[test]
    fn exakte_annahme() {
        let own = AudioFormat::new(SampleFormat::S16, 2, 48000, 960).unwrap();
        assert!(accepts_exact(&own, &StreamFormat::Pcm(own), "sink").is_ok());
        assert!(accepts_exact(&own, &StreamFormat::Pcm(own.with_channels(1)), "sink").is_err());
        assert!(accepts_exact(&own, &StreamFormat::Encoded { codec: "opus".into() }, "sink").is_err());
        assert!(accepts_any(&StreamFormat::Encoded { codec: "opus".into() }).is_ok());
    }
}
