//! Geraete-Endpunkte
//!
//! Delegieren Lesen und Schreiben an einen `DeviceDriver`. `close()` stoppt
//! das Geraet genau einmal; danach liefert jeder I/O-Aufruf `EndpointClosed`.

use std::time::Duration;

use tracing::{debug, info};

use super::{accepts_exact, EndpointCounters, FrameSink, FrameSource, ReadOutcome};
use crate::device::{resolve_stream, DeviceBackend, DeviceDriver, Direction};
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, StreamFormat};
use crate::frame::Frame;

/// Aufnahme-Geraet als Frame-Quelle
pub struct DeviceSource {
    name: String,
    driver: Box<dyn DeviceDriver>,
    format: AudioFormat,
    counters: EndpointCounters,
    stopped: bool,
}

impl DeviceSource {
    pub fn new(name: impl Into<String>, driver: Box<dyn DeviceDriver>, format: AudioFormat) -> Self {
        Self {
            name: name.into(),
            driver,
            format,
            counters: EndpointCounters::new(),
            stopped: false,
        }
    }

    /// Oeffnet das angegebene (oder das Standard-) Eingabegeraet
    pub fn open(
        backend: &dyn DeviceBackend,
        api: u32,
        device_id: Option<u32>,
        format: AudioFormat,
    ) -> AudioResult<Self> {
        let params = resolve_stream(backend, api, device_id, Direction::Input, format)?;
        let driver = backend.open_input(&params)?;
        info!(geraet = params.device_id, format = %format, "Eingabegeraet geoeffnet");
        Ok(Self::new(format!("device-in:{}", params.device_id), driver, format))
    }

    /// Aufgenommene Zeit laut Geraet
    pub fn current_time(&self) -> Duration {
        self.driver.current_time()
    }
}

impl FrameSource for DeviceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, sequence: u64) -> AudioResult<ReadOutcome> {
        if self.stopped {
            return Err(AudioError::EndpointClosed(format!("{} gestoppt", self.name)));
        }
        let mut buf = vec![0u8; self.format.frame_len()];
        self.driver.read_frame(&mut buf)?;
        self.counters.record(buf.len());
        Ok(ReadOutcome::Frame(Frame::new(sequence, buf)))
    }

    fn pause(&mut self) -> AudioResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.driver.pause()
    }

    fn resume(&mut self) -> AudioResult<()> {
        if self.stopped {
            return Err(AudioError::EndpointClosed(format!("{} gestoppt", self.name)));
        }
        self.driver.resume()
    }

    fn close(&mut self) -> AudioResult<()> {
        if std::mem::replace(&mut self.stopped, true) {
            return Ok(());
        }
        debug!(quelle = %self.name, "Geraet wird gestoppt");
        self.driver.stop()
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}

/// Wiedergabe-Geraet als Frame-Senke
pub struct DeviceSink {
    name: String,
    driver: Box<dyn DeviceDriver>,
    format: AudioFormat,
    counters: EndpointCounters,
    stopped: bool,
}

impl DeviceSink {
    pub fn new(name: impl Into<String>, driver: Box<dyn DeviceDriver>, format: AudioFormat) -> Self {
        Self {
            name: name.into(),
            driver,
            format,
            counters: EndpointCounters::new(),
            stopped: false,
        }
    }

    /// Oeffnet das angegebene (oder das Standard-) Ausgabegeraet
    pub fn open(
        backend: &dyn DeviceBackend,
        api: u32,
        device_id: Option<u32>,
        format: AudioFormat,
    ) -> AudioResult<Self> {
        let params = resolve_stream(backend, api, device_id, Direction::Output, format)?;
        let driver = backend.open_output(&params)?;
        info!(geraet = params.device_id, format = %format, "Ausgabegeraet geoeffnet");
        Ok(Self::new(format!("device-out:{}", params.device_id), driver, format))
    }

    /// Gespielte Zeit laut Geraet
    pub fn current_time(&self) -> Duration {
        self.driver.current_time()
    }
}

impl FrameSink for DeviceSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, format: &StreamFormat) -> AudioResult<()> {
        accepts_exact(&self.format, format, &self.name)
    }

    fn write(&mut self, frame: &Frame) -> AudioResult<()> {
        if self.stopped {
            return Err(AudioError::EndpointClosed(format!("{} gestoppt", self.name)));
        }
        frame.check_len(&self.format)?;
        self.driver.write_frame(frame.data())?;
        self.counters.record(frame.len());
        Ok(())
    }

    fn close(&mut self) -> AudioResult<()> {
        if std::mem::replace(&mut self.stopped, true) {
            return Ok(());
        }
        debug!(senke = %self.name, "Geraet wird gestoppt");
        self.driver.stop()
    }

    fn latency(&self) -> Option<Duration> {
        self.driver.latency()
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}
