//! Geraete-Schnittstellen (externe Kollaborateure)
//!
//! Die Engine enumeriert keine Geraete und spricht keine Treiber direkt an.
//! Sie bekommt einen `DeviceBackend`, der Geraete beschreibt und
//! `DeviceDriver`-Handles oeffnet. Benoetigt wird das nur beim Aufbau einer
//! Pipeline.

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AudioError, AudioResult};
use crate::format::AudioFormat;

/// Natives Audio-API (ALSA, PulseAudio, WASAPI, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiInfo {
    pub id: u32,
    pub name: String,
}

/// Repraesentiert ein Audio-Geraet mit seinen Eigenschaften
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bezeichner innerhalb des APIs
    pub id: u32,
    /// Anzeigename des Geraets
    pub name: String,
    pub input_channels: u16,
    pub output_channels: u16,
    /// Unterstuetzte Abtastraten
    pub sample_rates: Vec<u32>,
}

impl DeviceInfo {
    /// Maximale Kanalanzahl in der gegebenen Richtung
    pub fn channels(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Input => self.input_channels,
            Direction::Output => self.output_channels,
        }
    }
}

/// Ergebnis einer Geraete-Abfrage fuer ein API
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    pub devices: Vec<DeviceInfo>,
    pub default_input: Option<u32>,
    pub default_output: Option<u32>,
}

impl DeviceCatalog {
    pub fn find(&self, id: u32) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Geraete mit mindestens einem Kanal in der Richtung
    pub fn filter(&self, direction: Direction) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter().filter(move |d| d.channels(direction) > 0)
    }

    /// Standard-Eingabegeraet oder `DeviceUnavailable`
    pub fn default_input_device(&self) -> AudioResult<&DeviceInfo> {
        self.default_input
            .and_then(|id| self.find(id))
            .ok_or_else(|| AudioError::DeviceUnavailable("kein Standard-Eingabegeraet".into()))
    }

    /// Standard-Ausgabegeraet oder `DeviceUnavailable`
    pub fn default_output_device(&self) -> AudioResult<&DeviceInfo> {
        self.default_output
            .and_then(|id| self.find(id))
            .ok_or_else(|| AudioError::DeviceUnavailable("kein Standard-Ausgabegeraet".into()))
    }
}

/// Datenrichtung eines Geraete-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Parameter zum Oeffnen eines Geraete-Streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub api: u32,
    pub device_id: u32,
    pub format: AudioFormat,
}

impl StreamParams {
    /// Prueft die Parameter gegen die Faehigkeiten des Geraets
    pub fn validate(&self, device: &DeviceInfo, direction: Direction) -> AudioResult<()> {
        self.format.validieren()?;

        let available = device.channels(direction);
        if available == 0 {
            return Err(AudioError::DeviceUnavailable(format!(
                "{} hat keine {:?}-Kanaele",
                device.name, direction
            )));
        }
        if self.format.channels > available {
            return Err(AudioError::FormatMismatch(format!(
                "{} Kanaele angefordert, {} bietet nur {}",
                self.format.channels, device.name, available
            )));
        }
        if !device.sample_rates.is_empty() && !device.sample_rates.contains(&self.format.sample_rate) {
            return Err(AudioError::FormatMismatch(format!(
                "{} unterstuetzt {} Hz nicht (verfuegbar: {:?})",
                device.name, self.format.sample_rate, device.sample_rates
            )));
        }
        Ok(())
    }
}

/// Abtastraten, die beide Geraete unterstuetzen (aufsteigend)
pub fn common_sample_rates(a: &DeviceInfo, b: &DeviceInfo) -> Vec<u32> {
    let mut rates: Vec<u32> = a
        .sample_rates
        .iter()
        .copied()
        .filter(|rate| b.sample_rates.contains(rate))
        .collect();
    rates.sort_unstable();
    rates.dedup();
    rates
}

/// Bevorzugte Abtastrate: 48000 oder 32000 falls gemeinsam vorhanden, sonst die erste
pub fn preferred_sample_rate(common: &[u32]) -> Option<u32> {
    common
        .iter()
        .copied()
        .find(|&r| r == 48000 || r == 32000)
        .or_else(|| common.first().copied())
}

/// Offenes Handle auf einen Geraete-Stream.
///
/// Aufrufe koennen aus einem Echtzeit-Callback des Herstellers heraus
/// zurueckkehren; Implementierungen muessen `Send` sein.
pub trait DeviceDriver: Send {
    /// Fuellt `buf` mit genau einem Frame aufgenommener Samples
    fn read_frame(&mut self, buf: &mut [u8]) -> AudioResult<()>;

    /// Uebergibt genau einen Frame an das Geraet
    fn write_frame(&mut self, data: &[u8]) -> AudioResult<()>;

    /// Geraete-seitige Pause (Stream bleibt offen)
    fn pause(&mut self) -> AudioResult<()>;

    fn resume(&mut self) -> AudioResult<()>;

    /// Stoppt den Stream endgueltig; danach keine weiteren Aufrufe
    fn stop(&mut self) -> AudioResult<()>;

    /// Gespielte/aufgenommene Zeit seit Start
    fn current_time(&self) -> Duration;

    /// Vom Geraet gemeldete Latenz
    fn latency(&self) -> Option<Duration> {
        None
    }
}

/// Geraete-Erkennung und Stream-Oeffnung eines Audio-Backends
pub trait DeviceBackend: Send + Sync {
    /// Verfuegbare native APIs
    fn apis(&self) -> Vec<ApiInfo>;

    /// Geraete eines APIs inklusive Standard-Geraete
    fn discover_devices(&self, api: u32) -> AudioResult<DeviceCatalog>;

    fn open_input(&self, params: &StreamParams) -> AudioResult<Box<dyn DeviceDriver>>;

    fn open_output(&self, params: &StreamParams) -> AudioResult<Box<dyn DeviceDriver>>;
}

/// Erstes verfuegbares API oder `DeviceUnavailable`
pub fn first_api(backend: &dyn DeviceBackend) -> AudioResult<ApiInfo> {
    backend
        .apis()
        .into_iter()
        .next()
        .ok_or_else(|| AudioError::DeviceUnavailable("kein Audio-API verfuegbar".into()))
}

/// Loest ein Geraet auf (None = Standard-Geraet), prueft die Parameter
/// und liefert die fertigen `StreamParams`.
pub fn resolve_stream(
    backend: &dyn DeviceBackend,
    api: u32,
    device_id: Option<u32>,
    direction: Direction,
    format: AudioFormat,
) -> AudioResult<StreamParams> {
    let catalog = backend.discover_devices(api)?;
    let device = match device_id {
        Some(id) => catalog
            .find(id)
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("Geraet {id} nicht gefunden")))?,
        None => match direction {
            Direction::Input => catalog.default_input_device()?,
            Direction::Output => catalog.default_output_device()?,
        },
    };

    let params = StreamParams {
        api,
        device_id: device.id,
        format,
    };
    params.validate(device, direction)?;

    debug!(
        geraet = %device.name,
        richtung = ?direction,
        format = %format,
        "Geraete-Stream aufgeloest"
    );
    Ok(params)
}
