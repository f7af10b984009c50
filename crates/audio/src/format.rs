//! Audio-Formate und Sample-Kodierung
//!
//! Ein `AudioFormat` beschreibt den rohen, headerlosen PCM-Strom einer
//! Pipeline: Sample-Kodierung, Kanalanzahl, Abtastrate und Frame-Groesse.
//! Samples liegen interleaved und little-endian vor.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AudioError, AudioResult};

/// Sample-Kodierung eines PCM-Stroms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Vorzeichenbehaftet, 8 Bit
    S8,
    /// Vorzeichenbehaftet, 16 Bit
    S16,
    /// Vorzeichenbehaftet, 32 Bit
    S32,
    /// IEEE-754, 32 Bit
    F32,
    /// IEEE-754, 64 Bit
    F64,
}

impl SampleFormat {
    /// Alle unterstuetzten Kodierungen
    pub const ALL: [SampleFormat; 5] = [
        SampleFormat::S8,
        SampleFormat::S16,
        SampleFormat::S32,
        SampleFormat::F32,
        SampleFormat::F64,
    ];

    /// Bytes pro Sample
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32 | SampleFormat::F64)
    }

    /// Dekodiert ein Sample und normalisiert es auf -1.0..=1.0.
    ///
    /// Ganzzahlen werden durch ihren positiven Vollausschlag geteilt,
    /// `MIN` wird dabei auf -1.0 geklemmt.
    pub fn decode_normalized(self, bytes: &[u8]) -> f64 {
        let value = match self {
            SampleFormat::S8 => i8::from_le_bytes([bytes[0]]) as f64 / i8::MAX as f64,
            SampleFormat::S16 => {
                i16::from_le_bytes([bytes[0], bytes[1]]) as f64 / i16::MAX as f64
            }
            SampleFormat::S32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
                    / i32::MAX as f64
            }
            SampleFormat::F32 => {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            SampleFormat::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw)
            }
        };
        value.clamp(-1.0, 1.0)
    }

    /// Kodiert einen normalisierten Wert (-1.0..=1.0) und haengt ihn an `out` an
    pub fn encode_normalized(self, value: f64, out: &mut Vec<u8>) {
        let v = if value.is_nan() { 0.0 } else { value.clamp(-1.0, 1.0) };
        match self {
            SampleFormat::S8 => out.extend_from_slice(&((v * i8::MAX as f64).round() as i8).to_le_bytes()),
            SampleFormat::S16 => {
                out.extend_from_slice(&((v * i16::MAX as f64).round() as i16).to_le_bytes())
            }
            SampleFormat::S32 => {
                out.extend_from_slice(&((v * i32::MAX as f64).round() as i32).to_le_bytes())
            }
            SampleFormat::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            SampleFormat::F64 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::S8 => "8 bit",
            SampleFormat::S16 => "16 bit",
            SampleFormat::S32 => "32 bit",
            SampleFormat::F32 => "32 bit (float)",
            SampleFormat::F64 => "64 bit (float)",
        };
        f.write_str(name)
    }
}

/// Format eines PCM-Stroms. Unveraenderlich sobald die Pipeline laeuft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    /// Samples pro Kanal in einem Frame
    pub buffer_frames: u32,
}

impl AudioFormat {
    /// Erstellt ein Format und prueft die Werte
    pub fn new(
        sample_format: SampleFormat,
        channels: u16,
        sample_rate: u32,
        buffer_frames: u32,
    ) -> AudioResult<Self> {
        let format = Self {
            sample_format,
            channels,
            sample_rate,
            buffer_frames,
        };
        format.validieren()?;
        Ok(format)
    }

    /// Frame-Groesse aus einer Frame-Dauer in Millisekunden.
    ///
    /// `buffer_frames = sample_rate / (1000 / frame_ms)`, also 1920 bei
    /// 48000 Hz und 40 ms.
    pub fn with_frame_duration(
        sample_format: SampleFormat,
        channels: u16,
        sample_rate: u32,
        frame_ms: u32,
    ) -> AudioResult<Self> {
        if frame_ms == 0 || frame_ms > 1000 {
            return Err(AudioError::Konfiguration(format!(
                "Frame-Dauer muss 1..=1000 ms sein, war {frame_ms}"
            )));
        }
        let buffer_frames = (sample_rate as u64 * frame_ms as u64 / 1000) as u32;
        Self::new(sample_format, channels, sample_rate, buffer_frames)
    }

    /// Prueft Kanalanzahl, Abtastrate und Frame-Groesse
    pub fn validieren(&self) -> AudioResult<()> {
        if self.channels == 0 {
            return Err(AudioError::Konfiguration("Kanalanzahl muss > 0 sein".into()));
        }
        if self.sample_rate == 0 {
            return Err(AudioError::Konfiguration("Abtastrate muss > 0 sein".into()));
        }
        if self.buffer_frames == 0 {
            return Err(AudioError::Konfiguration("Frame-Groesse muss > 0 sein".into()));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes_per_sample()
    }

    /// Bytes pro Sample-Zeitpunkt ueber alle Kanaele
    pub fn bytes_per_instant(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Laenge eines Frames in Bytes
    pub fn frame_len(&self) -> usize {
        self.buffer_frames as usize * self.bytes_per_instant()
    }

    /// Abspieldauer eines Frames
    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(self.buffer_frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Gleiches Format mit anderer Sample-Kodierung
    pub fn with_sample_format(self, sample_format: SampleFormat) -> Self {
        Self {
            sample_format,
            ..self
        }
    }

    /// Gleiches Format mit anderer Kanalanzahl
    pub fn with_channels(self, channels: u16) -> Self {
        Self { channels, ..self }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}ch {}Hz ({} Frames)",
            self.sample_format, self.channels, self.sample_rate, self.buffer_frames
        )
    }
}

/// Nutzlast-Format hinter den Transformationen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFormat {
    /// Roher PCM-Strom
    Pcm(AudioFormat),
    /// Kodierter Strom (z.B. Opus-Pakete), kein festes Frame-Raster mehr
    Encoded { codec: String },
}

impl StreamFormat {
    pub fn pcm(&self) -> Option<&AudioFormat> {
        match self {
            StreamFormat::Pcm(format) => Some(format),
            StreamFormat::Encoded { .. } => None,
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFormat::Pcm(format) => write!(f, "PCM {format}"),
            StreamFormat::Encoded { codec } => write!(f, "kodiert ({codec})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_groesse_aus_dauer() {
        let format = AudioFormat::with_frame_duration(SampleFormat::S16, 1, 48000, 40).unwrap();
        assert_eq!(format.buffer_frames, 1920);
        assert_eq!(format.frame_len(), 3840);
        assert_eq!(format.frame_period(), Duration::from_millis(40));
    }

    #[test]
    fn frame_laenge_stereo_float() {
        let format = AudioFormat::new(SampleFormat::F64, 2, 44100, 441).unwrap();
        assert_eq!(format.frame_len(), 441 * 2 * 8);
    }

    #[test]
    fn ungueltige_formate_abgelehnt() {
        assert!(AudioFormat::new(SampleFormat::S16, 0, 48000, 960).is_err());
        assert!(AudioFormat::new(SampleFormat::S16, 1, 0, 960).is_err());
        assert!(AudioFormat::new(SampleFormat::S16, 1, 48000, 0).is_err());
        assert!(AudioFormat::with_frame_duration(SampleFormat::S16, 1, 48000, 0).is_err());
    }

    #[test]
    fn vollausschlag_normalisiert_auf_eins() {
        assert_eq!(SampleFormat::S16.decode_normalized(&i16::MAX.to_le_bytes()), 1.0);
        assert_eq!(SampleFormat::S16.decode_normalized(&i16::MIN.to_le_bytes()), -1.0);
        assert_eq!(SampleFormat::S8.decode_normalized(&i8::MIN.to_le_bytes()), -1.0);
        assert_eq!(SampleFormat::S32.decode_normalized(&i32::MAX.to_le_bytes()), 1.0);
        assert_eq!(SampleFormat::F32.decode_normalized(&2.5f32.to_le_bytes()), 1.0);
    }

    #[test]
    fn kodierung_klemmt_und_rundet() {
        let mut out = Vec::new();
        SampleFormat::S16.encode_normalized(1.5, &mut out);
        assert_eq!(out, i16::MAX.to_le_bytes());

        out.clear();
        SampleFormat::S8.encode_normalized(f64::NAN, &mut out);
        assert_eq!(out, [0u8]);
    }
}
