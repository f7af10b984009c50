//! Lautstaerke-Messung fuer die Anzeige
//!
//! Laeuft im Beobachter-Thread auf einer Kopie des Frames. Der Datenpfad
//! wird nie veraendert oder verzoegert.

use crate::format::AudioFormat;
use crate::frame::Frame;

/// Hoechste diskrete Stufe (Vollausschlag)
pub const MAX_LEVEL: u8 = 80;

/// Lautstaerke eines Frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessSample {
    /// Frame, aus dem gemessen wurde
    pub sequence: u64,
    /// Effektivwert der normalisierten Samples, 0.0..=1.0
    pub rms: f64,
    /// Diskrete Stufe 0..=MAX_LEVEL
    pub level: u8,
}

impl LoudnessSample {
    /// Stille (u.a. fuer pausierte Pipelines)
    pub fn silent(sequence: u64) -> Self {
        Self {
            sequence,
            rms: 0.0,
            level: 0,
        }
    }

    fn from_rms(sequence: u64, rms: f64) -> Self {
        let rms = rms.clamp(0.0, 1.0);
        Self {
            sequence,
            rms,
            level: level_for(rms),
        }
    }

    /// Pegel in dBFS, -100 fuer Stille
    pub fn db(&self) -> f64 {
        if self.rms <= 0.0 {
            return -100.0;
        }
        20.0 * self.rms.log10()
    }
}

/// `round(rms * MAX_LEVEL)`
pub fn level_for(rms: f64) -> u8 {
    (rms.clamp(0.0, 1.0) * MAX_LEVEL as f64).round() as u8
}

/// Effektivwert normalisierter Samples
pub fn rms(samples: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = samples
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), s| (sum + s * s, n + 1));
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

/// Misst Frames eines festen PCM-Formats
#[derive(Debug, Clone)]
pub struct MeteringStage {
    format: AudioFormat,
}

impl MeteringStage {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn observe(&self, frame: &Frame) -> LoudnessSample {
        let sample_format = self.format.sample_format;
        let samples = frame
            .data()
            .chunks_exact(sample_format.bytes_per_sample())
            .map(|s| sample_format.decode_normalized(s));
        LoudnessSample::from_rms(frame.sequence(), rms(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn frame_s16(value: i16, n: usize) -> Frame {
        let data: Vec<u8> = std::iter::repeat(value.to_le_bytes()).take(n).flatten().collect();
        Frame::new(1, data)
    }

    #[test]
    fn stille_ist_null() {
        let format = AudioFormat::new(SampleFormat::S16, 1, 48000, 480).unwrap();
        let meter = MeteringStage::new(format);
        let sample = meter.observe(&Frame::silence(0, &format));
        assert_eq!(sample.level, 0);
        assert_eq!(sample.rms, 0.0);
        assert_eq!(sample.db(), -100.0);
    }

    #[test]
    fn vollausschlag_ist_maximum() {
        let format = AudioFormat::new(SampleFormat::S16, 1, 48000, 480).unwrap();
        let meter = MeteringStage::new(format);
        assert_eq!(meter.observe(&frame_s16(i16::MAX, 480)).level, MAX_LEVEL);
        assert_eq!(meter.observe(&frame_s16(i16::MIN, 480)).level, MAX_LEVEL);
    }

    #[test]
    fn halber_pegel() {
        let format = AudioFormat::new(SampleFormat::F32, 1, 48000, 4).unwrap();
        let meter = MeteringStage::new(format);
        let data: Vec<u8> = [0.5f32, -0.5, 0.5, -0.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let sample = meter.observe(&Frame::new(0, data));
        assert!((sample.rms - 0.5).abs() < 1e-9);
        assert_eq!(sample.level, 40);
    }

    #[test]
    fn stufe_gerundet_und_begrenzt() {
        assert_eq!(level_for(0.0), 0);
        assert_eq!(level_for(0.006), 0);
        assert_eq!(level_for(0.007), 1);
        assert_eq!(level_for(1.5), MAX_LEVEL);
    }

    #[test]
    fn rms_leer() {
        assert_eq!(rms(Vec::new()), 0.0);
    }
}
