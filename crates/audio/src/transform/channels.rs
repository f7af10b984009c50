//! Kanal-Anpassung Mono <-> N Kanaele
//!
//! Beim Hochmischen wird das Mono-Sample auf alle Kanaele kopiert, beim
//! Heruntermischen wird der Mittelwert gebildet.

use super::TransformStage;
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, StreamFormat};
use crate::frame::Frame;

#[derive(Debug, Clone)]
pub struct ChannelRemix {
    input: AudioFormat,
    channels: u16,
}

impl ChannelRemix {
    /// Nur Mono nach N oder N nach Mono (bzw. gleiche Anzahl)
    pub fn new(input: AudioFormat, channels: u16) -> AudioResult<Self> {
        if channels == 0 {
            return Err(AudioError::Konfiguration("Kanalanzahl muss > 0 sein".into()));
        }
        if input.channels != channels && input.channels != 1 && channels != 1 {
            return Err(AudioError::Konfiguration(format!(
                "Kanal-Anpassung {} -> {} nicht unterstuetzt (nur Mono <-> N)",
                input.channels, channels
            )));
        }
        Ok(Self { input, channels })
    }

    pub fn output(&self) -> AudioFormat {
        self.input.with_channels(self.channels)
    }

    fn upmix(&self, data: &[u8]) -> Vec<u8> {
        let width = self.input.bytes_per_sample();
        let mut out = Vec::with_capacity(data.len() * self.channels as usize);
        for sample in data.chunks_exact(width) {
            for _ in 0..self.channels {
                out.extend_from_slice(sample);
            }
        }
        out
    }

    fn downmix(&self, data: &[u8]) -> Vec<u8> {
        let format = self.input.sample_format;
        let width = format.bytes_per_sample();
        let instant = width * self.input.channels as usize;
        let mut out = Vec::with_capacity(data.len() / self.input.channels as usize);
        for group in data.chunks_exact(instant) {
            let sum: f64 = group
                .chunks_exact(width)
                .map(|s| format.decode_normalized(s))
                .sum();
            format.encode_normalized(sum / self.input.channels as f64, &mut out);
        }
        out
    }
}

impl TransformStage for ChannelRemix {
    fn name(&self) -> &str {
        "channel-remix"
    }

    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        match input {
            StreamFormat::Pcm(f) if *f == self.input => Ok(StreamFormat::Pcm(self.output())),
            other => Err(AudioError::FormatMismatch(format!(
                "Kanal-Anpassung erwartet PCM {}, bekommt {other}",
                self.input
            ))),
        }
    }

    fn apply(&mut self, frame: Frame) -> AudioResult<Frame> {
        frame
            .check_len(&self.input)
            .map_err(|e| AudioError::transform(self.name(), e.to_string()))?;
        if self.input.channels == self.channels {
            return Ok(frame);
        }
        let data = if self.input.channels == 1 {
            self.upmix(frame.data())
        } else {
            self.downmix(frame.data())
        };
        Ok(frame.with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn s16(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn mono_zu_stereo_dupliziert() {
        let input = AudioFormat::new(SampleFormat::S16, 1, 8000, 2).unwrap();
        let mut stage = ChannelRemix::new(input, 2).unwrap();
        let out = stage.apply(Frame::new(0, s16(&[100, -200]))).unwrap();
        assert_eq!(out.data().as_ref(), s16(&[100, 100, -200, -200]).as_slice());
    }

    #[test]
    fn stereo_zu_mono_mittelt() {
        let input = AudioFormat::new(SampleFormat::S16, 2, 8000, 2).unwrap();
        let mut stage = ChannelRemix::new(input, 1).unwrap();
        let out = stage.apply(Frame::new(0, s16(&[1000, 3000, -500, 500]))).unwrap();
        assert_eq!(out.data().as_ref(), s16(&[2000, 0]).as_slice());
    }

    #[test]
    fn n_zu_m_abgelehnt() {
        let input = AudioFormat::new(SampleFormat::S16, 2, 8000, 2).unwrap();
        assert!(ChannelRemix::new(input, 4).is_err());
        assert!(ChannelRemix::new(input, 0).is_err());
    }
}
