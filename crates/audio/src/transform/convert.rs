//! Umwandlung zwischen Sample-Kodierungen
//!
//! Ganzzahlen werden ueber ihren Vollausschlag auf -1.0..=1.0 abgebildet;
//! beim Verengen wird geklemmt.

use super::TransformStage;
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, SampleFormat, StreamFormat};
use crate::frame::Frame;

/// Wandelt PCM-Frames von einer Sample-Kodierung in eine andere
#[derive(Debug, Clone)]
pub struct FormatConversion {
    input: AudioFormat,
    target: SampleFormat,
}

impl FormatConversion {
    pub fn new(input: AudioFormat, target: SampleFormat) -> Self {
        Self { input, target }
    }

    pub fn output(&self) -> AudioFormat {
        self.input.with_sample_format(self.target)
    }
}

/// Wandelt einen Block interleavter Samples
pub fn convert_samples(data: &[u8], from: SampleFormat, to: SampleFormat) -> Vec<u8> {
    if from == to {
        return data.to_vec();
    }
    let width = from.bytes_per_sample();
    let mut out = Vec::with_capacity(data.len() / width * to.bytes_per_sample());
    for sample in data.chunks_exact(width) {
        to.encode_normalized(from.decode_normalized(sample), &mut out);
    }
    out
}

impl TransformStage for FormatConversion {
    fn name(&self) -> &str {
        "format-conversion"
    }

    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        match input {
            StreamFormat::Pcm(f) if *f == self.input => Ok(StreamFormat::Pcm(self.output())),
            other => Err(AudioError::FormatMismatch(format!(
                "Formatwandlung erwartet PCM {}, bekommt {other}",
                self.input
            ))),
        }
    }

    fn apply(&mut self, frame: Frame) -> AudioResult<Frame> {
        frame
            .check_len(&self.input)
            .map_err(|e| AudioError::transform(self.name(), e.to_string()))?;
        if self.input.sample_format == self.target {
            return Ok(frame);
        }
        let data = convert_samples(frame.data(), self.input.sample_format, self.target);
        Ok(frame.with_data(data))
    }
}
