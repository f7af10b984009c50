//! Opus-Encoder als Transformations-Stufe
//!
//! Kodiert 16-Bit-PCM-Frames zu Opus-Paketen (Aufnahme-Frontend). Nach
//! dieser Stufe hat der Strom kein festes Frame-Raster mehr.

use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use tracing::debug;

use super::TransformStage;
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, SampleFormat, StreamFormat};
use crate::frame::Frame;

/// Codec-Name im `StreamFormat::Encoded`
pub const CODEC: &str = "opus";

/// Max. 4000 Bytes reichen fuer jedes Opus-Paket
const MAX_PACKET: usize = 4000;

/// Erlaubte Frame-Dauern in halben Millisekunden (2.5, 5, 10, 20, 40, 60 ms)
const HALF_MS: [u64; 6] = [5, 10, 20, 40, 80, 120];

pub struct OpusEncodeStage {
    encoder: Encoder,
    input: AudioFormat,
    bitrate_kbps: u32,
    bytes_in: u64,
    bytes_out: u64,
}

impl OpusEncodeStage {
    pub fn new(input: AudioFormat, bitrate_kbps: u32) -> AudioResult<Self> {
        if input.sample_format != SampleFormat::S16 {
            return Err(AudioError::FormatMismatch(format!(
                "Opus erwartet 16 bit PCM, bekommt {}",
                input.sample_format
            )));
        }
        if !(6..=510).contains(&bitrate_kbps) {
            return Err(AudioError::Konfiguration(format!(
                "Opus-Bitrate {bitrate_kbps} kbps ausserhalb 6..=510"
            )));
        }
        let frames = input.buffer_frames as u64 * 2000;
        if !HALF_MS.iter().any(|h| frames == input.sample_rate as u64 * h) {
            return Err(AudioError::Konfiguration(format!(
                "Opus unterstuetzt keine Frame-Groesse von {} Samples bei {} Hz",
                input.buffer_frames, input.sample_rate
            )));
        }

        let encoder = build_encoder(&input, bitrate_kbps)?;
        debug!(bitrate_kbps, format = %input, "Opus-Stufe erstellt");

        Ok(Self {
            encoder,
            input,
            bitrate_kbps,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    /// Verhaeltnis Eingabe- zu Ausgabe-Bytes seit dem letzten Reset
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            return 0.0;
        }
        self.bytes_in as f64 / self.bytes_out as f64
    }
}

fn build_encoder(input: &AudioFormat, bitrate_kbps: u32) -> AudioResult<Encoder> {
    let rate = match input.sample_rate {
        8000 => SampleRate::Hz8000,
        12000 => SampleRate::Hz12000,
        16000 => SampleRate::Hz16000,
        24000 => SampleRate::Hz24000,
        48000 => SampleRate::Hz48000,
        other => {
            return Err(AudioError::FormatMismatch(format!(
                "Opus unterstuetzt {other} Hz nicht"
            )))
        }
    };
    let channels = match input.channels {
        1 => Channels::Mono,
        2 => Channels::Stereo,
        other => {
            return Err(AudioError::FormatMismatch(format!(
                "Opus unterstuetzt {other} Kanaele nicht"
            )))
        }
    };

    let mut encoder = Encoder::new(rate, channels, Application::Audio)
        .map_err(|e| AudioError::transform(CODEC, e.to_string()))?;
    encoder
        .set_bitrate(Bitrate::BitsPerSecond(bitrate_kbps as i32 * 1000))
        .map_err(|e| AudioError::transform(CODEC, e.to_string()))?;
    Ok(encoder)
}

impl TransformStage for OpusEncodeStage {
    fn name(&self) -> &str {
        CODEC
    }

    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        match input {
            StreamFormat::Pcm(f) if *f == self.input => Ok(StreamFormat::Encoded {
                codec: CODEC.to_string(),
            }),
            other => Err(AudioError::FormatMismatch(format!(
                "Opus-Stufe erwartet PCM {}, bekommt {other}",
                self.input
            ))),
        }
    }

    fn apply(&mut self, frame: Frame) -> AudioResult<Frame> {
        frame
            .check_len(&self.input)
            .map_err(|e| AudioError::transform(CODEC, e.to_string()))?;

        let pcm: Vec<i16> = frame
            .data()
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let mut packet = vec![0u8; MAX_PACKET];
        let written = self
            .encoder
            .encode(&pcm, &mut packet)
            .map_err(|e| AudioError::transform(CODEC, e.to_string()))?;
        packet.truncate(written);

        self.bytes_in += frame.len() as u64;
        self.bytes_out += written as u64;
        Ok(frame.with_data(packet))
    }

    fn reset(&mut self) -> AudioResult<()> {
        self.encoder = build_encoder(&self.input, self.bitrate_kbps)?;
        self.bytes_in = 0;
        self.bytes_out = 0;
        Ok(())
    }
}
