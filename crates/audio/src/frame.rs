//! Frame – die Einheit, die durch die Pipeline wandert
//!
//! Ein Frame gehoert immer genau einer Stufe. Beim Weiterreichen wird er
//! verschoben; Beobachter erhalten eine billige Kopie (`Bytes` teilt den
//! Speicher), die Nutzdaten im Datenpfad bleiben unberuehrt.

use bytes::Bytes;

use crate::error::{AudioError, AudioResult};
use crate::format::AudioFormat;

/// Block interleavter Samples (oder kodierter Bytes nach einem Encoder)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u64,
    data: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
        }
    }

    /// Erstellt einen PCM-Frame und prueft die Laenge gegen das Format
    pub fn pcm(sequence: u64, data: impl Into<Bytes>, format: &AudioFormat) -> AudioResult<Self> {
        let frame = Self::new(sequence, data);
        frame.check_len(format)?;
        Ok(frame)
    }

    /// Stiller Frame (alle Samples null) im gegebenen Format
    pub fn silence(sequence: u64, format: &AudioFormat) -> Self {
        Self::new(sequence, vec![0u8; format.frame_len()])
    }

    /// Laufende Nummer, vom Treiber beim Lesen vergeben
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Ersetzt die Nutzdaten, die Sequenznummer bleibt erhalten
    pub fn with_data(self, data: impl Into<Bytes>) -> Self {
        Self {
            sequence: self.sequence,
            data: data.into(),
        }
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Prueft `len == buffer_frames * channels * bytes_per_sample`
    pub fn check_len(&self, format: &AudioFormat) -> AudioResult<()> {
        let expected = format.frame_len();
        if self.data.len() != expected {
            return Err(AudioError::FormatMismatch(format!(
                "Frame {} hat {} Bytes, erwartet {} ({})",
                self.sequence,
                self.data.len(),
                expected,
                format
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn mono16() -> AudioFormat {
        AudioFormat::new(SampleFormat::S16, 1, 48000, 4).unwrap()
    }

    #[test]
    fn stille_hat_frame_laenge() {
        let frame = Frame::silence(7, &mono16());
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.sequence(), 7);
        assert!(frame.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn falsche_laenge_ist_format_fehler() {
        let result = Frame::pcm(0, vec![0u8; 5], &mono16());
        assert!(matches!(result, Err(AudioError::FormatMismatch(_))));
    }

    #[test]
    fn with_data_behaelt_sequenz() {
        let frame = Frame::new(3, vec![1u8, 2]).with_data(vec![9u8]);
        assert_eq!(frame.sequence(), 3);
        assert_eq!(frame.data().as_ref(), &[9u8]);
    }
}
