//! Datei-Endpunkte fuer rohe, headerlose PCM-Stroeme
//!
//! Das Format ist nicht in der Datei gespeichert und muss ausserhalb
//! vereinbart werden.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{accepts_any, EndpointCounters, FrameSink, FrameSource, ReadOutcome};
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, StreamFormat};
use crate::frame::Frame;

/// Liest Frames sequentiell aus einer Datei
pub struct FileSource<R = BufReader<File>> {
    name: String,
    reader: Option<R>,
    format: AudioFormat,
    /// Teilweise gelesener Frame, falls ein Aufruf mitten im Frame scheitert
    pending: Vec<u8>,
    counters: EndpointCounters,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>, format: AudioFormat) -> AudioResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        debug!(pfad = %path.display(), format = %format, "Datei-Quelle geoeffnet");
        Ok(Self::from_reader(path.display().to_string(), BufReader::new(file), format))
    }
}

impl<R: Read + Send> FileSource<R> {
    /// Beliebiger sequentieller Byte-Strom als Quelle
    pub fn from_reader(name: impl Into<String>, reader: R, format: AudioFormat) -> Self {
        Self {
            name: name.into(),
            reader: Some(reader),
            format,
            pending: Vec::with_capacity(format.frame_len()),
            counters: EndpointCounters::new(),
        }
    }
}

impl<R: Read + Send> FrameSource for FileSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, sequence: u64) -> AudioResult<ReadOutcome> {
        let frame_len = self.format.frame_len();
        let Some(reader) = self.reader.as_mut() else {
            return Err(AudioError::EndpointClosed(format!("{} geschlossen", self.name)));
        };

        let mut chunk = [0u8; 8192];
        while self.pending.len() < frame_len {
            let want = (frame_len - self.pending.len()).min(chunk.len());
            let n = reader.read(&mut chunk[..want])?;
            if n == 0 {
                break;
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }

        if self.pending.is_empty() {
            return Ok(ReadOutcome::EndOfStream);
        }
        if self.pending.len() < frame_len {
            warn!(
                quelle = %self.name,
                bytes = self.pending.len(),
                "Unvollstaendiger letzter Frame, wird mit Stille aufgefuellt"
            );
            self.pending.resize(frame_len, 0);
        }

        let data = std::mem::replace(&mut self.pending, Vec::with_capacity(frame_len));
        self.counters.record(data.len());
        Ok(ReadOutcome::Frame(Frame::new(sequence, data)))
    }

    fn close(&mut self) -> AudioResult<()> {
        if self.reader.take().is_some() {
            debug!(quelle = %self.name, "Datei-Quelle geschlossen");
        }
        Ok(())
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}

/// Haengt Frames an eine Datei an
pub struct FileSink<W = BufWriter<File>> {
    name: String,
    writer: Option<W>,
    counters: EndpointCounters,
}

impl FileSink {
    /// Legt die Datei neu an (vorhandener Inhalt wird verworfen)
    pub fn create(path: impl AsRef<Path>) -> AudioResult<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        debug!(pfad = %path.display(), "Datei-Senke angelegt");
        Ok(Self::from_writer(path.display().to_string(), BufWriter::new(file)))
    }

    /// Oeffnet die Datei zum Anhaengen
    pub fn append(path: impl AsRef<Path>) -> AudioResult<Self> {
        let path: PathBuf = path.as_ref().into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self::from_writer(path.display().to_string(), BufWriter::new(file)))
    }
}

impl<W: Write + Send> FileSink<W> {
    pub fn from_writer(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Some(writer),
            counters: EndpointCounters::new(),
        }
    }

    fn writer(&mut self) -> AudioResult<&mut W> {
        let name = &self.name;
        self.writer
            .as_mut()
            .ok_or_else(|| AudioError::EndpointClosed(format!("{name} geschlossen")))
    }
}

impl<W: Write + Send> FrameSink for FileSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, format: &StreamFormat) -> AudioResult<()> {
        accepts_any(format)
    }

    fn write(&mut self, frame: &Frame) -> AudioResult<()> {
        self.writer()?.write_all(frame.data())?;
        self.counters.record(frame.len());
        Ok(())
    }

    fn flush(&mut self) -> AudioResult<()> {
        self.writer()?.flush()?;
        Ok(())
    }

    fn close(&mut self) -> AudioResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(senke = %self.name, bytes = self.counters.bytes(), "Datei-Senke geschlossen");
        }
        Ok(())
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}
