//! Socket-Endpunkte ueber eine beliebige Byte-Verbindung
//!
//! Trennt die Gegenseite die Verbindung, schlagen Lesen und Schreiben mit
//! `EndpointClosed` fehl.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use tracing::{debug, warn};

use super::{accepts_any, EndpointCounters, FrameSink, FrameSource, ReadOutcome};
use crate::error::{AudioError, AudioResult};
use crate::format::{AudioFormat, StreamFormat};
use crate::frame::Frame;

/// Verbindung, die sich geordnet beenden laesst
pub trait Connection: Send {
    /// Beendet beide Richtungen
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Adresse der Gegenseite fuer Logs
    fn peer(&self) -> String {
        "peer".into()
    }
}

impl Connection for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unbekannt".into())
    }
}

/// Liest PCM-Frames von einer Verbindung
pub struct SocketSource<S> {
    name: String,
    conn: Option<S>,
    format: AudioFormat,
    pending: Vec<u8>,
    counters: EndpointCounters,
}

impl<S: Read + Connection> SocketSource<S> {
    pub fn new(conn: S, format: AudioFormat) -> Self {
        let name = format!("socket-in:{}", conn.peer());
        Self {
            name,
            conn: Some(conn),
            format,
            pending: Vec::with_capacity(format.frame_len()),
            counters: EndpointCounters::new(),
        }
    }
}

impl<S: Read + Connection> FrameSource for SocketSource<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, sequence: u64) -> AudioResult<ReadOutcome> {
        let frame_len = self.format.frame_len();
        let Some(conn) = self.conn.as_mut() else {
            return Err(AudioError::EndpointClosed(format!("{} geschlossen", self.name)));
        };

        let mut chunk = [0u8; 8192];
        while self.pending.len() < frame_len {
            let want = (frame_len - self.pending.len()).min(chunk.len());
            let n = conn
                .read(&mut chunk[..want])
                .map_err(|e| AudioError::from_connection(e, &self.name))?;
            if n == 0 {
                if !self.pending.is_empty() {
                    warn!(
                        quelle = %self.name,
                        bytes = self.pending.len(),
                        "Verbindung mitten im Frame getrennt, Rest verworfen"
                    );
                    self.pending.clear();
                }
                return Err(AudioError::EndpointClosed(format!(
                    "{}: Gegenseite hat die Verbindung getrennt",
                    self.name
                )));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }

        let data = std::mem::replace(&mut self.pending, Vec::with_capacity(frame_len));
        self.counters.record(data.len());
        Ok(ReadOutcome::Frame(Frame::new(sequence, data)))
    }

    fn close(&mut self) -> AudioResult<()> {
        if let Some(mut conn) = self.conn.take() {
            conn.shutdown()?;
            debug!(quelle = %self.name, "Socket-Quelle geschlossen");
        }
        Ok(())
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}

/// Schreibt Frames auf eine Verbindung
pub struct SocketSink<S> {
    name: String,
    conn: Option<S>,
    counters: EndpointCounters,
}

impl<S: Write + Connection> SocketSink<S> {
    pub fn new(conn: S) -> Self {
        let name = format!("socket-out:{}", conn.peer());
        Self {
            name,
            conn: Some(conn),
            counters: EndpointCounters::new(),
        }
    }

    fn conn(&mut self) -> AudioResult<&mut S> {
        let name = &self.name;
        self.conn
            .as_mut()
            .ok_or_else(|| AudioError::EndpointClosed(format!("{name} geschlossen")))
    }
}

impl<S: Write + Connection> FrameSink for SocketSink<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, format: &StreamFormat) -> AudioResult<()> {
        accepts_any(format)
    }

    /// Schreibt den Frame vollstaendig. Bricht die Verbindung mitten im
    /// Frame ab, ist der Fehler nie voruebergehend: ein erneuter Versuch
    /// wuerde die schon gesendeten Bytes doppelt senden.
    fn write(&mut self, frame: &Frame) -> AudioResult<()> {
        let name = self.name.clone();
        let data = frame.data();
        let conn = self.conn()?;
        let mut written = 0;
        while written < data.len() {
            match conn.write(&data[written..]) {
                Ok(0) => {
                    return Err(AudioError::EndpointClosed(format!(
                        "{name}: Verbindung nimmt keine Daten mehr an"
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = AudioError::from_connection(e, &name);
                    if written > 0 && err.is_transient() {
                        return Err(AudioError::Io(io::Error::other(format!(
                            "{name}: Frame {} nach {written} von {} Bytes abgebrochen ({err})",
                            frame.sequence(),
                            data.len()
                        ))));
                    }
                    return Err(err);
                }
            }
        }
        self.counters.record(frame.len());
        Ok(())
    }

    fn flush(&mut self) -> AudioResult<()> {
        let name = self.name.clone();
        self.conn()?
            .flush()
            .map_err(|e| AudioError::from_connection(e, &name))
    }

    fn close(&mut self) -> AudioResult<()> {
        if let Some(mut conn) = self.conn.take() {
            let flushed = conn.flush();
            conn.shutdown()?;
            flushed.map_err(|e| AudioError::from_connection(e, &self.name))?;
            debug!(senke = %self.name, bytes = self.counters.bytes(), "Socket-Senke geschlossen");
        }
        Ok(())
    }

    fn counters(&self) -> EndpointCounters {
        self.counters.clone()
    }
}
