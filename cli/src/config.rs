//! Sonance-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass `sonance` ohne Konfigurationsdatei
//! lauffaehig ist.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonance_audio::{AudioFormat, PipelineConfig, RetryPolicy, SampleFormat};

/// Adresse einer lauschenden Socket-Senke ohne `adresse`
pub const STANDARD_ADRESSE: &str = "0.0.0.0:3000";

/// Vollstaendige Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SonanceConfig {
    /// Betriebsart und Neustarts
    pub sonance: AllgemeinEinstellungen,
    /// Strom-Format
    pub audio: AudioEinstellungen,
    /// Woher die Frames kommen
    pub quelle: EndpunktEinstellungen,
    /// Wohin die Frames gehen
    pub senke: EndpunktEinstellungen,
    /// Puffer, Timeouts, Wiederholungen
    pub pipeline: PipelineEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Prometheus-Export
    pub metriken: MetrikEinstellungen,
}

/// Betriebsart der Kommandozeile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modus {
    /// Mikrofon direkt auf den Lautsprecher
    #[default]
    Echo,
    /// Mikrofon in eine Datei
    Record,
    /// Datei auf den Lautsprecher
    Playback,
    /// Mikrofon an einen Client, der sich mit uns verbindet
    StreamToSocket,
}

impl Modus {
    /// Standard-Endpunkte (Quelle, Senke) der Betriebsart
    pub fn endpunkte(self) -> (EndpunktArt, EndpunktArt) {
        match self {
            Self::Echo => (EndpunktArt::Geraet, EndpunktArt::Geraet),
            Self::Record => (EndpunktArt::Geraet, EndpunktArt::Datei),
            Self::Playback => (EndpunktArt::Datei, EndpunktArt::Geraet),
            Self::StreamToSocket => (EndpunktArt::Geraet, EndpunktArt::Socket),
        }
    }
}

impl fmt::Display for Modus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Echo => "echo",
            Self::Record => "record",
            Self::Playback => "playback",
            Self::StreamToSocket => "stream-to-socket",
        };
        f.write_str(name)
    }
}

impl FromStr for Modus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "echo" => Ok(Self::Echo),
            "record" => Ok(Self::Record),
            "playback" => Ok(Self::Playback),
            "stream-to-socket" => Ok(Self::StreamToSocket),
            other => Err(anyhow::anyhow!(
                "Unbekannter Modus '{other}' (echo, record, playback, stream-to-socket)"
            )),
        }
    }
}

/// Art eines Endpunkts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpunktArt {
    Geraet,
    Datei,
    Socket,
}

/// Allgemeine Einstellungen
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllgemeinEinstellungen {
    pub modus: Modus,
    /// Wie oft eine fehlgeschlagene Pipeline neu aufgebaut wird (0 = nie)
    pub neustarts: u32,
}

/// Strom-Format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    /// Sample-Kodierung: "s8", "s16", "s32", "f32", "f64"
    pub sample_format: SampleFormat,
    pub kanaele: u16,
    pub abtastrate: u32,
    /// Frame-Dauer in Millisekunden
    pub frame_ms: u32,
    /// Kanalanzahl des Ausgabegeraets, falls abweichend (nur Mono <-> N)
    pub ausgabe_kanaele: Option<u16>,
    /// Natives Audio-API (leer = erstes verfuegbares)
    pub api: Option<u32>,
    /// Opus-Bitrate in kbit/s; gesetzt = Aufnahme wird kodiert
    pub opus_kbps: Option<u32>,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        Self {
            sample_format: SampleFormat::S16,
            kanaele: 1,
            abtastrate: 48_000,
            frame_ms: 40,
            ausgabe_kanaele: None,
            api: None,
            opus_kbps: None,
        }
    }
}

impl AudioEinstellungen {
    /// Format der Quelle
    pub fn format(&self) -> anyhow::Result<AudioFormat> {
        Ok(AudioFormat::with_frame_duration(
            self.sample_format,
            self.kanaele,
            self.abtastrate,
            self.frame_ms,
        )?)
    }
}

/// Einstellungen fuer Quelle bzw. Senke
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpunktEinstellungen {
    /// Ueberschreibt die Art aus dem Modus
    pub art: Option<EndpunktArt>,
    /// Geraete-ID (leer = Standard-Geraet)
    pub geraet: Option<u32>,
    /// Datei-Pfad
    pub pfad: Option<String>,
    /// Socket-Adresse: Quelle lauscht, Senke verbindet oder lauscht
    pub adresse: Option<String>,
    /// Socket-Senke: auf `adresse` lauschen und an den ersten Client senden
    /// (leer = nur im Modus stream-to-socket)
    pub lauschen: Option<bool>,
    /// Datei-Senke: anhaengen statt ueberschreiben
    pub anhaengen: bool,
}

/// Pipeline-Parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineEinstellungen {
    /// Plaetze im Frame-Puffer
    pub puffer: usize,
    pub drain_timeout_ms: u64,
    pub statistik_ms: u64,
    /// Versuche pro Lese-/Schreibvorgang bei voruebergehenden Fehlern
    pub versuche: u32,
    pub backoff_ms: u64,
    pub beobachter_queue: usize,
}

impl Default for PipelineEinstellungen {
    fn default() -> Self {
        let standard = PipelineConfig::default();
        Self {
            puffer: standard.buffer_capacity,
            drain_timeout_ms: standard.drain_timeout.as_millis() as u64,
            statistik_ms: standard.stats_interval.as_millis() as u64,
            versuche: standard.retry.max_attempts,
            backoff_ms: standard.retry.backoff.as_millis() as u64,
            beobachter_queue: standard.observer_queue,
        }
    }
}

impl PipelineEinstellungen {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            buffer_capacity: self.puffer,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            stats_interval: Duration::from_millis(self.statistik_ms),
            retry: RetryPolicy {
                max_attempts: self.versuche,
                backoff: Duration::from_millis(self.backoff_ms),
            },
            observer_queue: self.beobachter_queue,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Prometheus-Export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetrikEinstellungen {
    /// Zieldatei im Textformat (leer = kein Export)
    pub datei: Option<String>,
    /// Statuszeile auf stderr
    pub terminal: bool,
}

impl SonanceConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Art von Quelle und Senke nach Modus und Ueberschreibungen
    pub fn endpunkte(&self) -> (EndpunktArt, EndpunktArt) {
        let (quelle, senke) = self.sonance.modus.endpunkte();
        (
            self.quelle.art.unwrap_or(quelle),
            self.senke.art.unwrap_or(senke),
        )
    }

    /// Ob eine Socket-Senke auf eingehende Verbindungen wartet
    pub fn senke_lauscht(&self) -> bool {
        self.senke
            .lauschen
            .unwrap_or(self.sonance.modus == Modus::StreamToSocket)
    }
}
