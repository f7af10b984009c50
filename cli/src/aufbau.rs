//! Aufbau einer Pipeline aus der Konfiguration
//!
//! `Bauplan` haelt alles, was fuer einen Neuaufbau noetig ist. Ein
//! Neustart oeffnet Quelle und Senke neu und erzeugt eine neue Pipeline;
//! eine laufende Pipeline wird nie umkonfiguriert.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sonance_audio::{
    AudioFormat, ChannelRemix, DeviceSink, DeviceSource, FileSink, FileSource, FrameSink,
    FrameSource, Pipeline, PipelineDisplay, SocketSink, SocketSource, TransformStage,
};
use tracing::{debug, info};

use crate::config::{EndpunktArt, EndpunktEinstellungen, SonanceConfig, STANDARD_ADRESSE};

/// Bauplan einer Pipeline
#[derive(Debug, Clone)]
pub struct Bauplan {
    pub name: String,
    pub config: SonanceConfig,
    pub format: AudioFormat,
}

impl Bauplan {
    pub fn neu(config: SonanceConfig) -> Result<Self> {
        let format = config.audio.format()?;
        let (quelle, senke) = config.endpunkte();
        let name = format!("{}:{quelle:?}->{senke:?}", config.sonance.modus).to_lowercase();
        Ok(Self {
            name,
            config,
            format,
        })
    }

    /// Format des Ausgabegeraets (Kanalanzahl ggf. angepasst)
    pub fn ausgabe_format(&self) -> AudioFormat {
        match self.config.audio.ausgabe_kanaele {
            Some(kanaele) => self.format.with_channels(kanaele),
            None => self.format,
        }
    }

    /// Oeffnet Quelle und Senke und baut eine neue Pipeline (Zustand Idle)
    pub fn bauen(&self, anzeige: Arc<dyn PipelineDisplay>) -> Result<Pipeline> {
        let (quelle_art, senke_art) = self.config.endpunkte();
        let stufen = self.stufen(senke_art)?;
        let ausgabe = match senke_art {
            EndpunktArt::Geraet => self.ausgabe_format(),
            _ => self.format,
        };

        let quelle = self.quelle(quelle_art)?;
        let senke = self.senke(senke_art, ausgabe)?;

        let mut builder = Pipeline::builder(self.name.clone())
            .boxed_source(quelle)
            .boxed_sink(senke)
            .config(self.config.pipeline.pipeline_config())
            .display(anzeige);
        for stufe in stufen {
            builder = builder.boxed_stage(stufe);
        }
        Ok(builder.build()?)
    }

    fn stufen(&self, senke: EndpunktArt) -> Result<Vec<Box<dyn TransformStage>>> {
        let mut stufen: Vec<Box<dyn TransformStage>> = Vec::new();

        if senke == EndpunktArt::Geraet {
            let ausgabe = self.ausgabe_format();
            if ausgabe.channels != self.format.channels {
                stufen.push(Box::new(ChannelRemix::new(self.format, ausgabe.channels)?));
            }
        }

        if let Some(kbps) = self.config.audio.opus_kbps {
            if senke == EndpunktArt::Geraet {
                bail!("Opus-Kodierung nur fuer Datei- oder Socket-Senken");
            }
            stufen.push(opus_stufe(self.format, kbps)?);
        }

        debug!(stufen = stufen.len(), "Transformationen gewaehlt");
        Ok(stufen)
    }

    fn quelle(&self, art: EndpunktArt) -> Result<Box<dyn FrameSource>> {
        let cfg = &self.config.quelle;
        Ok(match art {
            EndpunktArt::Geraet => {
                let backend = geraete_backend()?;
                let api = self.api(backend.as_ref())?;
                Box::new(DeviceSource::open(backend.as_ref(), api, cfg.geraet, self.format)?)
            }
            EndpunktArt::Datei => {
                let pfad = pfad(cfg, "quelle")?;
                Box::new(FileSource::open(pfad, self.format)?)
            }
            EndpunktArt::Socket => {
                let stream = annehmen(adresse(cfg, "quelle")?)?;
                Box::new(SocketSource::new(stream, self.format))
            }
        })
    }

    fn senke(&self, art: EndpunktArt, format: AudioFormat) -> Result<Box<dyn FrameSink>> {
        let cfg = &self.config.senke;
        Ok(match art {
            EndpunktArt::Geraet => {
                let backend = geraete_backend()?;
                let api = self.api(backend.as_ref())?;
                Box::new(DeviceSink::open(backend.as_ref(), api, cfg.geraet, format)?)
            }
            EndpunktArt::Datei => {
                let pfad = pfad(cfg, "senke")?;
                let sink = if cfg.anhaengen {
                    FileSink::append(pfad)?
                } else {
                    FileSink::create(pfad)?
                };
                Box::new(sink)
            }
            EndpunktArt::Socket if self.config.senke_lauscht() => {
                let stream = annehmen(cfg.adresse.as_deref().unwrap_or(STANDARD_ADRESSE))?;
                stream.set_nodelay(true)?;
                Box::new(SocketSink::new(stream))
            }
            EndpunktArt::Socket => {
                let adresse = adresse(cfg, "senke")?;
                let stream = TcpStream::connect(adresse)
                    .with_context(|| format!("Verbinden mit {adresse}"))?;
                stream.set_nodelay(true)?;
                Box::new(SocketSink::new(stream))
            }
        })
    }

    fn api(&self, backend: &dyn sonance_audio::DeviceBackend) -> Result<u32> {
        match self.config.audio.api {
            Some(api) => Ok(api),
            None => Ok(sonance_audio::device::first_api(backend)?.id),
        }
    }
}

/// Lauscht auf `adresse` und nimmt genau eine Verbindung an
fn annehmen(adresse: &str) -> Result<TcpStream> {
    let listener =
        TcpListener::bind(adresse).with_context(|| format!("Lauschen auf {adresse}"))?;
    info!(adresse, "Warte auf eingehende Verbindung");
    let (stream, peer) = listener.accept()?;
    info!(%peer, "Verbindung angenommen");
    Ok(stream)
}

fn pfad<'a>(cfg: &'a EndpunktEinstellungen, rolle: &str) -> Result<&'a str> {
    cfg.pfad
        .as_deref()
        .with_context(|| format!("[{rolle}] pfad fehlt"))
}

fn adresse<'a>(cfg: &'a EndpunktEinstellungen, rolle: &str) -> Result<&'a str> {
    cfg.adresse
        .as_deref()
        .with_context(|| format!("[{rolle}] adresse fehlt"))
}

#[cfg(feature = "cpal-backend")]
fn geraete_backend() -> Result<Box<dyn sonance_audio::DeviceBackend>> {
    Ok(Box::new(sonance_audio::device::cpal_backend::CpalBackend::new()))
}

#[cfg(not(feature = "cpal-backend"))]
fn geraete_backend() -> Result<Box<dyn sonance_audio::DeviceBackend>> {
    bail!("Audio-Geraete nicht verfuegbar: mit Feature `cpal-backend` bauen")
}

#[cfg(feature = "opus")]
fn opus_stufe(format: AudioFormat, kbps: u32) -> Result<Box<dyn TransformStage>> {
    Ok(Box::new(sonance_audio::transform::OpusEncodeStage::new(format, kbps)?))
}

#[cfg(not(feature = "opus"))]
fn opus_stufe(_format: AudioFormat, _kbps: u32) -> Result<Box<dyn TransformStage>> {
    bail!("Opus-Kodierung nicht verfuegbar: mit Feature `opus` bauen")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Modus;
    use sonance_audio::{LogDisplay, PipelineState, StreamFormat};

    fn datei_config(eingang: &str, ausgang: &str) -> SonanceConfig {
        let mut config = SonanceConfig::default();
        config.sonance.modus = Modus::Playback;
        config.audio.abtastrate = 8000;
        config.audio.frame_ms = 10;
        config.quelle.pfad = Some(eingang.into());
        config.senke.art = Some(EndpunktArt::Datei);
        config.senke.pfad = Some(ausgang.into());
        config
    }

    #[test]
    fn datei_zu_datei() {
        let dir = tempfile::tempdir().unwrap();
        let eingang = dir.path().join("ein.raw");
        let ausgang = dir.path().join("aus.raw");
        std::fs::write(&eingang, vec![3u8; 160 * 4]).unwrap();

        let plan = Bauplan::neu(datei_config(
            eingang.to_str().unwrap(),
            ausgang.to_str().unwrap(),
        ))
        .unwrap();
        assert_eq!(plan.format.frame_len(), 160);

        let pipeline = plan.bauen(Arc::new(LogDisplay)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.start().unwrap();
        assert!(pipeline.wait().unwrap().is_success());
        assert_eq!(std::fs::read(&ausgang).unwrap().len(), 640);

        // Neuaufbau erzeugt eine frische Pipeline aus demselben Plan
        let zweite = plan.bauen(Arc::new(LogDisplay)).unwrap();
        assert_eq!(zweite.state(), PipelineState::Idle);
        assert_eq!(zweite.output_format(), &StreamFormat::Pcm(plan.format));
    }

    #[test]
    fn datei_an_lauschenden_socket() {
        use std::io::Read;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let eingang = dir.path().join("ein.raw");
        std::fs::write(&eingang, vec![9u8; 160 * 3]).unwrap();

        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let adresse = format!("127.0.0.1:{port}");

        let mut config = SonanceConfig::default();
        config.sonance.modus = Modus::StreamToSocket;
        config.audio.abtastrate = 8000;
        config.audio.frame_ms = 10;
        config.quelle.art = Some(EndpunktArt::Datei);
        config.quelle.pfad = Some(eingang.to_string_lossy().into_owned());
        config.senke.adresse = Some(adresse.clone());
        let plan = Bauplan::neu(config).unwrap();

        let server = std::thread::spawn(move || {
            let pipeline = plan.bauen(Arc::new(LogDisplay)).unwrap();
            pipeline.start().unwrap();
            pipeline.wait().unwrap()
        });

        let mut client = loop {
            match TcpStream::connect(&adresse) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };
        let mut empfangen = Vec::new();
        client.read_to_end(&mut empfangen).unwrap();

        let outcome = server.join().unwrap();
        assert!(outcome.is_success());
        assert_eq!(empfangen, vec![9u8; 160 * 3]);
    }

    #[test]
    fn fehlender_pfad() {
        let mut config = SonanceConfig::default();
        config.sonance.modus = Modus::Playback;
        config.senke.art = Some(EndpunktArt::Datei);
        let plan = Bauplan::neu(config).unwrap();
        let err = plan.bauen(Arc::new(LogDisplay)).err().unwrap();
        assert!(err.to_string().contains("pfad fehlt"), "{err}");
    }

    #[cfg(not(feature = "cpal-backend"))]
    #[test]
    fn echo_ohne_geraete_backend() {
        let plan = Bauplan::neu(SonanceConfig::default()).unwrap();
        let err = plan.bauen(Arc::new(LogDisplay)).err().unwrap();
        assert!(err.to_string().contains("cpal-backend"), "{err}");
    }

    #[test]
    fn ausgabe_kanaele_fuegt_remix_hinzu() {
        let mut config = SonanceConfig::default();
        config.audio.ausgabe_kanaele = Some(2);
        let plan = Bauplan::neu(config).unwrap();
        assert_eq!(plan.ausgabe_format().channels, 2);
        assert_eq!(plan.stufen(EndpunktArt::Geraet).unwrap().len(), 1);
        assert!(plan.stufen(EndpunktArt::Datei).unwrap().is_empty());
    }
}
