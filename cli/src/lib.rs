//! sonance-cli – Bibliotheks-Root
//!
//! Deklariert die Module der Kommandozeile und stellt die `Sitzung` bereit,
//! die eine Pipeline aufbaut, bis zum Ende, Ctrl-C oder einem
//! Tastatur-Befehl laufen laesst und bei Bedarf neu aufbaut.

pub mod anzeige;
pub mod aufbau;
pub mod config;
pub mod tastatur;

use std::sync::Arc;

use anyhow::Result;
use sonance_audio::{LogDisplay, Pipeline, PipelineDisplay, PipelineOutcome, PipelineState};
use sonance_observability::PipelineMetrics;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use anzeige::{Statuszeile, Verteiler};
use aufbau::Bauplan;
use config::SonanceConfig;
use tastatur::{Befehl, Folge};

/// Wie ein Lauf endete
#[derive(Debug)]
enum Lauf {
    Beendet(PipelineOutcome),
    Abgebrochen(PipelineOutcome),
    Neustart(PipelineOutcome),
}

/// Eine Kommandozeilen-Sitzung
pub struct Sitzung {
    pub plan: Bauplan,
    metriken: Option<PipelineMetrics>,
    anzeige: Arc<dyn PipelineDisplay>,
}

impl Sitzung {
    /// Erstellt die Sitzung aus der gegebenen Konfiguration
    pub fn neu(config: SonanceConfig) -> Result<Self> {
        let plan = Bauplan::neu(config)?;

        let mut verteiler = Verteiler::neu().mit(Arc::new(LogDisplay));
        let metriken = match &plan.config.metriken.datei {
            Some(_) => {
                let metriken = PipelineMetrics::neu(&plan.name)?;
                verteiler = verteiler.mit(Arc::new(metriken.clone()));
                Some(metriken)
            }
            None => None,
        };
        if plan.config.metriken.terminal {
            let mut zeile = Statuszeile::neu();
            if plan.config.audio.opus_kbps.is_some() {
                zeile = zeile.mit_kompression();
            }
            verteiler = verteiler.mit(Arc::new(zeile));
        }

        Ok(Self {
            plan,
            metriken,
            anzeige: Arc::new(verteiler),
        })
    }

    /// Laeuft bis die Pipeline endet, Ctrl-C kommt oder `q` eingegeben wird.
    /// Befehle werden von stdin gelesen (siehe [`tastatur`]).
    pub async fn ausfuehren(self) -> Result<PipelineOutcome> {
        let befehle = tastatur::lesen();
        self.ausfuehren_mit(befehle).await
    }

    /// Wie `ausfuehren`, Befehle kommen aus dem gegebenen Kanal.
    ///
    /// Eine fehlgeschlagene Pipeline wird bis zu `neustarts` mal neu
    /// aufgebaut, `r` baut immer neu auf. Liefert das Ergebnis des letzten
    /// Laufs.
    pub async fn ausfuehren_mit(self, mut befehle: mpsc::Receiver<Befehl>) -> Result<PipelineOutcome> {
        let neustarts = self.plan.config.sonance.neustarts;
        let mut versuch = 0;

        loop {
            let pipeline = Arc::new(self.bauen().await?);
            info!(
                pipeline = %self.plan.name,
                format = %self.plan.format,
                versuch,
                "Pipeline startet"
            );
            pipeline.start()?;

            let lauf = laufen_lassen(Arc::clone(&pipeline), &mut befehle).await?;
            self.metriken_exportieren();

            match lauf {
                Lauf::Abgebrochen(outcome) => {
                    info!("Abbruch durch Benutzer");
                    return ergebnis(outcome);
                }
                Lauf::Neustart(outcome) => {
                    info!(zustand = %outcome.final_state, "Pipeline wird auf Wunsch neu aufgebaut");
                }
                Lauf::Beendet(outcome)
                    if outcome.final_state == PipelineState::Failed && versuch < neustarts =>
                {
                    versuch += 1;
                    warn!(
                        versuch,
                        max = neustarts,
                        fehler = ?outcome.error,
                        "Pipeline fehlgeschlagen, wird neu aufgebaut"
                    );
                }
                Lauf::Beendet(outcome) => return ergebnis(outcome),
            }
        }
    }

    /// Baut die naechste Pipeline; Socket-Endpunkte warten dabei auf die
    /// Gegenstelle, deshalb ausserhalb der async-Threads
    async fn bauen(&self) -> Result<Pipeline> {
        let plan = self.plan.clone();
        let anzeige = Arc::clone(&self.anzeige);
        tokio::task::spawn_blocking(move || plan.bauen(anzeige)).await?
    }

    fn metriken_exportieren(&self) {
        let (Some(metriken), Some(datei)) = (&self.metriken, &self.plan.config.metriken.datei)
        else {
            return;
        };
        if let Err(e) = metriken.in_datei_schreiben(datei) {
            warn!("Metriken-Export fehlgeschlagen: {e:#}");
        }
    }
}

/// Wartet auf das Ende der Pipeline. Ctrl-C fordert geordnetes Beenden an,
/// Tastatur-Befehle werden auf die Pipeline angewendet.
async fn laufen_lassen(pipeline: Arc<Pipeline>, befehle: &mut mpsc::Receiver<Befehl>) -> Result<Lauf> {
    let warten = {
        let pipeline = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || pipeline.wait())
    };
    tokio::pin!(warten);
    let mut tastatur_offen = true;

    loop {
        tokio::select! {
            outcome = &mut warten => return Ok(Lauf::Beendet(outcome??)),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown-Signal empfangen, Pipeline wird geleert");
                tastatur::anhalten(&pipeline);
                return Ok(Lauf::Abgebrochen(warten.await??));
            }
            befehl = befehle.recv(), if tastatur_offen => {
                let Some(befehl) = befehl else {
                    tastatur_offen = false;
                    continue;
                };
                match tastatur::anwenden(&pipeline, befehl) {
                    Folge::Weiter => {}
                    Folge::Neustart => return Ok(Lauf::Neustart(warten.await??)),
                    Folge::Beenden => return Ok(Lauf::Abgebrochen(warten.await??)),
                }
            }
        }
    }
}

fn ergebnis(outcome: PipelineOutcome) -> Result<PipelineOutcome> {
    info!(
        zustand = %outcome.final_state,
        bytes = outcome.stats.bytes_transferred,
        frames = outcome.stats.frames_transferred,
        sekunden = outcome.stats.elapsed.as_secs_f64(),
        "Sitzung beendet"
    );
    match &outcome.error {
        Some(e) => {
            error!("Pipeline fehlgeschlagen: {e}");
            Err(anyhow::anyhow!("Pipeline fehlgeschlagen: {e}"))
        }
        None => Ok(outcome),
    }
}
