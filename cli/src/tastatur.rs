//! Tastatur-Befehle waehrend eine Pipeline laeuft
//!
//! Eine Zeile auf stdin ist ein Befehl:
//! - `p` – Pause bzw. Fortsetzen
//! - `r` – Pipeline geordnet beenden und neu aufbauen
//! - `q` – geordnet beenden (wie Ctrl-C)
//!
//! Gelesen wird in einem eigenen Thread; blockierendes Lesen auf stdin darf
//! das Beenden der Laufzeit nicht aufhalten.

use std::io::{self, BufRead};
use std::str::FromStr;
use std::thread;

use sonance_audio::{Pipeline, PipelineState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Ein Befehl von der Tastatur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Befehl {
    PauseUmschalten,
    Neustart,
    Beenden,
}

impl FromStr for Befehl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "p" | "pause" => Ok(Self::PauseUmschalten),
            "r" | "neustart" => Ok(Self::Neustart),
            "q" | "beenden" => Ok(Self::Beenden),
            other => Err(anyhow::anyhow!(
                "Unbekannter Befehl '{other}' (p = Pause, r = Neustart, q = Beenden)"
            )),
        }
    }
}

/// Was die Sitzung nach einem Befehl tun soll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folge {
    Weiter,
    Neustart,
    Beenden,
}

/// Startet den Lese-Thread. Endet stdin, wird der Kanal geschlossen.
pub fn lesen() -> mpsc::Receiver<Befehl> {
    let (tx, rx) = mpsc::channel(8);
    let gestartet = thread::Builder::new()
        .name("sonance-tastatur".into())
        .spawn(move || {
            for zeile in io::stdin().lock().lines() {
                let Ok(zeile) = zeile else { break };
                if zeile.trim().is_empty() {
                    continue;
                }
                match zeile.parse::<Befehl>() {
                    Ok(befehl) => {
                        if tx.blocking_send(befehl).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{e}"),
                }
            }
            debug!("Tastatur-Eingabe beendet");
        });
    if let Err(e) = gestartet {
        warn!("Ohne Tastatur-Befehle: {e}");
    }
    rx
}

/// Wendet einen Befehl auf die laufende Pipeline an
pub fn anwenden(pipeline: &Pipeline, befehl: Befehl) -> Folge {
    match befehl {
        Befehl::PauseUmschalten => {
            let ergebnis = match pipeline.state() {
                PipelineState::Paused => pipeline.resume().map(|()| "fortgesetzt"),
                _ => pipeline.pause().map(|()| "pausiert"),
            };
            match ergebnis {
                Ok(was) => info!(pipeline = %pipeline.name(), "Pipeline {was}"),
                Err(e) => debug!("Pause abgelehnt: {e}"),
            }
            Folge::Weiter
        }
        Befehl::Neustart => {
            info!(pipeline = %pipeline.name(), "Neustart angefordert");
            anhalten(pipeline);
            Folge::Neustart
        }
        Befehl::Beenden => {
            anhalten(pipeline);
            Folge::Beenden
        }
    }
}

/// Fordert geordnetes Beenden an; eine schon beendete Pipeline ist kein Fehler
pub(crate) fn anhalten(pipeline: &Pipeline) {
    if let Err(e) = pipeline.stop() {
        debug!("Stop abgelehnt: {e}");
    }
}
