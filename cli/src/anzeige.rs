//! Anzeigen der Kommandozeile
//!
//! `Verteiler` reicht jede Meldung an mehrere Anzeigen weiter (z.B.
//! Prometheus-Metriken und Statuszeile). Fehler einer Anzeige halten die
//! anderen nicht auf.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use sonance_audio::{LoudnessSample, PipelineDisplay, PipelineState, StatsSnapshot, MAX_LEVEL};

/// Reicht an alle Anzeigen weiter; der erste Fehler wird gemeldet
#[derive(Default, Clone)]
pub struct Verteiler {
    anzeigen: Vec<Arc<dyn PipelineDisplay>>,
}

impl Verteiler {
    pub fn neu() -> Self {
        Self::default()
    }

    pub fn mit(mut self, anzeige: Arc<dyn PipelineDisplay>) -> Self {
        self.anzeigen.push(anzeige);
        self
    }

    pub fn len(&self) -> usize {
        self.anzeigen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anzeigen.is_empty()
    }

    fn alle(&self, f: impl Fn(&dyn PipelineDisplay) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut erster = None;
        for anzeige in &self.anzeigen {
            if let Err(e) = f(anzeige.as_ref()) {
                erster.get_or_insert(e);
            }
        }
        erster.map_or(Ok(()), Err)
    }
}

impl PipelineDisplay for Verteiler {
    fn show_stats(&self, stats: &StatsSnapshot) -> anyhow::Result<()> {
        self.alle(|a| a.show_stats(stats))
    }

    fn show_loudness(&self, loudness: &LoudnessSample) -> anyhow::Result<()> {
        self.alle(|a| a.show_loudness(loudness))
    }

    fn show_state(&self, from: PipelineState, to: PipelineState) -> anyhow::Result<()> {
        self.alle(|a| a.show_state(from, to))
    }
}

/// Einzeilige Statusanzeige auf stderr
#[derive(Debug, Default)]
pub struct Statuszeile {
    pegel: AtomicU8,
    kompression: bool,
}

impl Statuszeile {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Zeigt zusaetzlich die Ersparnis eines Encoders
    pub fn mit_kompression(mut self) -> Self {
        self.kompression = true;
        self
    }

    /// Baut die Zeile: Laufzeit, Datenmenge, Speicher, Latenz, Pegel-Balken
    /// und bei Bedarf die Ersparnis gegenueber den gelesenen Bytes
    pub fn zeile(stats: &StatsSnapshot, pegel: u8, kompression: bool) -> String {
        let balken = "#".repeat(usize::from(pegel.min(MAX_LEVEL)) / 4);
        let mut zeile = format!(
            "{:>7.1}s {:>9.2} MB  mem {:>7.1} MB  lat {:>4} ms  [{:<20}]",
            stats.elapsed.as_secs_f64(),
            stats.megabytes(),
            stats.memory_megabytes(),
            stats.latency_estimate.as_millis(),
            balken
        );
        if kompression {
            match stats.compression_ratio() {
                Some(faktor) => {
                    zeile.push_str(&format!("  spart {:>5.1}%", (1.0 - 1.0 / faktor) * 100.0))
                }
                None => zeile.push_str("  spart    - %"),
            }
        }
        zeile
    }
}

impl PipelineDisplay for Statuszeile {
    fn show_stats(&self, stats: &StatsSnapshot) -> anyhow::Result<()> {
        let zeile = Self::zeile(stats, self.pegel.load(Ordering::Relaxed), self.kompression);
        let mut err = std::io::stderr().lock();
        write!(err, "\r{zeile}")?;
        err.flush()?;
        Ok(())
    }

    fn show_loudness(&self, loudness: &LoudnessSample) -> anyhow::Result<()> {
        self.pegel.store(loudness.level, Ordering::Relaxed);
        Ok(())
    }

    fn show_state(&self, _from: PipelineState, to: PipelineState) -> anyhow::Result<()> {
        if to.is_terminal() {
            writeln!(std::io::stderr())?;
        }
        Ok(())
    }
}
