//! Sonance – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet die Sitzung.
//!
//! Aufruf: `sonance [echo|record|playback|stream-to-socket]`
//!
//! Waehrend des Laufs liest stdin Befehle: `p` Pause, `r` Neustart, `q` Beenden.

use anyhow::Result;
use sonance_cli::{config::SonanceConfig, Sitzung};
use sonance_observability::logging_initialisieren;

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad = std::env::var("SONANCE_CONFIG").unwrap_or_else(|_| "sonance.toml".into());

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let mut config = SonanceConfig::laden(&config_pfad)?;

    // Modus auf der Kommandozeile hat Vorrang
    if let Some(modus) = std::env::args().nth(1) {
        config.sonance.modus = modus.parse()?;
    }

    logging_initialisieren(&config.logging.level, &config.logging.format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        modus = %config.sonance.modus,
        "Sonance wird initialisiert"
    );

    Sitzung::neu(config)?.ausfuehren().await?;
    Ok(())
}
