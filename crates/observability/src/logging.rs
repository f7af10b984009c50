//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Umgebungsvariable:
//! - `SONANCE_LOG_LEVEL`: Log-Level oder Filter-Direktive, Standard: info
//! - `SONANCE_LOG_FORMAT`: Format (text/json), Standard: text
//!
//! Die Umgebung hat Vorrang vor den Werten aus der Konfigurationsdatei.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LEVEL: &str = "SONANCE_LOG_LEVEL";
pub const ENV_FORMAT: &str = "SONANCE_LOG_FORMAT";

/// Initialisiert das Logging-System.
///
/// `level` und `format` kommen aus der Konfiguration und gelten nur, wenn
/// die Umgebungsvariablen nicht gesetzt sind. Schlaegt fehl, wenn bereits
/// ein globaler Subscriber installiert ist.
pub fn logging_initialisieren(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_env(ENV_LEVEL)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = std::env::var(ENV_FORMAT).unwrap_or_else(|_| format.to_string());

    // Thread-Namen zeigen, welcher Pipeline-Thread loggt
    let result = match format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_current_span(true)
            .try_init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Logging bereits initialisiert: {e}"))
}

/// Log-Level aus der Umgebung, sonst `fallback`
pub fn log_level_aus_env(fallback: &str) -> String {
    std::env::var(ENV_LEVEL).unwrap_or_else(|_| fallback.to_string())
}

/// Log-Format aus der Umgebung, sonst `fallback`
pub fn log_format_aus_env(fallback: &str) -> String {
    std::env::var(ENV_FORMAT).unwrap_or_else(|_| fallback.to_string())
}

/// Validiert ob ein Log-Level-String gueltig ist.
pub fn log_level_gueltig(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

/// Validiert ob ein Log-Format-String gueltig ist.
pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_gueltige_werte() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(log_level_gueltig(level), "{level}");
        }
    }

    #[test]
    fn log_level_ungueltige_werte() {
        assert!(!log_level_gueltig("verbose"));
        assert!(!log_level_gueltig("INFO")); // Gross-/Kleinschreibung
        assert!(!log_level_gueltig(""));
    }

    #[test]
    fn log_format_werte() {
        assert!(log_format_gueltig("text"));
        assert!(log_format_gueltig("json"));
        assert!(!log_format_gueltig("xml"));
        assert!(!log_format_gueltig("JSON"));
    }

    // Ein Test fuer beide Variablen, damit parallele Tests sich nicht stoeren
    #[test]
    fn umgebung_hat_vorrang() {
        std::env::remove_var(ENV_LEVEL);
        std::env::remove_var(ENV_FORMAT);
        assert_eq!(log_level_aus_env("warn"), "warn");
        assert_eq!(log_format_aus_env("text"), "text");

        std::env::set_var(ENV_LEVEL, "debug");
        std::env::set_var(ENV_FORMAT, "json");
        assert_eq!(log_level_aus_env("warn"), "debug");
        assert_eq!(log_format_aus_env("text"), "json");
        std::env::remove_var(ENV_LEVEL);
        std::env::remove_var(ENV_FORMAT);
    }
}
