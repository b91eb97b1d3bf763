//! Fehlertypen fuer Palaver
//!
//! Zentraler Fehler-Enum der alle moeglichen Fehlerzustaende abdeckt.
//! Untermodule koennen eigene Fehler definieren und via `#[from]` konvertieren.
//!
//! Die Taxonomie folgt den vier Fehlerklassen des Voice-Subsystems:
//! Aushandlungsfehler (fatal fuer den Versuch), Zeitueberschreitungen,
//! Codec-/Containerfehler (fatal fuer die Pipeline, nicht fuer den
//! Orchestrator) und transiente I/O-Fehler.

use thiserror::Error;

/// Globaler Result-Alias fuer Palaver
pub type Result<T> = std::result::Result<T, PalaverError>;

/// Alle moeglichen Fehler im Palaver-Voice-Subsystem
#[derive(Debug, Error)]
pub enum PalaverError {
    // --- Aushandlung (fatal fuer den Verbindungsversuch) ---
    #[error("Aushandlung fehlgeschlagen: {0}")]
    Aushandlung(String),

    #[error("Beitritt nicht innerhalb von {0} Sekunden abgeschlossen")]
    BeitrittZeitueberschreitung(u64),

    // --- Verbindung & Netzwerk (transient) ---
    #[error("Verbindung fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Verbindung getrennt: {0}")]
    Getrennt(String),

    // --- Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    // --- Codec & Container (fatal fuer die Pipeline) ---
    #[error("Containerfehler: {0}")]
    Container(String),

    #[error("Codecfehler: {0}")]
    Codec(String),

    #[error("Kein Videotrack im Container gefunden")]
    KeinVideoTrack,

    // --- Ressourcen ---
    #[error("Kanal nicht gefunden: {0}")]
    KanalNichtGefunden(String),

    #[error("Nicht unterstuetzt: {0}")]
    NichtUnterstuetzt(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PalaverError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler wiederholbar sein koennte
    ///
    /// Aushandlungs- und Codecfehler sind endgueltig; nur transiente
    /// Netzwerkzustaende kommen fuer einen erneuten Versuch in Frage.
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(
            self,
            Self::BeitrittZeitueberschreitung(_) | Self::Verbindung(_) | Self::Getrennt(_)
        )
    }
}
