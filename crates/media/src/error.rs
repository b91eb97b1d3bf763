//! Fehlertypen des Medienpfads
//!
//! Container- und Codecfehler sind fatal fuer die jeweilige Pipeline,
//! nicht fuer den Orchestrator – die Umwandlung in den zentralen
//! `PalaverError` haelt diese Unterscheidung bei.

use thiserror::Error;

/// Alle moeglichen Fehler des Medienpfads
#[derive(Debug, Error)]
pub enum MedienFehler {
    #[error("Containerfehler: {0}")]
    Container(String),

    #[error("Codec-Fehler: {0}")]
    CodecFehler(String),

    #[error("Kein Videotrack im Container gefunden")]
    KeinVideoTrack,

    #[error("Kein Opus-Audiotrack im Container gefunden")]
    KeinAudioTrack,

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Subprozess-Fehler: {0}")]
    Prozess(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

pub type MedienResult<T> = Result<T, MedienFehler>;

impl From<MedienFehler> for palaver_core::PalaverError {
    fn from(f: MedienFehler) -> Self {
        use palaver_core::PalaverError;
        match f {
            MedienFehler::Container(m) => PalaverError::Container(m),
            MedienFehler::CodecFehler(m) => PalaverError::Codec(m),
            MedienFehler::KeinVideoTrack => PalaverError::KeinVideoTrack,
            MedienFehler::KeinAudioTrack => {
                PalaverError::Container("kein Opus-Audiotrack".into())
            }
            MedienFehler::Konfiguration(m) => PalaverError::Intern(m),
            MedienFehler::Prozess(m) => PalaverError::Verbindung(m),
            MedienFehler::Io(e) => PalaverError::Io(e),
        }
    }
}
