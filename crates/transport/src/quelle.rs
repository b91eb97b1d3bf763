//! Laden und Demuxen der Abspielquellen
//!
//! `play(url)` und `play(puffer)` muenden beide in denselben
//! Opus-Paketstrom wie `play_opus` – hier sitzt der gemeinsame Trichter.

use palaver_core::{PalaverError, Result};
use palaver_media::webm::{self, OpusPaket};

use crate::AbspielQuelle;

/// EBML-Magic am Anfang jedes WebM-Containers
const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Dauer eines Opus-Frames im Rohpaket-Pfad (Zeitstempel-Synthese)
const OPUS_FRAME_MS: u64 = 20;

/// Laedt rohe Bytes einer Quelle (HTTP-Fetch fuer URLs)
pub(crate) async fn bytes_laden(url: &str) -> Result<Vec<u8>> {
    let antwort = reqwest::get(url)
        .await
        .map_err(|e| PalaverError::Verbindung(format!("Abruf von {} fehlgeschlagen: {}", url, e)))?
        .error_for_status()
        .map_err(|e| PalaverError::Verbindung(format!("Abruf von {} fehlgeschlagen: {}", url, e)))?;
    let bytes = antwort
        .bytes()
        .await
        .map_err(|e| PalaverError::Verbindung(format!("Abruf von {} abgebrochen: {}", url, e)))?;
    tracing::debug!(url, bytes = bytes.len(), "Quelle geladen");
    Ok(bytes.to_vec())
}

/// Ueberfuehrt eine Abspielquelle in zeitgestempelte Opus-Pakete
///
/// - `OpusPakete`: Zeitstempel werden mit 20 ms je Frame synthetisiert
/// - `Url`/`Puffer`: der Inhalt muss ein WebM-Container mit Opus-Track
///   sein und wird demuxt
pub(crate) async fn opus_pakete_laden(quelle: AbspielQuelle) -> Result<Vec<OpusPaket>> {
    let puffer = match quelle {
        AbspielQuelle::OpusPakete(pakete) => {
            return Ok(pakete
                .into_iter()
                .enumerate()
                .map(|(i, daten)| OpusPaket {
                    daten,
                    zeitstempel_ms: i as u64 * OPUS_FRAME_MS,
                })
                .collect());
        }
        AbspielQuelle::Url(url) => bytes_laden(&url).await?,
        AbspielQuelle::Puffer(puffer) => puffer,
    };

    if puffer.len() < WEBM_MAGIC.len() || puffer[..4] != WEBM_MAGIC {
        return Err(PalaverError::Container(
            "Audioquelle ist kein WebM-Container".into(),
        ));
    }
    let pakete = webm::opus_pakete(&puffer)?;
    Ok(pakete)
}
