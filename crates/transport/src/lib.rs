//! palaver-transport – die beiden Voice-Transporte
//!
//! Ein Sprachkanal wird ueber genau eine von zwei Transportvarianten
//! bedient, serverseitig gewaehlt und hier als Zwei-Varianten-Enum mit
//! gemeinsamem Trait modelliert:
//! - [`datagramm::DatagrammTransport`]: Steuerkanal-Handshake + UDP mit
//!   RTP-Rahmung und authentifizierter Verschluesselung
//! - [`sfu::SfuRaumTransport`]: Beitritt in einen SFU-Raum, publizierte
//!   Audio-/Videotracks, lokale Dekodierpipelines
//!
//! Transporte melden ausschliesslich Signale nach oben
//! ([`TransportEreignis`]); die Verbindungs-Registry gehoert dem
//! Orchestrator im Session-Crate.

pub mod datagramm;
pub mod quelle;
pub mod senke;
pub mod sfu;
pub mod sfu_video;

use async_trait::async_trait;
use palaver_core::Result;
use palaver_protocol::control::SteuerNachricht;

pub use datagramm::{DatagrammKonfig, DatagrammTransport, VerbindungsZustand};
pub use sfu::{SfuKonfig, SfuRaumTransport};
pub use sfu_video::VideoPipeline;

// ---------------------------------------------------------------------------
// Steuerkanal-Kontrakt (Kollaborateur)
// ---------------------------------------------------------------------------

/// Kontrakt zum persistenten Steuerkanal der Plattform
///
/// Der Steuerkanal selbst ist eine Black Box (eigenes Subsystem); Voice
/// braucht nur die Sende-Primitive, adressiert ueber den Shard-Index.
/// Eingehende Nachrichten stellt der Orchestrator den Transporten ueber
/// deren Eingangs-Kanaele zu.
pub trait Steuerkanal: Send + Sync + 'static {
    /// Sendet ein Payload ueber den Shard mit dem gegebenen Index
    fn senden(&self, shard_index: u32, nachricht: SteuerNachricht) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Transportart
// ---------------------------------------------------------------------------

/// Die zwei Transportvarianten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportArt {
    /// Roh-Datagramm: UDP mit eigener Rahmung und Verschluesselung
    RohDatagramm,
    /// SFU-Raum: publizierte Tracks ueber einen Medienraum
    SfuRaum,
}

impl TransportArt {
    /// Leitet die Transportart aus der Form der Server-Zugangsdaten ab
    ///
    /// Ein Endpunkt mit URL-Schema (`wss://`, `https://`) adressiert einen
    /// SFU-Raum; ein nacktes `host:port` den Voice-UDP-Server. Reines
    /// Praedikat, einmal beim Verbindungsaufbau ausgewertet – keine
    /// manuelle Konfiguration.
    pub fn aus_zugangsdaten(endpunkt: &str) -> Self {
        if endpunkt.contains("://") {
            Self::SfuRaum
        } else {
            Self::RohDatagramm
        }
    }
}

impl std::fmt::Display for TransportArt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RohDatagramm => write!(f, "roh_datagramm"),
            Self::SfuRaum => write!(f, "sfu_raum"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signale nach oben
// ---------------------------------------------------------------------------

/// Signale eines Transports an den Orchestrator
///
/// Typisierte Varianten statt String-Events; zugestellt ueber den beim
/// Erstellen uebergebenen mpsc-Kanal.
#[derive(Debug, Clone)]
pub enum TransportEreignis {
    /// Handshake abgeschlossen bzw. Raum beigetreten
    Bereit,
    /// Der Server hat die opake Verbindungs-Id vergeben
    VerbindungsId(String),
    /// Der Server hat die Verbindung beendet – wird *vor* `Getrennt`
    /// gemeldet, damit der Aufrufer ueber einen Wiederbeitritt
    /// entscheiden kann
    ServerGetrennt,
    /// Transport abgebaut
    Getrennt,
    /// Fehler; die Verbindung bleibt stoppbar, ein automatischer
    /// Neuaufbau findet auf dieser Ebene nicht statt
    Fehler(String),
    /// Entschluesseltes, dekodiertes Audio eines anderen Teilnehmers
    AudioEmpfangen { ssrc: u32, pcm: Vec<f32> },
    /// Ein Track eines anderen Teilnehmers wurde abonniert (SFU-Raum)
    TrackAbonniert { teilnehmer: String },
}

// ---------------------------------------------------------------------------
// Abspielquellen
// ---------------------------------------------------------------------------

/// Quelle fuer die Audio-Wiedergabe
pub enum AbspielQuelle {
    /// HTTP-URL, wird geladen und aus dem Container demuxt
    Url(String),
    /// Bereits geladener Containerpuffer (WebM)
    Puffer(Vec<u8>),
    /// Roher Opus-Paketstrom (ein Eintrag je Opus-Frame)
    OpusPakete(Vec<Vec<u8>>),
}

/// Optionen der Videowiedergabe
#[derive(Debug, Clone, Default)]
pub struct VideoOptionen {
    /// Am Streamende Demuxer/Decoder neu initialisieren und von vorn
    /// beginnen, ohne den publizierten Track zu schliessen
    pub schleife: bool,
    /// Bildrate erzwingen (sonst aus dem Container)
    pub fps: Option<f32>,
}

// ---------------------------------------------------------------------------
// MedienTransport-Trait + Zwei-Varianten-Enum
// ---------------------------------------------------------------------------

/// Gemeinsame Schnittstelle beider Transportvarianten
#[async_trait]
pub trait MedienTransport: Send + Sync {
    /// Baut die Verbindung auf (Handshake bzw. Raumbeitritt)
    async fn verbinden(&self) -> Result<()>;

    /// Spielt eine Audioquelle ab
    async fn abspielen(&self, quelle: AbspielQuelle) -> Result<()>;

    /// Spielt eine Videoquelle ab (nur SFU-Raum)
    async fn video_abspielen(&self, quelle: AbspielQuelle, optionen: VideoOptionen) -> Result<()>;

    /// Stoppt die Audio-Wiedergabe (mehrfach aufrufbar)
    async fn stoppen(&self);

    /// Stoppt die Video-Wiedergabe (mehrfach aufrufbar)
    async fn video_stoppen(&self);

    /// Setzt die Wiedergabe-Lautstaerke (0.0..2.0)
    fn lautstaerke_setzen(&self, lautstaerke: f32);

    /// Gibt die Ziel-Lautstaerke zurueck
    fn lautstaerke_holen(&self) -> f32;

    /// Baut den Transport vollstaendig ab; idempotent, aus jedem Zustand
    async fn zerstoeren(&self);
}

/// Die konkrete Transportinstanz einer Verbindung
pub enum Transport {
    Datagramm(DatagrammTransport),
    SfuRaum(SfuRaumTransport),
}

impl Transport {
    /// Variante dieses Transports
    pub fn art(&self) -> TransportArt {
        match self {
            Self::Datagramm(_) => TransportArt::RohDatagramm,
            Self::SfuRaum(_) => TransportArt::SfuRaum,
        }
    }

    fn als_trait(&self) -> &dyn MedienTransport {
        match self {
            Self::Datagramm(t) => t,
            Self::SfuRaum(t) => t,
        }
    }
}

#[async_trait]
impl MedienTransport for Transport {
    async fn verbinden(&self) -> Result<()> {
        self.als_trait().verbinden().await
    }

    async fn abspielen(&self, quelle: AbspielQuelle) -> Result<()> {
        self.als_trait().abspielen(quelle).await
    }

    async fn video_abspielen(&self, quelle: AbspielQuelle, optionen: VideoOptionen) -> Result<()> {
        self.als_trait().video_abspielen(quelle, optionen).await
    }

    async fn stoppen(&self) {
        self.als_trait().stoppen().await
    }

    async fn video_stoppen(&self) {
        self.als_trait().video_stoppen().await
    }

    fn lautstaerke_setzen(&self, lautstaerke: f32) {
        self.als_trait().lautstaerke_setzen(lautstaerke)
    }

    fn lautstaerke_holen(&self) -> f32 {
        self.als_trait().lautstaerke_holen()
    }

    async fn zerstoeren(&self) {
        self.als_trait().zerstoeren().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transportwahl_nach_endpunkt_form() {
        assert_eq!(
            TransportArt::aus_zugangsdaten("wss://sfu.palaver.chat"),
            TransportArt::SfuRaum
        );
        assert_eq!(
            TransportArt::aus_zugangsdaten("https://raum.example/t0ken"),
            TransportArt::SfuRaum
        );
        assert_eq!(
            TransportArt::aus_zugangsdaten("203.0.113.5:4010"),
            TransportArt::RohDatagramm
        );
        assert_eq!(
            TransportArt::aus_zugangsdaten("voice-eu3.palaver.chat:443"),
            TransportArt::RohDatagramm
        );
    }
}
