//! Kollaborateur-Kontrakte des Orchestrators
//!
//! Die Plattform (Gateway, Cache, Kanalobjekte) ist fuer Voice eine
//! Black Box. Hier stehen genau die Schnittstellen, die Voice davon
//! braucht: eine stabile Kanalreferenz und die typisierten Signale, die
//! das Gateway in den Orchestrator pusht. Die Sende-Primitive
//! (`Steuerkanal`) ist im Transport-Crate definiert und wird hier
//! mitverwendet.

use palaver_core::types::{ChannelId, GruppenId, UserId};
use palaver_protocol::control::VoiceGatewayNachricht;
use serde::{Deserialize, Serialize};

/// Referenz auf einen Sprachkanal
///
/// Das Kanalobjekt der Plattform bietet mehr (Name, Rechte, ...);
/// Voice braucht nur die stabile Id, die Gruppe und den Shard, ueber
/// den der Steuerkanal zu erreichen ist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanalRef {
    /// Stabile Kanal-Id
    pub id: ChannelId,
    /// Uebergeordnete Gruppe
    pub gruppe: GruppenId,
    /// Shard-Index des Steuerkanals
    pub shard_index: u32,
}

impl KanalRef {
    /// Erstellt eine Kanalreferenz auf Shard 0
    pub fn neu(id: ChannelId, gruppe: GruppenId) -> Self {
        Self {
            id,
            gruppe,
            shard_index: 0,
        }
    }
}

/// Signal: der Voice-Zustand eines Mitglieds hat sich geaendert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitgliedsZustand {
    /// Betroffenes Mitglied
    pub user_id: UserId,
    /// Gruppe in der sich der Zustand geaendert hat
    pub gruppe: GruppenId,
    /// Neuer Kanal (None = Sprachkanal verlassen)
    pub kanal_id: Option<ChannelId>,
    /// Session-Id – beim eigenen Zustand Teil des Voice-Handshakes
    pub session_id: String,
}

/// Signal: der Server hat Voice-Zugangsdaten ausgestellt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerZugangsdaten {
    /// Betroffene Gruppe
    pub gruppe: GruppenId,
    /// Voice-Endpunkt; leer/None heisst: der Server hat Voice entzogen
    pub endpunkt: Option<String>,
    /// Zugriffstoken fuer den Endpunkt
    pub token: String,
}

impl ServerZugangsdaten {
    /// Ist der Endpunkt vorhanden und nicht leer?
    pub fn hat_endpunkt(&self) -> bool {
        self.endpunkt.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Alle Signale, die das Gateway in den Orchestrator pusht
///
/// Typisierte Varianten statt String-Events (ein Signal = eine
/// Enum-Variante); zugestellt ueber `VoiceOrchestrator::signal_verarbeiten`.
#[derive(Debug, Clone)]
pub enum GatewaySignal {
    /// Einmaliger Zustandsabgleich beim Sitzungsstart
    InitialerAbgleich {
        /// Eigene Benutzer-Id laut Gateway
        user_id: UserId,
        /// Session-Id der Gateway-Sitzung
        session_id: String,
        /// Bekannte Voice-Zustaende aller Gruppen
        zustaende: Vec<MitgliedsZustand>,
    },
    /// Voice-Zustand eines Mitglieds geaendert
    MitgliedsZustand(MitgliedsZustand),
    /// Server-Zugangsdaten ausgestellt (Beitritt oder Migration)
    ServerZugangsdaten(ServerZugangsdaten),
    /// Voice-Nachricht vom Steuerkanal, adressiert an eine Gruppe
    VoiceNachricht {
        gruppe: GruppenId,
        nachricht: VoiceGatewayNachricht,
    },
}
