//! Orchestrator-Ereignisse
//!
//! Jedes Signal das der Orchestrator nach aussen meldet ist eine typisierte
//! Variante in einem getaggten Enum – keine String-Eventnamen. Verteilt
//! wird ueber einen tokio-Broadcast-Kanal im Session-Crate.

use crate::types::{ChannelId, GruppenId};
use serde::{Deserialize, Serialize};

/// Lebenszyklus-Ereignisse einer Voice-Verbindung
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestratorEreignis {
    /// Ein Beitritt wurde vollstaendig abgeschlossen (Transport steht)
    BeitrittAbgeschlossen {
        kanal_id: ChannelId,
        gruppe: GruppenId,
    },
    /// Der Server hat die Verbindung beendet (Raum geschlossen, Voice
    /// entzogen). Wird *vor* `VerbindungGeschlossen` gemeldet, damit der
    /// Aufrufer ueber einen Wiederbeitritt entscheiden kann – die
    /// Rejoin-Politik liegt nicht beim Orchestrator.
    ServerGetrennt {
        kanal_id: ChannelId,
        gruppe: GruppenId,
    },
    /// Eine Verbindung wurde abgebaut (explizit oder nach Fehler)
    VerbindungGeschlossen { kanal_id: ChannelId },
    /// Ein Transportfehler ist aufgetreten; die Verbindung bleibt
    /// stoppbar, ein automatischer Neuaufbau findet nicht statt
    TransportFehler {
        kanal_id: ChannelId,
        beschreibung: String,
    },
    /// Eine laufende Verbindung ist auf neue Server-Zugangsdaten
    /// umgezogen (Migration abgeschlossen)
    VerbindungMigriert {
        kanal_id: ChannelId,
        gruppe: GruppenId,
    },
    /// Im SFU-Raum wurde der Track eines Teilnehmers abonniert
    TrackAbonniert {
        kanal_id: ChannelId,
        teilnehmer: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, GruppenId};

    #[test]
    fn ereignis_ist_serde_kompatibel() {
        let event = OrchestratorEreignis::BeitrittAbgeschlossen {
            kanal_id: ChannelId::new(),
            gruppe: GruppenId::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let _: OrchestratorEreignis = serde_json::from_str(&json).unwrap();
    }
}
