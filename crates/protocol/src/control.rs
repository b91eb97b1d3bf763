//! Voice-Steuerkanal-Nachrichten
//!
//! Der Roh-Datagramm-Transport handelt seine Sitzung ueber den persistenten
//! Steuerkanal der Plattform aus. Jede Nachricht traegt einen numerischen
//! Opcode und ein JSON-Payload im `{op, d}`-Umschlag:
//!
//! ```text
//! Opcode  Richtung          Nachricht
//! ------  ----------------  ------------------
//! 0       Client -> Server  Identify
//! 1       Client -> Server  SelectProtocol
//! 2       Server -> Client  Ready
//! 3       beide             Heartbeat
//! 4       Server -> Client  SessionDescription
//! 5       Client -> Server  Speaking
//! ```
//!
//! serde kann getaggte Enums nicht mit numerischen Tags serialisieren,
//! daher wird der Umschlag wie beim TCP-Control-Protokoll von Hand
//! zusammengesetzt (`to_json`/`from_json`).

use palaver_core::types::{ChannelId, GruppenId, UserId};
use serde::{Deserialize, Serialize};
use std::io;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Opcode fuer `Identify`
pub const OP_IDENTIFY: u8 = 0;
/// Opcode fuer `SelectProtocol`
pub const OP_SELECT_PROTOCOL: u8 = 1;
/// Opcode fuer `Ready`
pub const OP_READY: u8 = 2;
/// Opcode fuer `Heartbeat`
pub const OP_HEARTBEAT: u8 = 3;
/// Opcode fuer `SessionDescription`
pub const OP_SESSION_DESCRIPTION: u8 = 4;
/// Opcode fuer `Speaking`
pub const OP_SPEAKING: u8 = 5;

// ---------------------------------------------------------------------------
// Payload-Strukturen
// ---------------------------------------------------------------------------

/// Schritt 1: Client identifiziert sich gegenueber dem Voice-Server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    /// Gruppe zu der der Sprachkanal gehoert
    pub gruppe: GruppenId,
    /// Eigene Benutzer-ID
    pub user_id: UserId,
    /// Session-ID aus dem Mitglieds-Zustandssignal
    pub session_id: String,
    /// Token aus dem Server-Zugangsdatensignal
    pub token: String,
}

/// Schritt 2: Server bestaetigt und nennt den UDP-Endpunkt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    /// Zugewiesene SSRC fuer alle ausgehenden Pakete
    pub ssrc: u32,
    /// IP-Adresse des Voice-UDP-Servers
    pub ip: String,
    /// UDP-Port des Voice-Servers
    pub port: u16,
    /// Vom Server angebotene Verschluesselungsmodi (bevorzugte zuerst)
    pub modi: Vec<String>,
    /// Heartbeat-Intervall in Millisekunden
    pub heartbeat_intervall_ms: u64,
}

/// Daten-Teil der Protokollwahl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtokollDaten {
    /// Extern beobachtete Adresse aus der IP-Ermittlung
    pub adresse: String,
    /// Extern beobachteter Port
    pub port: u16,
    /// Gewaehlter Verschluesselungsmodus (Wire-Name)
    pub modus: String,
}

/// Schritt 3: Client meldet Endpunkt und Verschluesselungsmodus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocol {
    /// Transportprotokoll, derzeit immer "udp"
    pub protokoll: String,
    /// Beobachteter Endpunkt + gewaehlter Modus
    pub daten: ProtokollDaten,
}

/// Schritt 4: Server liefert den Sitzungsschluessel – Handshake komplett
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Bestaetigter Verschluesselungsmodus
    pub modus: String,
    /// 32-Byte-Geheimschluessel der Sitzung
    pub geheimschluessel: Vec<u8>,
    /// Opakes Verbindungs-Token; wird auf allen spaeteren
    /// Voice-State-Mutationen mitgesendet, damit der Server sie nicht
    /// als neuen Beitritt auslegt
    pub verbindungs_id: Option<String>,
}

/// Keepalive in beide Richtungen (Nonce wird gespiegelt)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Beliebiger Wert, der Server spiegelt ihn zurueck
    pub nonce: u64,
}

/// Sprechstatus-Anzeige (vor dem ersten Medienpaket erforderlich)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Speaking {
    /// Spricht der Client gerade?
    pub spricht: bool,
    /// Verzoegerung in Millisekunden (0 fuer Clients)
    pub verzoegerung_ms: u32,
    /// Eigene SSRC
    pub ssrc: u32,
}

// ---------------------------------------------------------------------------
// Haupt-Enum: VoiceGatewayNachricht
// ---------------------------------------------------------------------------

/// Alle Nachrichten des Voice-Steuerkanals (typsicher via Enum)
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceGatewayNachricht {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    Heartbeat(Heartbeat),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
}

impl VoiceGatewayNachricht {
    /// Gibt den Opcode der Nachricht zurueck
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Identify(_) => OP_IDENTIFY,
            Self::SelectProtocol(_) => OP_SELECT_PROTOCOL,
            Self::Ready(_) => OP_READY,
            Self::Heartbeat(_) => OP_HEARTBEAT,
            Self::SessionDescription(_) => OP_SESSION_DESCRIPTION,
            Self::Speaking(_) => OP_SPEAKING,
        }
    }

    /// Serialisiert die Nachricht in den `{op, d}`-Umschlag
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        let d = match self {
            Self::Identify(p) => serde_json::to_value(p)?,
            Self::SelectProtocol(p) => serde_json::to_value(p)?,
            Self::Ready(p) => serde_json::to_value(p)?,
            Self::Heartbeat(p) => serde_json::to_value(p)?,
            Self::SessionDescription(p) => serde_json::to_value(p)?,
            Self::Speaking(p) => serde_json::to_value(p)?,
        };
        Ok(serde_json::json!({ "op": self.opcode(), "d": d }))
    }

    /// Deserialisiert eine Nachricht aus dem `{op, d}`-Umschlag
    ///
    /// # Fehler
    /// - `InvalidData` bei fehlendem/unbekanntem Opcode oder Payload,
    ///   das nicht zum Opcode passt
    pub fn from_json(wert: &serde_json::Value) -> io::Result<Self> {
        let op = wert
            .get("op")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ungueltig("Opcode fehlt"))?;
        let d = wert.get("d").cloned().unwrap_or(serde_json::Value::Null);

        let nachricht = match op as u8 {
            OP_IDENTIFY => Self::Identify(payload(d)?),
            OP_SELECT_PROTOCOL => Self::SelectProtocol(payload(d)?),
            OP_READY => Self::Ready(payload(d)?),
            OP_HEARTBEAT => Self::Heartbeat(payload(d)?),
            OP_SESSION_DESCRIPTION => Self::SessionDescription(payload(d)?),
            OP_SPEAKING => Self::Speaking(payload(d)?),
            andere => {
                return Err(ungueltig(format!("Unbekannter Opcode: {}", andere)));
            }
        };
        Ok(nachricht)
    }
}

fn payload<T: serde::de::DeserializeOwned>(d: serde_json::Value) -> io::Result<T> {
    serde_json::from_value(d)
        .map_err(|e| ungueltig(format!("Payload passt nicht zum Opcode: {}", e)))
}

fn ungueltig(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

// ---------------------------------------------------------------------------
// Gateway-Befehle (Orchestrator -> Plattform-Steuerkanal)
// ---------------------------------------------------------------------------

/// Voice-State-Flags fuer `ZustandAktualisieren`
///
/// Nur gesetzte Felder werden geaendert (Teil-Update).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZustandsFlags {
    /// Kamera/Video an oder aus
    pub video: Option<bool>,
    /// Mikrofon stummgeschaltet
    pub stumm: Option<bool>,
    /// Ausgabe deaktiviert
    pub taub: Option<bool>,
}

/// Befehle die der Orchestrator ueber den Plattform-Steuerkanal sendet
///
/// Dieselbe Verbindung traegt auch die Voice-Nachrichten (Opcodes 0-5);
/// die Plattformseite unterscheidet am `type`-Tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayBefehl {
    /// Beitritt zu einem Sprachkanal anfordern – loest die beiden
    /// Antwortsignale (Mitglieds-Zustand, Server-Zugangsdaten) aus
    BeitrittAnfordern {
        gruppe: GruppenId,
        kanal_id: ChannelId,
    },
    /// Abschied aus der Gruppe melden (kanal_id None = ganz verlassen)
    Verlassen {
        gruppe: GruppenId,
        kanal_id: Option<ChannelId>,
    },
    /// Voice-State einer bestehenden Verbindung mutieren; ohne
    /// `verbindungs_id` wuerde der Server dies als neuen Beitritt lesen
    ZustandAktualisieren {
        kanal_id: ChannelId,
        verbindungs_id: String,
        flags: ZustandsFlags,
    },
}

/// Alles was ueber den Steuerkanal nach draussen geht
#[derive(Debug, Clone, PartialEq)]
pub enum SteuerNachricht {
    /// Plattform-Gateway-Befehl (JSON mit `type`-Tag)
    Gateway(GatewayBefehl),
    /// Voice-Nachricht im `{op, d}`-Umschlag
    Voice(VoiceGatewayNachricht),
}

impl SteuerNachricht {
    /// Serialisiert die Nachricht fuer den Steuerkanal
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Gateway(befehl) => serde_json::to_value(befehl),
            Self::Voice(nachricht) => nachricht.to_json(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_umschlag_round_trip() {
        let original = VoiceGatewayNachricht::Identify(Identify {
            gruppe: GruppenId::new(),
            user_id: UserId::new(),
            session_id: "sitzung-123".to_string(),
            token: "token-abc".to_string(),
        });
        let json = original.to_json().unwrap();
        assert_eq!(json["op"], 0);
        let decoded = VoiceGatewayNachricht::from_json(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn ready_umschlag_round_trip() {
        let original = VoiceGatewayNachricht::Ready(Ready {
            ssrc: 0xCAFE,
            ip: "203.0.113.9".to_string(),
            port: 50001,
            modi: vec![
                "aead_aes256_gcm".to_string(),
                "aead_xchacha20_poly1305".to_string(),
            ],
            heartbeat_intervall_ms: 13750,
        });
        let json = original.to_json().unwrap();
        assert_eq!(json["op"], 2);
        let decoded = VoiceGatewayNachricht::from_json(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn session_description_mit_verbindungs_id() {
        let original = VoiceGatewayNachricht::SessionDescription(SessionDescription {
            modus: "aead_aes256_gcm".to_string(),
            geheimschluessel: vec![7u8; 32],
            verbindungs_id: Some("conn-xyz".to_string()),
        });
        let json = original.to_json().unwrap();
        let decoded = VoiceGatewayNachricht::from_json(&json).unwrap();
        if let VoiceGatewayNachricht::SessionDescription(sd) = decoded {
            assert_eq!(sd.geheimschluessel.len(), 32);
            assert_eq!(sd.verbindungs_id.as_deref(), Some("conn-xyz"));
        } else {
            panic!("Erwartet SessionDescription");
        }
    }

    #[test]
    fn alle_opcodes_eindeutig() {
        let nachrichten = vec![
            VoiceGatewayNachricht::Heartbeat(Heartbeat { nonce: 1 }),
            VoiceGatewayNachricht::Speaking(Speaking {
                spricht: true,
                verzoegerung_ms: 0,
                ssrc: 1,
            }),
        ];
        assert_eq!(nachrichten[0].opcode(), 3);
        assert_eq!(nachrichten[1].opcode(), 5);
    }

    #[test]
    fn unbekannter_opcode_fehler() {
        let json = serde_json::json!({ "op": 99, "d": {} });
        let result = VoiceGatewayNachricht::from_json(&json);
        assert!(result.is_err());
    }

    #[test]
    fn fehlender_opcode_fehler() {
        let json = serde_json::json!({ "d": {} });
        assert!(VoiceGatewayNachricht::from_json(&json).is_err());
    }

    #[test]
    fn payload_passt_nicht_zum_opcode() {
        // Ready-Opcode mit Heartbeat-Payload
        let json = serde_json::json!({ "op": 2, "d": { "nonce": 5 } });
        assert!(VoiceGatewayNachricht::from_json(&json).is_err());
    }

    #[test]
    fn gateway_befehl_serialisierung() {
        let befehl = GatewayBefehl::BeitrittAnfordern {
            gruppe: GruppenId::new(),
            kanal_id: ChannelId::new(),
        };
        let json = serde_json::to_value(&befehl).unwrap();
        assert_eq!(json["type"], "beitritt_anfordern");
        let decoded: GatewayBefehl = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, befehl);
    }

    #[test]
    fn zustands_flags_teil_update() {
        let flags = ZustandsFlags {
            video: Some(true),
            ..Default::default()
        };
        let befehl = GatewayBefehl::ZustandAktualisieren {
            kanal_id: ChannelId::new(),
            verbindungs_id: "conn-1".to_string(),
            flags,
        };
        let json = serde_json::to_value(&befehl).unwrap();
        let decoded: GatewayBefehl = serde_json::from_value(json).unwrap();
        if let GatewayBefehl::ZustandAktualisieren { flags, .. } = decoded {
            assert_eq!(flags.video, Some(true));
            assert_eq!(flags.stumm, None);
        } else {
            panic!("Erwartet ZustandAktualisieren");
        }
    }

    #[test]
    fn steuer_nachricht_umschlaege() {
        let voice = SteuerNachricht::Voice(VoiceGatewayNachricht::Heartbeat(Heartbeat {
            nonce: 9,
        }));
        assert_eq!(voice.to_json().unwrap()["op"], 3);

        let gateway = SteuerNachricht::Gateway(GatewayBefehl::Verlassen {
            gruppe: GruppenId::new(),
            kanal_id: None,
        });
        assert_eq!(gateway.to_json().unwrap()["type"], "verlassen");
    }
}
