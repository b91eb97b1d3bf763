//! Korrelation der beiden Beitrittssignale
//!
//! Ein Beitritt wird aus zwei unabhaengig, teilgeordnet eintreffenden
//! Signalen zusammengesetzt: dem eigenen Mitglieds-Zustand und den
//! Server-Zugangsdaten. Statt Future-Verkettung haelt eine explizite
//! Zustandsstruktur beide Optional-Felder und ein reines Praedikat
//! entscheidet nach jedem Update "vollstaendig, und fuer welche
//! Transportart". Der Abschluss feuert hoechstens einmal.

use tokio::sync::oneshot;

use palaver_transport::TransportArt;

use crate::kontrakt::{KanalRef, MitgliedsZustand, ServerZugangsdaten};

/// Ergebnis eines vollstaendigen Beitritts
#[derive(Debug, Clone)]
pub struct BeitrittsDaten {
    /// Zielkanal
    pub kanal: KanalRef,
    /// Gewaehlte Transportvariante
    pub art: TransportArt,
    /// Server-Zugangsdaten (Endpunkt garantiert vorhanden)
    pub zugangsdaten: ServerZugangsdaten,
    /// Eigener Mitglieds-Zustand; beim Roh-Datagramm garantiert vorhanden
    pub mitglieds_zustand: Option<MitgliedsZustand>,
}

/// Laufender Beitrittsversuch
///
/// Lebt von `beitreten()` bis zum Abschluss oder Timeout in der
/// Ausstehend-Tabelle des Orchestrators.
pub struct AusstehenderBeitritt {
    /// Zielkanal
    pub kanal: KanalRef,
    /// Unabhaengig eintreffend: Server-Zugangsdaten
    pub zugangsdaten: Option<ServerZugangsdaten>,
    /// Unabhaengig eintreffend: eigener Mitglieds-Zustand
    pub mitglieds_zustand: Option<MitgliedsZustand>,
    /// Abschluss-Sender; `Option::take` stellt Hoechstens-einmal sicher
    fertig: Option<oneshot::Sender<BeitrittsDaten>>,
}

impl AusstehenderBeitritt {
    /// Erstellt den Versuch samt Empfaenger fuer den Abschluss
    pub fn neu(kanal: KanalRef) -> (Self, oneshot::Receiver<BeitrittsDaten>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kanal,
                zugangsdaten: None,
                mitglieds_zustand: None,
                fertig: Some(tx),
            },
            rx,
        )
    }

    /// Reines Praedikat: ist der Versuch vollstaendig, und fuer welche
    /// Transportart?
    ///
    /// - SFU-Raum: die Zugangsdaten allein genuegen
    /// - Roh-Datagramm: Zugangsdaten *und* Mitglieds-Zustand, in
    ///   beliebiger Reihenfolge
    ///
    /// Die Wahl ist eine Funktion der Endpunkt-Form, keine Konfiguration.
    pub fn vollstaendig(&self) -> Option<TransportArt> {
        let zugang = self.zugangsdaten.as_ref()?;
        let endpunkt = zugang.endpunkt.as_deref().filter(|e| !e.is_empty())?;
        match TransportArt::aus_zugangsdaten(endpunkt) {
            TransportArt::SfuRaum => Some(TransportArt::SfuRaum),
            TransportArt::RohDatagramm if self.mitglieds_zustand.is_some() => {
                Some(TransportArt::RohDatagramm)
            }
            TransportArt::RohDatagramm => None,
        }
    }

    /// Versucht den Abschluss; gibt `true` zurueck wenn er gefeuert hat
    ///
    /// Feuert hoechstens einmal – auch wenn danach weitere Signale fuer
    /// denselben Versuch eintreffen.
    pub fn abschliessen(&mut self) -> bool {
        let Some(art) = self.vollstaendig() else {
            return false;
        };
        let Some(sender) = self.fertig.take() else {
            return false;
        };
        let daten = BeitrittsDaten {
            kanal: self.kanal,
            art,
            zugangsdaten: self
                .zugangsdaten
                .clone()
                .expect("vollstaendig() garantiert Zugangsdaten"),
            mitglieds_zustand: self.mitglieds_zustand.clone(),
        };
        sender.send(daten).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::types::{ChannelId, GruppenId, UserId};

    fn kanal() -> KanalRef {
        KanalRef::neu(ChannelId::new(), GruppenId::new())
    }

    fn zugang(kanal: &KanalRef, endpunkt: &str) -> ServerZugangsdaten {
        ServerZugangsdaten {
            gruppe: kanal.gruppe,
            endpunkt: Some(endpunkt.to_string()),
            token: "token".to_string(),
        }
    }

    fn zustand(kanal: &KanalRef) -> MitgliedsZustand {
        MitgliedsZustand {
            user_id: UserId::new(),
            gruppe: kanal.gruppe,
            kanal_id: Some(kanal.id),
            session_id: "sitzung".to_string(),
        }
    }

    #[test]
    fn leer_ist_unvollstaendig() {
        let (beitritt, _rx) = AusstehenderBeitritt::neu(kanal());
        assert_eq!(beitritt.vollstaendig(), None);
    }

    #[test]
    fn sfu_braucht_nur_die_zugangsdaten() {
        let k = kanal();
        let (mut beitritt, _rx) = AusstehenderBeitritt::neu(k);
        beitritt.zugangsdaten = Some(zugang(&k, "wss://sfu.example"));
        assert_eq!(beitritt.vollstaendig(), Some(TransportArt::SfuRaum));
    }

    #[test]
    fn datagramm_braucht_beide_signale_reihenfolge_egal() {
        let k = kanal();

        // Zugangsdaten zuerst
        let (mut a, _rx_a) = AusstehenderBeitritt::neu(k);
        a.zugangsdaten = Some(zugang(&k, "203.0.113.9:4010"));
        assert_eq!(a.vollstaendig(), None, "Zustand fehlt noch");
        a.mitglieds_zustand = Some(zustand(&k));
        assert_eq!(a.vollstaendig(), Some(TransportArt::RohDatagramm));

        // Zustand zuerst
        let (mut b, _rx_b) = AusstehenderBeitritt::neu(k);
        b.mitglieds_zustand = Some(zustand(&k));
        assert_eq!(b.vollstaendig(), None, "Zugangsdaten fehlen noch");
        b.zugangsdaten = Some(zugang(&k, "203.0.113.9:4010"));
        assert_eq!(b.vollstaendig(), Some(TransportArt::RohDatagramm));
    }

    #[test]
    fn leerer_endpunkt_macht_nie_vollstaendig() {
        let k = kanal();
        let (mut beitritt, _rx) = AusstehenderBeitritt::neu(k);
        beitritt.mitglieds_zustand = Some(zustand(&k));
        beitritt.zugangsdaten = Some(ServerZugangsdaten {
            gruppe: k.gruppe,
            endpunkt: Some(String::new()),
            token: "token".to_string(),
        });
        assert_eq!(beitritt.vollstaendig(), None);
    }

    #[tokio::test]
    async fn abschluss_feuert_hoechstens_einmal() {
        let k = kanal();
        let (mut beitritt, mut rx) = AusstehenderBeitritt::neu(k);
        beitritt.zugangsdaten = Some(zugang(&k, "wss://sfu.example"));

        assert!(beitritt.abschliessen());
        let daten = rx.try_recv().expect("Abschluss muss angekommen sein");
        assert_eq!(daten.art, TransportArt::SfuRaum);

        // Weitere Signale fuer denselben Versuch: kein zweiter Abschluss
        beitritt.mitglieds_zustand = Some(zustand(&k));
        assert!(!beitritt.abschliessen());
    }

    #[test]
    fn unvollstaendig_feuert_nicht() {
        let k = kanal();
        let (mut beitritt, mut rx) = AusstehenderBeitritt::neu(k);
        beitritt.mitglieds_zustand = Some(zustand(&k));
        assert!(!beitritt.abschliessen());
        assert!(rx.try_recv().is_err());
    }
}
