//! Session-Orchestrator
//!
//! Besitzt die Verbindungs-Registry (Kanal-Id -> Transport) und die
//! Voice-State-Tabelle exklusiv; beide werden nur von den Handlern
//! dieses Moduls mutiert. Transporte melden Signale nach oben, nie
//! umgekehrt in die Registry hinein.
//!
//! ## Beitrittsablauf
//!
//! `beitreten` schickt die Beitrittsanfrage ueber den Steuerkanal und
//! wartet darauf, dass die beiden Antwortsignale den
//! [`AusstehenderBeitritt`] vervollstaendigen – je nach Endpunkt-Form
//! genuegen die Zugangsdaten (SFU-Raum) oder es braucht zusaetzlich den
//! eigenen Mitglieds-Zustand (Roh-Datagramm). Nach 20 Sekunden ohne
//! vollstaendigen Signalsatz schlaegt der Beitritt mit
//! `BeitrittZeitueberschreitung` fehl.
//!
//! ## Migration
//!
//! Frische Zugangsdaten fuer eine Gruppe mit aktiver Verbindung:
//! identisches (Endpunkt, Token)-Paar wird als Duplikat ignoriert; ein
//! leerer Endpunkt heisst Voice entzogen und zerstoert die Verbindung;
//! andernfalls wird der alte Transport *vollstaendig* abgebaut, bevor
//! der neue gegen die frischen Zugangsdaten aufgebaut wird – Pakete
//! beider Sitzungen duerfen sich nie verschraenken.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use palaver_core::event::OrchestratorEreignis;
use palaver_core::types::{ChannelId, GruppenId, UserId};
use palaver_core::{PalaverError, Result};
use palaver_protocol::control::{
    GatewayBefehl, SteuerNachricht, VoiceGatewayNachricht, ZustandsFlags,
};
use palaver_transport::{
    AbspielQuelle, DatagrammKonfig, DatagrammTransport, MedienTransport, SfuKonfig,
    SfuRaumTransport, Steuerkanal, Transport, TransportArt, TransportEreignis, VideoOptionen,
};

use crate::beitritt::{AusstehenderBeitritt, BeitrittsDaten};
use crate::kontrakt::{GatewaySignal, KanalRef, MitgliedsZustand, ServerZugangsdaten};
use crate::zustaende::VoiceStateTabelle;

/// Kapazitaet des Ereignis-Broadcasts
const EREIGNIS_KAPAZITAET: usize = 256;

/// Kapazitaet des Audio-Abos je Verbindung (Echtzeit: Nachzuegler verlieren)
const AUDIO_ABO_KAPAZITAET: usize = 64;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration des Orchestrators
#[derive(Debug, Clone)]
pub struct OrchestratorKonfig {
    /// Eigene Benutzer-Id (zum Erkennen des eigenen Zustandssignals)
    pub user_id: UserId,
    /// Zeitlimit fuer den vollstaendigen Signalsatz eines Beitritts
    pub beitritts_timeout: Duration,
}

impl OrchestratorKonfig {
    /// Erstellt eine Konfiguration mit dem 20-Sekunden-Standardlimit
    pub fn neu(user_id: UserId) -> Self {
        Self {
            user_id,
            beitritts_timeout: Duration::from_secs(20),
        }
    }
}

// ---------------------------------------------------------------------------
// Verbindung + Handle
// ---------------------------------------------------------------------------

/// Registry-Eintrag: genau ein Transport je Kanal
struct Verbindung {
    kanal: KanalRef,
    art: TransportArt,
    transport: Arc<Transport>,
    /// Letzter bekannter Endpunkt (Migrationsvergleich)
    endpunkt: String,
    /// Letztes bekanntes Token (Migrationsvergleich)
    token: String,
    /// Opakes Verbindungs-Token, vergeben sobald Daten fliessen
    verbindungs_id: Arc<Mutex<Option<String>>>,
    /// Dekodiertes Empfangs-Audio fuer Abonnenten
    audio_abo: broadcast::Sender<(u32, Vec<f32>)>,
    /// Relay-Task der Transport-Signale
    _ereignis_task: JoinHandle<()>,
}

impl Verbindung {
    fn handle(&self) -> VerbindungsHandle {
        VerbindungsHandle {
            kanal: self.kanal,
            art: self.art,
            transport: Arc::clone(&self.transport),
            audio_abo: self.audio_abo.clone(),
        }
    }
}

/// Oeffentliches Handle auf eine Verbindung
///
/// Delegiert die Wiedergabe-Operationen an den Transport; die Registry
/// bleibt dem Orchestrator vorbehalten.
#[derive(Clone)]
pub struct VerbindungsHandle {
    /// Kanal dieser Verbindung
    pub kanal: KanalRef,
    /// Gewaehlte Transportvariante
    pub art: TransportArt,
    transport: Arc<Transport>,
    audio_abo: broadcast::Sender<(u32, Vec<f32>)>,
}

impl VerbindungsHandle {
    /// Spielt eine Containerquelle (URL oder Puffer) ab
    pub async fn abspielen(&self, quelle: AbspielQuelle) -> Result<()> {
        self.transport.abspielen(quelle).await
    }

    /// Spielt einen rohen Opus-Paketstrom ab
    pub async fn opus_abspielen(&self, pakete: Vec<Vec<u8>>) -> Result<()> {
        self.transport
            .abspielen(AbspielQuelle::OpusPakete(pakete))
            .await
    }

    /// Spielt eine Videoquelle ab (nur SFU-Raum)
    pub async fn video_abspielen(
        &self,
        quelle: AbspielQuelle,
        optionen: VideoOptionen,
    ) -> Result<()> {
        self.transport.video_abspielen(quelle, optionen).await
    }

    /// Stoppt die Audio-Wiedergabe
    pub async fn stoppen(&self) {
        self.transport.stoppen().await
    }

    /// Stoppt die Video-Wiedergabe
    pub async fn video_stoppen(&self) {
        self.transport.video_stoppen().await
    }

    /// Setzt die Wiedergabe-Lautstaerke (0.0..2.0)
    pub fn lautstaerke_setzen(&self, lautstaerke: f32) {
        self.transport.lautstaerke_setzen(lautstaerke)
    }

    /// Gibt die Ziel-Lautstaerke zurueck
    pub fn lautstaerke_holen(&self) -> f32 {
        self.transport.lautstaerke_holen()
    }

    /// Abonniert das dekodierte Empfangs-Audio (SSRC, interleaved f32)
    pub fn audio_abonnieren(&self) -> broadcast::Receiver<(u32, Vec<f32>)> {
        self.audio_abo.subscribe()
    }

    /// Trennt die Verbindung (idempotent); die Registry raeumt der
    /// Orchestrator ueber das Getrennt-Signal auf
    pub async fn trennen(&self) {
        self.transport.zerstoeren().await
    }
}

/// Ziel fuer `verbindung_holen`: Kanal- oder Gruppen-Id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbindungsZiel {
    Kanal(ChannelId),
    Gruppe(GruppenId),
}

impl From<ChannelId> for VerbindungsZiel {
    fn from(id: ChannelId) -> Self {
        Self::Kanal(id)
    }
}

impl From<GruppenId> for VerbindungsZiel {
    fn from(id: GruppenId) -> Self {
        Self::Gruppe(id)
    }
}

impl From<KanalRef> for VerbindungsZiel {
    fn from(kanal: KanalRef) -> Self {
        Self::Kanal(kanal.id)
    }
}

// ---------------------------------------------------------------------------
// VoiceOrchestrator
// ---------------------------------------------------------------------------

/// Der Session-Orchestrator des Voice-Subsystems
#[derive(Clone)]
pub struct VoiceOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    konfig: OrchestratorKonfig,
    steuerkanal: Arc<dyn Steuerkanal>,
    /// Session-Id der Gateway-Sitzung (aus Abgleich bzw. eigenem Zustand)
    session_id: RwLock<Option<String>>,
    zustaende: VoiceStateTabelle,
    /// Registry: genau eine Verbindung je Kanal
    verbindungen: DashMap<ChannelId, Verbindung>,
    /// Laufende Beitrittsversuche je Kanal
    ausstehend: DashMap<ChannelId, AusstehenderBeitritt>,
    /// Zustellung eingehender Voice-Nachrichten je Gruppe
    voice_eingaenge: DashMap<GruppenId, mpsc::Sender<VoiceGatewayNachricht>>,
    ereignisse: broadcast::Sender<OrchestratorEreignis>,
}

impl VoiceOrchestrator {
    /// Erstellt den Orchestrator
    pub fn neu(konfig: OrchestratorKonfig, steuerkanal: Arc<dyn Steuerkanal>) -> Self {
        let (ereignisse, _) = broadcast::channel(EREIGNIS_KAPAZITAET);
        Self {
            inner: Arc::new(Inner {
                konfig,
                steuerkanal,
                session_id: RwLock::new(None),
                zustaende: VoiceStateTabelle::neu(),
                verbindungen: DashMap::new(),
                ausstehend: DashMap::new(),
                voice_eingaenge: DashMap::new(),
                ereignisse,
            }),
        }
    }

    /// Abonniert die Lebenszyklus-Ereignisse
    pub fn ereignisse_abonnieren(&self) -> broadcast::Receiver<OrchestratorEreignis> {
        self.inner.ereignisse.subscribe()
    }

    /// Lesezugriff auf die Voice-State-Tabelle
    pub fn zustaende(&self) -> &VoiceStateTabelle {
        &self.inner.zustaende
    }

    /// Anzahl registrierter Verbindungen
    pub fn verbindungs_anzahl(&self) -> usize {
        self.inner.verbindungen.len()
    }

    /// Anzahl laufender Beitrittsversuche
    pub fn ausstehende_beitritte(&self) -> usize {
        self.inner.ausstehend.len()
    }

    // -----------------------------------------------------------------------
    // Oeffentliche Operationen
    // -----------------------------------------------------------------------

    /// Tritt einem Sprachkanal bei
    ///
    /// Idempotent je Kanal: eine bestehende Verbindung wird
    /// zurueckgegeben statt neu aufgebaut. Sonst geht die
    /// Beitrittsanfrage ueber den Steuerkanal raus und der Aufruf wartet
    /// auf den vollstaendigen Signalsatz (hoechstens 20 Sekunden).
    pub async fn beitreten(&self, kanal: KanalRef) -> Result<VerbindungsHandle> {
        if let Some(bestehend) = self.inner.verbindungen.get(&kanal.id) {
            debug!(kanal = %kanal.id, "Beitritt: bestehende Verbindung wiederverwendet");
            return Ok(bestehend.handle());
        }
        if self.inner.ausstehend.contains_key(&kanal.id) {
            return Err(PalaverError::Verbindung(format!(
                "Beitritt zu {} laeuft bereits",
                kanal.id
            )));
        }

        let (ausstehend, fertig_rx) = AusstehenderBeitritt::neu(kanal);
        self.inner.ausstehend.insert(kanal.id, ausstehend);

        if let Err(e) = self.inner.steuerkanal.senden(
            kanal.shard_index,
            SteuerNachricht::Gateway(GatewayBefehl::BeitrittAnfordern {
                gruppe: kanal.gruppe,
                kanal_id: kanal.id,
            }),
        ) {
            self.inner.ausstehend.remove(&kanal.id);
            return Err(e);
        }
        info!(kanal = %kanal.id, gruppe = %kanal.gruppe, "Beitritt angefordert");

        let daten = match tokio::time::timeout(self.inner.konfig.beitritts_timeout, fertig_rx)
            .await
        {
            Ok(Ok(daten)) => daten,
            Ok(Err(_)) => {
                // Sender verworfen: der Versuch wurde abgebrochen
                // (z.B. Zugangsdaten mit leerem Endpunkt)
                self.inner.ausstehend.remove(&kanal.id);
                return Err(PalaverError::Aushandlung(
                    "Beitritt abgebrochen: Server hat Voice entzogen".into(),
                ));
            }
            Err(_) => {
                self.inner.ausstehend.remove(&kanal.id);
                warn!(kanal = %kanal.id, "Beitritt nicht rechtzeitig vollstaendig");
                return Err(PalaverError::BeitrittZeitueberschreitung(
                    self.inner.konfig.beitritts_timeout.as_secs(),
                ));
            }
        };

        let handle = self.verbindung_aufbauen(daten).await?;
        let _ = self
            .inner
            .ereignisse
            .send(OrchestratorEreignis::BeitrittAbgeschlossen {
                kanal_id: kanal.id,
                gruppe: kanal.gruppe,
            });
        Ok(handle)
    }

    /// Verlaesst alle Sprachkanaele einer Gruppe
    pub async fn gruppe_verlassen(&self, gruppe: GruppenId) {
        let betroffen: Vec<ChannelId> = self
            .inner
            .verbindungen
            .iter()
            .filter(|eintrag| eintrag.kanal.gruppe == gruppe)
            .map(|eintrag| *eintrag.key())
            .collect();

        let mut shard_index = 0;
        for kanal_id in betroffen {
            if let Some((_, verbindung)) = self.inner.verbindungen.remove(&kanal_id) {
                shard_index = verbindung.kanal.shard_index;
                verbindung.transport.zerstoeren().await;
            }
        }
        self.inner.voice_eingaenge.remove(&gruppe);

        // Abschied der Gruppe ans Gateway melden
        let _ = self.inner.steuerkanal.senden(
            shard_index,
            SteuerNachricht::Gateway(GatewayBefehl::Verlassen {
                gruppe,
                kanal_id: None,
            }),
        );
        info!(gruppe = %gruppe, "Gruppe verlassen");
    }

    /// Verlaesst genau einen Sprachkanal
    pub async fn kanal_verlassen(&self, kanal_id: ChannelId) {
        let Some((_, verbindung)) = self.inner.verbindungen.remove(&kanal_id) else {
            debug!(kanal = %kanal_id, "Kanal verlassen: keine Verbindung");
            return;
        };
        let kanal = verbindung.kanal;
        verbindung.transport.zerstoeren().await;
        self.inner.voice_eingaenge.remove(&kanal.gruppe);

        let _ = self.inner.steuerkanal.senden(
            kanal.shard_index,
            SteuerNachricht::Gateway(GatewayBefehl::Verlassen {
                gruppe: kanal.gruppe,
                kanal_id: Some(kanal_id),
            }),
        );
        info!(kanal = %kanal_id, "Kanal verlassen");
    }

    /// Sucht eine Verbindung: direkt per Kanal-Id, sonst die erste der
    /// Gruppe
    pub fn verbindung_holen(&self, ziel: impl Into<VerbindungsZiel>) -> Option<VerbindungsHandle> {
        match ziel.into() {
            VerbindungsZiel::Kanal(kanal_id) => self
                .inner
                .verbindungen
                .get(&kanal_id)
                .map(|verbindung| verbindung.handle()),
            VerbindungsZiel::Gruppe(gruppe) => self
                .inner
                .verbindungen
                .iter()
                .find(|eintrag| eintrag.kanal.gruppe == gruppe)
                .map(|eintrag| eintrag.handle()),
        }
    }

    /// Mutiert den Voice-State einer bestehenden Verbindung
    ///
    /// Ohne gespeicherte Verbindungs-Id passiert bewusst nichts ausser
    /// einem Log: der Server wuerde das Update sonst als frischen
    /// Beitritt lesen und eine Verbindungsschleife anstossen.
    pub fn voice_state_aktualisieren(&self, kanal_id: ChannelId, flags: ZustandsFlags) -> Result<()> {
        let Some(verbindung) = self.inner.verbindungen.get(&kanal_id) else {
            warn!(kanal = %kanal_id, "Voice-State-Update ohne Verbindung, ignoriert");
            return Ok(());
        };
        let Some(verbindungs_id) = verbindung.verbindungs_id.lock().clone() else {
            warn!(
                kanal = %kanal_id,
                "Voice-State-Update ohne Verbindungs-Id, ignoriert (Schutz vor Verbindungsschleife)"
            );
            return Ok(());
        };
        self.inner.steuerkanal.senden(
            verbindung.kanal.shard_index,
            SteuerNachricht::Gateway(GatewayBefehl::ZustandAktualisieren {
                kanal_id,
                verbindungs_id,
                flags,
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Signal-Handler
    // -----------------------------------------------------------------------

    /// Verarbeitet ein Gateway-Signal
    ///
    /// Einziger Mutationspfad fuer Voice-State-Tabelle, Ausstehend-
    /// Tabelle und (via Migration) die Registry.
    pub async fn signal_verarbeiten(&self, signal: GatewaySignal) {
        match signal {
            GatewaySignal::InitialerAbgleich {
                user_id,
                session_id,
                zustaende,
            } => {
                debug!(user_id = %user_id, zustaende = zustaende.len(), "Initialer Abgleich");
                *self.inner.session_id.write() = Some(session_id);
                for zustand in zustaende {
                    self.inner.zustaende.zustand_setzen(
                        zustand.gruppe,
                        zustand.user_id,
                        zustand.kanal_id,
                    );
                }
            }

            GatewaySignal::MitgliedsZustand(zustand) => {
                self.inner.zustaende.zustand_setzen(
                    zustand.gruppe,
                    zustand.user_id,
                    zustand.kanal_id,
                );
                if zustand.user_id == self.inner.konfig.user_id {
                    *self.inner.session_id.write() = Some(zustand.session_id.clone());
                    self.eigenen_zustand_verarbeiten(zustand);
                }
            }

            GatewaySignal::ServerZugangsdaten(zugangsdaten) => {
                self.zugangsdaten_verarbeiten(zugangsdaten).await;
            }

            GatewaySignal::VoiceNachricht { gruppe, nachricht } => {
                let eingang = self
                    .inner
                    .voice_eingaenge
                    .get(&gruppe)
                    .map(|eintrag| eintrag.clone());
                match eingang {
                    Some(eingang) => {
                        if eingang.send(nachricht).await.is_err() {
                            debug!(gruppe = %gruppe, "Voice-Eingang geschlossen");
                        }
                    }
                    None => debug!(gruppe = %gruppe, "Voice-Nachricht ohne Empfaenger"),
                }
            }
        }
    }

    /// Eigener Mitglieds-Zustand: fuettert den ausstehenden Beitritt
    fn eigenen_zustand_verarbeiten(&self, zustand: MitgliedsZustand) {
        let Some(kanal_id) = zustand.kanal_id else {
            return;
        };
        let fertig = match self.inner.ausstehend.get_mut(&kanal_id) {
            Some(mut eintrag) => {
                eintrag.mitglieds_zustand = Some(zustand);
                eintrag.abschliessen()
            }
            None => false,
        };
        if fertig {
            self.inner.ausstehend.remove(&kanal_id);
        }
    }

    /// Server-Zugangsdaten: Beitritt vervollstaendigen oder migrieren
    async fn zugangsdaten_verarbeiten(&self, zugangsdaten: ServerZugangsdaten) {
        let gruppe = zugangsdaten.gruppe;

        // 1. Laufender Beitrittsversuch dieser Gruppe?
        let ausstehender_kanal = self
            .inner
            .ausstehend
            .iter()
            .find(|eintrag| eintrag.kanal.gruppe == gruppe)
            .map(|eintrag| *eintrag.key());
        if let Some(kanal_id) = ausstehender_kanal {
            if !zugangsdaten.hat_endpunkt() {
                // Der Versuch ist tot; das Verwerfen des Senders laesst
                // beitreten() mit einem Aushandlungsfehler zurueckkehren
                warn!(gruppe = %gruppe, "Zugangsdaten ohne Endpunkt waehrend des Beitritts");
                self.inner.ausstehend.remove(&kanal_id);
                return;
            }
            let fertig = match self.inner.ausstehend.get_mut(&kanal_id) {
                Some(mut eintrag) => {
                    eintrag.zugangsdaten = Some(zugangsdaten);
                    eintrag.abschliessen()
                }
                None => false,
            };
            if fertig {
                self.inner.ausstehend.remove(&kanal_id);
            }
            return;
        }

        // 2. Bestehende Verbindung dieser Gruppe: Migration pruefen
        let Some(kanal_id) = self
            .inner
            .verbindungen
            .iter()
            .find(|eintrag| eintrag.kanal.gruppe == gruppe)
            .map(|eintrag| *eintrag.key())
        else {
            debug!(gruppe = %gruppe, "Zugangsdaten ohne Verbindung und ohne Beitritt");
            return;
        };

        let (alter_endpunkt, altes_token, kanal) = {
            let verbindung = self
                .inner
                .verbindungen
                .get(&kanal_id)
                .expect("Eintrag eben noch vorhanden");
            (
                verbindung.endpunkt.clone(),
                verbindung.token.clone(),
                verbindung.kanal,
            )
        };

        // Leerer Endpunkt: der Server hat Voice entzogen
        if !zugangsdaten.hat_endpunkt() {
            info!(gruppe = %gruppe, "Server hat Voice entzogen, Verbindung wird zerstoert");
            if let Some((_, verbindung)) = self.inner.verbindungen.remove(&kanal_id) {
                let _ = self
                    .inner
                    .ereignisse
                    .send(OrchestratorEreignis::ServerGetrennt {
                        kanal_id,
                        gruppe,
                    });
                verbindung.transport.zerstoeren().await;
            }
            self.inner.voice_eingaenge.remove(&gruppe);
            return;
        }

        let neuer_endpunkt = zugangsdaten.endpunkt.clone().unwrap_or_default();

        // Identisches Paar: doppeltes Signal, keine Reconnection
        if neuer_endpunkt == alter_endpunkt && zugangsdaten.token == altes_token {
            debug!(gruppe = %gruppe, "Doppeltes Zugangsdatensignal ignoriert");
            return;
        }

        // Migration: alten Transport vollstaendig abbauen, dann neu
        info!(
            gruppe = %gruppe,
            von = %alter_endpunkt,
            nach = %neuer_endpunkt,
            "Voice-Server-Migration"
        );
        if let Some((_, verbindung)) = self.inner.verbindungen.remove(&kanal_id) {
            verbindung.transport.zerstoeren().await;
        }

        let session_id = self.inner.session_id.read().clone();
        let Some(session_id) = session_id else {
            warn!(gruppe = %gruppe, "Migration ohne Session-Id nicht moeglich");
            let _ = self
                .inner
                .ereignisse
                .send(OrchestratorEreignis::TransportFehler {
                    kanal_id,
                    beschreibung: "Migration ohne Session-Id".into(),
                });
            return;
        };

        let daten = BeitrittsDaten {
            kanal,
            art: TransportArt::aus_zugangsdaten(&neuer_endpunkt),
            zugangsdaten,
            mitglieds_zustand: Some(MitgliedsZustand {
                user_id: self.inner.konfig.user_id,
                gruppe,
                kanal_id: Some(kanal.id),
                session_id,
            }),
        };
        // Der alte Transport ist vollstaendig abgebaut; der Neuaufbau
        // laeuft als eigene Task, damit die Signalzustellung frei bleibt
        // (der neue Handshake braucht sie fuer seine Antworten)
        let orchestrator = self.clone();
        tokio::spawn(async move {
            match orchestrator.verbindung_aufbauen(daten).await {
                Ok(_) => {
                    let _ = orchestrator
                        .inner
                        .ereignisse
                        .send(OrchestratorEreignis::VerbindungMigriert {
                            kanal_id: kanal.id,
                            gruppe,
                        });
                }
                Err(e) => {
                    warn!(gruppe = %gruppe, fehler = %e, "Migration fehlgeschlagen");
                    let _ = orchestrator
                        .inner
                        .ereignisse
                        .send(OrchestratorEreignis::TransportFehler {
                            kanal_id: kanal.id,
                            beschreibung: format!("Migration fehlgeschlagen: {}", e),
                        });
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Verbindungsaufbau
    // -----------------------------------------------------------------------

    /// Baut aus vollstaendigen Beitrittsdaten den Transport auf und
    /// registriert die Verbindung
    async fn verbindung_aufbauen(&self, daten: BeitrittsDaten) -> Result<VerbindungsHandle> {
        let kanal = daten.kanal;
        let endpunkt = daten.zugangsdaten.endpunkt.clone().unwrap_or_default();
        let token = daten.zugangsdaten.token.clone();

        let (ereignis_tx, ereignis_rx) = mpsc::channel(256);

        let transport = match daten.art {
            TransportArt::RohDatagramm => {
                let zustand = daten.mitglieds_zustand.ok_or_else(|| {
                    PalaverError::Intern("Datagramm-Beitritt ohne Mitglieds-Zustand".into())
                })?;
                let mut konfig = DatagrammKonfig::neu(
                    kanal.gruppe,
                    self.inner.konfig.user_id,
                    zustand.session_id,
                    token.clone(),
                );
                konfig.shard_index = kanal.shard_index;
                let transport = DatagrammTransport::neu(
                    konfig,
                    Arc::clone(&self.inner.steuerkanal),
                    ereignis_tx,
                );
                // Zustellung der Handshake-Antworten muss stehen, bevor
                // verbinden() auf sie wartet
                self.inner
                    .voice_eingaenge
                    .insert(kanal.gruppe, transport.eingang());
                Transport::Datagramm(transport)
            }
            TransportArt::SfuRaum => Transport::SfuRaum(SfuRaumTransport::neu(
                SfuKonfig::neu(endpunkt.clone(), token.clone()),
                ereignis_tx,
            )),
        };
        let transport = Arc::new(transport);

        transport.verbinden().await?;

        let verbindungs_id = Arc::new(Mutex::new(None));
        let audio_abo = broadcast::channel(AUDIO_ABO_KAPAZITAET).0;
        let relay = tokio::spawn(ereignis_relay(
            kanal,
            ereignis_rx,
            Arc::downgrade(&self.inner),
            Arc::downgrade(&transport),
            Arc::clone(&verbindungs_id),
            audio_abo.clone(),
            self.inner.ereignisse.clone(),
        ));

        let verbindung = Verbindung {
            kanal,
            art: daten.art,
            transport: Arc::clone(&transport),
            endpunkt,
            token,
            verbindungs_id,
            audio_abo,
            _ereignis_task: relay,
        };
        let handle = verbindung.handle();
        self.inner.verbindungen.insert(kanal.id, verbindung);
        info!(kanal = %kanal.id, art = %daten.art, "Verbindung registriert");
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Transport-Signal-Relay
// ---------------------------------------------------------------------------

/// Uebersetzt Transport-Signale in Orchestrator-Ereignisse und haelt den
/// Registry-Eintrag aktuell
async fn ereignis_relay(
    kanal: KanalRef,
    mut ereignis_rx: mpsc::Receiver<TransportEreignis>,
    inner: Weak<Inner>,
    transport: Weak<Transport>,
    verbindungs_id: Arc<Mutex<Option<String>>>,
    audio_abo: broadcast::Sender<(u32, Vec<f32>)>,
    ereignisse: broadcast::Sender<OrchestratorEreignis>,
) {
    while let Some(ereignis) = ereignis_rx.recv().await {
        match ereignis {
            TransportEreignis::Bereit => {
                debug!(kanal = %kanal.id, "Transport bereit");
            }
            TransportEreignis::VerbindungsId(id) => {
                debug!(kanal = %kanal.id, verbindungs_id = %id, "Verbindungs-Id vergeben");
                *verbindungs_id.lock() = Some(id);
            }
            TransportEreignis::ServerGetrennt => {
                let _ = ereignisse.send(OrchestratorEreignis::ServerGetrennt {
                    kanal_id: kanal.id,
                    gruppe: kanal.gruppe,
                });
            }
            TransportEreignis::Getrennt => {
                // Nur den eigenen Registry-Eintrag raeumen: nach einer
                // Migration steht unter derselben Kanal-Id laengst der
                // Nachfolger
                if let (Some(inner), Some(transport)) = (inner.upgrade(), transport.upgrade()) {
                    let selber_eintrag = inner
                        .verbindungen
                        .get(&kanal.id)
                        .map(|eintrag| Arc::ptr_eq(&eintrag.transport, &transport))
                        .unwrap_or(false);
                    if selber_eintrag {
                        inner.verbindungen.remove(&kanal.id);
                    }
                }
                let _ = ereignisse.send(OrchestratorEreignis::VerbindungGeschlossen {
                    kanal_id: kanal.id,
                });
                break;
            }
            TransportEreignis::Fehler(beschreibung) => {
                let _ = ereignisse.send(OrchestratorEreignis::TransportFehler {
                    kanal_id: kanal.id,
                    beschreibung,
                });
            }
            TransportEreignis::AudioEmpfangen { ssrc, pcm } => {
                // Nur zustellen, niemand-hoert-zu ist kein Fehler
                let _ = audio_abo.send((ssrc, pcm));
            }
            TransportEreignis::TrackAbonniert { teilnehmer } => {
                let _ = ereignisse.send(OrchestratorEreignis::TrackAbonniert {
                    kanal_id: kanal.id,
                    teilnehmer,
                });
            }
        }
    }
    debug!(kanal = %kanal.id, "Ereignis-Relay beendet");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_protocol::control::{Ready, SessionDescription};
    use palaver_protocol::discovery;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc::error::TryRecvError;

    /// Steuerkanal-Double: reicht gesendete Nachrichten an den Test durch
    struct MockSteuerkanal {
        tx: mpsc::UnboundedSender<(u32, SteuerNachricht)>,
    }

    impl Steuerkanal for MockSteuerkanal {
        fn senden(&self, shard_index: u32, nachricht: SteuerNachricht) -> Result<()> {
            self.tx
                .send((shard_index, nachricht))
                .map_err(|_| PalaverError::Getrennt("Test-Steuerkanal geschlossen".into()))
        }
    }

    struct TestUmgebung {
        orchestrator: VoiceOrchestrator,
        gesendet: mpsc::UnboundedReceiver<(u32, SteuerNachricht)>,
        kanal: KanalRef,
        user_id: UserId,
    }

    fn umgebung() -> TestUmgebung {
        let user_id = UserId::new();
        let (tx, gesendet) = mpsc::unbounded_channel();
        let orchestrator = VoiceOrchestrator::neu(
            OrchestratorKonfig::neu(user_id),
            Arc::new(MockSteuerkanal { tx }),
        );
        TestUmgebung {
            orchestrator,
            gesendet,
            kanal: KanalRef::neu(ChannelId::new(), GruppenId::new()),
            user_id,
        }
    }

    fn zugangsdaten(gruppe: GruppenId, endpunkt: &str) -> ServerZugangsdaten {
        ServerZugangsdaten {
            gruppe,
            endpunkt: Some(endpunkt.to_string()),
            token: "token-1".to_string(),
        }
    }

    fn eigener_zustand(umgebung: &TestUmgebung) -> MitgliedsZustand {
        MitgliedsZustand {
            user_id: umgebung.user_id,
            gruppe: umgebung.kanal.gruppe,
            kanal_id: Some(umgebung.kanal.id),
            session_id: "sitzung-1".to_string(),
        }
    }

    /// Wartet auf die naechste Voice-Nachricht mit dem gegebenen Opcode
    async fn voice_nachricht_erwarten(
        gesendet: &mut mpsc::UnboundedReceiver<(u32, SteuerNachricht)>,
        opcode: u8,
    ) -> VoiceGatewayNachricht {
        loop {
            let (_, nachricht) = tokio::time::timeout(Duration::from_secs(5), gesendet.recv())
                .await
                .expect("Steuerkanal-Nachricht erwartet")
                .expect("Steuerkanal offen");
            if let SteuerNachricht::Voice(voice) = nachricht {
                if voice.opcode() == opcode {
                    return voice;
                }
            }
        }
    }

    /// Spielt die Serverseite des Roh-Datagramm-Handshakes durch
    async fn voice_server_bedienen(
        orchestrator: &VoiceOrchestrator,
        gruppe: GruppenId,
        server: &UdpSocket,
        gesendet: &mut mpsc::UnboundedReceiver<(u32, SteuerNachricht)>,
        verbindungs_id: Option<&str>,
    ) {
        let server_addr = server.local_addr().unwrap();

        voice_nachricht_erwarten(gesendet, palaver_protocol::control::OP_IDENTIFY).await;
        orchestrator
            .signal_verarbeiten(GatewaySignal::VoiceNachricht {
                gruppe,
                nachricht: VoiceGatewayNachricht::Ready(Ready {
                    ssrc: 0x77,
                    ip: "127.0.0.1".to_string(),
                    port: server_addr.port(),
                    modi: vec!["aead_aes256_gcm".to_string()],
                    heartbeat_intervall_ms: 60_000,
                }),
            })
            .await;

        // IP-Ermittlung spiegeln
        let mut buf = [0u8; 256];
        let (len, klient) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, discovery::ENTDECKUNG_LAENGE);
        let adresse = klient.ip().to_string();
        buf[10..10 + adresse.len()].copy_from_slice(adresse.as_bytes());
        buf[68..70].copy_from_slice(&klient.port().to_be_bytes());
        server.send_to(&buf[..len], klient).await.unwrap();

        voice_nachricht_erwarten(gesendet, palaver_protocol::control::OP_SELECT_PROTOCOL).await;
        orchestrator
            .signal_verarbeiten(GatewaySignal::VoiceNachricht {
                gruppe,
                nachricht: VoiceGatewayNachricht::SessionDescription(SessionDescription {
                    modus: "aead_aes256_gcm".to_string(),
                    geheimschluessel: vec![9u8; 32],
                    verbindungs_id: verbindungs_id.map(str::to_string),
                }),
            })
            .await;
    }

    /// Fuehrt einen vollstaendigen Roh-Datagramm-Beitritt aus
    async fn roh_beitritt(
        umgebung: &mut TestUmgebung,
        server: &UdpSocket,
        zustand_zuerst: bool,
    ) -> VerbindungsHandle {
        let endpunkt = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
        let orchestrator = umgebung.orchestrator.clone();
        let kanal = umgebung.kanal;
        let beitritt = tokio::spawn(async move { orchestrator.beitreten(kanal).await });

        // Beitrittsanfrage muss rausgehen
        let (_, anfrage) = umgebung.gesendet.recv().await.unwrap();
        assert!(matches!(
            anfrage,
            SteuerNachricht::Gateway(GatewayBefehl::BeitrittAnfordern { .. })
        ));

        let zustand = GatewaySignal::MitgliedsZustand(eigener_zustand(umgebung));
        let zugang = GatewaySignal::ServerZugangsdaten(zugangsdaten(
            umgebung.kanal.gruppe,
            &endpunkt,
        ));

        if zustand_zuerst {
            umgebung.orchestrator.signal_verarbeiten(zustand).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(
                !beitritt.is_finished(),
                "Beitritt darf vor dem zweiten Signal nicht abschliessen"
            );
            umgebung.orchestrator.signal_verarbeiten(zugang).await;
        } else {
            umgebung.orchestrator.signal_verarbeiten(zugang).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(
                !beitritt.is_finished(),
                "Beitritt darf vor dem zweiten Signal nicht abschliessen"
            );
            umgebung.orchestrator.signal_verarbeiten(zustand).await;
        }

        voice_server_bedienen(
            &umgebung.orchestrator,
            umgebung.kanal.gruppe,
            server,
            &mut umgebung.gesendet,
            Some("conn-1"),
        )
        .await;

        beitritt
            .await
            .unwrap()
            .expect("Beitritt muss abschliessen")
    }

    fn keine_weiteren_nachrichten(umgebung: &mut TestUmgebung) {
        match umgebung.gesendet.try_recv() {
            Err(TryRecvError::Empty) => {}
            andere => panic!("Unerwartete Steuerkanal-Nachricht: {:?}", andere.map(|(_, n)| n)),
        }
    }

    // -----------------------------------------------------------------------
    // Beitritt
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn zugangsdaten_zuerst_waehlt_roh_datagramm() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Nicht-SFU-Endpunkt vor dem Zustandssignal: Roh-Datagramm,
        // Abschluss erst nach dem Zustandssignal
        let handle = roh_beitritt(&mut umgebung, &server, false).await;
        assert_eq!(handle.art, TransportArt::RohDatagramm);
        assert_eq!(umgebung.orchestrator.verbindungs_anzahl(), 1);
        assert_eq!(umgebung.orchestrator.ausstehende_beitritte(), 0);

        umgebung.orchestrator.kanal_verlassen(umgebung.kanal.id).await;
    }

    #[tokio::test]
    async fn zustand_zuerst_gleicher_ausgang() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let handle = roh_beitritt(&mut umgebung, &server, true).await;
        assert_eq!(handle.art, TransportArt::RohDatagramm);
        assert_eq!(umgebung.orchestrator.verbindungs_anzahl(), 1);

        umgebung.orchestrator.kanal_verlassen(umgebung.kanal.id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn ohne_signale_beitritts_zeitueberschreitung() {
        let umgebung = umgebung();
        let orchestrator = umgebung.orchestrator.clone();
        let kanal = umgebung.kanal;

        let fehler = orchestrator.beitreten(kanal).await.expect_err("Muss scheitern");
        assert!(
            matches!(fehler, PalaverError::BeitrittZeitueberschreitung(20)),
            "Erwartet BeitrittZeitueberschreitung, war {:?}",
            fehler
        );
        assert_eq!(orchestrator.verbindungs_anzahl(), 0, "Nichts registriert");
        assert_eq!(orchestrator.ausstehende_beitritte(), 0, "Versuch aufgeraeumt");
    }

    #[tokio::test]
    async fn sfu_endpunkt_genuegt_ohne_zustandssignal() {
        let mut umgebung = umgebung();
        let orchestrator = umgebung.orchestrator.clone();
        let kanal = umgebung.kanal;
        let beitritt = tokio::spawn(async move { orchestrator.beitreten(kanal).await });

        let _ = umgebung.gesendet.recv().await.unwrap();

        // Nur die Zugangsdaten, nie ein Zustandssignal
        umgebung
            .orchestrator
            .signal_verarbeiten(GatewaySignal::ServerZugangsdaten(zugangsdaten(
                umgebung.kanal.gruppe,
                "wss://127.0.0.1:9",
            )))
            .await;

        // Der Signalsatz war vollstaendig: der Versuch kommt bis zum
        // Raumbeitritt und scheitert dort am toten Endpunkt – nicht an
        // einer Zeitueberschreitung des Signalsatzes
        let fehler = beitritt.await.unwrap().expect_err("Raum ist tot");
        assert!(
            !matches!(fehler, PalaverError::BeitrittZeitueberschreitung(_)),
            "SFU-Beitritt haette am Raum scheitern muessen, nicht am Signalsatz: {:?}",
            fehler
        );
    }

    #[tokio::test]
    async fn beitritt_ist_idempotent_pro_kanal() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _handle = roh_beitritt(&mut umgebung, &server, false).await;

        // Zweiter Beitritt: bestehende Verbindung, keine neue Anfrage
        let handle2 = umgebung
            .orchestrator
            .beitreten(umgebung.kanal)
            .await
            .expect("Bestehende Verbindung muss zurueckkommen");
        assert_eq!(handle2.kanal.id, umgebung.kanal.id);
        keine_weiteren_nachrichten(&mut umgebung);
        assert_eq!(umgebung.orchestrator.verbindungs_anzahl(), 1);
    }

    // -----------------------------------------------------------------------
    // Migration & Zugangsdaten
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn identische_zugangsdaten_keine_reconnection() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpunkt = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
        let _handle = roh_beitritt(&mut umgebung, &server, false).await;

        // Dasselbe (Endpunkt, Token)-Paar noch einmal
        umgebung
            .orchestrator
            .signal_verarbeiten(GatewaySignal::ServerZugangsdaten(zugangsdaten(
                umgebung.kanal.gruppe,
                &endpunkt,
            )))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Kein neues Identify, Verbindung unveraendert registriert
        keine_weiteren_nachrichten(&mut umgebung);
        assert_eq!(umgebung.orchestrator.verbindungs_anzahl(), 1);
    }

    #[tokio::test]
    async fn neue_zugangsdaten_migrieren_ohne_verschraenkung() {
        let mut umgebung = umgebung();
        let server_alt = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _handle = roh_beitritt(&mut umgebung, &server_alt, false).await;

        let mut ereignisse = umgebung.orchestrator.ereignisse_abonnieren();
        let server_neu = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpunkt_neu = format!("127.0.0.1:{}", server_neu.local_addr().unwrap().port());

        umgebung
            .orchestrator
            .signal_verarbeiten(GatewaySignal::ServerZugangsdaten(zugangsdaten(
                umgebung.kanal.gruppe,
                &endpunkt_neu,
            )))
            .await;

        // Der alte Transport muss vollstaendig weg sein, bevor der neue
        // sein Identify schickt
        voice_server_bedienen(
            &umgebung.orchestrator,
            umgebung.kanal.gruppe,
            &server_neu,
            &mut umgebung.gesendet,
            Some("conn-2"),
        )
        .await;

        // Migration gemeldet, genau eine Verbindung uebrig
        let mut migriert = false;
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_secs(2), ereignisse.recv()).await {
                Ok(Ok(OrchestratorEreignis::VerbindungMigriert { kanal_id, .. })) => {
                    assert_eq!(kanal_id, umgebung.kanal.id);
                    migriert = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(migriert, "VerbindungMigriert-Ereignis erwartet");
        assert_eq!(umgebung.orchestrator.verbindungs_anzahl(), 1);
    }

    #[tokio::test]
    async fn leerer_endpunkt_zerstoert_die_verbindung() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _handle = roh_beitritt(&mut umgebung, &server, false).await;
        let mut ereignisse = umgebung.orchestrator.ereignisse_abonnieren();

        umgebung
            .orchestrator
            .signal_verarbeiten(GatewaySignal::ServerZugangsdaten(ServerZugangsdaten {
                gruppe: umgebung.kanal.gruppe,
                endpunkt: None,
                token: "token-1".to_string(),
            }))
            .await;

        assert_eq!(
            umgebung.orchestrator.verbindungs_anzahl(),
            0,
            "Server-entzogene Verbindung muss aus der Registry verschwinden"
        );
        assert!(matches!(
            ereignisse.recv().await,
            Ok(OrchestratorEreignis::ServerGetrennt { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Voice-State-Updates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn voice_state_update_mit_verbindungs_id() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _handle = roh_beitritt(&mut umgebung, &server, false).await;

        // Die Verbindungs-Id kommt asynchron ueber das Relay
        tokio::time::sleep(Duration::from_millis(50)).await;

        let flags = ZustandsFlags {
            video: Some(true),
            ..Default::default()
        };
        umgebung
            .orchestrator
            .voice_state_aktualisieren(umgebung.kanal.id, flags)
            .unwrap();

        let (_, nachricht) = umgebung.gesendet.recv().await.unwrap();
        if let SteuerNachricht::Gateway(GatewayBefehl::ZustandAktualisieren {
            verbindungs_id,
            flags,
            ..
        }) = nachricht
        {
            assert_eq!(verbindungs_id, "conn-1");
            assert_eq!(flags.video, Some(true));
        } else {
            panic!("Erwartet ZustandAktualisieren, war {:?}", nachricht);
        }
    }

    #[tokio::test]
    async fn voice_state_update_ohne_verbindungs_id_ist_noop() {
        let umgebung = umgebung();
        // Keine Verbindung: bewusst nur loggen, nichts senden –
        // sonst droht die Verbindungsschleife
        umgebung
            .orchestrator
            .voice_state_aktualisieren(umgebung.kanal.id, ZustandsFlags::default())
            .unwrap();

        let mut umgebung = umgebung;
        keine_weiteren_nachrichten(&mut umgebung);
    }

    // -----------------------------------------------------------------------
    // Abfragen & Verlassen
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn verbindung_holen_faellt_auf_die_gruppe_zurueck() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _handle = roh_beitritt(&mut umgebung, &server, false).await;

        assert!(umgebung
            .orchestrator
            .verbindung_holen(umgebung.kanal.id)
            .is_some());
        let ueber_gruppe = umgebung
            .orchestrator
            .verbindung_holen(umgebung.kanal.gruppe)
            .expect("Gruppen-Lookup muss die Verbindung finden");
        assert_eq!(ueber_gruppe.kanal.id, umgebung.kanal.id);

        assert!(umgebung
            .orchestrator
            .verbindung_holen(ChannelId::new())
            .is_none());
        assert!(umgebung
            .orchestrator
            .verbindung_holen(GruppenId::new())
            .is_none());
    }

    #[tokio::test]
    async fn gruppe_verlassen_baut_ab_und_meldet_abschied() {
        let mut umgebung = umgebung();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _handle = roh_beitritt(&mut umgebung, &server, false).await;

        umgebung
            .orchestrator
            .gruppe_verlassen(umgebung.kanal.gruppe)
            .await;

        assert_eq!(umgebung.orchestrator.verbindungs_anzahl(), 0);
        let (_, nachricht) = umgebung.gesendet.recv().await.unwrap();
        assert!(matches!(
            nachricht,
            SteuerNachricht::Gateway(GatewayBefehl::Verlassen {
                kanal_id: None,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn initialer_abgleich_fuellt_die_tabelle() {
        let umgebung = umgebung();
        let gruppe = GruppenId::new();
        let mitglied = UserId::new();
        let kanal = ChannelId::new();

        umgebung
            .orchestrator
            .signal_verarbeiten(GatewaySignal::InitialerAbgleich {
                user_id: umgebung.user_id,
                session_id: "sitzung-start".to_string(),
                zustaende: vec![MitgliedsZustand {
                    user_id: mitglied,
                    gruppe,
                    kanal_id: Some(kanal),
                    session_id: String::new(),
                }],
            })
            .await;

        assert_eq!(
            umgebung.orchestrator.zustaende().kanal_von(&gruppe, &mitglied),
            Some(kanal)
        );
    }
}
