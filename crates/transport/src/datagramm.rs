//! Roh-Datagramm-Transport (UDP)
//!
//! Handshake ueber den Plattform-Steuerkanal, Medien ueber einen eigenen
//! UDP-Socket mit RTP-Rahmung und authentifizierter Verschluesselung.
//!
//! ## Zustandsautomat
//!
//! ```text
//! Leerlauf -> Identifizierung -> IpErmittlung -> ProtokollWahl
//!          -> SitzungSteht -> Streaming -> Geschlossen
//! ```
//!
//! ## Sendepfad
//!
//! Pakete kommen aus dem Demuxer in Salven, verlassen den Transport aber
//! im festen 20-ms-Takt: genau eine Entnahme aus der begrenzten
//! Warteschlange je Tick, nie schneller. Das ist der zentrale
//! Gegendruck-Vertrag dieses Transports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use palaver_core::types::{GruppenId, UserId};
use palaver_core::{PalaverError, Result};
use palaver_media::frame_queue::FrameWarteschlange;
use palaver_media::opus::OpusDecoder;
use palaver_media::takt::{Schrittmacher, OPUS_TAKT};
use palaver_protocol::control::{
    Heartbeat, Identify, ProtokollDaten, SelectProtocol, Speaking, SteuerNachricht,
    VoiceGatewayNachricht,
};
use palaver_protocol::crypto::{
    VerschluesselungsKontext, VerschluesselungsModus, SCHLUESSEL_LAENGE,
};
use palaver_protocol::discovery;

use crate::{quelle, AbspielQuelle, MedienTransport, Steuerkanal, TransportEreignis, VideoOptionen};

/// Maximale UDP-Paketgroesse (Kopf 12 + Opus + AEAD-Tag + Reserve)
const UDP_BUFFER_SIZE: usize = 1500;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration des Roh-Datagramm-Transports
#[derive(Debug, Clone)]
pub struct DatagrammKonfig {
    /// Gruppe des Sprachkanals
    pub gruppe: GruppenId,
    /// Eigene Benutzer-ID
    pub user_id: UserId,
    /// Session-ID aus dem Mitglieds-Zustandssignal
    pub session_id: String,
    /// Token aus dem Server-Zugangsdatensignal
    pub token: String,
    /// Shard-Index des Steuerkanals
    pub shard_index: u32,
    /// Zeitlimit je Handshake-Schritt
    pub handshake_timeout: Duration,
    /// Kappe der Sende-Warteschlange (Opus-Pakete)
    pub sende_kappe: usize,
}

impl DatagrammKonfig {
    /// Erstellt eine Konfiguration mit Standard-Werten
    pub fn neu(gruppe: GruppenId, user_id: UserId, session_id: String, token: String) -> Self {
        Self {
            gruppe,
            user_id,
            session_id,
            token,
            shard_index: 0,
            handshake_timeout: Duration::from_secs(10),
            sende_kappe: 512,
        }
    }
}

// ---------------------------------------------------------------------------
// Zustandsautomat
// ---------------------------------------------------------------------------

/// Zustaende des Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbindungsZustand {
    Leerlauf,
    Identifizierung,
    IpErmittlung,
    ProtokollWahl,
    SitzungSteht,
    Streaming,
    Geschlossen,
}

impl std::fmt::Display for VerbindungsZustand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Leerlauf => "leerlauf",
            Self::Identifizierung => "identifizierung",
            Self::IpErmittlung => "ip_ermittlung",
            Self::ProtokollWahl => "protokoll_wahl",
            Self::SitzungSteht => "sitzung_steht",
            Self::Streaming => "streaming",
            Self::Geschlossen => "geschlossen",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// DatagrammTransport
// ---------------------------------------------------------------------------

/// Roh-Datagramm-Transport einer Voice-Verbindung
pub struct DatagrammTransport {
    konfig: DatagrammKonfig,
    steuerkanal: Arc<dyn Steuerkanal>,
    ereignisse: mpsc::Sender<TransportEreignis>,
    /// Eingang fuer die vom Orchestrator zugestellten Voice-Nachrichten
    eingang_tx: mpsc::Sender<VoiceGatewayNachricht>,
    eingang_rx: Mutex<Option<mpsc::Receiver<VoiceGatewayNachricht>>>,
    zustand: Mutex<VerbindungsZustand>,
    /// Sende-Warteschlange: Salven hinein, 20-ms-Takt heraus
    sende_queue: Arc<Mutex<FrameWarteschlange<Vec<u8>>>>,
    /// Einmal-Flagge fuer den Abbau
    angehalten: Arc<AtomicBool>,
    /// Vom Server zugewiesene SSRC (nach Ready)
    ssrc: Arc<AtomicU32>,
    spricht: AtomicBool,
    lautstaerke: Mutex<f32>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatagrammTransport {
    /// Erstellt den Transport (noch nicht verbunden)
    pub fn neu(
        konfig: DatagrammKonfig,
        steuerkanal: Arc<dyn Steuerkanal>,
        ereignisse: mpsc::Sender<TransportEreignis>,
    ) -> Self {
        let (eingang_tx, eingang_rx) = mpsc::channel(64);
        let sende_kappe = konfig.sende_kappe;
        Self {
            konfig,
            steuerkanal,
            ereignisse,
            eingang_tx,
            eingang_rx: Mutex::new(Some(eingang_rx)),
            zustand: Mutex::new(VerbindungsZustand::Leerlauf),
            sende_queue: Arc::new(Mutex::new(FrameWarteschlange::neu(sende_kappe))),
            angehalten: Arc::new(AtomicBool::new(false)),
            ssrc: Arc::new(AtomicU32::new(0)),
            spricht: AtomicBool::new(false),
            lautstaerke: Mutex::new(1.0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Eingangsseite fuer den Orchestrator: hierueber werden die vom
    /// Steuerkanal empfangenen Voice-Nachrichten zugestellt
    pub fn eingang(&self) -> mpsc::Sender<VoiceGatewayNachricht> {
        self.eingang_tx.clone()
    }

    /// Aktueller Zustand
    pub fn zustand(&self) -> VerbindungsZustand {
        *self.zustand.lock()
    }

    /// Zugewiesene SSRC (0 vor Ready)
    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    fn zustand_setzen(&self, neu: VerbindungsZustand) {
        let mut zustand = self.zustand.lock();
        let alt = *zustand;
        debug!(von = %alt, nach = %neu, "Transport-Zustandswechsel");
        *zustand = neu;
    }

    fn voice_senden(&self, nachricht: VoiceGatewayNachricht) -> Result<()> {
        self.steuerkanal
            .senden(self.konfig.shard_index, SteuerNachricht::Voice(nachricht))
    }

    /// Wartet auf die naechste Voice-Nachricht des Servers
    async fn naechste_nachricht(
        &self,
        rx: &mut mpsc::Receiver<VoiceGatewayNachricht>,
    ) -> Result<VoiceGatewayNachricht> {
        match tokio::time::timeout(self.konfig.handshake_timeout, rx.recv()).await {
            Ok(Some(nachricht)) => Ok(nachricht),
            Ok(None) => Err(PalaverError::Getrennt("Steuerkanal geschlossen".into())),
            Err(_) => Err(PalaverError::Aushandlung(
                "Zeitueberschreitung im Voice-Handshake".into(),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Verbindungsaufbau
    // -----------------------------------------------------------------------

    /// Fuehrt den vollstaendigen Handshake aus
    ///
    /// Identify -> Ready -> IP-Ermittlung -> SelectProtocol ->
    /// SessionDescription; danach laufen Sende-, Empfangs- und
    /// Heartbeat-Task.
    pub async fn verbinden(&self) -> Result<()> {
        let mut rx = self
            .eingang_rx
            .lock()
            .take()
            .ok_or_else(|| PalaverError::Intern("verbinden doppelt aufgerufen".into()))?;

        // Schritt 1: Identify
        self.zustand_setzen(VerbindungsZustand::Identifizierung);
        self.voice_senden(VoiceGatewayNachricht::Identify(Identify {
            gruppe: self.konfig.gruppe,
            user_id: self.konfig.user_id,
            session_id: self.konfig.session_id.clone(),
            token: self.konfig.token.clone(),
        }))?;

        let ready = loop {
            match self.naechste_nachricht(&mut rx).await? {
                VoiceGatewayNachricht::Ready(r) => break r,
                andere => debug!(op = andere.opcode(), "Nachricht vor Ready ignoriert"),
            }
        };
        self.ssrc.store(ready.ssrc, Ordering::Relaxed);
        info!(ssrc = ready.ssrc, ip = %ready.ip, port = ready.port, "Voice-Server bereit");

        // Schritt 2: IP-Ermittlung ueber den Medien-Socket
        self.zustand_setzen(VerbindungsZustand::IpErmittlung);
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| PalaverError::Verbindung(format!("UDP-Socket: {}", e)))?;
        let ziel: SocketAddr = format!("{}:{}", ready.ip, ready.port)
            .parse()
            .map_err(|_| {
                PalaverError::Aushandlung(format!(
                    "Unbrauchbarer Voice-Endpunkt {}:{}",
                    ready.ip, ready.port
                ))
            })?;

        socket
            .send_to(&discovery::anfrage_kodieren(ready.ssrc), ziel)
            .await
            .map_err(|e| PalaverError::Verbindung(format!("IP-Ermittlung senden: {}", e)))?;

        let mut buf = [0u8; UDP_BUFFER_SIZE];
        let len = match tokio::time::timeout(
            self.konfig.handshake_timeout,
            socket.recv_from(&mut buf),
        )
        .await
        {
            Ok(Ok((len, _))) => len,
            Ok(Err(e)) => {
                return Err(PalaverError::Verbindung(format!(
                    "IP-Ermittlung empfangen: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(PalaverError::Aushandlung(
                    "IP-Ermittlung ohne Antwort".into(),
                ))
            }
        };
        // Eine zu kurze Antwort ist ein Aushandlungsfehler, kein IO-Fehler
        let beobachtet = discovery::antwort_dekodieren(&buf[..len])
            .map_err(|e| PalaverError::Aushandlung(e.to_string()))?;
        debug!(
            adresse = %beobachtet.adresse,
            port = beobachtet.port,
            "Externer Endpunkt ermittelt"
        );

        // Schritt 3: Protokoll- und Moduswahl
        let modus = VerschluesselungsModus::aus_angebot(&ready.modi).ok_or_else(|| {
            PalaverError::Aushandlung(format!(
                "Kein bekannter Verschluesselungsmodus im Angebot {:?}",
                ready.modi
            ))
        })?;
        self.zustand_setzen(VerbindungsZustand::ProtokollWahl);
        self.voice_senden(VoiceGatewayNachricht::SelectProtocol(SelectProtocol {
            protokoll: "udp".to_string(),
            daten: ProtokollDaten {
                adresse: beobachtet.adresse,
                port: beobachtet.port,
                modus: modus.wire_name().to_string(),
            },
        }))?;

        let sitzung = loop {
            match self.naechste_nachricht(&mut rx).await? {
                VoiceGatewayNachricht::SessionDescription(s) => break s,
                VoiceGatewayNachricht::Heartbeat(_) => {}
                andere => debug!(
                    op = andere.opcode(),
                    "Nachricht vor SessionDescription ignoriert"
                ),
            }
        };

        let schluessel: [u8; SCHLUESSEL_LAENGE] =
            sitzung.geheimschluessel.as_slice().try_into().map_err(|_| {
                PalaverError::Aushandlung(format!(
                    "Geheimschluessel fehlt oder hat falsche Laenge ({} Bytes)",
                    sitzung.geheimschluessel.len()
                ))
            })?;
        let bestaetigt = VerschluesselungsModus::von_wire_name(&sitzung.modus)
            .ok_or_else(|| {
                PalaverError::Aushandlung(format!(
                    "Server bestaetigte unbekannten Modus '{}'",
                    sitzung.modus
                ))
            })?;
        if let Some(id) = sitzung.verbindungs_id {
            let _ = self
                .ereignisse
                .try_send(TransportEreignis::VerbindungsId(id));
        }

        self.zustand_setzen(VerbindungsZustand::SitzungSteht);
        info!(modus = %bestaetigt, "Voice-Sitzung steht");

        // Schritt 4: Laufende Tasks starten
        let socket = Arc::new(socket);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(sende_loop(
            Arc::clone(&socket),
            ziel,
            VerschluesselungsKontext::neu(bestaetigt, &schluessel),
            Arc::clone(&self.sende_queue),
            Arc::clone(&self.ssrc),
            Arc::clone(&self.angehalten),
            self.ereignisse.clone(),
        )));
        tasks.push(tokio::spawn(empfangs_loop(
            socket,
            VerschluesselungsKontext::neu(bestaetigt, &schluessel),
            Arc::clone(&self.angehalten),
            self.ereignisse.clone(),
        )));
        tasks.push(tokio::spawn(heartbeat_loop(
            Arc::clone(&self.steuerkanal),
            self.konfig.shard_index,
            ready.heartbeat_intervall_ms,
            Arc::clone(&self.angehalten),
        )));
        tasks.push(tokio::spawn(eingang_loop(
            rx,
            Arc::clone(&self.angehalten),
        )));
        drop(tasks);

        let _ = self.ereignisse.try_send(TransportEreignis::Bereit);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Wiedergabe
    // -----------------------------------------------------------------------

    /// Reiht eine Audioquelle zur Wiedergabe ein
    ///
    /// Die Pakete landen als Salve in der Warteschlange; der 20-ms-Takt
    /// zieht sie in Echtzeit ab.
    pub async fn abspielen(&self, abspiel_quelle: AbspielQuelle) -> Result<()> {
        if self.angehalten.load(Ordering::Relaxed) {
            return Err(PalaverError::Getrennt("Transport bereits abgebaut".into()));
        }
        let pakete = quelle::opus_pakete_laden(abspiel_quelle).await?;

        if !self.spricht.swap(true, Ordering::Relaxed) {
            self.voice_senden(VoiceGatewayNachricht::Speaking(Speaking {
                spricht: true,
                verzoegerung_ms: 0,
                ssrc: self.ssrc(),
            }))?;
        }
        self.zustand_setzen(VerbindungsZustand::Streaming);

        let mut queue = self.sende_queue.lock();
        for paket in pakete {
            queue.einreihen(paket.zeitstempel_ms, paket.daten);
        }
        debug!(
            fuellstand = queue.laenge(),
            "Audioquelle eingereiht"
        );
        Ok(())
    }

    /// Stoppt die Wiedergabe (mehrfach aufrufbar)
    pub async fn stoppen(&self) {
        self.sende_queue.lock().leeren();
        if self.spricht.swap(false, Ordering::Relaxed) {
            let _ = self.voice_senden(VoiceGatewayNachricht::Speaking(Speaking {
                spricht: false,
                verzoegerung_ms: 0,
                ssrc: self.ssrc(),
            }));
        }
    }

    /// Baut den Transport vollstaendig ab (idempotent)
    pub async fn zerstoeren(&self) {
        // Nur der erste Aufruf raeumt auf
        if self.angehalten.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stoppen().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.zustand_setzen(VerbindungsZustand::Geschlossen);
        let _ = self.ereignisse.try_send(TransportEreignis::Getrennt);
        info!("Datagramm-Transport abgebaut");
    }
}

#[async_trait::async_trait]
impl MedienTransport for DatagrammTransport {
    async fn verbinden(&self) -> Result<()> {
        DatagrammTransport::verbinden(self).await
    }

    async fn abspielen(&self, abspiel_quelle: AbspielQuelle) -> Result<()> {
        DatagrammTransport::abspielen(self, abspiel_quelle).await
    }

    async fn video_abspielen(&self, _quelle: AbspielQuelle, _optionen: VideoOptionen) -> Result<()> {
        Err(PalaverError::NichtUnterstuetzt(
            "Videowiedergabe gibt es nur ueber den SFU-Raum-Transport".into(),
        ))
    }

    async fn stoppen(&self) {
        DatagrammTransport::stoppen(self).await
    }

    async fn video_stoppen(&self) {}

    fn lautstaerke_setzen(&self, lautstaerke: f32) {
        // Der Rohpfad reicht Opus unveraendert durch; der Skalar wirkt
        // nur im SFU-Dekodierpfad
        warn!("Lautstaerke wirkt im Roh-Datagramm-Pfad nicht auf Opus-Durchleitung");
        *self.lautstaerke.lock() = lautstaerke.clamp(0.0, 2.0);
    }

    fn lautstaerke_holen(&self) -> f32 {
        *self.lautstaerke.lock()
    }

    async fn zerstoeren(&self) {
        DatagrammTransport::zerstoeren(self).await
    }
}

// ---------------------------------------------------------------------------
// Laufende Tasks
// ---------------------------------------------------------------------------

/// Sende-Takt: genau ein Paket je 20-ms-Tick, nie schneller
async fn sende_loop(
    socket: Arc<UdpSocket>,
    ziel: SocketAddr,
    mut kontext: VerschluesselungsKontext,
    queue: Arc<Mutex<FrameWarteschlange<Vec<u8>>>>,
    ssrc: Arc<AtomicU32>,
    angehalten: Arc<AtomicBool>,
    ereignisse: mpsc::Sender<TransportEreignis>,
) {
    let mut takt = Schrittmacher::neu(OPUS_TAKT);
    debug!("Sende-Takt gestartet");

    loop {
        takt.tick().await;
        if angehalten.load(Ordering::Relaxed) {
            break;
        }

        let eintrag = queue.lock().entnehmen();
        let Some((_, opus)) = eintrag else { continue };

        let datagramm = match kontext.versiegeln(ssrc.load(Ordering::Relaxed), &opus) {
            Ok(d) => d,
            Err(e) => {
                warn!(fehler = %e, "Paket nicht versiegelbar, verworfen");
                continue;
            }
        };

        if let Err(e) = socket.send_to(&datagramm, ziel).await {
            warn!(fehler = %e, ziel = %ziel, "UDP-Sendefehler");
            let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                "UDP-Sendefehler: {}",
                e
            )));
        } else {
            trace!(
                sequenz = kontext.sequenz().wrapping_sub(1),
                bytes = datagramm.len(),
                "Paket gesendet"
            );
        }
    }

    debug!("Sende-Takt beendet");
}

/// Empfangspfad: entschluesseln, dekodieren, als Signal nach oben
async fn empfangs_loop(
    socket: Arc<UdpSocket>,
    kontext: VerschluesselungsKontext,
    angehalten: Arc<AtomicBool>,
    ereignisse: mpsc::Sender<TransportEreignis>,
) {
    let mut decoder = match OpusDecoder::neu() {
        Ok(d) => d,
        Err(e) => {
            let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                "Opus-Decoder: {}",
                e
            )));
            return;
        }
    };
    let mut buf = [0u8; UDP_BUFFER_SIZE];
    // Letzte Sequenznummer je SSRC fuer die Duplikat-/Altpaket-Erkennung
    let mut letzte_sequenzen: std::collections::HashMap<u32, u16> = std::collections::HashMap::new();
    debug!("Empfangs-Loop gestartet");

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _absender)) => {
                if angehalten.load(Ordering::Relaxed) {
                    break;
                }
                let (kopf, opus) = match kontext.oeffnen(&buf[..len]) {
                    Ok(geoeffnet) => geoeffnet,
                    Err(e) => {
                        trace!(fehler = %e, "Paket verworfen");
                        continue;
                    }
                };
                // Duplikate und regressive Sequenzen verwerfen
                // (Wrap bei 2^16: Differenz > 2^15 gilt als alt)
                if let Some(&letzte) = letzte_sequenzen.get(&kopf.ssrc) {
                    let diff = kopf.sequenz.wrapping_sub(letzte);
                    if diff == 0 || diff > u16::MAX / 2 {
                        trace!(sequenz = kopf.sequenz, letzte, "Altes Paket verworfen");
                        continue;
                    }
                }
                letzte_sequenzen.insert(kopf.ssrc, kopf.sequenz);
                match decoder.decode(&opus) {
                    Ok(pcm) => {
                        let _ = ereignisse.try_send(TransportEreignis::AudioEmpfangen {
                            ssrc: kopf.ssrc,
                            pcm,
                        });
                    }
                    Err(e) => trace!(fehler = %e, "Opus-Decoding fehlgeschlagen"),
                }
            }
            Err(e) => {
                if angehalten.load(Ordering::Relaxed) {
                    break;
                }
                warn!(fehler = %e, "UDP-Empfangsfehler");
                let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                    "UDP-Empfangsfehler: {}",
                    e
                )));
                // Kurze Pause gegen Busy-Loop bei persistentem Fehler
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    debug!("Empfangs-Loop beendet");
}

/// Keepalive im Server-Intervall
async fn heartbeat_loop(
    steuerkanal: Arc<dyn Steuerkanal>,
    shard_index: u32,
    intervall_ms: u64,
    angehalten: Arc<AtomicBool>,
) {
    let nonce = AtomicU64::new(0);
    let mut takt = tokio::time::interval(Duration::from_millis(intervall_ms.max(1000)));
    takt.tick().await; // erster Tick feuert sofort

    loop {
        takt.tick().await;
        if angehalten.load(Ordering::Relaxed) {
            break;
        }
        let nachricht = VoiceGatewayNachricht::Heartbeat(Heartbeat {
            nonce: nonce.fetch_add(1, Ordering::Relaxed),
        });
        if steuerkanal
            .senden(shard_index, SteuerNachricht::Voice(nachricht))
            .is_err()
        {
            debug!("Steuerkanal weg, Heartbeat beendet");
            break;
        }
        trace!("Heartbeat gesendet");
    }
}

/// Restliche Steuerkanal-Nachrichten nach dem Handshake (Echos etc.)
async fn eingang_loop(
    mut rx: mpsc::Receiver<VoiceGatewayNachricht>,
    angehalten: Arc<AtomicBool>,
) {
    while let Some(nachricht) = rx.recv().await {
        if angehalten.load(Ordering::Relaxed) {
            break;
        }
        match nachricht {
            VoiceGatewayNachricht::Heartbeat(h) => trace!(nonce = h.nonce, "Heartbeat-Echo"),
            andere => debug!(op = andere.opcode(), "Voice-Nachricht nach Handshake"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
