//! SFU-Raum-Transport (LiveKit)
//!
//! Beitritt in den Medienraum mit server-ausgestellter URL + Token,
//! Publikation lokaler Audio-/Videotracks. Eingehendes Material wird
//! lokal dekodiert und fuer den Raum neu kodiert – die Re-Enkodierung
//! uebernimmt die Raum-Bibliothek, hier endet der Pfad an den
//! publizierten Quellen.
//!
//! ## Audio-Pfad
//!
//! Quelle -> WebM-Demux -> Opus-Decode (f32) -> Lautstaerke (0-200 %)
//! -> Dithering nach i16 -> feste 10-ms/480-Sample-Frames -> Quelle des
//! publizierten Tracks. Der Takt kommt aus dem Gegendruck der Quelle:
//! `capture_frame` suspendiert, sobald mehr als ~500 ms Abspielmaterial
//! anstehen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use livekit::options::TrackPublishOptions;
use livekit::track::{LocalAudioTrack, LocalTrack, LocalVideoTrack, TrackSource};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::video_source::native::NativeVideoSource;
use livekit::webrtc::video_source::{RtcVideoSource, VideoResolution};
use livekit::{Room, RoomEvent, RoomOptions};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use palaver_core::{PalaverError, Result};
use palaver_media::opus::{ABTASTRATE, FRAME_10MS, KANAELE, OpusDecoder};
use palaver_media::pcm::{dithered_i16, FrameSammler, LautstaerkeRegler};
use palaver_media::webm::OpusPaket;

use crate::senke::{AudioSenke, LiveKitAudioSenke, LiveKitVideoSenke};
use crate::sfu_video::{VideoPipeline, STANDARD_VIDEO_KAPPE};
use crate::{quelle, AbspielQuelle, MedienTransport, TransportEreignis, VideoOptionen};

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration des SFU-Raum-Transports
#[derive(Debug, Clone)]
pub struct SfuKonfig {
    /// Raum-URL aus dem Server-Zugangsdatensignal
    pub url: String,
    /// Zugriffstoken aus demselben Signal
    pub token: String,
    /// Warteschlangen-Dauer der Audioquelle in Millisekunden
    /// (Gegendruck-Schwelle des Sendepfads)
    pub audio_warteschlange_ms: u32,
    /// Kappe der Video-Frame-Warteschlange
    pub video_kappe: usize,
}

impl SfuKonfig {
    /// Erstellt eine Konfiguration mit Standard-Werten
    pub fn neu(url: String, token: String) -> Self {
        Self {
            url,
            token,
            audio_warteschlange_ms: 500,
            video_kappe: STANDARD_VIDEO_KAPPE,
        }
    }
}

// ---------------------------------------------------------------------------
// SfuRaumTransport
// ---------------------------------------------------------------------------

/// SFU-Raum-Transport einer Voice-Verbindung
pub struct SfuRaumTransport {
    konfig: SfuKonfig,
    ereignisse: mpsc::Sender<TransportEreignis>,
    raum: AsyncMutex<Option<Arc<Room>>>,
    audio_quelle: AsyncMutex<Option<NativeAudioSource>>,
    /// Laufflagge der aktuellen Audio-Wiedergabe (je Wiedergabe neu)
    audio_laeuft: Mutex<Arc<AtomicBool>>,
    audio_task: Mutex<Option<JoinHandle<()>>>,
    video: AsyncMutex<Option<VideoPipeline>>,
    lautstaerke: Arc<Mutex<LautstaerkeRegler>>,
    /// Einmal-Flagge fuer den Abbau
    angehalten: Arc<AtomicBool>,
    ereignis_task: Mutex<Option<JoinHandle<()>>>,
}

impl SfuRaumTransport {
    /// Erstellt den Transport (noch nicht verbunden)
    pub fn neu(konfig: SfuKonfig, ereignisse: mpsc::Sender<TransportEreignis>) -> Self {
        Self {
            konfig,
            ereignisse,
            raum: AsyncMutex::new(None),
            audio_quelle: AsyncMutex::new(None),
            audio_laeuft: Mutex::new(Arc::new(AtomicBool::new(false))),
            audio_task: Mutex::new(None),
            video: AsyncMutex::new(None),
            lautstaerke: Arc::new(Mutex::new(LautstaerkeRegler::neu())),
            angehalten: Arc::new(AtomicBool::new(false)),
            ereignis_task: Mutex::new(None),
        }
    }

    /// Tritt dem Raum bei
    pub async fn verbinden(&self) -> Result<()> {
        let (raum, ereignis_rx) =
            Room::connect(&self.konfig.url, &self.konfig.token, RoomOptions::default())
                .await
                .map_err(|e| {
                    PalaverError::Verbindung(format!("SFU-Raum nicht erreichbar: {}", e))
                })?;
        let raum = Arc::new(raum);
        info!(url = %self.konfig.url, "SFU-Raum beigetreten");

        // Die Teilnehmer-Sid ist das opake Verbindungs-Token dieser
        // Sitzung – noetig fuer spaetere Voice-State-Mutationen
        let _ = self.ereignisse.try_send(TransportEreignis::VerbindungsId(
            raum.local_participant().sid().to_string(),
        ));

        *self.ereignis_task.lock() = Some(tokio::spawn(raum_ereignisse(
            ereignis_rx,
            self.ereignisse.clone(),
            Arc::clone(&self.angehalten),
        )));

        *self.raum.lock().await = Some(raum);
        let _ = self.ereignisse.try_send(TransportEreignis::Bereit);
        Ok(())
    }

    /// Spielt eine Audioquelle in den Raum
    pub async fn abspielen(&self, abspiel_quelle: AbspielQuelle) -> Result<()> {
        if self.angehalten.load(Ordering::Relaxed) {
            return Err(PalaverError::Getrennt("Transport bereits abgebaut".into()));
        }
        let pakete = quelle::opus_pakete_laden(abspiel_quelle).await?;
        let audio_quelle = self.audio_quelle_sicherstellen().await?;

        // Laufende Wiedergabe abloesen: alte Flagge loeschen, neue setzen
        let laeuft = Arc::new(AtomicBool::new(true));
        {
            let mut aktuelle = self.audio_laeuft.lock();
            aktuelle.store(false, Ordering::SeqCst);
            *aktuelle = Arc::clone(&laeuft);
        }
        if let Some(alte) = self.audio_task.lock().take() {
            alte.abort();
        }

        let senke: Arc<dyn AudioSenke> = Arc::new(LiveKitAudioSenke::neu(audio_quelle));
        let task = tokio::spawn(audio_pipeline(
            pakete,
            senke,
            Arc::clone(&self.lautstaerke),
            laeuft,
            self.ereignisse.clone(),
        ));
        *self.audio_task.lock() = Some(task);
        Ok(())
    }

    /// Spielt eine Videoquelle in den Raum
    pub async fn video_abspielen(
        &self,
        abspiel_quelle: AbspielQuelle,
        optionen: VideoOptionen,
    ) -> Result<()> {
        if self.angehalten.load(Ordering::Relaxed) {
            return Err(PalaverError::Getrennt("Transport bereits abgebaut".into()));
        }

        let (puffer, url) = match abspiel_quelle {
            AbspielQuelle::Url(url) => (quelle::bytes_laden(&url).await?, Some(url)),
            AbspielQuelle::Puffer(puffer) => (puffer, None),
            AbspielQuelle::OpusPakete(_) => {
                return Err(PalaverError::Container(
                    "Opus-Pakete sind keine Videoquelle".into(),
                ))
            }
        };

        // Laufende Wiedergabe zuerst vollstaendig abbauen
        self.video_stoppen().await;

        // Demux vorab fuer die Track-Abmessungen, dann Quelle publizieren
        let info_probe = palaver_media::mp4::Mp4Demuxer::neu(puffer.clone())
            .map_err(PalaverError::from)?;
        let (breite, hoehe) = (info_probe.info().breite, info_probe.info().hoehe);
        drop(info_probe);

        let video_quelle = NativeVideoSource::new(VideoResolution {
            width: breite,
            height: hoehe,
        });
        let track = LocalVideoTrack::create_video_track(
            "palaver-video",
            RtcVideoSource::Native(video_quelle.clone()),
        );
        let raum = self
            .raum
            .lock()
            .await
            .clone()
            .ok_or_else(|| PalaverError::Getrennt("Nicht mit dem Raum verbunden".into()))?;
        raum.local_participant()
            .publish_track(
                LocalTrack::Video(track),
                TrackPublishOptions {
                    source: TrackSource::Camera,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                PalaverError::Verbindung(format!("Videotrack nicht publizierbar: {}", e))
            })?;
        debug!(breite, hoehe, "Videotrack publiziert");

        let senke = Arc::new(LiveKitVideoSenke::neu(video_quelle));
        let (pipeline, info) = VideoPipeline::starten(
            puffer,
            url,
            senke,
            optionen,
            self.konfig.video_kappe,
            self.ereignisse.clone(),
        )
        .await?;
        info!(
            breite = info.breite,
            hoehe = info.hoehe,
            fps = info.fps,
            "Videowiedergabe gestartet"
        );
        *self.video.lock().await = Some(pipeline);
        Ok(())
    }

    /// Stoppt die Audio-Wiedergabe (mehrfach aufrufbar)
    pub async fn stoppen(&self) {
        self.audio_laeuft.lock().store(false, Ordering::SeqCst);
        if let Some(task) = self.audio_task.lock().take() {
            task.abort();
        }
    }

    /// Stoppt die Video-Wiedergabe (mehrfach aufrufbar)
    pub async fn video_stoppen(&self) {
        if let Some(pipeline) = self.video.lock().await.take() {
            pipeline.bereinigen().await;
        }
    }

    /// Baut den Transport vollstaendig ab (idempotent)
    pub async fn zerstoeren(&self) {
        // Nur der erste Aufruf raeumt auf; die Flagge faellt vor dem
        // Raum-Close, damit dessen Disconnected-Ereignis nicht als
        // Server-Abschied gemeldet wird
        if self.angehalten.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stoppen().await;
        self.video_stoppen().await;

        if let Some(raum) = self.raum.lock().await.take() {
            if let Err(e) = raum.close().await {
                debug!(fehler = %e, "Raum-Close fehlgeschlagen (ignoriert)");
            }
        }
        if let Some(task) = self.ereignis_task.lock().take() {
            task.abort();
        }
        let _ = self.ereignisse.try_send(TransportEreignis::Getrennt);
        info!("SFU-Raum-Transport abgebaut");
    }

    /// Publiziert den Audiotrack beim ersten Abspielen
    async fn audio_quelle_sicherstellen(&self) -> Result<NativeAudioSource> {
        let mut slot = self.audio_quelle.lock().await;
        if let Some(vorhanden) = slot.as_ref() {
            return Ok(vorhanden.clone());
        }

        let raum = self
            .raum
            .lock()
            .await
            .clone()
            .ok_or_else(|| PalaverError::Getrennt("Nicht mit dem Raum verbunden".into()))?;

        let audio_quelle = NativeAudioSource::new(
            AudioSourceOptions::default(),
            ABTASTRATE,
            KANAELE as u32,
            self.konfig.audio_warteschlange_ms,
        );
        let track = LocalAudioTrack::create_audio_track(
            "palaver-audio",
            RtcAudioSource::Native(audio_quelle.clone()),
        );
        raum.local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: TrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                PalaverError::Verbindung(format!("Audiotrack nicht publizierbar: {}", e))
            })?;
        debug!("Audiotrack publiziert");

        *slot = Some(audio_quelle.clone());
        Ok(audio_quelle)
    }
}

#[async_trait::async_trait]
impl MedienTransport for SfuRaumTransport {
    async fn verbinden(&self) -> Result<()> {
        SfuRaumTransport::verbinden(self).await
    }

    async fn abspielen(&self, abspiel_quelle: AbspielQuelle) -> Result<()> {
        SfuRaumTransport::abspielen(self, abspiel_quelle).await
    }

    async fn video_abspielen(&self, abspiel_quelle: AbspielQuelle, optionen: VideoOptionen) -> Result<()> {
        SfuRaumTransport::video_abspielen(self, abspiel_quelle, optionen).await
    }

    async fn stoppen(&self) {
        SfuRaumTransport::stoppen(self).await
    }

    async fn video_stoppen(&self) {
        SfuRaumTransport::video_stoppen(self).await
    }

    fn lautstaerke_setzen(&self, lautstaerke: f32) {
        self.lautstaerke.lock().setzen(lautstaerke);
    }

    fn lautstaerke_holen(&self) -> f32 {
        self.lautstaerke.lock().holen()
    }

    async fn zerstoeren(&self) {
        SfuRaumTransport::zerstoeren(self).await
    }
}

// ---------------------------------------------------------------------------
// Raum-Ereignisse
// ---------------------------------------------------------------------------

/// Uebersetzt Raum-Ereignisse in Transport-Signale
///
/// Ein raumseitiger Disconnect wird als Server-Abschied *vor* dem
/// generischen Trennsignal gemeldet – die Wiederbeitritts-Politik liegt
/// beim Aufrufer, nicht hier.
async fn raum_ereignisse(
    mut rx: mpsc::UnboundedReceiver<RoomEvent>,
    ereignisse: mpsc::Sender<TransportEreignis>,
    angehalten: Arc<AtomicBool>,
) {
    while let Some(ereignis) = rx.recv().await {
        match ereignis {
            RoomEvent::Disconnected { reason } => {
                if !angehalten.load(Ordering::Relaxed) {
                    warn!(grund = ?reason, "Raum hat die Verbindung beendet");
                    let _ = ereignisse.try_send(TransportEreignis::ServerGetrennt);
                    let _ = ereignisse.try_send(TransportEreignis::Getrennt);
                }
                break;
            }
            RoomEvent::TrackSubscribed { participant, .. } => {
                debug!(teilnehmer = %participant.identity(), "Track abonniert");
                let _ = ereignisse.try_send(TransportEreignis::TrackAbonniert {
                    teilnehmer: participant.identity().to_string(),
                });
            }
            andere => trace!(ereignis = ?andere, "Raum-Ereignis"),
        }
    }
    debug!("Raum-Ereignis-Loop beendet");
}

// ---------------------------------------------------------------------------
// Audio-Pipeline
// ---------------------------------------------------------------------------

/// Dekodiert Opus-Pakete und liefert feste 10-ms-Frames an die Senke
///
/// Der Takt kommt aus dem Gegendruck der Senke: `frame_abliefern`
/// suspendiert, sobald deren Warteschlangen-Dauer ueberschritten ist.
/// Jede Iteration prueft die Laufflagge, bevor sie geteilte Zustaende
/// anfasst.
pub(crate) async fn audio_pipeline(
    pakete: Vec<OpusPaket>,
    senke: Arc<dyn AudioSenke>,
    lautstaerke: Arc<Mutex<LautstaerkeRegler>>,
    laeuft: Arc<AtomicBool>,
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
    let mut sammler = FrameSammler::neu(FRAME_10MS, KANAELE);
    debug!(pakete = pakete.len(), "Audio-Pipeline gestartet");

    for paket in pakete {
        if !laeuft.load(Ordering::Relaxed) {
            debug!("Audio-Pipeline gestoppt");
            return;
        }

        let mut pcm = match decoder.decode(&paket.daten) {
            Ok(pcm) => pcm,
            Err(e) => {
                // Einzelne kaputte Pakete verdecken, nicht abbrechen
                trace!(fehler = %e, "Opus-Paket nicht dekodierbar, PLC");
                match decoder.decode_plc() {
                    Ok(pcm) => pcm,
                    Err(_) => continue,
                }
            }
        };

        lautstaerke.lock().anwenden(&mut pcm);
        sammler.schieben(&dithered_i16(&pcm));

        while let Some(frame) = sammler.naechster_frame() {
            if !laeuft.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = senke.frame_abliefern(frame).await {
                let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                    "Audio-Senke: {}",
                    e
                )));
                return;
            }
        }
    }

    debug!("Audio-Pipeline am Streamende");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
