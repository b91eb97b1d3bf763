//! Video-Pipeline des SFU-Raum-Transports
//!
//! Demux -> Decode -> begrenzte Warteschlange -> fester Abspieltakt.
//! Die Pipeline liefert hoechstens ein Frame je Tick; wer hinterherhinkt,
//! verwirft abgelaufene Frames statt sie als Salve nachzuliefern. Am
//! Streamende stoppt sie sauber oder beginnt – unter Schleife – nach
//! Neuinitialisierung von Demuxer und Decoder von vorn, ohne den
//! publizierten Track zu schliessen.
//!
//! Der Abbau ist durch eine einzige Einmal-Flagge geschuetzt: viele
//! asynchrone Rueckrufe (Decoderfehler, Subprozess-Ende, explizites
//! Stoppen) duerfen ihn gleichzeitig anstossen, nur der erste raeumt auf.
//! Jeder frame-produzierende Schritt prueft vorher "laeuft noch".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use palaver_core::Result;
use palaver_media::error::MedienResult;
use palaver_media::ffmpeg::{FfmpegEingabe, FfmpegKonfig, FfmpegRohVideo};
use palaver_media::frame_queue::FrameWarteschlange;
use palaver_media::h264::{AvcKonfiguration, H264Decoder, VideoDecoder, VideoFrameI420};
use palaver_media::mp4::{Mp4Demuxer, VideoCodec, VideoTrackInfo};
use palaver_media::takt::Schrittmacher;

use crate::senke::VideoSenke;
use crate::{TransportEreignis, VideoOptionen};

/// Standard-Kappe der Frame-Warteschlange
pub const STANDARD_VIDEO_KAPPE: usize = 30;

// ---------------------------------------------------------------------------
// Frame-Quellen
// ---------------------------------------------------------------------------

/// Quelle dekodierter Frames – Naht zwischen In-Prozess-Pfad,
/// Subprozess-Fallback und den Pipeline-Tests
#[async_trait]
pub(crate) trait FrameQuelle: Send {
    /// Naechstes Frame mit Zeitstempel; `None` am Streamende
    async fn naechstes(&mut self) -> MedienResult<Option<(u64, VideoFrameI420)>>;

    /// Neuinitialisierung fuer den Schleifenbetrieb
    async fn zuruecksetzen(&mut self) -> MedienResult<()>;
}

/// In-Prozess-Pfad: MP4-Demuxer + H.264-Decoder
pub(crate) struct ContainerQuelle {
    demuxer: Mp4Demuxer,
    decoder: Box<dyn VideoDecoder>,
}

#[async_trait]
impl FrameQuelle for ContainerQuelle {
    async fn naechstes(&mut self) -> MedienResult<Option<(u64, VideoFrameI420)>> {
        loop {
            let Some((sample, bytes)) = self.demuxer.naechstes_sample() else {
                return Ok(None);
            };
            match self.decoder.dekodieren(bytes)? {
                Some(frame) => return Ok(Some((sample.zeit_ms, frame))),
                // Decoder waermt noch auf (Parameter-Sets, B-Frames)
                None => continue,
            }
        }
    }

    async fn zuruecksetzen(&mut self) -> MedienResult<()> {
        self.demuxer.zuruecksetzen();
        self.decoder.zuruecksetzen()
    }
}

/// Subprozess-Fallback: rohe I420-Frames aus FFmpeg
pub(crate) struct SubprozessQuelle {
    quelle: FfmpegRohVideo,
    konfig: FfmpegKonfig,
    frame_dauer_ms: f64,
    index: u64,
}

impl SubprozessQuelle {
    pub(crate) async fn starten(konfig: FfmpegKonfig, fps: f32) -> MedienResult<Self> {
        let quelle = FfmpegRohVideo::starten(&konfig).await?;
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        Ok(Self {
            quelle,
            konfig,
            frame_dauer_ms: 1000.0 / fps as f64,
            index: 0,
        })
    }
}

#[async_trait]
impl FrameQuelle for SubprozessQuelle {
    async fn naechstes(&mut self) -> MedienResult<Option<(u64, VideoFrameI420)>> {
        match self.quelle.naechstes_frame().await? {
            Some(frame) => {
                let zeit_ms = (self.index as f64 * self.frame_dauer_ms) as u64;
                self.index += 1;
                Ok(Some((zeit_ms, frame)))
            }
            // Prozessende: regulaerer Abschluss bzw. Schleifen-Ausloeser
            None => Ok(None),
        }
    }

    async fn zuruecksetzen(&mut self) -> MedienResult<()> {
        let neu = FfmpegRohVideo::starten(&self.konfig).await?;
        let alt = std::mem::replace(&mut self.quelle, neu);
        alt.beenden().await;
        self.index = 0;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VideoPipeline
// ---------------------------------------------------------------------------

/// Laufende Video-Pipeline einer publizierten Videospur
pub struct VideoPipeline {
    laeuft: Arc<AtomicBool>,
    bereinigt: Arc<AtomicBool>,
    fertig: Arc<AtomicBool>,
    queue: Arc<Mutex<FrameWarteschlange<VideoFrameI420>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VideoPipeline {
    /// Startet die Pipeline ueber einem geladenen MP4-Container
    ///
    /// Decoderwahl: H.264-Material laeuft in-Prozess; fremde Codecs und
    /// ein nicht verfuegbarer In-Prozess-Decoder gehen direkt auf den
    /// FFmpeg-Subprozess. Gibt die Pipeline und die Track-Metadaten
    /// (Abmessungen fuer die publizierte Quelle) zurueck.
    pub async fn starten(
        puffer: Vec<u8>,
        quell_url: Option<String>,
        senke: Arc<dyn VideoSenke>,
        optionen: VideoOptionen,
        kappe: usize,
        ereignisse: mpsc::Sender<TransportEreignis>,
    ) -> Result<(Self, VideoTrackInfo)> {
        let demuxer = Mp4Demuxer::neu(puffer).map_err(palaver_core::PalaverError::from)?;
        let info = demuxer.info().clone();
        let fps = optionen.fps.unwrap_or(info.fps);

        let fallback_konfig = FfmpegKonfig {
            eingabe: match quell_url {
                Some(url) => FfmpegEingabe::Url(url),
                None => FfmpegEingabe::Puffer(demuxer.daten().to_vec()),
            },
            breite: info.breite as usize,
            hoehe: info.hoehe as usize,
        };

        let (frame_quelle, ersatz): (Box<dyn FrameQuelle>, Option<(FfmpegKonfig, f32)>) =
            match &info.codec {
                VideoCodec::H264 { avcc } => {
                    match AvcKonfiguration::parse(avcc).and_then(H264Decoder::neu) {
                        Ok(decoder) => (
                            Box::new(ContainerQuelle {
                                demuxer,
                                decoder: Box::new(decoder),
                            }),
                            Some((fallback_konfig, fps)),
                        ),
                        Err(e) => {
                            warn!(
                                fehler = %e,
                                "In-Prozess-Decoder nicht verfuegbar, FFmpeg-Subprozess"
                            );
                            (
                                Box::new(
                                    SubprozessQuelle::starten(fallback_konfig, fps)
                                        .await
                                        .map_err(palaver_core::PalaverError::from)?,
                                ),
                                None,
                            )
                        }
                    }
                }
                VideoCodec::Unbekannt(fourcc) => {
                    debug!(
                        codec = %String::from_utf8_lossy(fourcc),
                        "Fremder Codec, FFmpeg-Subprozess"
                    );
                    (
                        Box::new(
                            SubprozessQuelle::starten(fallback_konfig, fps)
                                .await
                                .map_err(palaver_core::PalaverError::from)?,
                        ),
                        None,
                    )
                }
            };

        Ok((
            Self::mit_quelle(frame_quelle, ersatz, senke, optionen.schleife, fps, kappe, ereignisse),
            info,
        ))
    }

    /// Startet die beiden Loops ueber einer fertigen Frame-Quelle
    pub(crate) fn mit_quelle(
        frame_quelle: Box<dyn FrameQuelle>,
        ersatz: Option<(FfmpegKonfig, f32)>,
        senke: Arc<dyn VideoSenke>,
        schleife: bool,
        fps: f32,
        kappe: usize,
        ereignisse: mpsc::Sender<TransportEreignis>,
    ) -> Self {
        let laeuft = Arc::new(AtomicBool::new(true));
        let fertig = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(Mutex::new(FrameWarteschlange::neu(kappe)));
        let intervall = Schrittmacher::fuer_fps(fps).dauer();

        let tasks = vec![
            tokio::spawn(dekodier_loop(
                frame_quelle,
                ersatz,
                Arc::clone(&queue),
                Arc::clone(&laeuft),
                Arc::clone(&fertig),
                schleife,
                intervall,
                kappe,
                ereignisse.clone(),
            )),
            tokio::spawn(abspiel_loop(
                Arc::clone(&queue),
                senke,
                Arc::clone(&laeuft),
                Arc::clone(&fertig),
                fps,
                ereignisse,
            )),
        ];

        Self {
            laeuft,
            bereinigt: Arc::new(AtomicBool::new(false)),
            fertig,
            queue,
            tasks: Mutex::new(tasks),
        }
    }

    /// Laeuft die Pipeline noch?
    pub fn laeuft(&self) -> bool {
        self.laeuft.load(Ordering::Relaxed) && !self.bereinigt.load(Ordering::Relaxed)
    }

    /// Hat der Dekodierpfad das Streamende erreicht?
    pub fn fertig(&self) -> bool {
        self.fertig.load(Ordering::Relaxed)
    }

    /// Baut die Pipeline ab
    ///
    /// Viele Rueckrufe duerfen gleichzeitig anstossen; nur der erste
    /// Aufruf raeumt auf (Tasks, Warteschlange, Subprozess via
    /// kill_on_drop).
    pub async fn bereinigen(&self) {
        if self.bereinigt.swap(true, Ordering::SeqCst) {
            return;
        }
        self.laeuft.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.queue.lock().leeren();
        debug!("Video-Pipeline bereinigt");
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Dekodiert Samples in die Warteschlange; am Streamende Schleife oder Ende
#[allow(clippy::too_many_arguments)]
async fn dekodier_loop(
    mut frame_quelle: Box<dyn FrameQuelle>,
    mut ersatz: Option<(FfmpegKonfig, f32)>,
    queue: Arc<Mutex<FrameWarteschlange<VideoFrameI420>>>,
    laeuft: Arc<AtomicBool>,
    fertig: Arc<AtomicBool>,
    schleife: bool,
    intervall: Duration,
    kappe: usize,
    ereignisse: mpsc::Sender<TransportEreignis>,
) {
    // Zeitbasis ueber Schleifendurchlaeufe hinweg
    let mut basis_ms = 0u64;
    let mut letzte_ms = 0u64;

    loop {
        if !laeuft.load(Ordering::Relaxed) {
            break;
        }
        // Die Warteschlange nicht ueberrennen: bei voller Kappe kurz warten
        if queue.lock().laenge() >= kappe {
            tokio::time::sleep(intervall).await;
            continue;
        }

        match frame_quelle.naechstes().await {
            Ok(Some((zeit_ms, frame))) => {
                letzte_ms = basis_ms + zeit_ms;
                queue.lock().einreihen(letzte_ms, frame);
            }
            Ok(None) => {
                if !schleife {
                    debug!("Streamende erreicht");
                    break;
                }
                // Schleife: Demuxer/Decoder neu aufsetzen, Track bleibt offen
                basis_ms = letzte_ms + intervall.as_millis().max(1) as u64;
                if let Err(e) = frame_quelle.zuruecksetzen().await {
                    let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                        "Schleifen-Neustart fehlgeschlagen: {}",
                        e
                    )));
                    break;
                }
                debug!(basis_ms, "Schleife: Wiedergabe beginnt von vorn");
            }
            Err(e) => {
                // Instabiler In-Prozess-Decoder: einmalig auf den
                // Subprozess wechseln, gleiche Takt- und Schleifenvertraege
                if let Some((konfig, fps)) = ersatz.take() {
                    warn!(fehler = %e, "Decoder instabil, wechsle auf FFmpeg-Subprozess");
                    match SubprozessQuelle::starten(konfig, fps).await {
                        Ok(neu) => {
                            frame_quelle = Box::new(neu);
                            basis_ms = letzte_ms;
                            continue;
                        }
                        Err(e2) => {
                            let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                                "Subprozess-Fallback fehlgeschlagen: {}",
                                e2
                            )));
                            break;
                        }
                    }
                }
                let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                    "Videodecoder: {}",
                    e
                )));
                break;
            }
        }
    }

    fertig.store(true, Ordering::SeqCst);
    debug!("Dekodier-Loop beendet");
}

/// Liefert hoechstens ein Frame je Tick an die Senke
async fn abspiel_loop(
    queue: Arc<Mutex<FrameWarteschlange<VideoFrameI420>>>,
    senke: Arc<dyn VideoSenke>,
    laeuft: Arc<AtomicBool>,
    fertig: Arc<AtomicBool>,
    fps: f32,
    ereignisse: mpsc::Sender<TransportEreignis>,
) {
    let mut takt = Schrittmacher::fuer_fps(fps);
    let intervall_ms = takt.dauer().as_millis().max(1) as u64;
    let start = tokio::time::Instant::now();

    loop {
        takt.tick().await;
        if !laeuft.load(Ordering::Relaxed) {
            break;
        }
        let vergangen = start.elapsed().as_millis() as u64;

        let eintrag = {
            let mut q = queue.lock();
            // Rueckstand: abgelaufene Frames verwerfen statt sie als
            // Salve nachzuliefern; das juengste bleibt immer abspielbar
            let mut verworfen = 0u32;
            while q.laenge() > 1 {
                match q.vorderster_zeitstempel() {
                    Some(ts) if ts + intervall_ms < vergangen => {
                        q.entnehmen();
                        verworfen += 1;
                    }
                    _ => break,
                }
            }
            if verworfen > 0 {
                debug!(verworfen, "Abgelaufene Frames verworfen (Resynchronisation)");
            }
            q.entnehmen()
        };

        match eintrag {
            Some((zeit_ms, frame)) => {
                // "Laeuft noch"-Pruefung unmittelbar vor dem Schreiben in
                // die geteilte Senke
                if !laeuft.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = senke.frame_abliefern(&frame, zeit_ms as i64 * 1000) {
                    let _ = ereignisse.try_send(TransportEreignis::Fehler(format!(
                        "Video-Senke: {}",
                        e
                    )));
                    break;
                }
            }
            None => {
                if fertig.load(Ordering::Relaxed) {
                    debug!("Videowiedergabe sauber beendet");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_frame(markierung: u8) -> VideoFrameI420 {
        VideoFrameI420 {
            breite: 4,
            hoehe: 4,
            y: vec![markierung; 16],
            u: vec![markierung; 4],
            v: vec![markierung; 4],
        }
    }

    /// Frame-Quelle mit fester Frameliste und Reset-Zaehler
    struct TestQuelle {
        frames: Vec<(u64, VideoFrameI420)>,
        pos: usize,
        resets: Arc<AtomicUsize>,
    }

    impl TestQuelle {
        fn neu(anzahl: usize, intervall_ms: u64) -> (Self, Arc<AtomicUsize>) {
            let resets = Arc::new(AtomicUsize::new(0));
            let frames = (0..anzahl)
                .map(|i| (i as u64 * intervall_ms, test_frame(i as u8)))
                .collect();
            (
                Self {
                    frames,
                    pos: 0,
                    resets: Arc::clone(&resets),
                },
                resets,
            )
        }
    }

    #[async_trait]
    impl FrameQuelle for TestQuelle {
        async fn naechstes(&mut self) -> MedienResult<Option<(u64, VideoFrameI420)>> {
            match self.frames.get(self.pos) {
                Some(eintrag) => {
                    self.pos += 1;
                    Ok(Some(eintrag.clone()))
                }
                None => Ok(None),
            }
        }

        async fn zuruecksetzen(&mut self) -> MedienResult<()> {
            self.pos = 0;
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Senke, die abgelieferte Frames einsammelt
    #[derive(Default)]
    struct TestSenke {
        frames: Mutex<Vec<i64>>,
    }

    impl VideoSenke for TestSenke {
        fn frame_abliefern(&self, _frame: &VideoFrameI420, zeitstempel_us: i64) -> Result<()> {
            self.frames.lock().push(zeitstempel_us);
            Ok(())
        }
    }

    fn pipeline_bauen(
        anzahl: usize,
        schleife: bool,
        fps: f32,
        kappe: usize,
    ) -> (VideoPipeline, Arc<TestSenke>, Arc<AtomicUsize>) {
        let intervall_ms = (1000.0 / fps) as u64;
        let (quelle, resets) = TestQuelle::neu(anzahl, intervall_ms);
        let senke = Arc::new(TestSenke::default());
        let (ereignis_tx, _ereignis_rx) = mpsc::channel(64);
        let pipeline = VideoPipeline::mit_quelle(
            Box::new(quelle),
            None,
            Arc::clone(&senke) as Arc<dyn VideoSenke>,
            schleife,
            fps,
            kappe,
            ereignis_tx,
        );
        (pipeline, senke, resets)
    }

    #[tokio::test(start_paused = true)]
    async fn schleife_setzt_quelle_zurueck_ohne_die_pipeline_zu_schliessen() {
        let (pipeline, senke, resets) = pipeline_bauen(3, true, 50.0, 8);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let geliefert = senke.frames.lock().len();
        assert!(
            geliefert > 3,
            "Unter Schleife muessen mehr Frames fliessen als die Quelle hat ({})",
            geliefert
        );
        assert!(
            resets.load(Ordering::SeqCst) >= 1,
            "Die Quelle muss mindestens einmal zurueckgesetzt worden sein"
        );
        assert!(pipeline.laeuft(), "Die Pipeline darf unter Schleife nie enden");

        pipeline.bereinigen().await;
        let stand = senke.frames.lock().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            senke.frames.lock().len(),
            stand,
            "Nach der Bereinigung duerfen keine Frames mehr fliessen"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ohne_schleife_endet_die_wiedergabe_sauber() {
        let (pipeline, senke, resets) = pipeline_bauen(3, false, 50.0, 8);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(senke.frames.lock().len(), 3, "Genau die drei Frames");
        assert_eq!(resets.load(Ordering::SeqCst), 0);
        assert!(pipeline.fertig());
        pipeline.bereinigen().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hoechstens_ein_frame_je_tick() {
        // 20 Frames liegen sofort bereit; bei 50 fps duerfen nach 100 ms
        // nur etwa 5 abgeliefert sein – nie eine Salve
        let (pipeline, senke, _resets) = pipeline_bauen(20, false, 50.0, 32);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let geliefert = senke.frames.lock().len();
        assert!(
            geliefert <= 7,
            "Abspieltakt verletzt: {} Frames in 100 ms",
            geliefert
        );
        assert!(geliefert >= 3, "Takt liefert zu langsam: {}", geliefert);
        pipeline.bereinigen().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bereinigen_ist_idempotent() {
        let (pipeline, _senke, _resets) = pipeline_bauen(3, true, 50.0, 8);
        pipeline.bereinigen().await;
        pipeline.bereinigen().await;
        pipeline.bereinigen().await;
        assert!(!pipeline.laeuft());
    }

    #[tokio::test(start_paused = true)]
    async fn zeitstempel_wachsen_ueber_schleifengrenzen() {
        let (pipeline, senke, _resets) = pipeline_bauen(2, true, 50.0, 8);

        tokio::time::sleep(Duration::from_millis(300)).await;
        pipeline.bereinigen().await;

        let frames = senke.frames.lock().clone();
        assert!(frames.len() > 2);
        for paar in frames.windows(2) {
            assert!(
                paar[1] > paar[0],
                "Zeitstempel muessen auch ueber die Schleife hinweg steigen"
            );
        }
    }
}
