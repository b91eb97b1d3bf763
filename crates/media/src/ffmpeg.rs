//! FFmpeg-Subprozess als Video-Fallback
//!
//! Wenn der In-Prozess-Decoder nicht verfuegbar ist oder das Material
//! nicht traegt (fremder Codec, Decodefehler), liest die Video-Pipeline
//! rohe I420-Frames aus der Standardausgabe eines FFmpeg-Kindprozesses.
//! Takt, Warteschlange und Schleifenvertrag bleiben identisch zum
//! In-Prozess-Pfad; das Prozessende ist entweder ein regulaerer Abschluss
//! oder – unter Schleife – der Ausloeser fuer einen Neustart.

use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{MedienFehler, MedienResult};
use crate::h264::VideoFrameI420;

/// Eingabequelle des Subprozesses
#[derive(Debug, Clone)]
pub enum FfmpegEingabe {
    /// FFmpeg holt die Quelle selbst (HTTP/Datei)
    Url(String),
    /// Containerbytes werden ueber stdin zugefuehrt
    Puffer(Vec<u8>),
}

/// Konfiguration des Fallback-Prozesses
#[derive(Debug, Clone)]
pub struct FfmpegKonfig {
    pub eingabe: FfmpegEingabe,
    /// Zielbreite (FFmpeg skaliert falls noetig)
    pub breite: usize,
    /// Zielhoehe
    pub hoehe: usize,
}

/// Liest rohe I420-Frames aus einem FFmpeg-Kindprozess
pub struct FfmpegRohVideo {
    kind: Child,
    stdout: BufReader<ChildStdout>,
    breite: usize,
    hoehe: usize,
    frame_groesse: usize,
    /// Haelt die stdin-Schreib-Task am Leben (Puffer-Eingabe)
    _stdin_task: Option<tokio::task::JoinHandle<()>>,
}

impl FfmpegRohVideo {
    /// Startet den Kindprozess
    ///
    /// # Fehler
    /// - `Prozess` wenn die ffmpeg-Binary nicht startbar ist
    pub async fn starten(konfig: &FfmpegKonfig) -> MedienResult<Self> {
        let eingabe_arg = match &konfig.eingabe {
            FfmpegEingabe::Url(url) => url.clone(),
            FfmpegEingabe::Puffer(_) => "pipe:0".to_string(),
        };

        let mut befehl = Command::new("ffmpeg");
        befehl
            .arg("-hide_banner")
            .args(["-loglevel", "error"])
            .args(["-i", &eingabe_arg])
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-s", &format!("{}x{}", konfig.breite, konfig.hoehe)])
            .arg("pipe:1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if matches!(konfig.eingabe, FfmpegEingabe::Puffer(_)) {
            befehl.stdin(Stdio::piped());
        } else {
            befehl.stdin(Stdio::null());
        }

        let mut kind = befehl
            .spawn()
            .map_err(|e| MedienFehler::Prozess(format!("ffmpeg nicht startbar: {}", e)))?;

        let stdout = kind
            .stdout
            .take()
            .ok_or_else(|| MedienFehler::Prozess("ffmpeg ohne stdout".into()))?;

        // Puffer-Eingabe asynchron zufuehren; das Schliessen von stdin
        // signalisiert FFmpeg das Eingabeende
        let stdin_task = if let FfmpegEingabe::Puffer(puffer) = &konfig.eingabe {
            let mut stdin = kind
                .stdin
                .take()
                .ok_or_else(|| MedienFehler::Prozess("ffmpeg ohne stdin".into()))?;
            let puffer = puffer.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&puffer).await {
                    warn!(fehler = %e, "FFmpeg-stdin-Schreiben abgebrochen");
                }
                let _ = stdin.shutdown().await;
            }))
        } else {
            None
        };

        debug!(
            breite = konfig.breite,
            hoehe = konfig.hoehe,
            "FFmpeg-Fallback gestartet"
        );

        Ok(Self {
            kind,
            stdout: BufReader::new(stdout),
            breite: konfig.breite,
            hoehe: konfig.hoehe,
            frame_groesse: konfig.breite * konfig.hoehe * 3 / 2,
            _stdin_task: stdin_task,
        })
    }

    /// Liest das naechste I420-Frame; `None` wenn der Prozess fertig ist
    pub async fn naechstes_frame(&mut self) -> MedienResult<Option<VideoFrameI420>> {
        let mut roh = vec![0u8; self.frame_groesse];
        match self.stdout.read_exact(&mut roh).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Prozessende: Abschluss bzw. Neustart-Ausloeser der Pipeline
                return Ok(None);
            }
            Err(e) => return Err(MedienFehler::Io(e)),
        }

        let luma = self.breite * self.hoehe;
        let chroma = luma / 4;
        Ok(Some(VideoFrameI420 {
            breite: self.breite,
            hoehe: self.hoehe,
            y: roh[..luma].to_vec(),
            u: roh[luma..luma + chroma].to_vec(),
            v: roh[luma + chroma..].to_vec(),
        }))
    }

    /// Beendet den Kindprozess (best effort, Fehler bewusst ignoriert)
    pub async fn beenden(mut self) {
        let _ = self.kind.start_kill();
        let _ = self.kind.wait().await;
        debug!("FFmpeg-Fallback beendet");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
