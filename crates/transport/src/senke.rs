//! Medien-Senken des SFU-Raum-Transports
//!
//! Die Pipelines schreiben ihre fertigen Frames in eine Senke. Im
//! Produktionspfad sind das die publizierten LiveKit-Quellen; die Traits
//! bilden die Naht fuer die Pipeline-Tests.

use async_trait::async_trait;
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::video_frame::{I420Buffer, VideoFrame, VideoRotation};
use livekit::webrtc::video_source::native::NativeVideoSource;
use palaver_core::{PalaverError, Result};
use palaver_media::h264::VideoFrameI420;
use palaver_media::opus::{ABTASTRATE, KANAELE};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Senke fuer fertige 10-ms-Audio-Frames (interleaved i16)
///
/// `frame_abliefern` suspendiert, wenn die Abspiel-Warteschlange der Senke
/// ihre Dauer-Schwelle ueberschreitet – das ist der Gegendruck, der die
/// Pipeline auf Echtzeit haelt.
#[async_trait]
pub trait AudioSenke: Send + Sync {
    async fn frame_abliefern(&self, pcm: Vec<i16>) -> Result<()>;
}

/// Senke fuer dekodierte I420-Videoframes
pub trait VideoSenke: Send + Sync {
    fn frame_abliefern(&self, frame: &VideoFrameI420, zeitstempel_us: i64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// LiveKit-Implementierungen
// ---------------------------------------------------------------------------

/// Audio-Senke auf einer publizierten LiveKit-Quelle
pub struct LiveKitAudioSenke {
    quelle: NativeAudioSource,
}

impl LiveKitAudioSenke {
    pub fn neu(quelle: NativeAudioSource) -> Self {
        Self { quelle }
    }
}

#[async_trait]
impl AudioSenke for LiveKitAudioSenke {
    async fn frame_abliefern(&self, pcm: Vec<i16>) -> Result<()> {
        let samples_pro_kanal = (pcm.len() / KANAELE) as u32;
        let frame = AudioFrame {
            data: pcm.into(),
            sample_rate: ABTASTRATE,
            num_channels: KANAELE as u32,
            samples_per_channel: samples_pro_kanal,
        };
        self.quelle
            .capture_frame(&frame)
            .await
            .map_err(|e| PalaverError::Verbindung(format!("Audio-Frame abgelehnt: {}", e)))
    }
}

/// Video-Senke auf einer publizierten LiveKit-Quelle
pub struct LiveKitVideoSenke {
    quelle: NativeVideoSource,
}

impl LiveKitVideoSenke {
    pub fn neu(quelle: NativeVideoSource) -> Self {
        Self { quelle }
    }
}

impl VideoSenke for LiveKitVideoSenke {
    fn frame_abliefern(&self, frame: &VideoFrameI420, zeitstempel_us: i64) -> Result<()> {
        let mut puffer = I420Buffer::new(frame.breite as u32, frame.hoehe as u32);
        let (stride_y, stride_u, stride_v) = puffer.strides();
        let (ziel_y, ziel_u, ziel_v) = puffer.data_mut();

        ebene_kopieren(&frame.y, frame.breite, ziel_y, stride_y as usize);
        ebene_kopieren(&frame.u, frame.breite / 2, ziel_u, stride_u as usize);
        ebene_kopieren(&frame.v, frame.breite / 2, ziel_v, stride_v as usize);

        self.quelle.capture_frame(&VideoFrame {
            rotation: VideoRotation::VideoRotation0,
            timestamp_us: zeitstempel_us,
            buffer: puffer,
        });
        Ok(())
    }
}

/// Kopiert eine dicht gepackte Ebene zeilenweise in einen gestrideten Puffer
fn ebene_kopieren(quelle: &[u8], zeilen_breite: usize, ziel: &mut [u8], stride: usize) {
    for (zeile, quell_zeile) in quelle.chunks_exact(zeilen_breite).enumerate() {
        let ziel_start = zeile * stride;
        ziel[ziel_start..ziel_start + zeilen_breite].copy_from_slice(quell_zeile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebene_kopieren_respektiert_den_stride() {
        let quelle = vec![1u8, 2, 3, 4, 5, 6]; // 2 Zeilen a 3 Bytes
        let mut ziel = vec![0u8; 10]; // Stride 5
        ebene_kopieren(&quelle, 3, &mut ziel, 5);
        assert_eq!(&ziel[0..3], &[1, 2, 3]);
        assert_eq!(&ziel[3..5], &[0, 0]);
        assert_eq!(&ziel[5..8], &[4, 5, 6]);
    }
}
