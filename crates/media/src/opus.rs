//! Opus-Decoder Wrapper
//!
//! Kapselt audiopus und stellt eine einfache f32-PCM basierte API bereit.
//! Der Voice-Pfad arbeitet durchgehend mit 48 kHz Stereo; die Frames aus
//! dem WebM-Demuxer sind 10 oder 20 ms lang.

use audiopus::{coder::Decoder, Channels, SampleRate};
use tracing::debug;

use crate::error::{MedienFehler, MedienResult};

/// Abtastrate des Voice-Pfads
pub const ABTASTRATE: u32 = 48_000;

/// Kanalanzahl des Voice-Pfads
pub const KANAELE: usize = 2;

/// Samples pro Kanal eines 20-ms-Frames
pub const FRAME_20MS: usize = 960;

/// Samples pro Kanal eines 10-ms-Frames
pub const FRAME_10MS: usize = 480;

/// Samples pro Kanal des laengsten gueltigen Opus-Frames (120 ms)
const FRAME_MAX: usize = 5760;

/// Opus-Decoder: dekodiert Opus-Bytes zu interleaved f32-PCM
pub struct OpusDecoder {
    decoder: Decoder,
}

impl OpusDecoder {
    /// Erstellt einen neuen Decoder (48 kHz, Stereo)
    pub fn neu() -> MedienResult<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;

        debug!("OpusDecoder erstellt: 48 kHz Stereo");

        Ok(Self { decoder })
    }

    /// Dekodiert ein Opus-Paket zu interleaved f32-PCM (-1.0..1.0)
    pub fn decode(&mut self, opus_daten: &[u8]) -> MedienResult<Vec<f32>> {
        let mut output = vec![0.0f32; FRAME_MAX * KANAELE];
        let dekodiert = self
            .decoder
            .decode_float(Some(opus_daten), &mut output, false)
            .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;

        output.truncate(dekodiert * KANAELE);
        Ok(output)
    }

    /// Dekodiert mit PLC (Packet Loss Concealment) wenn ein Paket fehlt
    pub fn decode_plc(&mut self) -> MedienResult<Vec<f32>> {
        let mut output = vec![0.0f32; FRAME_20MS * KANAELE];
        let dekodiert = self
            .decoder
            .decode_float(None::<&[u8]>, &mut output, false)
            .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;

        output.truncate(dekodiert * KANAELE);
        Ok(output)
    }
}
