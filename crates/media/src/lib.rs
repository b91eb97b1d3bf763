//! palaver-media – Medienpfad des Voice-Subsystems
//!
//! Alles zwischen Containerbytes und sendefertigen Frames:
//! - Opus-Decoding (audiopus)
//! - WebM/EBML-Audio-Demuxer und ISO-BMFF-Video-Demuxer (handgeparst)
//! - H.264: avcC-Konfiguration, In-Prozess-Decoder (openh264),
//!   FFmpeg-Subprozess-Fallback
//! - PCM-Utilities (Dithering, Lautstaerke, Frame-Sammler)
//! - Geteilte Takt-/Warteschlangen-Primitiven der Transporte

pub mod error;
pub mod ffmpeg;
pub mod frame_queue;
pub mod h264;
pub mod mp4;
pub mod opus;
pub mod pcm;
pub mod takt;
pub mod webm;

// Bequeme Re-Exporte der wichtigsten Typen
pub use error::{MedienFehler, MedienResult};
pub use frame_queue::FrameWarteschlange;
pub use h264::{AvcKonfiguration, H264Decoder, VideoDecoder, VideoFrameI420};
pub use opus::OpusDecoder;
pub use pcm::{dithered_i16, FrameSammler, LautstaerkeRegler};
pub use takt::Schrittmacher;
