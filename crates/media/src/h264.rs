//! H.264: Decoder-Konfiguration und In-Prozess-Decode
//!
//! MP4 speichert H.264 laengenpraefixiert plus eine avcC-Konfigurationsbox
//! (Profil/Level/SPS/PPS). Der Decoder erwartet sein eigenes Framing:
//! `AvcKonfiguration` wird aus der Box synthetisiert, primt den Decoder
//! mit den Parameter-Sets und ueberfuehrt jedes Sample aus dem
//! Laengenpraefix- in das Decoder-Framing.

use crate::error::{MedienFehler, MedienResult};

/// Startcode, der im Decoder-Framing jede NAL-Einheit einleitet
const STARTCODE: [u8; 4] = [0, 0, 0, 1];

// ---------------------------------------------------------------------------
// AvcKonfiguration
// ---------------------------------------------------------------------------

/// Decoder-Konfiguration aus der avcC-Box des Containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcKonfiguration {
    /// AVC-Profil (z.B. 66 = Baseline, 100 = High)
    pub profil: u8,
    /// Profil-Kompatibilitaetsbits
    pub kompatibilitaet: u8,
    /// AVC-Level (z.B. 30 = Level 3.0)
    pub level: u8,
    /// Breite des Laengenpraefixes der Samples in Bytes (1, 2 oder 4)
    pub nal_laengen_groesse: usize,
    /// Sequence Parameter Sets
    pub sps: Vec<Vec<u8>>,
    /// Picture Parameter Sets
    pub pps: Vec<Vec<u8>>,
}

impl AvcKonfiguration {
    /// Parst den Inhalt einer avcC-Box
    ///
    /// # Fehler
    /// - `Container` bei falscher Version, unsinniger Praefixbreite oder
    ///   abgeschnittenen Parameter-Sets
    pub fn parse(avcc: &[u8]) -> MedienResult<Self> {
        if avcc.len() < 7 {
            return Err(MedienFehler::Container("avcC-Box zu kurz".into()));
        }
        if avcc[0] != 1 {
            return Err(MedienFehler::Container(format!(
                "Unbekannte avcC-Version: {}",
                avcc[0]
            )));
        }

        let profil = avcc[1];
        let kompatibilitaet = avcc[2];
        let level = avcc[3];
        let nal_laengen_groesse = (avcc[4] & 0x03) as usize + 1;
        if nal_laengen_groesse == 3 {
            return Err(MedienFehler::Container(
                "NAL-Laengenpraefix von 3 Bytes ist unzulaessig".into(),
            ));
        }

        let mut pos = 5usize;
        let sps_anzahl = (avcc[pos] & 0x1F) as usize;
        pos += 1;
        let sps = parameter_sets(avcc, &mut pos, sps_anzahl)?;

        let pps_anzahl = *avcc
            .get(pos)
            .ok_or_else(|| MedienFehler::Container("avcC: PPS-Anzahl fehlt".into()))?
            as usize;
        pos += 1;
        let pps = parameter_sets(avcc, &mut pos, pps_anzahl)?;

        if sps.is_empty() || pps.is_empty() {
            return Err(MedienFehler::Container(
                "avcC ohne SPS oder PPS".into(),
            ));
        }

        Ok(Self {
            profil,
            kompatibilitaet,
            level,
            nal_laengen_groesse,
            sps,
            pps,
        })
    }

    /// Vorspann im Decoder-Framing: alle SPS/PPS mit Startcodes
    ///
    /// Wird dem Decoder einmal vor dem ersten Sample zugefuehrt.
    pub fn vorspann(&self) -> Vec<u8> {
        let mut v = Vec::new();
        for nal in self.sps.iter().chain(self.pps.iter()) {
            v.extend_from_slice(&STARTCODE);
            v.extend_from_slice(nal);
        }
        v
    }

    /// Ueberfuehrt ein laengenpraefixiertes Sample ins Decoder-Framing
    ///
    /// # Fehler
    /// - `Container` wenn ein Laengenpraefix ueber das Sample hinauszeigt
    pub fn sample_umrahmen(&self, sample: &[u8]) -> MedienResult<Vec<u8>> {
        let mut umgerahmt = Vec::with_capacity(sample.len() + 8);
        let mut pos = 0usize;
        while pos < sample.len() {
            let praefix = sample
                .get(pos..pos + self.nal_laengen_groesse)
                .ok_or_else(|| {
                    MedienFehler::Container("NAL-Laengenpraefix abgeschnitten".into())
                })?;
            let laenge = praefix.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
            pos += self.nal_laengen_groesse;

            let nal = sample.get(pos..pos + laenge).ok_or_else(|| {
                MedienFehler::Container(format!(
                    "NAL-Einheit ({} Bytes) laenger als das Sample",
                    laenge
                ))
            })?;
            pos += laenge;

            umgerahmt.extend_from_slice(&STARTCODE);
            umgerahmt.extend_from_slice(nal);
        }
        Ok(umgerahmt)
    }
}

fn parameter_sets(avcc: &[u8], pos: &mut usize, anzahl: usize) -> MedienResult<Vec<Vec<u8>>> {
    let mut sets = Vec::with_capacity(anzahl);
    for _ in 0..anzahl {
        let laenge = avcc
            .get(*pos..*pos + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| MedienFehler::Container("avcC: Set-Laenge fehlt".into()))?;
        *pos += 2;
        let set = avcc
            .get(*pos..*pos + laenge)
            .ok_or_else(|| MedienFehler::Container("avcC: Parameter-Set abgeschnitten".into()))?;
        *pos += laenge;
        sets.push(set.to_vec());
    }
    Ok(sets)
}

// ---------------------------------------------------------------------------
// VideoFrameI420
// ---------------------------------------------------------------------------

/// Unkomprimiertes planares Videoframe (I420)
///
/// Die Ebenen sind dicht gepackt (Stride = Breite bzw. Breite/2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrameI420 {
    pub breite: usize,
    pub hoehe: usize,
    /// Luma-Ebene, `breite × hoehe` Bytes
    pub y: Vec<u8>,
    /// Chroma-U, `(breite/2) × (hoehe/2)` Bytes
    pub u: Vec<u8>,
    /// Chroma-V, `(breite/2) × (hoehe/2)` Bytes
    pub v: Vec<u8>,
}

// ---------------------------------------------------------------------------
// VideoDecoder-Trait
// ---------------------------------------------------------------------------

/// Gemeinsame Schnittstelle des In-Prozess-Decoders, des Subprozess-
/// Fallbacks und der Test-Doubles der Video-Pipeline
pub trait VideoDecoder: Send {
    /// Dekodiert ein Container-Sample; `None` solange der Decoder noch
    /// kein Bild ausgibt (Aufwaermen, B-Frame-Verzoegerung)
    fn dekodieren(&mut self, sample: &[u8]) -> MedienResult<Option<VideoFrameI420>>;

    /// Setzt den Decoder fuer den Schleifenbetrieb auf den Anfang zurueck
    fn zuruecksetzen(&mut self) -> MedienResult<()>;
}

// ---------------------------------------------------------------------------
// H264Decoder (openh264)
// ---------------------------------------------------------------------------

/// In-Prozess-H.264-Decoder auf Basis von openh264
pub struct H264Decoder {
    decoder: openh264::decoder::Decoder,
    konfig: AvcKonfiguration,
    vorspann_gesendet: bool,
}

impl H264Decoder {
    /// Erstellt einen Decoder fuer die gegebene Konfiguration
    pub fn neu(konfig: AvcKonfiguration) -> MedienResult<Self> {
        let decoder = openh264::decoder::Decoder::new(openh264::OpenH264API::from_source())
            .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;
        tracing::debug!(
            profil = konfig.profil,
            level = konfig.level,
            "H264Decoder erstellt"
        );
        Ok(Self {
            decoder,
            konfig,
            vorspann_gesendet: false,
        })
    }
}

impl VideoDecoder for H264Decoder {
    fn dekodieren(&mut self, sample: &[u8]) -> MedienResult<Option<VideoFrameI420>> {
        if !self.vorspann_gesendet {
            let vorspann = self.konfig.vorspann();
            // Parameter-Sets liefern kein Bild; Fehler hier sind fatal
            self.decoder
                .decode(&vorspann)
                .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;
            self.vorspann_gesendet = true;
        }

        let umgerahmt = self.konfig.sample_umrahmen(sample)?;
        let yuv = self
            .decoder
            .decode(&umgerahmt)
            .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;

        Ok(yuv.map(|yuv| frame_kopieren(&yuv)))
    }

    fn zuruecksetzen(&mut self) -> MedienResult<()> {
        self.decoder = openh264::decoder::Decoder::new(openh264::OpenH264API::from_source())
            .map_err(|e| MedienFehler::CodecFehler(e.to_string()))?;
        self.vorspann_gesendet = false;
        Ok(())
    }
}

/// Kopiert die gestrideten Decoder-Ebenen in dicht gepackte Puffer
fn frame_kopieren(yuv: &openh264::decoder::DecodedYUV<'_>) -> VideoFrameI420 {
    let (breite, hoehe) = yuv.dimension_y();
    let (stride_y, stride_u, stride_v) = yuv.strides_yuv();
    let (chroma_breite, chroma_hoehe) = yuv.dimension_u();

    let mut y = Vec::with_capacity(breite * hoehe);
    for zeile in 0..hoehe {
        y.extend_from_slice(&yuv.y_with_stride()[zeile * stride_y..zeile * stride_y + breite]);
    }
    let mut u = Vec::with_capacity(chroma_breite * chroma_hoehe);
    for zeile in 0..chroma_hoehe {
        u.extend_from_slice(
            &yuv.u_with_stride()[zeile * stride_u..zeile * stride_u + chroma_breite],
        );
    }
    let mut v = Vec::with_capacity(chroma_breite * chroma_hoehe);
    for zeile in 0..chroma_hoehe {
        v.extend_from_slice(
            &yuv.v_with_stride()[zeile * stride_v..zeile * stride_v + chroma_breite],
        );
    }

    VideoFrameI420 {
        breite,
        hoehe,
        y,
        u,
        v,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
