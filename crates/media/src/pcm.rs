//! PCM-Utilities des SFU-Audio-Pfads
//!
//! Drei kleine Bausteine zwischen Opus-Decoder und publiziertem Track:
//! - `LautstaerkeRegler`: 0–200 % Skalar mit Glaettung (keine Klicks)
//! - `dithered_i16`: f32 → 16-Bit-PCM mit TPDF-Dithering
//! - `FrameSammler`: sammelt beliebig lange PCM-Stuecke zu festen
//!   10-ms/480-Sample-Frames

use rand::Rng;

/// Lautstaerke-Regler fuer einen Abspielstrom
///
/// Der Zielwert wird geklemmt auf 0.0..2.0 (0–200 %); `anwenden` naehert
/// die wirksame Lautstaerke geglaettet an den Zielwert an.
pub struct LautstaerkeRegler {
    aktuell: f32,
    ziel: f32,
    glaettung: f32,
}

impl LautstaerkeRegler {
    /// Erstellt einen Regler mit Normal-Lautstaerke (1.0)
    pub fn neu() -> Self {
        Self {
            aktuell: 1.0,
            ziel: 1.0,
            glaettung: 0.995,
        }
    }

    /// Setzt die Ziel-Lautstaerke (geklemmt auf 0.0..2.0)
    pub fn setzen(&mut self, lautstaerke: f32) {
        self.ziel = lautstaerke.clamp(0.0, 2.0);
    }

    /// Gibt die Ziel-Lautstaerke zurueck
    pub fn holen(&self) -> f32 {
        self.ziel
    }

    /// Wendet die Lautstaerke auf einen Sample-Puffer an (mit Glaettung)
    pub fn anwenden(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            self.aktuell = self.glaettung * self.aktuell + (1.0 - self.glaettung) * self.ziel;
            *s *= self.aktuell;
        }
    }
}

impl Default for LautstaerkeRegler {
    fn default() -> Self {
        Self::neu()
    }
}

/// Konvertiert f32-PCM (-1.0..1.0) zu 16-Bit-PCM mit TPDF-Dithering
///
/// Das Dreiecks-Rauschen (±1 LSB) dekorreliert den Quantisierungsfehler;
/// Uebersteuerung wird vor der Rundung geklemmt.
pub fn dithered_i16(samples: &[f32]) -> Vec<i16> {
    let mut rng = rand::thread_rng();
    samples
        .iter()
        .map(|&s| {
            let dither = (rng.gen::<f32>() - rng.gen::<f32>()) / 32768.0;
            let skaliert = (s + dither).clamp(-1.0, 1.0) * 32767.0;
            skaliert.round() as i16
        })
        .collect()
}

/// Sammelt interleaved PCM zu Frames fester Groesse
///
/// Der SFU-Audio-Pfad publiziert feste 10-ms-Frames (480 Samples pro
/// Kanal); Opus-Pakete aus dem Demuxer sind aber 10 oder 20 ms lang.
pub struct FrameSammler {
    puffer: Vec<i16>,
    /// Samples pro Kanal eines fertigen Frames
    frame_samples: usize,
    kanaele: usize,
}

impl FrameSammler {
    /// Erstellt einen Sammler fuer Frames aus `frame_samples` Samples pro Kanal
    pub fn neu(frame_samples: usize, kanaele: usize) -> Self {
        Self {
            puffer: Vec::with_capacity(frame_samples * kanaele * 2),
            frame_samples,
            kanaele,
        }
    }

    /// Haengt interleaved Samples an
    pub fn schieben(&mut self, samples: &[i16]) {
        self.puffer.extend_from_slice(samples);
    }

    /// Entnimmt den naechsten vollstaendigen Frame, falls vorhanden
    pub fn naechster_frame(&mut self) -> Option<Vec<i16>> {
        let benoetigt = self.frame_samples * self.kanaele;
        if self.puffer.len() < benoetigt {
            return None;
        }
        Some(self.puffer.drain(..benoetigt).collect())
    }

    /// Anzahl gepufferter Samples (interleaved)
    pub fn gepuffert(&self) -> usize {
        self.puffer.len()
    }

    /// Verwirft alle gepufferten Samples
    pub fn leeren(&mut self) {
        self.puffer.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lautstaerke_klemmt_auf_0_bis_200_prozent() {
        let mut regler = LautstaerkeRegler::neu();
        regler.setzen(3.5);
        assert_eq!(regler.holen(), 2.0);
        regler.setzen(-1.0);
        assert_eq!(regler.holen(), 0.0);
    }

    #[test]
    fn lautstaerke_naehert_sich_dem_ziel() {
        let mut regler = LautstaerkeRegler::neu();
        regler.setzen(0.0);
        let mut samples = vec![1.0f32; 48_000];
        regler.anwenden(&mut samples);
        // Nach einer Sekunde Material muss der Pegel praktisch am Ziel sein
        assert!(samples[samples.len() - 1].abs() < 0.001);
        // Der Uebergang beginnt nahe der Ausgangslautstaerke
        assert!(samples[0] > 0.9);
    }

    #[test]
    fn dithering_bleibt_im_wertebereich() {
        let samples = vec![1.0f32, -1.0, 0.0, 0.5, -0.5, 2.0, -2.0];
        let konvertiert = dithered_i16(&samples);
        assert_eq!(konvertiert.len(), samples.len());
        // Uebersteuerte Eingaben duerfen nicht wrappen
        assert!(konvertiert[5] > 32000);
        assert!(konvertiert[6] < -32000);
    }

    #[test]
    fn dithering_stille_bleibt_nahe_null() {
        let samples = vec![0.0f32; 1000];
        let konvertiert = dithered_i16(&samples);
        for s in konvertiert {
            assert!(s.abs() <= 1, "Dither darf Stille maximal um 1 LSB verschieben");
        }
    }

    #[test]
    fn frame_sammler_feste_frames() {
        let mut sammler = FrameSammler::neu(480, 2);
        // 960 interleaved Samples = genau ein 480er-Stereo-Frame
        sammler.schieben(&vec![7i16; 960]);
        let frame = sammler.naechster_frame().expect("Frame erwartet");
        assert_eq!(frame.len(), 960);
        assert!(sammler.naechster_frame().is_none());
    }

    #[test]
    fn frame_sammler_teilt_grosse_stuecke() {
        let mut sammler = FrameSammler::neu(480, 2);
        // Ein 20-ms-Paket (1920 interleaved) ergibt zwei 10-ms-Frames
        sammler.schieben(&vec![1i16; 1920]);
        assert!(sammler.naechster_frame().is_some());
        assert!(sammler.naechster_frame().is_some());
        assert!(sammler.naechster_frame().is_none());
        assert_eq!(sammler.gepuffert(), 0);
    }

    #[test]
    fn frame_sammler_sammelt_ueber_grenzen() {
        let mut sammler = FrameSammler::neu(480, 2);
        sammler.schieben(&vec![1i16; 500]);
        assert!(sammler.naechster_frame().is_none());
        sammler.schieben(&vec![2i16; 460]);
        let frame = sammler.naechster_frame().expect("Frame erwartet");
        assert_eq!(frame.len(), 960);
        assert_eq!(sammler.gepuffert(), 0);
    }
}
