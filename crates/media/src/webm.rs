//! Minimaler WebM/EBML-Demuxer fuer Opus-Audio
//!
//! Liest genau das, was der Voice-Pfad braucht: den Opus-Track aus den
//! Tracks-Metadaten und die Blocks aus den Clustern, als zeitgestempelte
//! Opus-Pakete. Kein Seeking, keine Cues, kein Lacing.
//!
//! ## EBML in Kuerze
//!
//! Jedes Element ist `ID (1-4 Bytes, vint mit Markerbits) + Groesse
//! (1-8 Bytes, vint ohne Markerbit) + Inhalt`. Unbekannte Groesse (alle
//! Wertbits 1) ist nur fuer das Segment erlaubt und heisst "bis zum Ende".

use crate::error::{MedienFehler, MedienResult};

// ---------------------------------------------------------------------------
// Element-IDs (mit Markerbits, wie im Standard notiert)
// ---------------------------------------------------------------------------

const EBML_KOPF: u32 = 0x1A45_DFA3;
const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const ZEITSKALA: u32 = 0x002A_D7B1;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_EINTRAG: u32 = 0xAE;
const TRACK_NUMMER: u32 = 0xD7;
const TRACK_TYP: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const CLUSTER: u32 = 0x1F43_B675;
const CLUSTER_ZEIT: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;
const BLOCK_GRUPPE: u32 = 0xA0;
const BLOCK: u32 = 0xA1;

/// Track-Typ "Audio"
const TRACK_TYP_AUDIO: u64 = 2;

/// Codec-Kennung des Opus-Tracks
const CODEC_OPUS: &str = "A_OPUS";

/// Standard-Zeitskala: 1 ms pro Tick (in Nanosekunden)
const STANDARD_ZEITSKALA: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// OpusPaket
// ---------------------------------------------------------------------------

/// Ein demuxtes Opus-Paket mit Abspiel-Zeitstempel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusPaket {
    /// Rohe Opus-Bytes (genau ein Opus-Frame)
    pub daten: Vec<u8>,
    /// Abspielzeitpunkt relativ zum Streambeginn
    pub zeitstempel_ms: u64,
}

// ---------------------------------------------------------------------------
// EBML-Leser
// ---------------------------------------------------------------------------

struct Leser<'a> {
    daten: &'a [u8],
    pos: usize,
}

impl<'a> Leser<'a> {
    fn neu(daten: &'a [u8]) -> Self {
        Self { daten, pos: 0 }
    }

    fn ist_ende(&self) -> bool {
        self.pos >= self.daten.len()
    }

    fn byte(&mut self) -> MedienResult<u8> {
        let b = *self
            .daten
            .get(self.pos)
            .ok_or_else(|| MedienFehler::Container("EBML endet unerwartet".into()))?;
        self.pos += 1;
        Ok(b)
    }

    /// Liest eine Element-ID (Markerbits bleiben erhalten)
    fn element_id(&mut self) -> MedienResult<u32> {
        let erster = self.byte()?;
        let laenge = erster.leading_zeros() as usize + 1;
        if laenge > 4 {
            return Err(MedienFehler::Container(format!(
                "Ungueltige Element-ID (erstes Byte {:#04x})",
                erster
            )));
        }
        let mut id = erster as u32;
        for _ in 1..laenge {
            id = (id << 8) | self.byte()? as u32;
        }
        Ok(id)
    }

    /// Liest eine Groessenangabe (Markerbit wird entfernt)
    ///
    /// `None` bedeutet "unbekannte Groesse".
    fn groesse(&mut self) -> MedienResult<Option<u64>> {
        let erster = self.byte()?;
        let laenge = erster.leading_zeros() as usize + 1;
        if laenge > 8 {
            return Err(MedienFehler::Container(
                "Ungueltige Groessenangabe".into(),
            ));
        }
        let marker = 1u64 << (8 - laenge);
        let mut wert = (erster as u64) & (marker - 1);
        let mut alle_einsen = wert == marker - 1;
        for _ in 1..laenge {
            let b = self.byte()?;
            alle_einsen = alle_einsen && b == 0xFF;
            wert = (wert << 8) | b as u64;
        }
        if alle_einsen {
            return Ok(None);
        }
        Ok(Some(wert))
    }

    /// Liest das naechste Element und gibt (ID, Inhalt) zurueck
    ///
    /// Unbekannte Groesse ist nur fuer das Segment zulaessig und liefert
    /// den Rest des Puffers.
    fn element(&mut self) -> MedienResult<(u32, &'a [u8])> {
        let id = self.element_id()?;
        let groesse = self.groesse()?;
        let inhalt = match groesse {
            Some(n) => {
                let n = n as usize;
                let ende = self.pos.checked_add(n).filter(|&e| e <= self.daten.len());
                let ende = ende.ok_or_else(|| {
                    MedienFehler::Container(format!(
                        "Element {:#x} laenger als der Container",
                        id
                    ))
                })?;
                let inhalt = &self.daten[self.pos..ende];
                self.pos = ende;
                inhalt
            }
            None if id == SEGMENT => {
                let inhalt = &self.daten[self.pos..];
                self.pos = self.daten.len();
                inhalt
            }
            None => {
                return Err(MedienFehler::Container(format!(
                    "Unbekannte Groesse fuer Element {:#x} nicht unterstuetzt",
                    id
                )));
            }
        };
        Ok((id, inhalt))
    }
}

/// Big-endian Unsigned aus 1-8 Inhaltbytes
fn uint(inhalt: &[u8]) -> MedienResult<u64> {
    if inhalt.is_empty() || inhalt.len() > 8 {
        return Err(MedienFehler::Container(
            "Ungueltige Unsigned-Laenge".into(),
        ));
    }
    Ok(inhalt.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

// ---------------------------------------------------------------------------
// Demuxer
// ---------------------------------------------------------------------------

/// Demuxt alle Opus-Pakete aus einem WebM-Puffer
///
/// # Fehler
/// - `Container` bei kaputtem EBML oder nicht unterstuetztem Lacing
/// - `KeinAudioTrack` wenn der Container keinen Opus-Track enthaelt
pub fn opus_pakete(daten: &[u8]) -> MedienResult<Vec<OpusPaket>> {
    let mut leser = Leser::neu(daten);

    let (id, _kopf) = leser.element()?;
    if id != EBML_KOPF {
        return Err(MedienFehler::Container(
            "Kein EBML/WebM-Container (Magic fehlt)".into(),
        ));
    }

    let (id, segment) = leser.element()?;
    if id != SEGMENT {
        return Err(MedienFehler::Container(
            "Segment-Element fehlt nach dem EBML-Kopf".into(),
        ));
    }

    let mut seg = Leser::neu(segment);
    let mut zeitskala = STANDARD_ZEITSKALA;
    let mut opus_track: Option<u64> = None;
    let mut pakete = Vec::new();

    while !seg.ist_ende() {
        let (id, inhalt) = seg.element()?;
        match id {
            INFO => {
                let mut info = Leser::neu(inhalt);
                while !info.ist_ende() {
                    let (id, inhalt) = info.element()?;
                    if id == ZEITSKALA {
                        zeitskala = uint(inhalt)?;
                    }
                }
            }
            TRACKS => {
                if opus_track.is_none() {
                    opus_track = opus_track_suchen(inhalt)?;
                }
            }
            CLUSTER => {
                let track = match opus_track {
                    Some(t) => t,
                    // Cluster vor den Track-Metadaten: nicht abspielbar
                    None => return Err(MedienFehler::KeinAudioTrack),
                };
                cluster_lesen(inhalt, track, zeitskala, &mut pakete)?;
            }
            _ => {} // SeekHead, Cues, Void, ... interessieren hier nicht
        }
    }

    if opus_track.is_none() {
        return Err(MedienFehler::KeinAudioTrack);
    }

    tracing::debug!(
        pakete = pakete.len(),
        zeitskala,
        "WebM demuxt"
    );
    Ok(pakete)
}

/// Sucht in den Tracks-Metadaten den Opus-Audiotrack
fn opus_track_suchen(inhalt: &[u8]) -> MedienResult<Option<u64>> {
    let mut tracks = Leser::neu(inhalt);
    while !tracks.ist_ende() {
        let (id, eintrag) = tracks.element()?;
        if id != TRACK_EINTRAG {
            continue;
        }
        let mut nummer = None;
        let mut typ = None;
        let mut codec = None;
        let mut felder = Leser::neu(eintrag);
        while !felder.ist_ende() {
            let (id, inhalt) = felder.element()?;
            match id {
                TRACK_NUMMER => nummer = Some(uint(inhalt)?),
                TRACK_TYP => typ = Some(uint(inhalt)?),
                CODEC_ID => codec = Some(String::from_utf8_lossy(inhalt).into_owned()),
                _ => {}
            }
        }
        if typ == Some(TRACK_TYP_AUDIO) && codec.as_deref() == Some(CODEC_OPUS) {
            return Ok(nummer);
        }
    }
    Ok(None)
}

/// Liest alle Blocks eines Clusters
fn cluster_lesen(
    inhalt: &[u8],
    track: u64,
    zeitskala: u64,
    pakete: &mut Vec<OpusPaket>,
) -> MedienResult<()> {
    let mut cluster = Leser::neu(inhalt);
    let mut cluster_zeit: u64 = 0;
    while !cluster.ist_ende() {
        let (id, inhalt) = cluster.element()?;
        match id {
            CLUSTER_ZEIT => cluster_zeit = uint(inhalt)?,
            SIMPLE_BLOCK => block_lesen(inhalt, track, cluster_zeit, zeitskala, pakete)?,
            BLOCK_GRUPPE => {
                let mut gruppe = Leser::neu(inhalt);
                while !gruppe.ist_ende() {
                    let (id, inhalt) = gruppe.element()?;
                    if id == BLOCK {
                        block_lesen(inhalt, track, cluster_zeit, zeitskala, pakete)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Liest einen (Simple-)Block: vint-Tracknummer, i16-Relativzeit, Flags, Daten
fn block_lesen(
    inhalt: &[u8],
    track: u64,
    cluster_zeit: u64,
    zeitskala: u64,
    pakete: &mut Vec<OpusPaket>,
) -> MedienResult<()> {
    let mut leser = Leser::neu(inhalt);
    let block_track = leser
        .groesse()?
        .ok_or_else(|| MedienFehler::Container("Ungueltige Block-Tracknummer".into()))?;
    if block_track != track {
        return Ok(()); // fremder Track (z.B. Video) – ueberspringen
    }

    let relativ = i16::from_be_bytes([leser.byte()?, leser.byte()?]);
    let flags = leser.byte()?;
    if flags & 0x06 != 0 {
        return Err(MedienFehler::Container(
            "Block-Lacing wird nicht unterstuetzt".into(),
        ));
    }

    let daten = inhalt[leser.pos..].to_vec();
    if daten.is_empty() {
        return Ok(());
    }

    let ticks = cluster_zeit as i64 + relativ as i64;
    let zeitstempel_ms = (ticks.max(0) as u64).saturating_mul(zeitskala) / 1_000_000;
    pakete.push(OpusPaket {
        daten,
        zeitstempel_ms,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Kodiert eine Element-ID in ihre Standard-Bytefolge
    fn id_bytes(id: u32) -> Vec<u8> {
        let mut bytes = id.to_be_bytes().to_vec();
        while bytes.len() > 1 && bytes[0] == 0 {
            bytes.remove(0);
        }
        bytes
    }

    /// Kodiert eine Groesse als 1-Byte-vint (reicht fuer die Tests)
    fn groesse_bytes(n: usize) -> Vec<u8> {
        assert!(n < 0x7F);
        vec![0x80 | n as u8]
    }

    fn element(id: u32, inhalt: &[u8]) -> Vec<u8> {
        let mut e = id_bytes(id);
        e.extend(groesse_bytes(inhalt.len()));
        e.extend_from_slice(inhalt);
        e
    }

    fn track_eintrag(nummer: u8, typ: u8, codec: &str) -> Vec<u8> {
        let mut eintrag = Vec::new();
        eintrag.extend(element(TRACK_NUMMER, &[nummer]));
        eintrag.extend(element(TRACK_TYP, &[typ]));
        eintrag.extend(element(CODEC_ID, codec.as_bytes()));
        element(TRACK_EINTRAG, &eintrag)
    }

    fn simple_block(track: u8, relativ_ms: i16, daten: &[u8]) -> Vec<u8> {
        let mut block = vec![0x80 | track];
        block.extend(relativ_ms.to_be_bytes());
        block.push(0x80); // Keyframe-Flag, kein Lacing
        block.extend_from_slice(daten);
        element(SIMPLE_BLOCK, &block)
    }

    /// Baut einen minimalen WebM-Container mit einem Opus-Track
    fn webm_bauen(bloecke: &[Vec<u8>]) -> Vec<u8> {
        let mut segment = Vec::new();
        segment.extend(element(TRACKS, &track_eintrag(1, 2, "A_OPUS")));

        let mut cluster = element(CLUSTER_ZEIT, &[0]);
        for b in bloecke {
            cluster.extend_from_slice(b);
        }
        segment.extend(element(CLUSTER, &cluster));

        let mut webm = element(EBML_KOPF, &[]);
        webm.extend(element(SEGMENT, &segment));
        webm
    }

    #[test]
    fn demuxt_opus_pakete_mit_zeitstempeln() {
        let webm = webm_bauen(&[
            simple_block(1, 0, &[0xAA, 0xBB]),
            simple_block(1, 20, &[0xCC]),
            simple_block(1, 40, &[0xDD, 0xEE, 0xFF]),
        ]);

        let pakete = opus_pakete(&webm).expect("Demux muss erfolgreich sein");
        assert_eq!(pakete.len(), 3);
        assert_eq!(pakete[0].daten, vec![0xAA, 0xBB]);
        assert_eq!(pakete[0].zeitstempel_ms, 0);
        assert_eq!(pakete[1].zeitstempel_ms, 20);
        assert_eq!(pakete[2].zeitstempel_ms, 40);
    }

    #[test]
    fn fremde_tracks_werden_uebersprungen() {
        let webm = webm_bauen(&[
            simple_block(1, 0, &[0x01]),
            simple_block(2, 0, &[0x02]), // Videotrack
            simple_block(1, 20, &[0x03]),
        ]);
        let pakete = opus_pakete(&webm).unwrap();
        assert_eq!(pakete.len(), 2);
    }

    #[test]
    fn kein_opus_track_ist_fehler() {
        let mut segment = Vec::new();
        segment.extend(element(TRACKS, &track_eintrag(1, 2, "A_VORBIS")));
        let mut webm = element(EBML_KOPF, &[]);
        webm.extend(element(SEGMENT, &segment));

        let result = opus_pakete(&webm);
        assert!(matches!(result, Err(MedienFehler::KeinAudioTrack)));
    }

    #[test]
    fn fehlendes_magic_ist_containerfehler() {
        let result = opus_pakete(&[0x00, 0x01, 0x02, 0x03]);
        assert!(matches!(result, Err(MedienFehler::Container(_))));
    }

    #[test]
    fn lacing_wird_abgelehnt() {
        // Flags-Byte mit gesetzten Lacing-Bits
        let mut block = vec![0x81, 0x00, 0x00, 0x02];
        block.extend_from_slice(&[0x01, 0x02]);
        let webm = webm_bauen(&[element(SIMPLE_BLOCK, &block)]);
        assert!(opus_pakete(&webm).is_err());
    }

    #[test]
    fn abgeschnittener_container_ist_fehler() {
        let webm = webm_bauen(&[simple_block(1, 0, &[0xAA])]);
        let result = opus_pakete(&webm[..webm.len() - 2]);
        assert!(result.is_err());
    }

    #[test]
    fn cluster_zeit_fliesst_in_die_zeitstempel_ein() {
        let mut segment = Vec::new();
        segment.extend(element(TRACKS, &track_eintrag(1, 2, "A_OPUS")));
        let mut cluster = element(CLUSTER_ZEIT, &[0x64]); // 100 Ticks
        cluster.extend(simple_block(1, 20, &[0x01]));
        segment.extend(element(CLUSTER, &cluster));
        let mut webm = element(EBML_KOPF, &[]);
        webm.extend(element(SEGMENT, &segment));

        let pakete = opus_pakete(&webm).unwrap();
        assert_eq!(pakete[0].zeitstempel_ms, 120);
    }
}
