//! Minimaler ISO-BMFF-Demuxer (MP4-Video)
//!
//! Liest aus `moov` die Metadaten des Videotracks (Abmessungen, Codec,
//! avcC-Konfigurationsbox) und baut aus den Sample-Tabellen
//! (stts/stsz/stsc/stco/stss) eine flache Sample-Liste mit Dateioffsets,
//! Zeitstempeln und Keyframe-Markern. Kein Fragmented MP4, kein Edit-List.

use crate::error::{MedienFehler, MedienResult};

// ---------------------------------------------------------------------------
// Oeffentliche Typen
// ---------------------------------------------------------------------------

/// Ein Videosample (Zugriff ueber den Demuxer, Offsets sind dateiabsolut)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSample {
    /// Absoluter Byte-Offset im Container
    pub offset: u64,
    /// Groesse in Bytes
    pub groesse: u32,
    /// Dekodier-Zeitstempel in Millisekunden
    pub zeit_ms: u64,
    /// Beginnt das Sample mit einem Schluesselbild?
    pub schluesselbild: bool,
}

/// Codec des Videotracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264/AVC mit roher avcC-Konfigurationsbox
    H264 { avcc: Vec<u8> },
    /// Anderer Codec (FourCC) – nur ueber den Subprozess-Fallback abspielbar
    Unbekannt([u8; 4]),
}

/// Metadaten des Videotracks
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackInfo {
    /// Breite in Pixeln
    pub breite: u32,
    /// Hoehe in Pixeln
    pub hoehe: u32,
    /// Codec + Konfiguration
    pub codec: VideoCodec,
    /// Ticks pro Sekunde der Track-Zeitbasis
    pub zeitskala: u32,
    /// Trackdauer in Millisekunden (0 wenn unbekannt)
    pub dauer_ms: u64,
    /// Mittlere Bildrate
    pub fps: f32,
}

// ---------------------------------------------------------------------------
// Byte-Helfer
// ---------------------------------------------------------------------------

fn u16_bei(daten: &[u8], offset: usize) -> MedienResult<u16> {
    daten
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| MedienFehler::Container("Box endet unerwartet".into()))
}

fn u32_bei(daten: &[u8], offset: usize) -> MedienResult<u32> {
    daten
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| MedienFehler::Container("Box endet unerwartet".into()))
}

fn u64_bei(daten: &[u8], offset: usize) -> MedienResult<u64> {
    daten
        .get(offset..offset + 8)
        .map(|b| u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or_else(|| MedienFehler::Container("Box endet unerwartet".into()))
}

// ---------------------------------------------------------------------------
// Box-Leser
// ---------------------------------------------------------------------------

struct BoxLeser<'a> {
    daten: &'a [u8],
    pos: usize,
}

impl<'a> BoxLeser<'a> {
    fn neu(daten: &'a [u8]) -> Self {
        Self { daten, pos: 0 }
    }

    fn ist_ende(&self) -> bool {
        self.pos + 8 > self.daten.len()
    }

    /// Liest die naechste Box und gibt (Typ, Inhalt) zurueck
    fn naechste(&mut self) -> MedienResult<([u8; 4], &'a [u8])> {
        let groesse = u32_bei(self.daten, self.pos)? as u64;
        let typ: [u8; 4] = self.daten[self.pos + 4..self.pos + 8]
            .try_into()
            .expect("Laenge durch ist_ende gesichert");

        let (kopf, gesamt) = match groesse {
            0 => (8usize, (self.daten.len() - self.pos) as u64), // bis zum Ende
            1 => (16usize, u64_bei(self.daten, self.pos + 8)?),  // 64-Bit-Groesse
            n => (8usize, n),
        };

        if gesamt < kopf as u64 {
            return Err(MedienFehler::Container(format!(
                "Box '{}' mit unsinniger Groesse {}",
                String::from_utf8_lossy(&typ),
                gesamt
            )));
        }
        let ende = self
            .pos
            .checked_add(gesamt as usize)
            .filter(|&e| e <= self.daten.len())
            .ok_or_else(|| {
                MedienFehler::Container(format!(
                    "Box '{}' laenger als der Container",
                    String::from_utf8_lossy(&typ)
                ))
            })?;

        let inhalt = &self.daten[self.pos + kopf..ende];
        self.pos = ende;
        Ok((typ, inhalt))
    }
}

/// Sucht die erste Kindbox des gegebenen Typs
fn erste_box<'a>(daten: &'a [u8], gesucht: &[u8; 4]) -> MedienResult<Option<&'a [u8]>> {
    let mut leser = BoxLeser::neu(daten);
    while !leser.ist_ende() {
        let (typ, inhalt) = leser.naechste()?;
        if &typ == gesucht {
            return Ok(Some(inhalt));
        }
    }
    Ok(None)
}

/// Folgt einem Box-Pfad (z.B. mdia → minf → stbl)
fn box_pfad<'a>(daten: &'a [u8], pfad: &[&[u8; 4]]) -> MedienResult<Option<&'a [u8]>> {
    let mut aktuell = daten;
    for typ in pfad {
        match erste_box(aktuell, typ)? {
            Some(inhalt) => aktuell = inhalt,
            None => return Ok(None),
        }
    }
    Ok(Some(aktuell))
}

// ---------------------------------------------------------------------------
// Sample-Tabellen
// ---------------------------------------------------------------------------

struct SampleTabellen {
    /// (Anzahl, Delta) aus stts
    zeiten: Vec<(u32, u32)>,
    /// Einzelgroessen (stsz); bei fester Groesse expandiert
    groessen: Vec<u32>,
    /// (first_chunk, samples_per_chunk) aus stsc
    chunk_zuordnung: Vec<(u32, u32)>,
    /// Chunk-Offsets aus stco/co64
    chunk_offsets: Vec<u64>,
    /// 1-basierte Keyframe-Indizes aus stss (None = alles Keyframes)
    schluesselbilder: Option<Vec<u32>>,
}

fn stts_lesen(inhalt: &[u8]) -> MedienResult<Vec<(u32, u32)>> {
    let anzahl = u32_bei(inhalt, 4)? as usize;
    let mut eintraege = Vec::with_capacity(anzahl);
    for i in 0..anzahl {
        let basis = 8 + i * 8;
        eintraege.push((u32_bei(inhalt, basis)?, u32_bei(inhalt, basis + 4)?));
    }
    Ok(eintraege)
}

fn stsz_lesen(inhalt: &[u8]) -> MedienResult<Vec<u32>> {
    let feste_groesse = u32_bei(inhalt, 4)?;
    let anzahl = u32_bei(inhalt, 8)? as usize;
    if feste_groesse != 0 {
        return Ok(vec![feste_groesse; anzahl]);
    }
    let mut groessen = Vec::with_capacity(anzahl);
    for i in 0..anzahl {
        groessen.push(u32_bei(inhalt, 12 + i * 4)?);
    }
    Ok(groessen)
}

fn stsc_lesen(inhalt: &[u8]) -> MedienResult<Vec<(u32, u32)>> {
    let anzahl = u32_bei(inhalt, 4)? as usize;
    let mut eintraege = Vec::with_capacity(anzahl);
    for i in 0..anzahl {
        let basis = 8 + i * 12;
        eintraege.push((u32_bei(inhalt, basis)?, u32_bei(inhalt, basis + 4)?));
    }
    Ok(eintraege)
}

fn stco_lesen(inhalt: &[u8], co64: bool) -> MedienResult<Vec<u64>> {
    let anzahl = u32_bei(inhalt, 4)? as usize;
    let mut offsets = Vec::with_capacity(anzahl);
    for i in 0..anzahl {
        if co64 {
            offsets.push(u64_bei(inhalt, 8 + i * 8)?);
        } else {
            offsets.push(u32_bei(inhalt, 8 + i * 4)? as u64);
        }
    }
    Ok(offsets)
}

fn stss_lesen(inhalt: &[u8]) -> MedienResult<Vec<u32>> {
    let anzahl = u32_bei(inhalt, 4)? as usize;
    let mut indizes = Vec::with_capacity(anzahl);
    for i in 0..anzahl {
        indizes.push(u32_bei(inhalt, 8 + i * 4)?);
    }
    Ok(indizes)
}

// ---------------------------------------------------------------------------
// Mp4Demuxer
// ---------------------------------------------------------------------------

/// Demuxer ueber einem vollstaendig geladenen MP4-Puffer
///
/// `zuruecksetzen` springt fuer den Schleifenbetrieb zurueck auf Sample 0,
/// ohne den Puffer neu zu parsen.
pub struct Mp4Demuxer {
    daten: Vec<u8>,
    info: VideoTrackInfo,
    samples: Vec<VideoSample>,
    naechstes: usize,
}

impl Mp4Demuxer {
    /// Parst den Container und baut die Sample-Liste des Videotracks
    ///
    /// # Fehler
    /// - `Container` bei kaputten Boxen oder Offsets ausserhalb des Puffers
    /// - `KeinVideoTrack` wenn kein Track mit 'vide'-Handler existiert
    pub fn neu(daten: Vec<u8>) -> MedienResult<Self> {
        let moov = erste_box(&daten, b"moov")?
            .ok_or_else(|| MedienFehler::Container("moov-Box fehlt".into()))?;

        let mut gefunden = None;
        let mut leser = BoxLeser::neu(moov);
        while !leser.ist_ende() {
            let (typ, trak) = leser.naechste()?;
            if &typ != b"trak" {
                continue;
            }
            if let Some(ergebnis) = video_track_lesen(trak)? {
                gefunden = Some(ergebnis);
                break;
            }
        }
        let (info, tabellen) = gefunden.ok_or(MedienFehler::KeinVideoTrack)?;

        let samples = samples_bauen(&info, &tabellen)?;

        // Offsets gegen den Puffer validieren, damit der Zugriff spaeter
        // nie ausserhalb liest
        for s in &samples {
            let ende = s.offset.checked_add(s.groesse as u64);
            if ende.is_none() || ende.unwrap() > daten.len() as u64 {
                return Err(MedienFehler::Container(format!(
                    "Sample-Offset {} + {} ausserhalb des Containers",
                    s.offset, s.groesse
                )));
            }
        }

        tracing::debug!(
            breite = info.breite,
            hoehe = info.hoehe,
            samples = samples.len(),
            fps = info.fps,
            "MP4 demuxt"
        );

        Ok(Self {
            daten,
            info,
            samples,
            naechstes: 0,
        })
    }

    /// Metadaten des Videotracks
    pub fn info(&self) -> &VideoTrackInfo {
        &self.info
    }

    /// Rohbytes des Containers (fuer den Subprozess-Fallback)
    pub fn daten(&self) -> &[u8] {
        &self.daten
    }

    /// Gesamtzahl der Samples
    pub fn sample_anzahl(&self) -> usize {
        self.samples.len()
    }

    /// Liefert das naechste Sample samt Rohbytes, `None` am Streamende
    pub fn naechstes_sample(&mut self) -> Option<(VideoSample, &[u8])> {
        let sample = *self.samples.get(self.naechstes)?;
        self.naechstes += 1;
        let start = sample.offset as usize;
        let bytes = &self.daten[start..start + sample.groesse as usize];
        Some((sample, bytes))
    }

    /// Springt fuer den Schleifenbetrieb auf Sample 0 zurueck
    pub fn zuruecksetzen(&mut self) {
        self.naechstes = 0;
    }
}

/// Liest einen trak und gibt Info + Tabellen zurueck, falls es ein Videotrack ist
fn video_track_lesen(
    trak: &[u8],
) -> MedienResult<Option<(VideoTrackInfo, SampleTabellen)>> {
    let mdia = match erste_box(trak, b"mdia")? {
        Some(b) => b,
        None => return Ok(None),
    };

    // Handler pruefen: nur 'vide'-Tracks interessieren
    let hdlr = match erste_box(mdia, b"hdlr")? {
        Some(b) => b,
        None => return Ok(None),
    };
    if hdlr.get(8..12) != Some(b"vide".as_slice()) {
        return Ok(None);
    }

    // Zeitbasis + Dauer aus mdhd (Version 0 oder 1)
    let mdhd = erste_box(mdia, b"mdhd")?
        .ok_or_else(|| MedienFehler::Container("mdhd-Box fehlt".into()))?;
    let (zeitskala, dauer) = match mdhd.first() {
        Some(1) => (u32_bei(mdhd, 20)?, u64_bei(mdhd, 24)?),
        _ => (u32_bei(mdhd, 12)?, u32_bei(mdhd, 16)? as u64),
    };
    if zeitskala == 0 {
        return Err(MedienFehler::Container("mdhd-Zeitskala ist 0".into()));
    }

    let stbl = box_pfad(mdia, &[b"minf", b"stbl"])?
        .ok_or_else(|| MedienFehler::Container("stbl-Box fehlt".into()))?;

    // stsd: erster Sample-Eintrag traegt Abmessungen und Codec
    let stsd = erste_box(stbl, b"stsd")?
        .ok_or_else(|| MedienFehler::Container("stsd-Box fehlt".into()))?;
    let eintrag_typ: [u8; 4] = stsd
        .get(12..16)
        .ok_or_else(|| MedienFehler::Container("stsd ohne Sample-Eintrag".into()))?
        .try_into()
        .expect("Laenge geprueft");
    let eintrag_groesse = u32_bei(stsd, 8)? as usize;
    let eintrag = stsd
        .get(16..8 + eintrag_groesse)
        .ok_or_else(|| MedienFehler::Container("stsd-Eintrag abgeschnitten".into()))?;

    let breite = u16_bei(eintrag, 24)? as u32;
    let hoehe = u16_bei(eintrag, 26)? as u32;

    let codec = if &eintrag_typ == b"avc1" {
        let kinder = eintrag
            .get(78..)
            .ok_or_else(|| MedienFehler::Container("avc1-Eintrag zu kurz".into()))?;
        let avcc = erste_box(kinder, b"avcC")?
            .ok_or_else(|| MedienFehler::Container("avcC-Box fehlt".into()))?;
        VideoCodec::H264 {
            avcc: avcc.to_vec(),
        }
    } else {
        VideoCodec::Unbekannt(eintrag_typ)
    };

    let stts = erste_box(stbl, b"stts")?
        .ok_or_else(|| MedienFehler::Container("stts-Box fehlt".into()))?;
    let stsz = erste_box(stbl, b"stsz")?
        .ok_or_else(|| MedienFehler::Container("stsz-Box fehlt".into()))?;
    let stsc = erste_box(stbl, b"stsc")?
        .ok_or_else(|| MedienFehler::Container("stsc-Box fehlt".into()))?;
    let (stco, co64) = match erste_box(stbl, b"stco")? {
        Some(b) => (b, false),
        None => (
            erste_box(stbl, b"co64")?
                .ok_or_else(|| MedienFehler::Container("stco/co64-Box fehlt".into()))?,
            true,
        ),
    };

    let tabellen = SampleTabellen {
        zeiten: stts_lesen(stts)?,
        groessen: stsz_lesen(stsz)?,
        chunk_zuordnung: stsc_lesen(stsc)?,
        chunk_offsets: stco_lesen(stco, co64)?,
        schluesselbilder: match erste_box(stbl, b"stss")? {
            Some(b) => Some(stss_lesen(b)?),
            None => None,
        },
    };

    let dauer_ms = dauer.saturating_mul(1000) / zeitskala as u64;
    let fps = fps_schaetzen(&tabellen, zeitskala, dauer);

    Ok(Some((
        VideoTrackInfo {
            breite,
            hoehe,
            codec,
            zeitskala,
            dauer_ms,
            fps,
        },
        tabellen,
    )))
}

/// Mittlere Bildrate aus Dauer bzw. dem ersten stts-Delta
fn fps_schaetzen(tabellen: &SampleTabellen, zeitskala: u32, dauer: u64) -> f32 {
    let sample_anzahl: u64 = tabellen.zeiten.iter().map(|(n, _)| *n as u64).sum();
    if dauer > 0 && sample_anzahl > 0 {
        return (sample_anzahl as f64 * zeitskala as f64 / dauer as f64) as f32;
    }
    match tabellen.zeiten.first() {
        Some((_, delta)) if *delta > 0 => zeitskala as f32 / *delta as f32,
        _ => 30.0,
    }
}

/// Baut aus den Tabellen die flache Sample-Liste
fn samples_bauen(
    info: &VideoTrackInfo,
    tabellen: &SampleTabellen,
) -> MedienResult<Vec<VideoSample>> {
    let anzahl = tabellen.groessen.len();

    // Dekodier-Zeitstempel aus den stts-Laeufen expandieren
    let mut zeiten = Vec::with_capacity(anzahl);
    let mut dts: u64 = 0;
    for &(n, delta) in &tabellen.zeiten {
        for _ in 0..n {
            zeiten.push(dts);
            dts += delta as u64;
        }
    }
    if zeiten.len() != anzahl {
        return Err(MedienFehler::Container(format!(
            "stts ({} Samples) passt nicht zu stsz ({})",
            zeiten.len(),
            anzahl
        )));
    }

    let mut samples = Vec::with_capacity(anzahl);
    let mut sample_index = 0usize;

    for (chunk_index, &chunk_offset) in tabellen.chunk_offsets.iter().enumerate() {
        let chunk_nr = chunk_index as u32 + 1;
        // Letzter stsc-Lauf dessen first_chunk <= chunk_nr
        let pro_chunk = tabellen
            .chunk_zuordnung
            .iter()
            .rev()
            .find(|(first, _)| *first <= chunk_nr)
            .map(|(_, n)| *n)
            .ok_or_else(|| MedienFehler::Container("stsc ohne passenden Lauf".into()))?;

        let mut offset = chunk_offset;
        for _ in 0..pro_chunk {
            if sample_index >= anzahl {
                break;
            }
            let groesse = tabellen.groessen[sample_index];
            let schluesselbild = match &tabellen.schluesselbilder {
                Some(liste) => liste.contains(&(sample_index as u32 + 1)),
                None => true,
            };
            samples.push(VideoSample {
                offset,
                groesse,
                zeit_ms: zeiten[sample_index] * 1000 / info.zeitskala as u64,
                schluesselbild,
            });
            offset += groesse as u64;
            sample_index += 1;
        }
    }

    if sample_index != anzahl {
        return Err(MedienFehler::Container(format!(
            "Chunk-Tabellen decken nur {} von {} Samples ab",
            sample_index, anzahl
        )));
    }

    Ok(samples)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
