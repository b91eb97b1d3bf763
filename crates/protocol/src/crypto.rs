//! Authentifizierte Verschluesselung der Medienpakete
//!
//! Der Roh-Datagramm-Transport verschluesselt jede Opus-Nutzlast mit einer
//! AEAD-Chiffre. Der 12-Byte-RTP-Kopf wird wortwoertlich als Nonce
//! verwendet, nullgepolstert auf die Nonce-Laenge der jeweiligen Chiffre
//! (12 Bytes bei AES-256-GCM, 24 Bytes bei XChaCha20-Poly1305).
//!
//! ## Zaehler-Invarianten
//! - Sequenz: +1 je Paket, Wrap bei 2^16
//! - Zeitstempel: +Samples-pro-Frame × Kanalzahl je Paket, regrediert nie

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use std::io;

use crate::rtp::{RtpKopf, ZEITSTEMPEL_SCHRITT};

/// Laenge des Sitzungsschluessels in Bytes
pub const SCHLUESSEL_LAENGE: usize = 32;

// ---------------------------------------------------------------------------
// VerschluesselungsModus
// ---------------------------------------------------------------------------

/// Verschluesselungsmodus eines Voice-Pakets
///
/// Die Wire-Namen erscheinen in `Ready.modi` und `SelectProtocol.daten.modus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerschluesselungsModus {
    /// AES-256-GCM, 12-Byte-Nonce
    #[default]
    AeadAes256Gcm,
    /// XChaCha20-Poly1305, 24-Byte-Nonce
    AeadXChaCha20Poly1305,
}

impl VerschluesselungsModus {
    /// Name des Modus auf dem Draht
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::AeadAes256Gcm => "aead_aes256_gcm",
            Self::AeadXChaCha20Poly1305 => "aead_xchacha20_poly1305",
        }
    }

    /// Parst einen Wire-Namen
    pub fn von_wire_name(name: &str) -> Option<Self> {
        match name {
            "aead_aes256_gcm" => Some(Self::AeadAes256Gcm),
            "aead_xchacha20_poly1305" => Some(Self::AeadXChaCha20Poly1305),
            _ => None,
        }
    }

    /// Nonce-Laenge der Chiffre in Bytes
    pub fn nonce_laenge(&self) -> usize {
        match self {
            Self::AeadAes256Gcm => 12,
            Self::AeadXChaCha20Poly1305 => 24,
        }
    }

    /// Waehlt aus den vom Server angebotenen Modi den ersten bekannten
    ///
    /// Die Serverliste ist nach Praeferenz sortiert; ein leeres oder rein
    /// unbekanntes Angebot ist ein Aushandlungsfehler (None).
    pub fn aus_angebot(modi: &[String]) -> Option<Self> {
        modi.iter().find_map(|m| Self::von_wire_name(m))
    }
}

impl std::fmt::Display for VerschluesselungsModus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ---------------------------------------------------------------------------
// VerschluesselungsKontext
// ---------------------------------------------------------------------------

enum Chiffre {
    Aes(Box<Aes256Gcm>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// Verschluesselungszustand einer Verbindung
///
/// Haelt den Sitzungsschluessel sowie das monotone (Sequenz, Zeitstempel)-
/// Paar, aus dem der Kopf und damit die Nonce jedes Pakets entsteht.
/// Nicht thread-safe – lebt exklusiv in der Sende-Task des Transports.
pub struct VerschluesselungsKontext {
    modus: VerschluesselungsModus,
    chiffre: Chiffre,
    sequenz: u16,
    zeitstempel: u32,
}

impl VerschluesselungsKontext {
    /// Erstellt einen neuen Kontext mit Sitzungsschluessel
    pub fn neu(modus: VerschluesselungsModus, schluessel: &[u8; SCHLUESSEL_LAENGE]) -> Self {
        let chiffre = match modus {
            VerschluesselungsModus::AeadAes256Gcm => {
                Chiffre::Aes(Box::new(Aes256Gcm::new(schluessel.into())))
            }
            VerschluesselungsModus::AeadXChaCha20Poly1305 => {
                Chiffre::XChaCha(Box::new(XChaCha20Poly1305::new(schluessel.into())))
            }
        };
        Self {
            modus,
            chiffre,
            sequenz: 0,
            zeitstempel: 0,
        }
    }

    /// Aktuelle Sequenznummer (naechstes ausgehendes Paket)
    pub fn sequenz(&self) -> u16 {
        self.sequenz
    }

    /// Aktueller Zeitstempel (naechstes ausgehendes Paket)
    pub fn zeitstempel(&self) -> u32 {
        self.zeitstempel
    }

    /// Verwendeter Modus
    pub fn modus(&self) -> VerschluesselungsModus {
        self.modus
    }

    /// Versiegelt eine Opus-Nutzlast zum vollstaendigen UDP-Paket
    ///
    /// Rueckt die Zaehler vor: Sequenz +1 (Wrap bei 2^16), Zeitstempel
    /// +Samples×Kanaele. Das Ergebnis ist Kopf ++ Chiffretext.
    pub fn versiegeln(&mut self, ssrc: u32, opus: &[u8]) -> io::Result<Vec<u8>> {
        let kopf = RtpKopf::new(self.sequenz, self.zeitstempel, ssrc);
        let kopf_bytes = kopf.encode();
        let nonce = self.nonce_aus_kopf(&kopf_bytes);

        let chiffretext = match &self.chiffre {
            Chiffre::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(&nonce[..12]), opus),
            Chiffre::XChaCha(c) => c.encrypt(XNonce::from_slice(&nonce[..24]), opus),
        }
        .map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "Verschluesselung fehlgeschlagen")
        })?;

        self.sequenz = self.sequenz.wrapping_add(1);
        self.zeitstempel = self.zeitstempel.wrapping_add(ZEITSTEMPEL_SCHRITT);

        let mut paket = Vec::with_capacity(RtpKopf::SIZE + chiffretext.len());
        paket.extend_from_slice(&kopf_bytes);
        paket.extend_from_slice(&chiffretext);
        Ok(paket)
    }

    /// Oeffnet ein empfangenes UDP-Paket
    ///
    /// # Fehler
    /// - Kopf-Validierungsfehler (Laenge, feste Bytes)
    /// - `InvalidData` wenn die Authentifizierung fehlschlaegt
    pub fn oeffnen(&self, paket: &[u8]) -> io::Result<(RtpKopf, Vec<u8>)> {
        let kopf = RtpKopf::decode(paket)?;
        let kopf_bytes: [u8; RtpKopf::SIZE] = paket[..RtpKopf::SIZE]
            .try_into()
            .expect("Laenge durch decode gesichert");
        let nonce = self.nonce_aus_kopf(&kopf_bytes);

        let klartext = match &self.chiffre {
            Chiffre::Aes(c) => {
                c.decrypt(aes_gcm::Nonce::from_slice(&nonce[..12]), &paket[RtpKopf::SIZE..])
            }
            Chiffre::XChaCha(c) => {
                c.decrypt(XNonce::from_slice(&nonce[..24]), &paket[RtpKopf::SIZE..])
            }
        }
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "Entschluesselung fehlgeschlagen (Authentifizierung)",
            )
        })?;

        Ok((kopf, klartext))
    }

    /// Kopf nullgepolstert auf die Nonce-Laenge der Chiffre
    fn nonce_aus_kopf(&self, kopf: &[u8; RtpKopf::SIZE]) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..RtpKopf::SIZE].copy_from_slice(kopf);
        nonce
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
