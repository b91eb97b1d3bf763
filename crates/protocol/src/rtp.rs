//! RTP-artige Rahmung der Medienpakete (UDP)
//!
//! Jedes ausgehende Medienpaket beginnt mit einem 12-Byte-Kopf, gefolgt vom
//! AEAD-Chiffretext der Opus-Nutzdaten. Der Kopf dient wortwoertlich als
//! Nonce (nullgepolstert auf die Nonce-Laenge der Chiffre, siehe `crypto`).
//!
//! ## Kopfformat (12 Bytes, kein serde)
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       1   Version/Flags (fest 0x80)
//!  1       1   Payload-Typ (fest 0x78)
//!  2       2   Sequenznummer (big-endian, +1 je Paket, Wrap bei 2^16)
//!  4       4   Zeitstempel (big-endian, +Samples×Kanaele je Frame)
//!  8       4   SSRC (big-endian)
//! ```

use std::io;

/// Festes Version/Flags-Byte
pub const RTP_VERSION_FLAGS: u8 = 0x80;

/// Fester Payload-Typ fuer Opus
pub const RTP_PAYLOAD_TYP: u8 = 0x78;

/// Samples pro Opus-Frame (20 ms bei 48 kHz)
pub const SAMPLES_PRO_FRAME: u32 = 960;

/// Kanalanzahl der uebertragenen Frames
pub const KANAL_ANZAHL: u32 = 2;

/// Zeitstempel-Schritt je gesendetem Frame (Samples × Kanaele)
pub const ZEITSTEMPEL_SCHRITT: u32 = SAMPLES_PRO_FRAME * KANAL_ANZAHL;

// ---------------------------------------------------------------------------
// RtpKopf
// ---------------------------------------------------------------------------

/// 12-Byte-Kopf eines Medienpakets
///
/// Direkte Byte-Serialisierung, kein serde (Hot Path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpKopf {
    /// Monoton steigende Sequenznummer (Wrap bei 2^16)
    pub sequenz: u16,
    /// Monoton steigender Zeitstempel (48 kHz-Ticks × Kanaele)
    pub zeitstempel: u32,
    /// Synchronisation Source – vom Server zugewiesene Senderkennung
    pub ssrc: u32,
}

impl RtpKopf {
    /// Kopf-Groesse in Bytes
    pub const SIZE: usize = 12;

    /// Erstellt einen neuen Kopf
    pub fn new(sequenz: u16, zeitstempel: u32, ssrc: u32) -> Self {
        Self {
            sequenz,
            zeitstempel,
            ssrc,
        }
    }

    /// Serialisiert den Kopf in ein 12-Byte-Array (big-endian)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = RTP_VERSION_FLAGS;
        buf[1] = RTP_PAYLOAD_TYP;
        buf[2..4].copy_from_slice(&self.sequenz.to_be_bytes());
        buf[4..8].copy_from_slice(&self.zeitstempel.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    /// Deserialisiert einen Kopf aus einem Byte-Slice
    ///
    /// # Fehler
    /// - `InvalidData` wenn das Slice kuerzer als 12 Bytes ist
    /// - `InvalidData` bei falschem Version- oder Payload-Typ-Byte
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Kopf zu kurz: {} Bytes (erwartet {})", buf.len(), Self::SIZE),
            ));
        }
        if buf[0] != RTP_VERSION_FLAGS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Ungueltiges Versionsbyte: {:#04x}", buf[0]),
            ));
        }
        if buf[1] != RTP_PAYLOAD_TYP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unbekannter Payload-Typ: {:#04x}", buf[1]),
            ));
        }

        Ok(Self {
            sequenz: u16::from_be_bytes([buf[2], buf[3]]),
            zeitstempel: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kopf_encode_decode_round_trip() {
        let kopf = RtpKopf::new(42, 13440, 0xDEAD);
        let encoded = kopf.encode();
        assert_eq!(encoded.len(), RtpKopf::SIZE);
        let decoded = RtpKopf::decode(&encoded).expect("Decode muss erfolgreich sein");
        assert_eq!(kopf, decoded);
    }

    #[test]
    fn kopf_feste_bytes() {
        let bytes = RtpKopf::new(0, 0, 0).encode();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x78);
    }

    #[test]
    fn kopf_big_endian_byte_reihenfolge() {
        let kopf = RtpKopf::new(0x0102, 0x03040506, 0x0708090A);
        let bytes = kopf.encode();
        // Sequenz bei Offset 2-3
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);
        // Zeitstempel bei Offset 4-7
        assert_eq!(bytes[4], 0x03);
        assert_eq!(bytes[7], 0x06);
        // SSRC bei Offset 8-11
        assert_eq!(bytes[8], 0x07);
        assert_eq!(bytes[11], 0x0A);
    }

    #[test]
    fn kopf_decode_zu_kurz() {
        let bytes = [0u8; 8];
        assert!(RtpKopf::decode(&bytes).is_err());
    }

    #[test]
    fn kopf_decode_falsches_versionsbyte() {
        let mut bytes = RtpKopf::new(1, 2, 3).encode();
        bytes[0] = 0x00;
        assert!(RtpKopf::decode(&bytes).is_err());
    }

    #[test]
    fn kopf_decode_falscher_payload_typ() {
        let mut bytes = RtpKopf::new(1, 2, 3).encode();
        bytes[1] = 0x42;
        assert!(RtpKopf::decode(&bytes).is_err());
    }

    #[test]
    fn zeitstempel_schritt_ist_samples_mal_kanaele() {
        assert_eq!(ZEITSTEMPEL_SCHRITT, 960 * 2);
    }
}
