//! IP-Ermittlung ueber den Voice-UDP-Socket
//!
//! Vor der Protokollwahl schickt der Client ein festes 70-Byte-Paket an den
//! Voice-Server; die Antwort traegt die extern beobachtete Adresse und den
//! Port des Clients (NAT-Durchdringung ohne STUN).
//!
//! ## Paketformat (70 Bytes, Anfrage wie Antwort)
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       4   Typ/Flags (big-endian, fest 0x1)
//!  4       2   Laenge (big-endian, fest 70)
//!  6       4   SSRC (big-endian)
//! 10      58   ASCII-Adresse, nullterminiert/nullgepolstert
//! 68       2   Port (big-endian; in der Anfrage 0)
//! ```

use std::io;

/// Gesamtlaenge des Ermittlungspakets in Bytes
pub const ENTDECKUNG_LAENGE: usize = 70;

/// Typ/Flags-Wert des Ermittlungspakets
pub const ENTDECKUNG_TYP: u32 = 0x1;

/// Offset des Adressfelds
const ADRESSE_OFFSET: usize = 10;

/// Offset des Portfelds
const PORT_OFFSET: usize = 68;

/// Extern beobachteter Endpunkt aus der Ermittlungsantwort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntdeckungsAntwort {
    /// Oeffentliche IP-Adresse des Clients als ASCII-String
    pub adresse: String,
    /// Oeffentlicher UDP-Port des Clients
    pub port: u16,
}

/// Kodiert die Ermittlungsanfrage fuer die gegebene SSRC
pub fn anfrage_kodieren(ssrc: u32) -> [u8; ENTDECKUNG_LAENGE] {
    let mut buf = [0u8; ENTDECKUNG_LAENGE];
    buf[0..4].copy_from_slice(&ENTDECKUNG_TYP.to_be_bytes());
    buf[4..6].copy_from_slice(&(ENTDECKUNG_LAENGE as u16).to_be_bytes());
    buf[6..10].copy_from_slice(&ssrc.to_be_bytes());
    buf
}

/// Dekodiert die Ermittlungsantwort des Servers
///
/// # Fehler
/// - `InvalidData` wenn die Antwort kuerzer als 70 Bytes ist
///   (Aushandlungsfehler, fatal fuer den Verbindungsversuch)
/// - `InvalidData` wenn das Adressfeld kein gueltiges ASCII enthaelt
pub fn antwort_dekodieren(buf: &[u8]) -> io::Result<EntdeckungsAntwort> {
    if buf.len() < ENTDECKUNG_LAENGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Ermittlungsantwort zu kurz: {} Bytes (erwartet {})",
                buf.len(),
                ENTDECKUNG_LAENGE
            ),
        ));
    }

    let adress_feld = &buf[ADRESSE_OFFSET..PORT_OFFSET];
    let ende = adress_feld
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(adress_feld.len());
    let adresse = std::str::from_utf8(&adress_feld[..ende])
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "Adressfeld enthaelt ungueltiges ASCII",
            )
        })?
        .to_string();

    if adresse.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Adressfeld der Ermittlungsantwort ist leer",
        ));
    }

    let port = u16::from_be_bytes([buf[PORT_OFFSET], buf[PORT_OFFSET + 1]]);

    Ok(EntdeckungsAntwort { adresse, port })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Baut eine Serverantwort wie sie der Voice-Server erzeugen wuerde
    fn antwort_bauen(ssrc: u32, adresse: &str, port: u16) -> Vec<u8> {
        let mut buf = anfrage_kodieren(ssrc).to_vec();
        buf[ADRESSE_OFFSET..ADRESSE_OFFSET + adresse.len()]
            .copy_from_slice(adresse.as_bytes());
        buf[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&port.to_be_bytes());
        buf
    }

    #[test]
    fn anfrage_hat_festes_layout() {
        let buf = anfrage_kodieren(0xCAFEBABE);
        assert_eq!(buf.len(), 70);
        assert_eq!(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]), 0x1);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 70);
        assert_eq!(
            u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            0xCAFEBABE
        );
        // Rest muss genullt sein
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn antwort_round_trip() {
        let buf = antwort_bauen(0x1234, "203.0.113.42", 61001);
        let antwort = antwort_dekodieren(&buf).expect("Decode muss erfolgreich sein");
        assert_eq!(antwort.adresse, "203.0.113.42");
        assert_eq!(antwort.port, 61001);
    }

    #[test]
    fn antwort_zu_kurz_ist_aushandlungsfehler() {
        let buf = vec![0u8; 32];
        assert!(antwort_dekodieren(&buf).is_err());
    }

    #[test]
    fn antwort_mit_leerem_adressfeld_fehler() {
        let buf = anfrage_kodieren(1).to_vec();
        assert!(antwort_dekodieren(&buf).is_err());
    }

    #[test]
    fn antwort_adressfeld_nullterminiert() {
        // Adresse kuerzer als das Feld – Rest bleibt genullt
        let buf = antwort_bauen(1, "10.0.0.1", 4000);
        let antwort = antwort_dekodieren(&buf).unwrap();
        assert_eq!(antwort.adresse, "10.0.0.1");
    }
}
