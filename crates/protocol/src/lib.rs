//! palaver-protocol – Wire-Formate des Voice-Subsystems
//!
//! Drei Schichten, alle versionslos klein gehalten:
//! - `control`: JSON-Nachrichten des Voice-Steuerkanals (`{op, d}`-Umschlag)
//! - `rtp` + `discovery`: handkodierte Binaerformate fuer den UDP-Pfad
//! - `crypto`: authentifizierte Verschluesselung der Medienpakete

pub mod control;
pub mod crypto;
pub mod discovery;
pub mod rtp;
