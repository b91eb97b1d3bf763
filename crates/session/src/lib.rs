//! palaver-session – der Session-Orchestrator des Voice-Subsystems
//!
//! Korreliert die beiden unabhaengig eintreffenden Steuerungssignale
//! (Mitglieds-Zustand, Server-Zugangsdaten), waehlt daraus die
//! Transportvariante, verwaltet die Verbindungs-Registry pro Kanal und
//! ueberlebt Migrationen, Timeouts und serverseitige Trennungen.
//!
//! Die Registry und die Voice-State-Tabelle gehoeren exklusiv dem
//! Orchestrator; Transporte melden nur Signale nach oben.

pub mod beitritt;
pub mod kontrakt;
pub mod orchestrator;
pub mod zustaende;

pub use beitritt::{AusstehenderBeitritt, BeitrittsDaten};
pub use kontrakt::{GatewaySignal, KanalRef, MitgliedsZustand, ServerZugangsdaten};
pub use orchestrator::{
    OrchestratorKonfig, VerbindungsHandle, VerbindungsZiel, VoiceOrchestrator,
};
pub use zustaende::VoiceStateTabelle;

// Durchgereichte Typen der Nachbar-Crates, damit Aufrufer mit dem
// Session-Crate allein auskommen
pub use palaver_core::event::OrchestratorEreignis;
pub use palaver_protocol::control::ZustandsFlags;
pub use palaver_transport::{Steuerkanal, TransportArt};
