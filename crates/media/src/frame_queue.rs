//! Begrenzte Frame-Warteschlange mit Aelteste-zuerst-Verwerfung
//!
//! Die Transporte puffern dekodierte Frames zwischen Demux-Salven und dem
//! festen Abspieltakt. Die Warteschlange ist hart begrenzt: Einreihen
//! ueber die Kappe hinaus verwirft das aelteste Element zuerst.

use std::collections::VecDeque;

/// Begrenzte, zeitgestempelte Warteschlange
///
/// Invariante: Laenge ≤ Kappe, zu jedem Zeitpunkt.
pub struct FrameWarteschlange<T> {
    eintraege: VecDeque<(u64, T)>,
    kappe: usize,
    verworfen: u64,
}

impl<T> FrameWarteschlange<T> {
    /// Erstellt eine Warteschlange mit der gegebenen Kappe (mindestens 1)
    pub fn neu(kappe: usize) -> Self {
        Self {
            eintraege: VecDeque::with_capacity(kappe.max(1)),
            kappe: kappe.max(1),
            verworfen: 0,
        }
    }

    /// Reiht einen Frame ein
    ///
    /// Ist die Warteschlange voll, wird zuerst das aelteste Element
    /// verworfen. Gibt `true` zurueck wenn dabei etwas verworfen wurde.
    pub fn einreihen(&mut self, zeitstempel_ms: u64, frame: T) -> bool {
        let mut verworfen = false;
        if self.eintraege.len() >= self.kappe {
            self.eintraege.pop_front();
            self.verworfen += 1;
            verworfen = true;
            tracing::warn!(
                kappe = self.kappe,
                "Frame-Warteschlange voll: aeltestes Frame verworfen"
            );
        }
        self.eintraege.push_back((zeitstempel_ms, frame));
        verworfen
    }

    /// Entnimmt das aelteste Frame
    pub fn entnehmen(&mut self) -> Option<(u64, T)> {
        self.eintraege.pop_front()
    }

    /// Zeitstempel des aeltesten Frames ohne Entnahme
    pub fn vorderster_zeitstempel(&self) -> Option<u64> {
        self.eintraege.front().map(|(ts, _)| *ts)
    }

    /// Aktuelle Laenge
    pub fn laenge(&self) -> usize {
        self.eintraege.len()
    }

    /// Ist die Warteschlange leer?
    pub fn ist_leer(&self) -> bool {
        self.eintraege.is_empty()
    }

    /// Verwirft alle Eintraege (Teardown)
    pub fn leeren(&mut self) {
        self.eintraege.clear();
    }

    /// Anzahl insgesamt verworfener Frames
    pub fn verworfen_gesamt(&self) -> u64 {
        self.verworfen
    }

    /// Konfigurierte Kappe
    pub fn kappe(&self) -> usize {
        self.kappe
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
