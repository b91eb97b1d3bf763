//! Taktgeber fuer die Abspiel-Loops
//!
//! Alle Abliefer-Loops sind timer-getrieben, nie busy-gepollt. Der
//! Schrittmacher tickt mit festem Intervall und holt verpasste Ticks
//! nicht nach – wer hinterherhinkt, verwirft Frames statt zu buendeln.

use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Takt des Opus-Sendepfads (ein Paket je Tick)
pub const OPUS_TAKT: Duration = Duration::from_millis(20);

/// Fester Timer-Takt ohne Aufholsalven
pub struct Schrittmacher {
    intervall: Interval,
    dauer: Duration,
}

impl Schrittmacher {
    /// Erstellt einen Schrittmacher mit dem gegebenen Intervall
    pub fn neu(dauer: Duration) -> Self {
        let mut intervall = interval(dauer);
        // Verpasste Ticks ueberspringen: die Loop darf nie schneller
        // liefern als Echtzeit
        intervall.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { intervall, dauer }
    }

    /// Erstellt einen Schrittmacher fuer die gegebene Bildrate
    pub fn fuer_fps(fps: f32) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        Self::neu(Duration::from_secs_f64(1.0 / fps as f64))
    }

    /// Wartet auf den naechsten Tick
    pub async fn tick(&mut self) {
        self.intervall.tick().await;
    }

    /// Konfiguriertes Intervall
    pub fn dauer(&self) -> Duration {
        self.dauer
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tick_haelt_das_intervall() {
        let mut takt = Schrittmacher::neu(Duration::from_millis(20));
        takt.tick().await; // erster Tick feuert sofort

        let start = tokio::time::Instant::now();
        takt.tick().await;
        takt.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn verpasste_ticks_werden_nicht_gebuendelt() {
        let mut takt = Schrittmacher::neu(Duration::from_millis(20));
        takt.tick().await;

        // Lange Pause: mehrere Ticks verpasst
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Der naechste Tick feuert sofort, der uebernaechste aber erst
        // wieder ein volles Intervall spaeter – keine Salve
        takt.tick().await;
        let start = tokio::time::Instant::now();
        takt.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[tokio::test]
    async fn fps_intervall() {
        let takt = Schrittmacher::fuer_fps(25.0);
        assert_eq!(takt.dauer(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn ungueltige_fps_fallen_auf_30_zurueck() {
        let takt = Schrittmacher::fuer_fps(0.0);
        assert!((takt.dauer().as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);
    }
}
