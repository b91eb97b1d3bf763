//! Voice-State-Tabelle
//!
//! Beantwortet "in welchem Kanal ist Mitglied X" pro Gruppe. Gefuettert
//! ausschliesslich von den Signal-Handlern des Orchestrators; Eintraege
//! werden in-place ueberschrieben und leben bis zum Prozessende.

use dashmap::DashMap;
use palaver_core::types::{ChannelId, GruppenId, UserId};
use std::collections::HashMap;
use std::sync::Arc;

/// Gruppen-weise Tabelle der Voice-Zustaende aller Mitglieder
#[derive(Clone, Default)]
pub struct VoiceStateTabelle {
    inner: Arc<DashMap<GruppenId, HashMap<UserId, Option<ChannelId>>>>,
}

impl VoiceStateTabelle {
    /// Erstellt eine leere Tabelle
    pub fn neu() -> Self {
        Self::default()
    }

    /// Setzt den Zustand eines Mitglieds (ueberschreibt in-place)
    pub fn zustand_setzen(&self, gruppe: GruppenId, user_id: UserId, kanal: Option<ChannelId>) {
        self.inner.entry(gruppe).or_default().insert(user_id, kanal);
        tracing::trace!(
            gruppe = %gruppe,
            user_id = %user_id,
            kanal = ?kanal,
            "Voice-Zustand gesetzt"
        );
    }

    /// In welchem Kanal ist das Mitglied? (None = keinem/unbekannt)
    pub fn kanal_von(&self, gruppe: &GruppenId, user_id: &UserId) -> Option<ChannelId> {
        self.inner
            .get(gruppe)
            .and_then(|mitglieder| mitglieder.get(user_id).copied().flatten())
    }

    /// Alle Mitglieder eines Kanals
    pub fn mitglieder_in(&self, gruppe: &GruppenId, kanal: &ChannelId) -> Vec<UserId> {
        self.inner
            .get(gruppe)
            .map(|mitglieder| {
                mitglieder
                    .iter()
                    .filter(|(_, k)| k.as_ref() == Some(kanal))
                    .map(|(user_id, _)| *user_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Anzahl bekannter Gruppen
    pub fn gruppen_anzahl(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zustand_setzen_und_abfragen() {
        let tabelle = VoiceStateTabelle::neu();
        let gruppe = GruppenId::new();
        let user = UserId::new();
        let kanal = ChannelId::new();

        assert_eq!(tabelle.kanal_von(&gruppe, &user), None);

        tabelle.zustand_setzen(gruppe, user, Some(kanal));
        assert_eq!(tabelle.kanal_von(&gruppe, &user), Some(kanal));
    }

    #[test]
    fn zustand_wird_in_place_ueberschrieben() {
        let tabelle = VoiceStateTabelle::neu();
        let gruppe = GruppenId::new();
        let user = UserId::new();
        let kanal_a = ChannelId::new();
        let kanal_b = ChannelId::new();

        tabelle.zustand_setzen(gruppe, user, Some(kanal_a));
        tabelle.zustand_setzen(gruppe, user, Some(kanal_b));
        assert_eq!(tabelle.kanal_von(&gruppe, &user), Some(kanal_b));

        // Kanal verlassen: Eintrag bleibt, Kanal ist weg
        tabelle.zustand_setzen(gruppe, user, None);
        assert_eq!(tabelle.kanal_von(&gruppe, &user), None);
        assert_eq!(tabelle.gruppen_anzahl(), 1);
    }

    #[test]
    fn mitglieder_eines_kanals() {
        let tabelle = VoiceStateTabelle::neu();
        let gruppe = GruppenId::new();
        let kanal = ChannelId::new();
        let anderer = ChannelId::new();

        let im_kanal = [UserId::new(), UserId::new()];
        for user in &im_kanal {
            tabelle.zustand_setzen(gruppe, *user, Some(kanal));
        }
        tabelle.zustand_setzen(gruppe, UserId::new(), Some(anderer));
        tabelle.zustand_setzen(gruppe, UserId::new(), None);

        let gefunden = tabelle.mitglieder_in(&gruppe, &kanal);
        assert_eq!(gefunden.len(), 2);
        for user in &im_kanal {
            assert!(gefunden.contains(user));
        }
    }

    #[test]
    fn clone_teilt_die_tabelle() {
        let tabelle1 = VoiceStateTabelle::neu();
        let tabelle2 = tabelle1.clone();
        let gruppe = GruppenId::new();
        let user = UserId::new();
        let kanal = ChannelId::new();

        tabelle1.zustand_setzen(gruppe, user, Some(kanal));
        assert_eq!(tabelle2.kanal_von(&gruppe, &user), Some(kanal));
    }
}
