//! Lobby setting bounds, defaults and cleanup configuration.

use crate::scoring::ScoringKind;
use crate::words::Language;
use shared::EditableSettings;
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingBounds {
    pub drawing_time: RangeInclusive<u32>,
    pub rounds: RangeInclusive<u32>,
    pub max_players: RangeInclusive<u32>,
    pub clients_per_address_limit: RangeInclusive<u32>,
    pub custom_words_per_turn: RangeInclusive<u32>,
    pub word_select_count: RangeInclusive<u32>,
}

impl Default for SettingBounds {
    fn default() -> Self {
        Self {
            drawing_time: 60..=300,
            rounds: 1..=20,
            max_players: 2..=24,
            clients_per_address_limit: 1..=24,
            custom_words_per_turn: 1..=3,
            word_select_count: 1..=5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyDefaults {
    pub settings: EditableSettings,
    pub language: Language,
    pub scoring: ScoringKind,
}

impl Default for LobbyDefaults {
    fn default() -> Self {
        Self {
            settings: EditableSettings {
                max_players: 24,
                rounds: 4,
                drawing_time: 120,
                clients_per_address_limit: 2,
                custom_words_per_turn: 3,
                word_select_count: 3,
                public: false,
            },
            language: Language::English,
            scoring: ScoringKind::Chill,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Zero disables the cleanup task.
    pub interval: Duration,
    pub inactivity_threshold: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(90),
            inactivity_threshold: Duration::from_secs(75),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("drawing time must be between {min} and {max} seconds, got {value}")]
    DrawingTime { value: u32, min: u32, max: u32 },

    #[error("rounds must be between {min} and {max}, got {value}")]
    Rounds { value: u32, min: u32, max: u32 },

    #[error("max players must be between {min} and {max}, got {value}")]
    MaxPlayers { value: u32, min: u32, max: u32 },

    #[error("clients per address must be between {min} and {max}, got {value}")]
    ClientsPerAddressLimit { value: u32, min: u32, max: u32 },

    #[error("custom words per turn must be between {min} and {max}, got {value}")]
    CustomWordsPerTurn { value: u32, min: u32, max: u32 },

    #[error("word select count must be between {min} and {max}, got {value}")]
    WordSelectCount { value: u32, min: u32, max: u32 },
}

fn check(
    value: u32,
    bounds: &RangeInclusive<u32>,
    error: fn(u32, u32, u32) -> SettingsError,
) -> Result<(), SettingsError> {
    if bounds.contains(&value) {
        Ok(())
    } else {
        Err(error(value, *bounds.start(), *bounds.end()))
    }
}

/// Checks every editable setting against `bounds`, reporting the first one
/// that is out of range.
pub fn validate(settings: &EditableSettings, bounds: &SettingBounds) -> Result<(), SettingsError> {
    check(settings.drawing_time, &bounds.drawing_time, |value, min, max| {
        SettingsError::DrawingTime { value, min, max }
    })?;
    check(settings.rounds, &bounds.rounds, |value, min, max| {
        SettingsError::Rounds { value, min, max }
    })?;
    check(settings.max_players, &bounds.max_players, |value, min, max| {
        SettingsError::MaxPlayers { value, min, max }
    })?;
    check(
        settings.clients_per_address_limit,
        &bounds.clients_per_address_limit,
        |value, min, max| SettingsError::ClientsPerAddressLimit { value, min, max },
    )?;
    check(
        settings.custom_words_per_turn,
        &bounds.custom_words_per_turn,
        |value, min, max| SettingsError::CustomWordsPerTurn { value, min, max },
    )?;
    check(
        settings.word_select_count,
        &bounds.word_select_count,
        |value, min, max| SettingsError::WordSelectCount { value, min, max },
    )?;
    Ok(())
}
