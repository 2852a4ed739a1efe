//! Score calculation strategies
//!
//! A lobby picks one [`ScoreCalculation`] at creation time. Both shipped
//! strategies are instances of [`AdjustableScoring`] and differ only in
//! their constants: `chill` gives everyone a solid base score and decays
//! slowly, `competitive` gives almost nothing for slow guesses.

use crate::error::LobbyError;
use serde::{Deserialize, Serialize};
use shared::PlayerState;
use std::fmt;
use std::str::FromStr;

/// Everything the drawer score depends on, per guesser.
#[derive(Debug, Clone, Copy)]
pub struct GuesserOutcome {
    pub state: PlayerState,
    pub connected: bool,
    pub last_score: u32,
}

pub trait ScoreCalculation: Send + Sync {
    /// Points for a correct guess.
    ///
    /// `drawing_time_secs` is the length of the drawing phase and
    /// `elapsed_millis` the time since it started.
    fn guesser_score(
        &self,
        hint_count: usize,
        hints_left: usize,
        drawing_time_secs: u32,
        elapsed_millis: u64,
    ) -> u32;

    /// Points for the drawer once the turn ends, based on the guessers of
    /// that turn (the drawer itself is not part of `guessers`).
    fn drawer_score(&self, guessers: &[GuesserOutcome]) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustableScoring {
    pub base_score: f64,
    pub max_bonus_base_score: f64,
    pub max_hint_bonus_score: f64,
    pub bonus_base_score_decline_factor: f64,
}

pub const CHILL: AdjustableScoring = AdjustableScoring {
    base_score: 100.0,
    max_bonus_base_score: 100.0,
    max_hint_bonus_score: 60.0,
    bonus_base_score_decline_factor: 2.0,
};

pub const COMPETITIVE: AdjustableScoring = AdjustableScoring {
    base_score: 10.0,
    max_bonus_base_score: 290.0,
    max_hint_bonus_score: 120.0,
    bonus_base_score_decline_factor: 10.0,
};

impl AdjustableScoring {
    /// Share of the time bonus still available after `elapsed_secs`.
    /// Starts at 1.0 and falls off exponentially over the drawing phase.
    pub fn decay(&self, drawing_time_secs: u32, elapsed_secs: f64) -> f64 {
        if drawing_time_secs == 0 {
            return 0.0;
        }
        let decline = self.bonus_base_score_decline_factor / f64::from(drawing_time_secs);
        (1.0 - decline).max(0.0).powf(elapsed_secs.max(0.0))
    }
}

impl ScoreCalculation for AdjustableScoring {
    fn guesser_score(
        &self,
        hint_count: usize,
        hints_left: usize,
        drawing_time_secs: u32,
        elapsed_millis: u64,
    ) -> u32 {
        let elapsed_secs = (elapsed_millis / 1000) as f64;
        let mut score =
            self.base_score + self.max_bonus_base_score * self.decay(drawing_time_secs, elapsed_secs);

        if hint_count > 0 {
            score += hints_left as f64 * (self.max_hint_bonus_score / hint_count as f64);
        }

        score.max(0.0) as u32
    }

    fn drawer_score(&self, guessers: &[GuesserOutcome]) -> u32 {
        // Players that left before guessing don't drag the drawer down, but
        // someone who guessed and then left still counts.
        let counted: Vec<u32> = guessers
            .iter()
            .filter(|guesser| {
                guesser.state != PlayerState::Spectating
                    && guesser.state != PlayerState::Drawing
                    && (guesser.connected || guesser.last_score > 0)
            })
            .map(|guesser| guesser.last_score)
            .collect();

        if counted.is_empty() {
            return 0;
        }

        let total: u64 = counted.iter().map(|&score| u64::from(score)).sum();
        (total / counted.len() as u64) as u32
    }
}

/// Serializable selector for the shipped strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringKind {
    Chill,
    Competitive,
}

impl ScoringKind {
    pub fn strategy(self) -> &'static dyn ScoreCalculation {
        match self {
            ScoringKind::Chill => &CHILL,
            ScoringKind::Competitive => &COMPETITIVE,
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            ScoringKind::Chill => "chill",
            ScoringKind::Competitive => "competitive",
        }
    }
}

impl Default for ScoringKind {
    fn default() -> Self {
        ScoringKind::Chill
    }
}

impl fmt::Display for ScoringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for ScoringKind {
    type Err = LobbyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "chill" => Ok(ScoringKind::Chill),
            "competitive" => Ok(ScoringKind::Competitive),
            _ => Err(LobbyError::UnknownScoring(value.to_string())),
        }
    }
}
