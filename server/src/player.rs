use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use shared::{PlayerId, PlayerState, PlayerView, MAX_PLAYER_NAME_LENGTH};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Messages allowed within [`MESSAGE_WINDOW_MILLIS`].
pub const MESSAGE_WINDOW_SIZE: usize = 5;
pub const MESSAGE_WINDOW_MILLIS: u64 = 3_000;

/// A participant of exactly one lobby.
///
/// The record outlives its connection: a disconnect only flips `connected`
/// and stamps `disconnect_time`, so a reconnect with the session token picks
/// up score and state where they were left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    session: Uuid,
    pub name: String,
    pub connected: bool,
    /// False until the first connection was attached.
    pub(crate) ever_connected: bool,
    pub(crate) last_known_address: Option<String>,
    pub score: u32,
    pub last_score: u32,
    pub rank: u32,
    pub state: PlayerState,
    pub spectate_toggle_requested: bool,
    /// Players this player has voted to kick.
    pub(crate) kick_votes: HashSet<PlayerId>,
    message_window: MessageWindow,
    pub disconnect_time: Option<u64>,
}

impl Player {
    pub fn new(name: &str, state: PlayerState) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: Uuid::new_v4(),
            name: sanitize_name(name),
            connected: false,
            ever_connected: false,
            last_known_address: None,
            score: 0,
            last_score: 0,
            rank: 1,
            state,
            spectate_toggle_requested: false,
            kick_votes: HashSet::new(),
            message_window: MessageWindow::default(),
            disconnect_time: None,
        }
    }

    /// Private credential for reattaching a connection. Never broadcast.
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn last_known_address(&self) -> Option<&str> {
        self.last_known_address.as_deref()
    }

    pub fn set_last_known_address(&mut self, address: impl Into<String>) {
        self.last_known_address = Some(address.into());
    }

    pub fn has_connected_once(&self) -> bool {
        self.ever_connected
    }

    /// Whether the player's state after the next turn boundary is spectating.
    pub fn will_spectate(&self) -> bool {
        (self.state == PlayerState::Spectating) != self.spectate_toggle_requested
    }

    /// Records a chat message. Returns false when the player exceeded the
    /// rate limit; limited messages are not recorded.
    pub(crate) fn allow_message(&mut self, now_millis: u64) -> bool {
        self.message_window.allow(now_millis)
    }

    pub(crate) fn shift_timestamps(&mut self, by_millis: u64) {
        self.message_window.shift(by_millis);
        if let Some(time) = self.disconnect_time.as_mut() {
            *time += by_millis;
        }
    }

    pub fn view(&self) -> PlayerView {
        PlayerView {
            id: self.id,
            name: self.name.clone(),
            score: self.score,
            last_score: self.last_score,
            rank: self.rank,
            state: self.state,
            connected: self.connected,
        }
    }
}

/// Sliding window over the timestamps of the last few chat messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MessageWindow {
    stamps: VecDeque<u64>,
}

impl MessageWindow {
    fn allow(&mut self, now_millis: u64) -> bool {
        if self.stamps.len() >= MESSAGE_WINDOW_SIZE {
            if let Some(&oldest) = self.stamps.front() {
                if now_millis.saturating_sub(oldest) < MESSAGE_WINDOW_MILLIS {
                    return false;
                }
            }
            self.stamps.pop_front();
        }
        self.stamps.push_back(now_millis);
        true
    }

    /// Moves every stamp forward, used when a lobby is restored.
    fn shift(&mut self, by_millis: u64) {
        for stamp in self.stamps.iter_mut() {
            *stamp += by_millis;
        }
    }
}

/// Trims the name and cuts it to [`MAX_PLAYER_NAME_LENGTH`] characters.
/// Empty names are replaced by a generated one.
pub fn sanitize_name(name: &str) -> String {
    let trimmed: String = name.trim().chars().take(MAX_PLAYER_NAME_LENGTH).collect();
    let trimmed = trimmed.trim_end();
    if trimmed.is_empty() {
        generate_name()
    } else {
        trimmed.to_string()
    }
}

const ADVERBS: &[&str] = &[
    "Briskly", "Calmly", "Deeply", "Eagerly", "Gently", "Happily", "Kindly", "Loudly", "Merrily",
    "Neatly", "Oddly", "Quickly", "Quietly", "Slowly", "Sweetly", "Wildly",
];

const ADJECTIVES: &[&str] = &[
    "Amused", "Brave", "Clever", "Curious", "Fancy", "Fluffy", "Gentle", "Golden", "Jolly",
    "Lucky", "Mighty", "Polite", "Proud", "Shiny", "Sleepy", "Witty",
];

const ANIMALS: &[&str] = &[
    "Badger", "Beaver", "Crane", "Dingo", "Falcon", "Ferret", "Gecko", "Heron", "Koala", "Lemur",
    "Marmot", "Otter", "Panda", "Puffin", "Walrus", "Wombat",
];

/// Three title-cased words, adverb, adjective and animal.
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let pick = |words: &[&'static str], rng: &mut rand::rngs::ThreadRng| -> &'static str {
        words.choose(rng).copied().unwrap_or("Someone")
    };
    format!(
        "{}{}{}",
        pick(ADVERBS, &mut rng),
        pick(ADJECTIVES, &mut rng),
        pick(ANIMALS, &mut rng)
    )
}
