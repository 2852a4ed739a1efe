use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PlayerId = Uuid;

pub const MIN_BRUSH_SIZE: f32 = 8.0;
pub const MAX_BRUSH_SIZE: f32 = 32.0;
pub const MAX_PLAYER_NAME_LENGTH: usize = 30;

// Inbound event types
pub const EVENT_KEEP_ALIVE: &str = "keep-alive";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_LINE: &str = "line";
pub const EVENT_FILL: &str = "fill";
pub const EVENT_CLEAR_DRAWING_BOARD: &str = "clear-drawing-board";
pub const EVENT_UNDO: &str = "undo";
pub const EVENT_CHOOSE_WORD: &str = "choose-word";
pub const EVENT_KICK_VOTE: &str = "kick-vote";
pub const EVENT_NAME_CHANGE: &str = "name-change";
pub const EVENT_TOGGLE_READINESS: &str = "toggle-readiness";
pub const EVENT_TOGGLE_SPECTATE: &str = "toggle-spectate";
pub const EVENT_START: &str = "start";
pub const EVENT_REQUEST_DRAWING: &str = "request-drawing";

/// Wire shape of every inbound event: `{ "type": ..., "data": ... }`.
///
/// The payload stays untyped until the lobby knows which event it is looking
/// at, so unknown event types can be dropped without failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Guessing,
    Drawing,
    Standby,
    Ready,
    Spectating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameState {
    Unstarted,
    Ongoing,
    GameOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineData {
    pub from_x: f32,
    pub from_y: f32,
    pub to_x: f32,
    pub to_y: f32,
    pub color: RgbColor,
    pub line_width: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillData {
    pub x: f32,
    pub y: f32,
    pub color: RgbColor,
}

/// A single entry of the canvas history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum DrawOp {
    Line(LineData),
    Fill(FillData),
}

/// One character slot of the word shown to a player. Hidden characters have
/// no `character`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordHint {
    pub character: Option<char>,
    pub underline: bool,
}

/// Public view of a player, safe to hand to every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub id: PlayerId,
    pub name: String,
    pub score: u32,
    pub last_score: u32,
    pub rank: u32,
    pub state: PlayerState,
    pub connected: bool,
}

/// Lobby settings the owner may change after the lobby has been opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableSettings {
    pub max_players: u32,
    pub rounds: u32,
    /// Seconds per drawing phase.
    pub drawing_time: u32,
    pub clients_per_address_limit: u32,
    pub custom_words_per_turn: u32,
    pub word_select_count: u32,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub author: String,
    pub author_id: PlayerId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordHintUpdate {
    pub word_hints: Vec<WordHint>,
    pub round_end_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YourTurn {
    pub words: Vec<String>,
    pub preselected_word: usize,
    pub choice_end_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTurn {
    pub previous_word: String,
    pub players: Vec<PlayerView>,
    pub round: u32,
    pub choice_end_time: u64,
}

/// Everything a freshly connected client needs to render the lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub player_id: PlayerId,
    pub player_name: String,
    pub owner_id: PlayerId,
    pub allow_drawing: bool,
    pub game_state: GameState,
    pub round: u32,
    pub rounds: u32,
    pub round_end_time: u64,
    pub settings: EditableSettings,
    pub word_hints: Vec<WordHint>,
    pub players: Vec<PlayerView>,
    pub current_drawing: Vec<DrawOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub word: String,
    pub drawing: Vec<DrawOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOver {
    #[serde(flatten)]
    pub ready: Ready,
    pub previous_word: String,
    pub gallery: Vec<GalleryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickVote {
    pub player_id: PlayerId,
    pub player_name: String,
    pub vote_count: u32,
    pub required_vote_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRef {
    pub player_id: PlayerId,
    pub player_name: String,
}

/// Every event the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Ready(Ready),
    UpdatePlayers(Vec<PlayerView>),
    WordChosen(WordHintUpdate),
    #[serde(rename = "update-wordhint")]
    UpdateWordHint(WordHintUpdate),
    CorrectGuess(PlayerId),
    CloseGuess(String),
    SystemMessage(String),
    Message(ChatMessage),
    NonGuessingPlayerMessage(ChatMessage),
    GameOver(GameOver),
    YourTurn(YourTurn),
    NextTurn(NextTurn),
    Drawing(Vec<DrawOp>),
    Line(LineData),
    Fill(FillData),
    ClearDrawingBoard,
    KickVote(KickVote),
    DrawerKicked,
    OwnerChange(PlayerRef),
    NameChange(PlayerRef),
    LobbySettingsChanged(EditableSettings),
    Shutdown,
}

/// First line a connection sends, before any lobby event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Handshake {
    #[serde(rename_all = "camelCase")]
    Create {
        name: String,
        language: String,
        scoring: String,
        settings: EditableSettings,
        #[serde(default)]
        custom_words: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Join { lobby_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    Reconnect { lobby_id: String, session: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum HandshakeReply {
    #[serde(rename_all = "camelCase")]
    Session {
        lobby_id: String,
        player_id: PlayerId,
        session: Uuid,
    },
    Rejected { reason: String },
}
