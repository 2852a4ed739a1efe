//! The lobby engine
//!
//! A [`Lobby`] is one game session. All of its mutable data lives in a
//! [`LobbyState`] behind a single lock; every entry point (inbound events,
//! connects and disconnects, the per-turn ticker, administration calls)
//! takes that lock for its whole body. Nothing inside the lock awaits or
//! blocks: outbound events are serialized and handed to the [`Transport`],
//! which only queues them.
//!
//! ## Turn lifecycle
//!
//! ```text
//! start ──> advance ──> word choice (30s) ──> drawing (drawing_time) ──┐
//!              ^                                                       │
//!              └──── everyone guessed / time up / drawer gone ─────────┘
//! ```
//!
//! `advance` settles the outgoing turn (drawer score, gallery, deferred
//! spectate toggles), picks the next eligible drawer after the current one
//! and either opens a new turn or ends the game once the last round wrapped.
//!
//! ## Ticker
//!
//! While a turn runs, a background task ticks the lobby once per second. It
//! only knows the generation number it was started with; whenever the lobby
//! starts a new ticker or stops the current one, the generation stored in
//! the state no longer matches and the old task exits on its next tick.
//! Without a tokio runtime no task is spawned and [`Lobby::tick`] can be
//! driven by hand.

use crate::clock::Clock;
use crate::error::{HandshakeError, LobbyError};
use crate::normalize::{check_guess, is_separator, normalize, GuessResult};
use crate::player::{sanitize_name, Player};
use crate::scoring::{GuesserOutcome, ScoringKind};
use crate::transport::Transport;
use crate::words::{Language, WordCache, WordPool};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{
    ChatMessage, DrawOp, EditableSettings, FillData, GalleryEntry, GameOver, GameState, KickVote,
    LineData, NextTurn, PlayerId, PlayerRef, PlayerState, PlayerView, Ready, ServerEvent,
    WordHint, WordHintUpdate, YourTurn, EVENT_CHOOSE_WORD, EVENT_CLEAR_DRAWING_BOARD, EVENT_FILL,
    EVENT_KEEP_ALIVE, EVENT_KICK_VOTE, EVENT_LINE, EVENT_MESSAGE, EVENT_NAME_CHANGE,
    EVENT_REQUEST_DRAWING, EVENT_START, EVENT_TOGGLE_READINESS, EVENT_TOGGLE_SPECTATE, EVENT_UNDO,
    MAX_BRUSH_SIZE, MIN_BRUSH_SIZE,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

pub const WORD_CHOICE_MILLIS: u64 = 30_000;
/// How long a drawer or the last guessers may be gone before the turn ends.
pub const DISCONNECT_GRACE_MILLIS: u64 = 8_000;
/// How long a disconnected player keeps their slot.
pub const SLOT_RESERVATION_MILLIS: u64 = 60_000;
pub const MAX_MESSAGE_BYTES: usize = 10_000;
const UNDO_BOUNDARY_MILLIS: u64 = 150;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything needed to open a lobby besides its first player.
#[derive(Debug, Clone)]
pub struct LobbyOptions {
    pub settings: EditableSettings,
    pub language: Language,
    pub scoring: ScoringKind,
    pub custom_words: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyState {
    settings: EditableSettings,
    /// Drawing time requested during a game, applied at the next turn.
    pending_drawing_time: Option<u32>,
    scoring: ScoringKind,
    game_state: GameState,
    round: u32,
    /// Order decides the drawing rotation.
    players: Vec<Player>,
    owner: PlayerId,

    current_word: String,
    word_choice: Vec<String>,
    preselected_word: usize,
    word_hints: Vec<WordHint>,
    word_hints_shown: Vec<WordHint>,
    hint_count: usize,
    hints_left: usize,
    round_end: u64,
    word_choice_end: u64,

    drawing: Vec<DrawOp>,
    undo_boundaries: Vec<usize>,
    last_draw_event: u64,
    gallery: Vec<GalleryEntry>,

    words: WordPool,
    last_disconnect: u64,

    #[serde(skip)]
    ticker: Option<u64>,
    #[serde(skip)]
    ticker_counter: u64,
}

impl LobbyState {
    pub fn game_state(&self) -> GameState {
        self.game_state
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn settings(&self) -> &EditableSettings {
        &self.settings
    }

    pub fn scoring(&self) -> ScoringKind {
        self.scoring
    }

    pub fn language(&self) -> Language {
        self.words.language()
    }

    pub fn owner(&self) -> PlayerId {
        self.owner
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|player| player.id == id)
    }

    pub fn drawer(&self) -> Option<&Player> {
        self.players
            .iter()
            .find(|player| player.state == PlayerState::Drawing)
    }

    /// Empty while no word has been chosen.
    pub fn current_word(&self) -> &str {
        &self.current_word
    }

    pub fn word_choice(&self) -> &[String] {
        &self.word_choice
    }

    pub fn preselected_word(&self) -> usize {
        self.preselected_word
    }

    pub fn word_hints(&self) -> &[WordHint] {
        &self.word_hints
    }

    pub fn revealed_word_hints(&self) -> &[WordHint] {
        &self.word_hints_shown
    }

    pub fn hint_count(&self) -> usize {
        self.hint_count
    }

    pub fn hints_left(&self) -> usize {
        self.hints_left
    }

    pub fn round_end(&self) -> u64 {
        self.round_end
    }

    pub fn word_choice_end(&self) -> u64 {
        self.word_choice_end
    }

    pub fn drawing(&self) -> &[DrawOp] {
        &self.drawing
    }

    pub fn undo_boundaries(&self) -> &[usize] {
        &self.undo_boundaries
    }

    pub fn gallery(&self) -> &[GalleryEntry] {
        &self.gallery
    }

    pub fn pending_drawing_time(&self) -> Option<u32> {
        self.pending_drawing_time
    }

    /// Generation of the running ticker, if any.
    pub fn ticker(&self) -> Option<u64> {
        self.ticker
    }

    fn player_index(&self, id: PlayerId) -> Option<usize> {
        self.players.iter().position(|player| player.id == id)
    }

    fn drawer_index(&self) -> Option<usize> {
        self.players
            .iter()
            .position(|player| player.state == PlayerState::Drawing)
    }

    fn player_views(&self) -> Vec<PlayerView> {
        self.players.iter().map(Player::view).collect()
    }

    fn connected_count(&self) -> usize {
        self.players.iter().filter(|player| player.connected).count()
    }

    fn anyone_guessing(&self) -> bool {
        self.players
            .iter()
            .any(|player| player.connected && player.state == PlayerState::Guessing)
    }

    fn can_draw(&self, id: PlayerId) -> bool {
        self.game_state == GameState::Ongoing
            && !self.current_word.is_empty()
            && self.drawer().map(|drawer| drawer.id) == Some(id)
    }

    fn hints_for(&self, player: &Player) -> Vec<WordHint> {
        if self.current_word.is_empty() {
            Vec::new()
        } else if player.state == PlayerState::Guessing {
            self.word_hints.clone()
        } else {
            self.word_hints_shown.clone()
        }
    }

    fn remaining_round_millis(&self, now: u64) -> u64 {
        if self.game_state == GameState::Ongoing && !self.current_word.is_empty() {
            self.round_end.saturating_sub(now)
        } else {
            0
        }
    }

    fn ready_data(&self, player: &Player, now: u64) -> Ready {
        Ready {
            player_id: player.id,
            player_name: player.name.clone(),
            owner_id: self.owner,
            allow_drawing: self.can_draw(player.id),
            game_state: self.game_state,
            round: self.round,
            rounds: self.settings.rounds,
            round_end_time: self.remaining_round_millis(now),
            settings: self.settings.clone(),
            word_hints: self.hints_for(player),
            players: self.player_views(),
            current_drawing: self.drawing.clone(),
        }
    }

    /// Dense ranking over connected players: equal scores share a rank and
    /// the next lower score gets the following rank.
    fn recalculate_ranks(&mut self) {
        let mut scores: Vec<u32> = self
            .players
            .iter()
            .filter(|player| player.connected)
            .map(|player| player.score)
            .collect();
        scores.sort_unstable_by(|a, b| b.cmp(a));
        scores.dedup();

        for player in self.players.iter_mut().filter(|player| player.connected) {
            if let Some(position) = scores.iter().position(|&score| score == player.score) {
                player.rank = position as u32 + 1;
            }
        }
    }

    /// The player who draws next and whether picking them wraps the round.
    /// `skip` is treated as not eligible.
    fn next_drawer(&self, skip: Option<PlayerId>) -> Option<(PlayerId, bool)> {
        let eligible = |player: &&Player| {
            player.connected && !player.will_spectate() && Some(player.id) != skip
        };

        if let Some(current) = self.drawer_index() {
            if let Some(player) = self.players[current + 1..].iter().find(eligible) {
                return Some((player.id, false));
            }
        }

        self.players
            .iter()
            .find(eligible)
            .map(|player| (player.id, true))
    }

    fn clear_drawing(&mut self) {
        self.drawing.clear();
        self.undo_boundaries.clear();
    }

    fn reset_turn(&mut self) {
        self.current_word.clear();
        self.word_choice.clear();
        self.preselected_word = 0;
        self.word_hints.clear();
        self.word_hints_shown.clear();
        self.hint_count = 0;
        self.hints_left = 0;
        self.round_end = 0;
        self.word_choice_end = 0;
    }

    fn occupied_slots(&self, now: u64) -> usize {
        self.players
            .iter()
            .filter(|player| {
                player.connected
                    || !player.has_connected_once()
                    || player.disconnect_time.map_or(true, |time| {
                        now.saturating_sub(time) < SLOT_RESERVATION_MILLIS
                    })
            })
            .count()
    }

    fn address_has_room(&self, address: &str) -> bool {
        let same_address = self
            .players
            .iter()
            .filter(|player| player.last_known_address() == Some(address))
            .count();
        same_address < self.settings.clients_per_address_limit as usize
    }

    fn shift_timestamps(&mut self, by_millis: u64) {
        let shift = |time: &mut u64| {
            if *time > 0 {
                *time += by_millis;
            }
        };
        shift(&mut self.round_end);
        shift(&mut self.word_choice_end);
        shift(&mut self.last_draw_event);
        shift(&mut self.last_disconnect);
        for player in self.players.iter_mut() {
            player.shift_timestamps(by_millis);
        }
    }
}

/// Serialized form of a lobby, used to carry running games over a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySnapshot {
    pub id: String,
    state: LobbyState,
}

pub struct Lobby {
    id: String,
    me: Weak<Lobby>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<LobbyState>,
}

impl Lobby {
    /// Opens a new lobby owned by a freshly created player.
    ///
    /// Settings are taken as given; bounds are checked by the caller. Fails
    /// only if the dictionary for the language can't be loaded.
    pub fn create(
        creator_name: &str,
        creator_address: Option<String>,
        options: LobbyOptions,
        words: &WordCache,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Player, Arc<Lobby>), LobbyError> {
        let dictionary = words.words(options.language)?;
        let mut creator = Player::new(creator_name, PlayerState::Standby);
        creator.last_known_address = creator_address;

        let state = LobbyState {
            settings: options.settings,
            pending_drawing_time: None,
            scoring: options.scoring,
            game_state: GameState::Unstarted,
            round: 0,
            players: vec![creator.clone()],
            owner: creator.id,
            current_word: String::new(),
            word_choice: Vec::new(),
            preselected_word: 0,
            word_hints: Vec::new(),
            word_hints_shown: Vec::new(),
            hint_count: 0,
            hints_left: 0,
            round_end: 0,
            word_choice_end: 0,
            drawing: Vec::new(),
            undo_boundaries: Vec::new(),
            last_draw_event: 0,
            gallery: Vec::new(),
            words: WordPool::new(options.language, dictionary, options.custom_words),
            last_disconnect: clock.now_millis(),
            ticker: None,
            ticker_counter: 0,
        };

        let lobby = Self::from_state(Uuid::new_v4().to_string(), state, transport, clock);
        info!(
            "Lobby {} created by {} ({}, {})",
            lobby.id, creator.name, options.language, options.scoring
        );
        Ok((creator, lobby))
    }

    /// Rebuilds a lobby from a snapshot taken `gap_millis` ago.
    ///
    /// All timestamps are moved forward by the gap, every player is marked
    /// disconnected until they reconnect with their session, and a running
    /// game gets a fresh ticker.
    pub fn resurrect(
        snapshot: LobbySnapshot,
        gap_millis: u64,
        words: &WordCache,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Lobby>, LobbyError> {
        let mut state = snapshot.state;
        let dictionary = words.words(state.words.language())?;
        state.words.attach_dictionary(dictionary);
        state.shift_timestamps(gap_millis);

        let now = clock.now_millis();
        for player in state.players.iter_mut() {
            if player.connected {
                player.connected = false;
                player.disconnect_time = Some(now);
            }
        }
        state.last_disconnect = now;
        state.ticker = None;

        let lobby = Self::from_state(snapshot.id, state, transport, clock);
        {
            let mut state = lobby.state.lock();
            if state.game_state == GameState::Ongoing {
                lobby.start_ticker(&mut state);
            }
        }
        info!("Lobby {} restored", lobby.id);
        Ok(lobby)
    }

    fn from_state(
        id: String,
        state: LobbyState,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Lobby> {
        Arc::new_cyclic(|me| Lobby {
            id,
            me: me.clone(),
            transport,
            clock,
            state: Mutex::new(state),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            id: self.id.clone(),
            state: self.state.lock().clone(),
        }
    }

    /// Runs `f` with the lobby lock held.
    pub fn synchronized<R>(&self, f: impl FnOnce(&mut LobbyState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Adds a player. Late joiners guess; nobody joins as drawer.
    pub fn join(&self, name: &str, address: Option<String>) -> Player {
        let mut state = self.state.lock();
        self.add_player(&mut state, name, address)
    }

    /// Checks the free slots and the per-address limit and adds the player,
    /// all under one lock so concurrent joins can't overfill the lobby.
    pub fn try_join(&self, name: &str, address: &str) -> Result<Player, HandshakeError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.occupied_slots(now) >= state.settings.max_players as usize {
            return Err(HandshakeError::LobbyFull);
        }
        if !state.address_has_room(address) {
            return Err(HandshakeError::TooManyClients);
        }
        Ok(self.add_player(&mut state, name, Some(address.to_string())))
    }

    fn add_player(&self, state: &mut LobbyState, name: &str, address: Option<String>) -> Player {
        let initial_state = if state.game_state == GameState::Ongoing {
            PlayerState::Guessing
        } else {
            PlayerState::Standby
        };

        let mut player = Player::new(name, initial_state);
        player.last_known_address = address;
        state.players.push(player.clone());
        info!("{} joined lobby {}", player.name, self.id);
        player
    }

    pub fn player_by_session(&self, session: Uuid) -> Option<PlayerId> {
        self.state
            .lock()
            .players
            .iter()
            .find(|player| player.session() == session)
            .map(|player| player.id)
    }

    /// Looks up the player owning `session` and records the address they
    /// are coming back from.
    pub fn resume_session(&self, session: Uuid, address: &str) -> Option<PlayerId> {
        let mut state = self.state.lock();
        let player = state
            .players
            .iter_mut()
            .find(|player| player.session() == session)?;
        player.set_last_known_address(address);
        Some(player.id)
    }

    pub fn is_public(&self) -> bool {
        self.state.lock().settings.public
    }

    pub fn player_count(&self) -> usize {
        self.state.lock().players.len()
    }

    pub fn connected_player_count(&self) -> usize {
        self.state.lock().connected_count()
    }

    pub fn has_connected_players(&self) -> bool {
        self.state.lock().players.iter().any(|player| player.connected)
    }

    pub fn last_disconnect_time(&self) -> u64 {
        self.state.lock().last_disconnect
    }

    /// Players that hold a slot: connected ones, ones that never connected
    /// yet and ones that left less than a minute ago.
    pub fn occupied_player_slots(&self) -> usize {
        let now = self.clock.now_millis();
        self.state.lock().occupied_slots(now)
    }

    pub fn has_free_player_slot(&self) -> bool {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        state.occupied_slots(now) < state.settings.max_players as usize
    }

    /// Whether a new player from `address` stays within the per-address limit.
    pub fn can_address_connect(&self, address: &str) -> bool {
        self.state.lock().address_has_room(address)
    }

    /// Attaches a live connection to an existing player and sends them the
    /// full lobby state.
    pub fn on_connect(&self, id: PlayerId) -> Result<(), LobbyError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let index = state.player_index(id).ok_or(LobbyError::PlayerNotFound(id))?;

        let player = &mut state.players[index];
        player.connected = true;
        player.ever_connected = true;
        player.disconnect_time = None;
        info!("{} connected to lobby {}", player.name, self.id);

        state.recalculate_ranks();
        let ready = state.ready_data(&state.players[index], now);
        self.send_to(id, &ServerEvent::Ready(ready));

        let is_choosing = state.drawer().map(|drawer| drawer.id) == Some(id)
            && state.current_word.is_empty()
            && !state.word_choice.is_empty();
        if is_choosing {
            self.send_to(
                id,
                &ServerEvent::YourTurn(YourTurn {
                    words: state.word_choice.clone(),
                    preselected_word: state.preselected_word,
                    choice_end_time: state.word_choice_end.saturating_sub(now),
                }),
            );
        }

        let players = ServerEvent::UpdatePlayers(state.player_views());
        self.broadcast_if(&state, &players, |player| player.id != id);
        Ok(())
    }

    pub fn on_disconnect(&self, id: PlayerId) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let index = match state.player_index(id) {
            Some(index) => index,
            None => return,
        };
        if !state.players[index].connected {
            return;
        }

        let game_running = state.game_state == GameState::Ongoing;
        let player = &mut state.players[index];
        player.connected = false;
        player.disconnect_time = Some(now);
        if !game_running && player.state == PlayerState::Ready {
            player.state = PlayerState::Standby;
        }
        info!("{} disconnected from lobby {}", player.name, self.id);
        state.last_disconnect = now;

        state.recalculate_ranks();
        self.broadcast(&state, &ServerEvent::UpdatePlayers(state.player_views()));

        if !game_running {
            self.start_if_all_ready(&mut state);
        }
    }

    /// Single entry point for inbound player events.
    ///
    /// Unknown and out-of-context events are ignored. Malformed payloads are
    /// answered with a system message and reported as
    /// [`LobbyError::InvalidPayload`].
    pub fn handle_event(
        &self,
        event_type: &str,
        data: serde_json::Value,
        sender: PlayerId,
    ) -> Result<(), LobbyError> {
        if event_type == EVENT_KEEP_ALIVE {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.player_index(sender).is_none() {
            debug!("Ignoring '{}' from unknown player {}", event_type, sender);
            return Ok(());
        }

        match event_type {
            EVENT_MESSAGE => {
                let text: String = self.parse_payload(sender, event_type, data)?;
                self.handle_message(&mut state, sender, &text);
            }
            EVENT_LINE => {
                let line: LineData = self.parse_payload(sender, event_type, data)?;
                self.handle_line(&mut state, sender, line);
            }
            EVENT_FILL => {
                let fill: FillData = self.parse_payload(sender, event_type, data)?;
                self.handle_fill(&mut state, sender, fill);
            }
            EVENT_CLEAR_DRAWING_BOARD => self.handle_clear(&mut state, sender),
            EVENT_UNDO => self.handle_undo(&mut state, sender),
            EVENT_REQUEST_DRAWING => {
                if !state.drawing.is_empty() {
                    self.send_to(sender, &ServerEvent::Drawing(state.drawing.clone()));
                }
            }
            EVENT_CHOOSE_WORD => {
                let index: usize = self.parse_payload(sender, event_type, data)?;
                self.choose_word(&mut state, sender, index)?;
            }
            EVENT_KICK_VOTE => {
                let target: PlayerId = self.parse_payload(sender, event_type, data)?;
                self.kick_vote(&mut state, sender, target);
            }
            EVENT_NAME_CHANGE => {
                let name: String = self.parse_payload(sender, event_type, data)?;
                self.change_name(&mut state, sender, &name);
            }
            EVENT_TOGGLE_READINESS => self.toggle_readiness(&mut state, sender),
            EVENT_TOGGLE_SPECTATE => self.toggle_spectate(&mut state, sender),
            EVENT_START => {
                if sender == state.owner && state.game_state != GameState::Ongoing {
                    self.start_game(&mut state);
                }
            }
            other => debug!("Ignoring unknown event type '{}'", other),
        }

        Ok(())
    }

    /// Applies new settings. Only the owner may do this. A new drawing time
    /// waits for the next turn while a game runs.
    pub fn update_settings(
        &self,
        caller: PlayerId,
        settings: EditableSettings,
    ) -> Result<(), LobbyError> {
        let mut state = self.state.lock();
        if caller != state.owner {
            return Err(LobbyError::NotOwner);
        }

        let mut applied = settings.clone();
        if state.game_state == GameState::Ongoing
            && settings.drawing_time != state.settings.drawing_time
        {
            state.pending_drawing_time = Some(settings.drawing_time);
            applied.drawing_time = state.settings.drawing_time;
        } else {
            state.pending_drawing_time = None;
        }
        applied.rounds = applied.rounds.max(state.round);
        state.settings = applied;

        let mut announced = state.settings.clone();
        if let Some(drawing_time) = state.pending_drawing_time {
            announced.drawing_time = drawing_time;
        }
        info!("Lobby {} settings changed: {:?}", self.id, announced);
        self.broadcast(&state, &ServerEvent::LobbySettingsChanged(announced));
        Ok(())
    }

    /// Tells every player the lobby is going away and drops their
    /// connections.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.ticker = None;
        self.broadcast(&state, &ServerEvent::Shutdown);
        for player in state.players.iter().filter(|player| player.connected) {
            self.transport.close(player.id);
        }
        info!("Lobby {} shut down", self.id);
    }

    /// One tick of the turn timer. Returns false once `generation` is no
    /// longer the lobby's current ticker, telling the caller to stop.
    pub fn tick(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.ticker != Some(generation) {
            return false;
        }
        self.tick_locked(&mut state);
        state.ticker == Some(generation)
    }

    fn tick_locked(&self, state: &mut LobbyState) {
        let now = self.clock.now_millis();
        if state.game_state != GameState::Ongoing {
            state.ticker = None;
            return;
        }

        if let Some(reason) = early_end_reason(state, now) {
            info!("Lobby {}: turn ended early, {}", self.id, reason);
            self.broadcast(state, &ServerEvent::SystemMessage(reason.to_string()));
            self.advance(state);
            return;
        }

        if state.current_word.is_empty() {
            if now >= state.word_choice_end && state.preselected_word < state.word_choice.len() {
                let index = state.preselected_word;
                self.select_word(state, index);
            }
            return;
        }

        if now >= state.round_end {
            self.advance(state);
            return;
        }

        self.reveal_hints(state, now);
    }

    fn start_ticker(&self, state: &mut LobbyState) {
        state.ticker_counter += 1;
        let generation = state.ticker_counter;
        state.ticker = Some(generation);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No runtime, lobby {} ticks manually", self.id);
                return;
            }
        };

        let lobby = self.me.clone();
        handle.spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;
                let lobby = match lobby.upgrade() {
                    Some(lobby) => lobby,
                    None => break,
                };
                if !lobby.tick(generation) {
                    break;
                }
            }
        });
    }

    fn reveal_hints(&self, state: &mut LobbyState, now: u64) {
        if state.hints_left == 0 {
            return;
        }

        let drawing_millis = u64::from(state.settings.drawing_time) * 1000;
        let cadence = drawing_millis / (state.hint_count as u64 + 1);
        let time_left = state.round_end.saturating_sub(now);
        if time_left > cadence * state.hints_left as u64 {
            return;
        }

        let hidden: Vec<usize> = state
            .word_hints
            .iter()
            .enumerate()
            .filter(|(_, hint)| hint.character.is_none())
            .map(|(index, _)| index)
            .collect();
        let index = match hidden.choose(&mut rand::thread_rng()) {
            Some(&index) => index,
            None => {
                state.hints_left = 0;
                return;
            }
        };

        state.word_hints[index].character = state.word_hints_shown[index].character;
        state.hints_left -= 1;

        let update = ServerEvent::UpdateWordHint(WordHintUpdate {
            word_hints: state.word_hints.clone(),
            round_end_time: time_left,
        });
        self.broadcast_if(state, &update, |player| {
            player.state == PlayerState::Guessing
        });
    }

    fn handle_message(&self, state: &mut LobbyState, sender: PlayerId, text: &str) {
        let content = text.trim();
        if content.is_empty() || text.len() > MAX_MESSAGE_BYTES {
            return;
        }
        let now = self.clock.now_millis();
        let index = match state.player_index(sender) {
            Some(index) => index,
            None => return,
        };

        let player = &mut state.players[index];
        let message = ChatMessage {
            author: player.name.clone(),
            author_id: sender,
            content: content.to_string(),
        };

        if !player.allow_message(now) {
            debug!("Rate limited message from {}", player.name);
            self.send_to(sender, &ServerEvent::Message(message));
            return;
        }

        if state.current_word.is_empty() {
            self.broadcast(state, &ServerEvent::Message(message));
            return;
        }

        if state.players[index].state != PlayerState::Guessing {
            self.broadcast_if(
                state,
                &ServerEvent::NonGuessingPlayerMessage(message),
                |player| player.state != PlayerState::Guessing,
            );
            return;
        }

        match check_guess(&normalize(content), &normalize(&state.current_word)) {
            GuessResult::Exact => self.handle_correct_guess(state, index, now),
            GuessResult::Close => {
                self.broadcast(state, &ServerEvent::Message(message));
                self.send_to(sender, &ServerEvent::CloseGuess(content.to_string()));
            }
            GuessResult::Distant => self.broadcast(state, &ServerEvent::Message(message)),
        }
    }

    fn handle_correct_guess(&self, state: &mut LobbyState, index: usize, now: u64) {
        let drawing_millis = u64::from(state.settings.drawing_time) * 1000;
        let elapsed = drawing_millis.saturating_sub(state.round_end.saturating_sub(now));
        let score = state.scoring.strategy().guesser_score(
            state.hint_count,
            state.hints_left,
            state.settings.drawing_time,
            elapsed,
        );

        let player = &mut state.players[index];
        player.last_score = score;
        player.score += score;
        player.state = PlayerState::Standby;
        let id = player.id;
        info!("{} guessed the word in lobby {}", player.name, self.id);

        self.broadcast(state, &ServerEvent::CorrectGuess(id));

        if !state.anyone_guessing() {
            self.advance(state);
            return;
        }

        self.send_to(
            id,
            &ServerEvent::UpdateWordHint(WordHintUpdate {
                word_hints: state.word_hints_shown.clone(),
                round_end_time: state.remaining_round_millis(now),
            }),
        );
        state.recalculate_ranks();
        self.broadcast(state, &ServerEvent::UpdatePlayers(state.player_views()));
    }

    fn push_undo_boundary(state: &mut LobbyState) {
        let boundary = state.drawing.len();
        if state.undo_boundaries.last() != Some(&boundary) {
            state.undo_boundaries.push(boundary);
        }
    }

    fn handle_line(&self, state: &mut LobbyState, sender: PlayerId, mut line: LineData) {
        if !state.can_draw(sender) {
            return;
        }
        let now = self.clock.now_millis();
        line.line_width = line.line_width.clamp(MIN_BRUSH_SIZE, MAX_BRUSH_SIZE);

        let after_fill = matches!(state.drawing.last(), Some(DrawOp::Fill(_)));
        if after_fill || now.saturating_sub(state.last_draw_event) > UNDO_BOUNDARY_MILLIS {
            Self::push_undo_boundary(state);
        }
        state.last_draw_event = now;
        state.drawing.push(DrawOp::Line(line.clone()));

        self.broadcast_if(state, &ServerEvent::Line(line), |player| player.id != sender);
    }

    fn handle_fill(&self, state: &mut LobbyState, sender: PlayerId, fill: FillData) {
        if !state.can_draw(sender) {
            return;
        }
        Self::push_undo_boundary(state);
        state.last_draw_event = self.clock.now_millis();
        state.drawing.push(DrawOp::Fill(fill.clone()));

        self.broadcast_if(state, &ServerEvent::Fill(fill), |player| player.id != sender);
    }

    fn handle_clear(&self, state: &mut LobbyState, sender: PlayerId) {
        if !state.can_draw(sender) || state.drawing.is_empty() {
            return;
        }
        state.clear_drawing();
        self.broadcast_if(state, &ServerEvent::ClearDrawingBoard, |player| {
            player.id != sender
        });
    }

    fn handle_undo(&self, state: &mut LobbyState, sender: PlayerId) {
        if !state.can_draw(sender) {
            return;
        }
        if let Some(boundary) = state.undo_boundaries.pop() {
            state.drawing.truncate(boundary);
            self.broadcast(state, &ServerEvent::Drawing(state.drawing.clone()));
        }
    }

    fn choose_word(
        &self,
        state: &mut LobbyState,
        sender: PlayerId,
        index: usize,
    ) -> Result<(), LobbyError> {
        if state.game_state != GameState::Ongoing
            || state.drawer().map(|drawer| drawer.id) != Some(sender)
        {
            return Ok(());
        }
        if state.word_choice.is_empty() {
            return Err(LobbyError::NoWordChoice);
        }
        if index >= state.word_choice.len() {
            return Err(LobbyError::WordChoiceOutOfRange {
                index,
                available: state.word_choice.len(),
            });
        }

        self.select_word(state, index);
        Ok(())
    }

    fn select_word(&self, state: &mut LobbyState, index: usize) {
        let now = self.clock.now_millis();
        let word = state.word_choice.swap_remove(index);
        state.word_choice.clear();

        let (hints, shown) = build_hints(&word);
        state.hint_count = hint_budget(word.chars().count());
        state.hints_left = state.hint_count;
        state.word_hints = hints;
        state.word_hints_shown = shown;
        state.current_word = word;
        state.round_end = now + u64::from(state.settings.drawing_time) * 1000;
        debug!("Lobby {}: word chosen", self.id);

        let remaining = state.remaining_round_millis(now);
        let masked = ServerEvent::WordChosen(WordHintUpdate {
            word_hints: state.word_hints.clone(),
            round_end_time: remaining,
        });
        self.broadcast_if(state, &masked, |player| {
            player.state == PlayerState::Guessing
        });
        let revealed = ServerEvent::WordChosen(WordHintUpdate {
            word_hints: state.word_hints_shown.clone(),
            round_end_time: remaining,
        });
        self.broadcast_if(state, &revealed, |player| {
            player.state != PlayerState::Guessing
        });
    }

    fn kick_vote(&self, state: &mut LobbyState, voter: PlayerId, target: PlayerId) {
        if voter == target {
            return;
        }
        let (voter_index, target_index) = match (state.player_index(voter), state.player_index(target)) {
            (Some(voter_index), Some(target_index)) => (voter_index, target_index),
            _ => return,
        };
        if !state.players[voter_index].connected {
            return;
        }
        if !state.players[voter_index].kick_votes.insert(target) {
            return;
        }

        let vote_count = state
            .players
            .iter()
            .filter(|player| player.connected && player.kick_votes.contains(&target))
            .count();
        let required = votes_needed(state.connected_count());

        self.broadcast(
            state,
            &ServerEvent::KickVote(KickVote {
                player_id: target,
                player_name: state.players[target_index].name.clone(),
                vote_count: vote_count as u32,
                required_vote_count: required as u32,
            }),
        );

        if vote_count >= required {
            self.kick(state, target);
        }
    }

    fn kick(&self, state: &mut LobbyState, target: PlayerId) {
        let index = match state.player_index(target) {
            Some(index) => index,
            None => return,
        };

        self.transport.close(target);
        for player in state.players.iter_mut() {
            player.kick_votes.remove(&target);
        }

        let next = state.next_drawer(Some(target));
        let kicked = state.players.remove(index);
        info!("{} was kicked from lobby {}", kicked.name, self.id);

        if state.owner == target {
            if let Some(new_owner) = state.players.iter().find(|player| player.connected) {
                state.owner = new_owner.id;
                let change = ServerEvent::OwnerChange(PlayerRef {
                    player_id: new_owner.id,
                    player_name: new_owner.name.clone(),
                });
                self.broadcast(state, &change);
            }
        }

        let ongoing = state.game_state == GameState::Ongoing;
        if ongoing && kicked.state == PlayerState::Drawing {
            self.broadcast(state, &ServerEvent::DrawerKicked);
            // A truncated turn doesn't count for anyone. Mid-game, only
            // players who guessed this turn are in standby.
            for player in state
                .players
                .iter_mut()
                .filter(|player| player.state == PlayerState::Standby)
            {
                player.score = player.score.saturating_sub(player.last_score);
                player.last_score = 0;
            }
            self.advance_to(state, next);
        } else if ongoing && !state.anyone_guessing() {
            self.advance(state);
        } else {
            state.recalculate_ranks();
            self.broadcast(state, &ServerEvent::UpdatePlayers(state.player_views()));
        }
    }

    fn change_name(&self, state: &mut LobbyState, sender: PlayerId, name: &str) {
        let name = sanitize_name(name);
        let index = match state.player_index(sender) {
            Some(index) => index,
            None => return,
        };
        let player = &mut state.players[index];
        if player.name == name {
            return;
        }

        debug!("{} is now called {}", player.name, name);
        player.name = name.clone();
        self.broadcast(
            state,
            &ServerEvent::NameChange(PlayerRef {
                player_id: sender,
                player_name: name,
            }),
        );
    }

    fn toggle_readiness(&self, state: &mut LobbyState, sender: PlayerId) {
        if state.game_state == GameState::Ongoing {
            return;
        }
        let index = match state.player_index(sender) {
            Some(index) => index,
            None => return,
        };
        let player = &mut state.players[index];
        player.state = match player.state {
            PlayerState::Ready => PlayerState::Standby,
            PlayerState::Spectating => return,
            _ => PlayerState::Ready,
        };

        self.broadcast(state, &ServerEvent::UpdatePlayers(state.player_views()));
        self.start_if_all_ready(state);
    }

    fn toggle_spectate(&self, state: &mut LobbyState, sender: PlayerId) {
        let index = match state.player_index(sender) {
            Some(index) => index,
            None => return,
        };
        let ongoing = state.game_state == GameState::Ongoing;
        let player = &mut state.players[index];

        if ongoing {
            player.spectate_toggle_requested = !player.spectate_toggle_requested;
        } else {
            player.spectate_toggle_requested = false;
            player.state = if player.state == PlayerState::Spectating {
                PlayerState::Standby
            } else {
                PlayerState::Spectating
            };
        }

        self.broadcast(state, &ServerEvent::UpdatePlayers(state.player_views()));
        if !ongoing {
            self.start_if_all_ready(state);
        }
    }

    fn start_if_all_ready(&self, state: &mut LobbyState) {
        if state.game_state == GameState::Ongoing {
            return;
        }
        let mut candidates = state
            .players
            .iter()
            .filter(|player| player.connected && player.state != PlayerState::Spectating)
            .peekable();
        if candidates.peek().is_none() {
            return;
        }
        if candidates.all(|player| player.state == PlayerState::Ready) {
            self.start_game(state);
        }
    }

    fn start_game(&self, state: &mut LobbyState) {
        info!("Lobby {}: game started", self.id);
        for player in state.players.iter_mut() {
            player.score = 0;
            player.last_score = 0;
            player.rank = 1;
        }
        state.round = 0;
        state.gallery.clear();
        state.reset_turn();
        state.clear_drawing();

        let next = state.next_drawer(None);
        self.advance_to(state, next);
    }

    fn advance(&self, state: &mut LobbyState) {
        let next = state.next_drawer(None);
        self.advance_to(state, next);
    }

    /// Settles the running turn and hands the pen to `next`, or ends the
    /// game if there is no next drawer or the last round just wrapped.
    fn advance_to(&self, state: &mut LobbyState, next: Option<(PlayerId, bool)>) {
        let now = self.clock.now_millis();
        state.ticker = None;

        for player in state
            .players
            .iter_mut()
            .filter(|player| player.state == PlayerState::Guessing)
        {
            player.last_score = 0;
        }

        if let Some(drawer_index) = state.drawer_index() {
            let outcomes: Vec<GuesserOutcome> = state
                .players
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != drawer_index)
                .map(|(_, player)| GuesserOutcome {
                    state: player.state,
                    connected: player.connected,
                    last_score: player.last_score,
                })
                .collect();
            let score = state.scoring.strategy().drawer_score(&outcomes);
            let drawer = &mut state.players[drawer_index];
            drawer.last_score = score;
            drawer.score += score;
        }

        if !state.current_word.is_empty() && !state.drawing.is_empty() {
            let entry = GalleryEntry {
                word: state.current_word.clone(),
                drawing: state.drawing.clone(),
            };
            state.gallery.push(entry);
        }

        let previous_word = std::mem::take(&mut state.current_word);
        state.reset_turn();
        if let Some(drawing_time) = state.pending_drawing_time.take() {
            state.settings.drawing_time = drawing_time;
        }

        for player in state.players.iter_mut() {
            if player.state != PlayerState::Spectating {
                player.state = PlayerState::Guessing;
            }
            if player.spectate_toggle_requested {
                player.spectate_toggle_requested = false;
                player.state = if player.state == PlayerState::Spectating {
                    PlayerState::Guessing
                } else {
                    PlayerState::Spectating
                };
            }
        }

        let next = next
            .filter(|&(_, round_over)| !(round_over && state.round >= state.settings.rounds))
            .and_then(|(id, round_over)| state.player_index(id).map(|index| (index, round_over)));
        let (drawer_index, round_over) = match next {
            Some(next) => next,
            None => {
                self.end_game(state, previous_word, now);
                return;
            }
        };

        if round_over {
            state.round += 1;
        }
        state.clear_drawing();
        state.players[drawer_index].state = PlayerState::Drawing;
        state.game_state = GameState::Ongoing;

        let count = state.settings.word_select_count as usize;
        let custom_per_turn = state.settings.custom_words_per_turn as usize;
        state.word_choice = state.words.next_words(count, custom_per_turn);
        state.preselected_word = if state.word_choice.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..state.word_choice.len())
        };
        state.word_choice_end = now + WORD_CHOICE_MILLIS;
        self.start_ticker(state);
        state.recalculate_ranks();

        let drawer_id = state.players[drawer_index].id;
        info!(
            "Lobby {}: round {}/{}, {} is drawing",
            self.id, state.round, state.settings.rounds, state.players[drawer_index].name
        );

        self.broadcast(
            state,
            &ServerEvent::NextTurn(NextTurn {
                previous_word,
                players: state.player_views(),
                round: state.round,
                choice_end_time: WORD_CHOICE_MILLIS,
            }),
        );
        self.send_to(
            drawer_id,
            &ServerEvent::YourTurn(YourTurn {
                words: state.word_choice.clone(),
                preselected_word: state.preselected_word,
                choice_end_time: WORD_CHOICE_MILLIS,
            }),
        );
    }

    fn end_game(&self, state: &mut LobbyState, previous_word: String, now: u64) {
        state.game_state = GameState::GameOver;
        state.ticker = None;
        state.recalculate_ranks();
        info!("Lobby {}: game over after round {}", self.id, state.round);

        for player in state.players.iter().filter(|player| player.connected) {
            let event = ServerEvent::GameOver(GameOver {
                ready: state.ready_data(player, now),
                previous_word: previous_word.clone(),
                gallery: state.gallery.clone(),
            });
            self.send_to(player.id, &event);
        }
    }

    fn parse_payload<T: DeserializeOwned>(
        &self,
        sender: PlayerId,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<T, LobbyError> {
        serde_json::from_value(data).map_err(|source| {
            warn!("Invalid '{}' payload from {}: {}", event_type, sender, source);
            self.send_to(
                sender,
                &ServerEvent::SystemMessage(format!("invalid data for '{}'", event_type)),
            );
            LobbyError::InvalidPayload {
                event: event_type.to_string(),
                source,
            }
        })
    }

    fn deliver(&self, player: PlayerId, message: Arc<str>) {
        if let Err(e) = self.transport.send(player, message) {
            debug!("Failed to send to {}: {}", player, e);
        }
    }

    fn send_to(&self, player: PlayerId, event: &ServerEvent) {
        if let Some(message) = encode(event) {
            self.deliver(player, message);
        }
    }

    /// Sends a private system message without touching the lobby state.
    pub fn send_system_message(&self, player: PlayerId, text: &str) {
        self.send_to(player, &ServerEvent::SystemMessage(text.to_string()));
    }

    fn broadcast(&self, state: &LobbyState, event: &ServerEvent) {
        self.broadcast_if(state, event, |_| true);
    }

    /// Sends to every connected player matching `filter`. Serializes at
    /// most once, and not at all if nobody matches.
    fn broadcast_if(
        &self,
        state: &LobbyState,
        event: &ServerEvent,
        filter: impl Fn(&Player) -> bool,
    ) {
        let mut encoded: Option<Arc<str>> = None;
        for player in state
            .players
            .iter()
            .filter(|player| player.connected && filter(player))
        {
            let message = match &encoded {
                Some(message) => Arc::clone(message),
                None => match encode(event) {
                    Some(message) => {
                        encoded = Some(Arc::clone(&message));
                        message
                    }
                    None => return,
                },
            };
            self.deliver(player.id, message);
        }
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            None
        }
    }
}

fn early_end_reason(state: &LobbyState, now: u64) -> Option<&'static str> {
    let gone_long_enough = |player: &Player| {
        !player.connected
            && player
                .disconnect_time
                .map_or(false, |time| now.saturating_sub(time) >= DISCONNECT_GRACE_MILLIS)
    };

    if let Some(drawer) = state.drawer() {
        if gone_long_enough(drawer) && state.drawing.is_empty() {
            return Some("drawer disconnected");
        }
    }

    // Players that never connected are most likely still loading.
    let mut guessers = state
        .players
        .iter()
        .filter(|player| player.state == PlayerState::Guessing && player.has_connected_once())
        .peekable();
    if guessers.peek().is_some() && guessers.all(gone_long_enough) {
        return Some("all guessers disconnected");
    }

    None
}

/// Number of hints revealed over a turn for a word of `length` characters.
pub fn hint_budget(length: usize) -> usize {
    match length {
        0..=2 => 0,
        3..=4 => 1,
        5..=9 => 2,
        _ => 3,
    }
}

/// Masked and fully revealed hints for `word`. Separators are visible and
/// not underlined in both.
pub fn build_hints(word: &str) -> (Vec<WordHint>, Vec<WordHint>) {
    word.chars()
        .map(|character| {
            if is_separator(character) {
                let hint = WordHint {
                    character: Some(character),
                    underline: false,
                };
                (hint, hint)
            } else {
                (
                    WordHint {
                        character: None,
                        underline: true,
                    },
                    WordHint {
                        character: Some(character),
                        underline: true,
                    },
                )
            }
        })
        .unzip()
}

/// Kick votes required with `connected` players online.
pub fn votes_needed(connected: usize) -> usize {
    if connected <= 2 {
        2
    } else {
        (connected + 2) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    struct Fixture {
        lobby: Arc<Lobby>,
        transport: Arc<MemoryTransport>,
        clock: Arc<ManualClock>,
        players: Vec<PlayerId>,
    }

    impl Fixture {
        fn events(&self, player: PlayerId) -> Vec<ServerEvent> {
            self.transport.events_for(player)
        }

        fn tick(&self) {
            if let Some(generation) = self.lobby.synchronized(|state| state.ticker()) {
                self.lobby.tick(generation);
            }
        }

        fn send(&self, event_type: &str, data: serde_json::Value, sender: PlayerId) {
            self.lobby.handle_event(event_type, data, sender).unwrap();
        }

        fn drawer(&self) -> PlayerId {
            self.lobby
                .synchronized(|state| state.drawer().map(|drawer| drawer.id))
                .unwrap()
        }

        fn word(&self) -> String {
            self.lobby
                .synchronized(|state| state.current_word().to_string())
        }

        fn start_and_choose(&self) {
            self.send(EVENT_START, json!(null), self.players[0]);
            self.send(EVENT_CHOOSE_WORD, json!(0), self.drawer());
        }
    }

    fn settings(rounds: u32) -> EditableSettings {
        EditableSettings {
            max_players: 4,
            rounds,
            drawing_time: 120,
            clients_per_address_limit: 2,
            custom_words_per_turn: 1,
            word_select_count: 3,
            public: false,
        }
    }

    fn fixture_with(count: usize, rounds: u32, dictionary: &'static str) -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let words = WordCache::with_loader(move |_| Some(dictionary.to_string()));
        let options = LobbyOptions {
            settings: settings(rounds),
            language: Language::English,
            scoring: ScoringKind::Chill,
            custom_words: vec![],
        };

        let (owner, lobby) = Lobby::create(
            "owner",
            None,
            options,
            &words,
            transport.clone(),
            clock.clone(),
        )
        .unwrap();
        lobby.on_connect(owner.id).unwrap();

        let mut players = vec![owner.id];
        for i in 1..count {
            let player = lobby.join(&format!("player{}", i), None);
            lobby.on_connect(player.id).unwrap();
            players.push(player.id);
        }
        transport.clear();

        Fixture {
            lobby,
            transport,
            clock,
            players,
        }
    }

    fn fixture(count: usize) -> Fixture {
        fixture_with(count, 4, "apple\nbanana\ncherry\ndragonfruit\nelderberry\n")
    }

    fn line(width: f32) -> serde_json::Value {
        json!({
            "fromX": 0.0, "fromY": 0.0, "toX": 10.0, "toY": 10.0,
            "color": {"r": 0, "g": 0, "b": 0},
            "lineWidth": width
        })
    }

    #[test]
    fn test_create_makes_owner() {
        let f = fixture(1);
        f.lobby.synchronized(|state| {
            assert_eq!(state.owner(), f.players[0]);
            assert_eq!(state.game_state(), GameState::Unstarted);
            assert_eq!(state.round(), 0);
            assert_eq!(state.players()[0].state, PlayerState::Standby);
        });
    }

    #[test]
    fn test_create_fails_without_words() {
        let words = WordCache::with_loader(|_| None);
        let options = LobbyOptions {
            settings: settings(4),
            language: Language::German,
            scoring: ScoringKind::Chill,
            custom_words: vec![],
        };
        let result = Lobby::create(
            "owner",
            None,
            options,
            &words,
            Arc::new(MemoryTransport::new()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(LobbyError::EmptyWordList(Language::German))));
    }

    #[test]
    fn test_connect_sends_ready() {
        let f = fixture(1);
        let player = f.lobby.join("late", None);
        f.lobby.on_connect(player.id).unwrap();

        match &f.events(player.id)[0] {
            ServerEvent::Ready(ready) => {
                assert_eq!(ready.player_id, player.id);
                assert_eq!(ready.owner_id, f.players[0]);
                assert_eq!(ready.players.len(), 2);
            }
            other => panic!("Expected ready, got {:?}", other),
        }
        assert!(matches!(
            f.events(f.players[0]).last(),
            Some(ServerEvent::UpdatePlayers(_))
        ));
    }

    #[test]
    fn test_connect_unknown_player() {
        let f = fixture(1);
        let unknown = Uuid::new_v4();
        assert!(matches!(
            f.lobby.on_connect(unknown),
            Err(LobbyError::PlayerNotFound(id)) if id == unknown
        ));
    }

    #[test]
    fn test_start_game_opens_word_choice() {
        let f = fixture(3);
        f.send(EVENT_START, json!(null), f.players[0]);

        f.lobby.synchronized(|state| {
            assert_eq!(state.game_state(), GameState::Ongoing);
            assert_eq!(state.round(), 1);
            let drawer = state.drawer().unwrap();
            assert_eq!(drawer.id, f.players[0]);
            assert_eq!(state.word_choice().len(), 3);
            assert!(state.preselected_word() < 3);
            assert_eq!(state.word_choice_end(), 1_000_000 + WORD_CHOICE_MILLIS);
            assert!(state.ticker().is_some());
            assert!(state.current_word().is_empty());
            for player in &state.players()[1..] {
                assert_eq!(player.state, PlayerState::Guessing);
            }
        });

        let drawer_events = f.events(f.players[0]);
        assert!(drawer_events
            .iter()
            .any(|event| matches!(event, ServerEvent::YourTurn(turn) if turn.words.len() == 3)));
        assert!(f.events(f.players[1]).iter().any(|event| matches!(
            event,
            ServerEvent::NextTurn(turn) if turn.round == 1
        )));
        assert!(!f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::YourTurn(_))));
    }

    #[test]
    fn test_start_requires_owner() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[1]);
        assert_eq!(
            f.lobby.synchronized(|state| state.game_state()),
            GameState::Unstarted
        );
    }

    #[test]
    fn test_join_during_game_guesses() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[0]);
        let late = f.lobby.join("late", None);
        assert_eq!(late.state, PlayerState::Guessing);
    }

    #[test]
    fn test_choose_word() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[0]);

        // Non-drawers are ignored.
        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[1]);
        assert!(f.word().is_empty());

        let result = f
            .lobby
            .handle_event(EVENT_CHOOSE_WORD, json!(7), f.players[0]);
        assert!(matches!(
            result,
            Err(LobbyError::WordChoiceOutOfRange {
                index: 7,
                available: 3
            })
        ));

        let options = f
            .lobby
            .synchronized(|state| state.word_choice().to_vec());
        f.send(EVENT_CHOOSE_WORD, json!(1), f.players[0]);
        assert_eq!(f.word(), options[1]);

        let result = f
            .lobby
            .handle_event(EVENT_CHOOSE_WORD, json!(0), f.players[0]);
        assert!(matches!(result, Err(LobbyError::NoWordChoice)));
    }

    #[test]
    fn test_word_chosen_hints_per_role() {
        let f = fixture(2);
        f.start_and_choose();
        let length = f.word().chars().count();

        let guesser_hints = f
            .events(f.players[1])
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::WordChosen(update) => Some(update),
                _ => None,
            })
            .unwrap();
        assert_eq!(guesser_hints.word_hints.len(), length);
        assert!(guesser_hints.word_hints.iter().all(|hint| hint.character.is_none()));
        assert_eq!(guesser_hints.round_end_time, 120_000);

        let drawer_hints = f
            .events(f.players[0])
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::WordChosen(update) => Some(update),
                _ => None,
            })
            .unwrap();
        let revealed: String = drawer_hints
            .word_hints
            .iter()
            .filter_map(|hint| hint.character)
            .collect();
        assert_eq!(revealed, f.word());
    }

    #[test]
    fn test_exact_guess_scores_and_advances() {
        let f = fixture(3);
        f.start_and_choose();
        let word = f.word().to_uppercase();

        f.clock.advance(Duration::from_secs(10));
        f.send(EVENT_MESSAGE, json!(word), f.players[1]);

        f.lobby.synchronized(|state| {
            let guesser = state.player(f.players[1]).unwrap();
            assert_eq!(guesser.state, PlayerState::Standby);
            assert!(guesser.score > 100);
            assert_eq!(guesser.last_score, guesser.score);
            assert_eq!(state.drawer().unwrap().id, f.players[0]);
        });
        assert!(f
            .events(f.players[2])
            .contains(&ServerEvent::CorrectGuess(f.players[1])));
        // The guesser sees the full word now.
        assert!(f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::UpdateWordHint(update)
                if update.word_hints.iter().all(|hint| hint.character.is_some()))));

        f.send(EVENT_MESSAGE, json!(f.word()), f.players[2]);

        f.lobby.synchronized(|state| {
            assert_eq!(state.drawer().unwrap().id, f.players[1]);
            assert_eq!(state.round(), 1);
            // Drawer gets the mean of both guessers.
            let first = state.player(f.players[1]).unwrap().score;
            let second = state.player(f.players[2]).unwrap().score;
            let drawer = state.player(f.players[0]).unwrap();
            assert_eq!(drawer.score, (first + second) / 2);
        });
    }

    #[test]
    fn test_close_guess_is_private() {
        let f = fixture(3);
        f.start_and_choose();
        let mut close = f.word();
        close.push('x');

        f.send(EVENT_MESSAGE, json!(close.clone()), f.players[1]);

        assert!(f
            .events(f.players[1])
            .contains(&ServerEvent::CloseGuess(close.clone())));
        assert!(!f
            .events(f.players[2])
            .iter()
            .any(|event| matches!(event, ServerEvent::CloseGuess(_))));
        assert!(f.events(f.players[2]).iter().any(
            |event| matches!(event, ServerEvent::Message(message) if message.content == close)
        ));
    }

    #[test]
    fn test_non_guessing_chat_hidden_from_guessers() {
        let f = fixture(3);
        f.start_and_choose();

        f.send(EVENT_MESSAGE, json!("it's round"), f.players[0]);

        assert!(!f.events(f.players[1]).iter().any(|event| matches!(
            event,
            ServerEvent::NonGuessingPlayerMessage(_)
        )));
        assert!(f.events(f.players[0]).iter().any(|event| matches!(
            event,
            ServerEvent::NonGuessingPlayerMessage(message) if message.content == "it's round"
        )));
    }

    #[test]
    fn test_sixth_message_is_rate_limited() {
        let f = fixture(2);
        for i in 0..5 {
            f.send(EVENT_MESSAGE, json!(format!("hello {}", i)), f.players[1]);
            f.clock.advance(Duration::from_millis(100));
        }
        f.send(EVENT_MESSAGE, json!("spam"), f.players[1]);

        let is_spam =
            |event: &ServerEvent| matches!(event, ServerEvent::Message(message) if message.content == "spam");
        assert!(f.events(f.players[1]).iter().any(is_spam));
        assert!(!f.events(f.players[0]).iter().any(is_spam));
        assert_eq!(
            f.events(f.players[0])
                .iter()
                .filter(|event| matches!(event, ServerEvent::Message(_)))
                .count(),
            5
        );
    }

    #[test]
    fn test_empty_and_oversized_messages_dropped() {
        let f = fixture(2);
        f.send(EVENT_MESSAGE, json!("   "), f.players[1]);
        f.send(EVENT_MESSAGE, json!("a".repeat(MAX_MESSAGE_BYTES + 1)), f.players[1]);
        assert_eq!(f.transport.total_sent(), 0);
    }

    #[test]
    fn test_preselected_word_after_choice_timeout() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[0]);
        let (words, preselected) = f
            .lobby
            .synchronized(|state| (state.word_choice().to_vec(), state.preselected_word()));

        f.clock.advance(Duration::from_secs(29));
        f.tick();
        assert!(f.word().is_empty());

        f.clock.advance(Duration::from_secs(1));
        f.tick();
        assert_eq!(f.word(), words[preselected]);
    }

    #[test]
    fn test_hints_revealed_over_time() {
        let f = fixture_with(2, 4, "elderberry\n");
        f.start_and_choose();
        assert_eq!(f.lobby.synchronized(|state| state.hints_left()), 3);

        // 120s with 3 hints: one every 30s.
        f.clock.advance(Duration::from_secs(29));
        f.tick();
        assert_eq!(f.lobby.synchronized(|state| state.hints_left()), 3);

        f.clock.advance(Duration::from_secs(2));
        f.tick();
        f.lobby.synchronized(|state| {
            assert_eq!(state.hints_left(), 2);
            let shown = state
                .word_hints()
                .iter()
                .filter(|hint| hint.character.is_some())
                .count();
            assert_eq!(shown, 1);
        });
        assert!(f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::UpdateWordHint(_))));
    }

    #[test]
    fn test_round_end_advances() {
        let f = fixture(2);
        f.start_and_choose();
        f.clock.advance(Duration::from_secs(120));
        f.tick();

        f.lobby.synchronized(|state| {
            assert_eq!(state.drawer().unwrap().id, f.players[1]);
            assert!(state.current_word().is_empty());
        });
    }

    #[test]
    fn test_stale_ticker_stops() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[0]);
        let first = f.lobby.synchronized(|state| state.ticker()).unwrap();

        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[0]);
        f.clock.advance(Duration::from_secs(121));
        assert!(!f.lobby.tick(first + 1));
        assert!(!f.lobby.tick(first + 100));

        // The turn ends and a new ticker takes over.
        assert!(!f.lobby.tick(first));
        let second = f.lobby.synchronized(|state| state.ticker()).unwrap();
        assert_ne!(first, second);
        assert_eq!(f.drawer(), f.players[1]);
        assert!(f.lobby.tick(second));
    }

    #[test]
    fn test_drawer_disconnect_ends_turn() {
        let f = fixture(3);
        f.send(EVENT_START, json!(null), f.players[0]);
        f.lobby.on_disconnect(f.players[0]);

        f.clock.advance(Duration::from_secs(5));
        f.tick();
        assert_eq!(f.drawer(), f.players[0]);

        f.clock.advance(Duration::from_secs(4));
        f.tick();
        assert_eq!(f.drawer(), f.players[1]);
        assert!(f
            .events(f.players[2])
            .contains(&ServerEvent::SystemMessage("drawer disconnected".to_string())));
        f.lobby.synchronized(|state| {
            assert!(state.players().iter().all(|player| player.score == 0));
        });
    }

    #[test]
    fn test_all_guessers_disconnected() {
        let f = fixture(3);
        f.start_and_choose();
        f.lobby.on_disconnect(f.players[1]);
        f.lobby.on_disconnect(f.players[2]);

        f.clock.advance(Duration::from_secs(9));
        f.tick();

        assert!(f.events(f.players[0]).contains(&ServerEvent::SystemMessage(
            "all guessers disconnected".to_string()
        )));
        // Nobody else is eligible, the owner draws again in the next round.
        f.lobby.synchronized(|state| {
            assert_eq!(state.drawer().unwrap().id, f.players[0]);
            assert_eq!(state.round(), 2);
        });
    }

    #[test]
    fn test_never_connected_guessers_are_exempt() {
        let f = fixture(1);
        f.start_and_choose();
        f.lobby.join("loading", None);

        // Only a player that is still loading guesses, nothing to end.
        f.clock.advance(Duration::from_secs(9));
        f.tick();
        assert_eq!(f.drawer(), f.players[0]);
        assert!(!f.word().is_empty());

        let f = fixture(2);
        f.start_and_choose();
        f.lobby.join("loading", None);
        f.lobby.on_disconnect(f.players[1]);

        f.clock.advance(Duration::from_secs(9));
        f.tick();
        assert!(f.events(f.players[0]).contains(&ServerEvent::SystemMessage(
            "all guessers disconnected".to_string()
        )));
    }

    #[test]
    fn test_game_over_after_last_round() {
        let f = fixture_with(2, 1, "apple\nbanana\ncherry\n");
        f.start_and_choose();
        f.send(EVENT_LINE, line(10.0), f.players[0]);
        let first_word = f.word();
        f.send(EVENT_MESSAGE, json!(first_word.clone()), f.players[1]);

        assert_eq!(f.drawer(), f.players[1]);
        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[1]);
        let second_word = f.word();
        f.send(EVENT_MESSAGE, json!(second_word.clone()), f.players[0]);

        f.lobby.synchronized(|state| {
            assert_eq!(state.game_state(), GameState::GameOver);
            assert_eq!(state.round(), 1);
            assert!(state.ticker().is_none());
            assert_eq!(state.gallery().len(), 1);
        });

        let game_over = f
            .events(f.players[1])
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::GameOver(game_over) => Some(game_over),
                _ => None,
            })
            .unwrap();
        assert_eq!(game_over.previous_word, second_word);
        assert_eq!(game_over.gallery[0].word, first_word);
        assert_eq!(game_over.ready.player_id, f.players[1]);
    }

    #[test]
    fn test_restart_resets_scores() {
        let f = fixture_with(2, 1, "apple\nbanana\ncherry\n");
        f.start_and_choose();
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[1]);
        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[1]);
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[0]);
        assert_eq!(
            f.lobby.synchronized(|state| state.game_state()),
            GameState::GameOver
        );

        f.send(EVENT_START, json!(null), f.players[0]);
        f.lobby.synchronized(|state| {
            assert_eq!(state.game_state(), GameState::Ongoing);
            assert_eq!(state.round(), 1);
            assert!(state.gallery().is_empty());
            assert!(state.players().iter().all(|player| player.score == 0));
        });
    }

    #[test]
    fn test_kick_vote_threshold() {
        let f = fixture(4);
        let target = f.players[3];

        f.send(EVENT_KICK_VOTE, json!(target), f.players[0]);
        f.send(EVENT_KICK_VOTE, json!(target), f.players[0]);
        f.send(EVENT_KICK_VOTE, json!(target), f.players[1]);

        let votes: Vec<KickVote> = f
            .events(target)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::KickVote(vote) => Some(vote),
                _ => None,
            })
            .collect();
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[1].vote_count, 2);
        assert_eq!(votes[1].required_vote_count, 3);
        assert_eq!(f.lobby.player_count(), 4);

        f.send(EVENT_KICK_VOTE, json!(target), f.players[2]);
        assert_eq!(f.lobby.player_count(), 3);
        assert_eq!(f.transport.closed(), vec![target]);
    }

    #[test]
    fn test_self_kick_vote_ignored() {
        let f = fixture(3);
        f.send(EVENT_KICK_VOTE, json!(f.players[1]), f.players[1]);
        assert_eq!(f.transport.total_sent(), 0);
    }

    #[test]
    fn test_kicking_drawer_rolls_back_turn() {
        let f = fixture(4);
        f.start_and_choose();
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[1]);
        assert!(f.lobby.synchronized(|state| state.player(f.players[1]).unwrap().score) > 0);

        let drawer = f.players[0];
        for voter in &f.players[1..] {
            f.send(EVENT_KICK_VOTE, json!(drawer), *voter);
        }

        f.lobby.synchronized(|state| {
            assert!(state.player(drawer).is_none());
            assert_eq!(state.owner(), f.players[1]);
            assert_eq!(state.drawer().unwrap().id, f.players[1]);
            assert_eq!(state.round(), 1);
            assert!(state
                .players()
                .iter()
                .all(|player| player.score == 0 && player.last_score == 0));
        });
        let events = f.events(f.players[2]);
        assert!(events.contains(&ServerEvent::DrawerKicked));
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::OwnerChange(change) if change.player_id == f.players[1]
        )));
    }

    #[test]
    fn test_kicking_drawer_keeps_earlier_turns() {
        let f = fixture(3);
        f.start_and_choose();
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[1]);
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[2]);
        assert_eq!(f.drawer(), f.players[1]);

        let scores: Vec<u32> = f.lobby.synchronized(|state| {
            [f.players[0], f.players[2]]
                .iter()
                .map(|id| state.player(*id).unwrap().score)
                .collect()
        });
        assert!(scores.iter().all(|score| *score > 0));

        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[1]);
        f.send(EVENT_KICK_VOTE, json!(f.players[1]), f.players[0]);
        f.send(EVENT_KICK_VOTE, json!(f.players[1]), f.players[2]);

        f.lobby.synchronized(|state| {
            assert!(state.player(f.players[1]).is_none());
            assert_eq!(state.player(f.players[0]).unwrap().score, scores[0]);
            assert_eq!(state.player(f.players[2]).unwrap().score, scores[1]);
        });
    }

    #[test]
    fn test_kicking_last_guesser_advances() {
        let f = fixture(4);
        f.start_and_choose();
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[1]);
        f.send(EVENT_MESSAGE, json!(f.word()), f.players[2]);
        assert_eq!(f.drawer(), f.players[0]);

        for voter in &f.players[..3] {
            f.send(EVENT_KICK_VOTE, json!(f.players[3]), *voter);
        }
        assert_eq!(f.drawer(), f.players[1]);
    }

    #[test]
    fn test_kick_outside_game_does_not_start() {
        let f = fixture(4);
        for voter in &f.players[..3] {
            f.send(EVENT_KICK_VOTE, json!(f.players[3]), *voter);
        }
        assert_eq!(f.lobby.player_count(), 3);
        assert_eq!(
            f.lobby.synchronized(|state| state.game_state()),
            GameState::Unstarted
        );
    }

    #[test]
    fn test_votes_needed() {
        assert_eq!(votes_needed(0), 2);
        assert_eq!(votes_needed(1), 2);
        assert_eq!(votes_needed(2), 2);
        assert_eq!(votes_needed(3), 2);
        assert_eq!(votes_needed(4), 3);
        assert_eq!(votes_needed(5), 3);
        assert_eq!(votes_needed(6), 4);
        let mut previous = 0;
        for connected in 0..50 {
            let needed = votes_needed(connected);
            assert!(needed >= previous);
            if connected > 2 {
                assert!(needed * 2 > connected);
            }
            previous = needed;
        }
    }

    #[test]
    fn test_hint_budget() {
        let expected = [0, 0, 0, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3];
        for (length, hints) in expected.iter().enumerate() {
            assert_eq!(hint_budget(length), *hints, "length {}", length);
        }
    }

    #[test]
    fn test_build_hints_separators() {
        let (hints, shown) = build_hints("ice cream-x_y");
        assert_eq!(hints.len(), 13);
        assert_eq!(shown.len(), 13);
        assert_eq!(
            hints[3],
            WordHint {
                character: Some(' '),
                underline: false
            }
        );
        assert_eq!(hints[3], shown[3]);
        assert_eq!(
            hints[0],
            WordHint {
                character: None,
                underline: true
            }
        );
        assert_eq!(shown[0].character, Some('i'));
        assert!(shown[0].underline);
    }

    #[test]
    fn test_ranks_are_dense() {
        let f = fixture(4);
        f.lobby.synchronized(|state| {
            state.players[0].score = 300;
            state.players[1].score = 100;
            state.players[2].score = 300;
            state.players[3].score = 50;
            state.recalculate_ranks();
            let ranks: Vec<u32> = state.players().iter().map(|player| player.rank).collect();
            assert_eq!(ranks, vec![1, 2, 1, 3]);
        });
    }

    #[test]
    fn test_line_width_clamped_and_forwarded() {
        let f = fixture(2);
        f.start_and_choose();
        f.send(EVENT_LINE, line(100.0), f.players[0]);

        match f.lobby.synchronized(|state| state.drawing().to_vec()).as_slice() {
            [DrawOp::Line(line)] => assert_eq!(line.line_width, MAX_BRUSH_SIZE),
            other => panic!("Unexpected drawing {:?}", other),
        }
        assert!(f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::Line(line) if line.line_width == MAX_BRUSH_SIZE)));
        assert!(!f
            .events(f.players[0])
            .iter()
            .any(|event| matches!(event, ServerEvent::Line(_))));
    }

    #[test]
    fn test_guessers_cannot_draw() {
        let f = fixture(2);
        f.start_and_choose();
        f.send(EVENT_LINE, line(10.0), f.players[1]);
        assert!(f.lobby.synchronized(|state| state.drawing().is_empty()));
    }

    #[test]
    fn test_no_drawing_before_word_chosen() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[0]);
        f.send(EVENT_LINE, line(10.0), f.players[0]);
        assert!(f.lobby.synchronized(|state| state.drawing().is_empty()));
    }

    #[test]
    fn test_undo_removes_last_stroke() {
        let f = fixture(2);
        f.start_and_choose();
        let drawer = f.players[0];

        // First stroke: two quick segments.
        f.send(EVENT_LINE, line(10.0), drawer);
        f.clock.advance(Duration::from_millis(20));
        f.send(EVENT_LINE, line(10.0), drawer);
        // Second stroke after a pause.
        f.clock.advance(Duration::from_millis(500));
        f.send(EVENT_LINE, line(10.0), drawer);
        f.send(EVENT_LINE, line(10.0), drawer);
        // A fill is always its own step, and so is the line after it.
        let fill = json!({"x": 1.0, "y": 1.0, "color": {"r": 1, "g": 2, "b": 3}});
        f.send(EVENT_FILL, fill, drawer);
        f.send(EVENT_LINE, line(10.0), drawer);

        assert_eq!(
            f.lobby.synchronized(|state| state.undo_boundaries().to_vec()),
            vec![0, 2, 4, 5]
        );

        f.send(EVENT_UNDO, json!(null), drawer);
        assert_eq!(f.lobby.synchronized(|state| state.drawing().len()), 5);
        f.send(EVENT_UNDO, json!(null), drawer);
        assert_eq!(f.lobby.synchronized(|state| state.drawing().len()), 4);
        f.send(EVENT_UNDO, json!(null), drawer);
        assert_eq!(f.lobby.synchronized(|state| state.drawing().len()), 2);

        assert!(f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::Drawing(drawing) if drawing.len() == 2)));
    }

    #[test]
    fn test_clear_and_request_drawing() {
        let f = fixture(2);
        f.start_and_choose();
        f.send(EVENT_REQUEST_DRAWING, json!(null), f.players[1]);
        assert!(!f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::Drawing(_))));

        f.send(EVENT_LINE, line(10.0), f.players[0]);
        f.send(EVENT_REQUEST_DRAWING, json!(null), f.players[1]);
        assert!(f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::Drawing(drawing) if drawing.len() == 1)));

        f.send(EVENT_CLEAR_DRAWING_BOARD, json!(null), f.players[0]);
        assert!(f.lobby.synchronized(|state| state.drawing().is_empty()));
        assert!(f.events(f.players[1]).contains(&ServerEvent::ClearDrawingBoard));
    }

    #[test]
    fn test_all_ready_starts_game() {
        let f = fixture(2);
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[0]);
        assert_eq!(
            f.lobby.synchronized(|state| state.game_state()),
            GameState::Unstarted
        );
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[1]);
        assert_eq!(
            f.lobby.synchronized(|state| state.game_state()),
            GameState::Ongoing
        );
    }

    #[test]
    fn test_disconnect_resets_ready_and_may_start() {
        let f = fixture(3);
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[0]);
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[2]);
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[2]);
        assert_eq!(
            f.lobby.synchronized(|state| state.player(f.players[2]).unwrap().state),
            PlayerState::Standby
        );
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[1]);

        // The only player not ready leaves, everyone left is ready.
        f.lobby.on_disconnect(f.players[2]);
        assert_eq!(
            f.lobby.synchronized(|state| state.game_state()),
            GameState::Ongoing
        );
    }

    #[test]
    fn test_disconnect_outside_game_unreadies() {
        let f = fixture(3);
        f.send(EVENT_TOGGLE_READINESS, json!(null), f.players[1]);
        f.lobby.on_disconnect(f.players[1]);
        f.lobby.synchronized(|state| {
            let player = state.player(f.players[1]).unwrap();
            assert_eq!(player.state, PlayerState::Standby);
            assert!(!player.connected);
            assert_eq!(player.disconnect_time, Some(1_000_000));
        });
        assert_eq!(f.lobby.last_disconnect_time(), 1_000_000);
    }

    #[test]
    fn test_spectate_outside_game_is_immediate() {
        let f = fixture(2);
        f.send(EVENT_TOGGLE_SPECTATE, json!(null), f.players[1]);
        assert_eq!(
            f.lobby.synchronized(|state| state.player(f.players[1]).unwrap().state),
            PlayerState::Spectating
        );
        f.send(EVENT_TOGGLE_SPECTATE, json!(null), f.players[1]);
        assert_eq!(
            f.lobby.synchronized(|state| state.player(f.players[1]).unwrap().state),
            PlayerState::Standby
        );
    }

    #[test]
    fn test_spectate_during_game_is_deferred() {
        let f = fixture(3);
        f.start_and_choose();
        f.send(EVENT_TOGGLE_SPECTATE, json!(null), f.players[1]);
        f.lobby.synchronized(|state| {
            let player = state.player(f.players[1]).unwrap();
            assert_eq!(player.state, PlayerState::Guessing);
            assert!(player.spectate_toggle_requested);
        });

        f.clock.advance(Duration::from_secs(120));
        f.tick();

        f.lobby.synchronized(|state| {
            assert_eq!(
                state.player(f.players[1]).unwrap().state,
                PlayerState::Spectating
            );
            // The spectator is skipped in the rotation.
            assert_eq!(state.drawer().unwrap().id, f.players[2]);
        });

        f.send(EVENT_TOGGLE_SPECTATE, json!(null), f.players[1]);
        f.clock.advance(Duration::from_secs(30));
        f.tick();
        f.clock.advance(Duration::from_secs(120));
        f.tick();
        assert_eq!(
            f.lobby.synchronized(|state| state.player(f.players[1]).unwrap().state),
            PlayerState::Guessing
        );
    }

    #[test]
    fn test_name_change() {
        let f = fixture(2);
        f.send(EVENT_NAME_CHANGE, json!("  renamed  "), f.players[1]);
        assert!(f.events(f.players[0]).contains(&ServerEvent::NameChange(PlayerRef {
            player_id: f.players[1],
            player_name: "renamed".to_string(),
        })));

        f.transport.clear();
        f.send(EVENT_NAME_CHANGE, json!("renamed"), f.players[1]);
        assert_eq!(f.transport.total_sent(), 0);
    }

    #[test]
    fn test_update_settings() {
        let f = fixture(2);
        let mut changed = settings(6);
        changed.drawing_time = 200;

        assert!(matches!(
            f.lobby.update_settings(f.players[1], changed.clone()),
            Err(LobbyError::NotOwner)
        ));

        f.send(EVENT_START, json!(null), f.players[0]);
        f.lobby.update_settings(f.players[0], changed.clone()).unwrap();
        f.lobby.synchronized(|state| {
            assert_eq!(state.settings().rounds, 6);
            assert_eq!(state.settings().drawing_time, 120);
            assert_eq!(state.pending_drawing_time(), Some(200));
        });
        assert!(f
            .events(f.players[1])
            .contains(&ServerEvent::LobbySettingsChanged(changed)));

        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[0]);
        f.clock.advance(Duration::from_secs(120));
        f.tick();
        f.lobby.synchronized(|state| {
            assert_eq!(state.settings().drawing_time, 200);
            assert_eq!(state.pending_drawing_time(), None);
        });
    }

    #[test]
    fn test_rounds_never_below_current_round() {
        let f = fixture(2);
        f.start_and_choose();
        f.clock.advance(Duration::from_secs(120));
        f.tick();
        f.send(EVENT_CHOOSE_WORD, json!(0), f.players[1]);
        f.clock.advance(Duration::from_secs(120));
        f.tick();
        assert_eq!(f.lobby.synchronized(|state| state.round()), 2);

        f.lobby.update_settings(f.players[0], settings(1)).unwrap();
        assert_eq!(f.lobby.synchronized(|state| state.settings().rounds), 2);
    }

    #[test]
    fn test_slot_reservation() {
        let f = fixture(3);
        assert!(f.lobby.has_free_player_slot());
        let waiting = f.lobby.join("waiting", None);
        // Never connected, still holds a slot.
        assert!(!f.lobby.has_free_player_slot());

        f.lobby.on_connect(waiting.id).unwrap();
        f.lobby.on_disconnect(waiting.id);
        f.clock.advance(Duration::from_secs(59));
        assert!(!f.lobby.has_free_player_slot());
        f.clock.advance(Duration::from_secs(2));
        assert!(f.lobby.has_free_player_slot());
    }

    #[test]
    fn test_clients_per_address() {
        let f = fixture(1);
        assert!(f.lobby.can_address_connect("10.0.0.1"));
        f.lobby.join("a", Some("10.0.0.1".to_string()));
        assert!(f.lobby.can_address_connect("10.0.0.1"));
        f.lobby.join("b", Some("10.0.0.1".to_string()));
        assert!(!f.lobby.can_address_connect("10.0.0.1"));
        assert!(f.lobby.can_address_connect("10.0.0.2"));
    }

    #[test]
    fn test_try_join_checks_address_limit() {
        let f = fixture(1);
        f.lobby.try_join("a", "10.0.0.1").unwrap();
        f.lobby.try_join("b", "10.0.0.1").unwrap();
        assert!(matches!(
            f.lobby.try_join("c", "10.0.0.1"),
            Err(HandshakeError::TooManyClients)
        ));
        assert_eq!(f.lobby.player_count(), 3);
    }

    #[test]
    fn test_concurrent_joins_never_overfill() {
        let f = fixture(1);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lobby = Arc::clone(&f.lobby);
                std::thread::spawn(move || {
                    lobby.try_join(&format!("joiner{}", i), &format!("10.0.0.{}", i))
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 3);
        assert!(results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|e| matches!(e, HandshakeError::LobbyFull)));
        assert_eq!(f.lobby.player_count(), 4);
        assert!(!f.lobby.has_free_player_slot());
    }

    #[test]
    fn test_resume_session_refreshes_address() {
        let f = fixture(2);
        let session = f
            .lobby
            .synchronized(|state| state.player(f.players[1]).unwrap().session());

        assert_eq!(f.lobby.resume_session(session, "10.0.0.9"), Some(f.players[1]));
        f.lobby.synchronized(|state| {
            assert_eq!(
                state.player(f.players[1]).unwrap().last_known_address(),
                Some("10.0.0.9")
            );
        });
        assert_eq!(f.lobby.resume_session(Uuid::new_v4(), "10.0.0.9"), None);
    }

    #[test]
    fn test_reconnecting_drawer_gets_choice_again() {
        let f = fixture(2);
        f.send(EVENT_START, json!(null), f.players[0]);
        f.lobby.on_disconnect(f.players[0]);
        f.transport.clear();
        f.clock.advance(Duration::from_secs(5));
        f.lobby.on_connect(f.players[0]).unwrap();

        let events = f.events(f.players[0]);
        assert!(matches!(events[0], ServerEvent::Ready(_)));
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::YourTurn(turn) if turn.choice_end_time == 25_000
        )));
    }

    #[test]
    fn test_invalid_payload_answers_sender() {
        let f = fixture(2);
        let result = f
            .lobby
            .handle_event(EVENT_CHOOSE_WORD, json!("first"), f.players[1]);
        assert!(matches!(
            result,
            Err(LobbyError::InvalidPayload { ref event, .. }) if event == EVENT_CHOOSE_WORD
        ));
        assert!(f
            .events(f.players[1])
            .iter()
            .any(|event| matches!(event, ServerEvent::SystemMessage(_))));
        assert!(f.events(f.players[0]).is_empty());
    }

    #[test]
    fn test_keep_alive_and_unknown_events_ignored() {
        let f = fixture(2);
        f.send(EVENT_KEEP_ALIVE, json!(null), f.players[1]);
        f.send("dance", json!({"moves": 3}), f.players[1]);
        f.send(EVENT_MESSAGE, json!("hi"), Uuid::new_v4());
        assert_eq!(f.transport.total_sent(), 0);
    }

    #[test]
    fn test_snapshot_and_resurrect() {
        let f = fixture(2);
        f.start_and_choose();
        let round_end = f.lobby.synchronized(|state| state.round_end());
        let word = f.word();

        let json = serde_json::to_string(&f.lobby.snapshot()).unwrap();
        let snapshot: LobbySnapshot = serde_json::from_str(&json).unwrap();

        f.clock.advance(Duration::from_secs(10));
        let words = WordCache::with_loader(|_| Some("apple\nbanana\n".to_string()));
        let restored = Lobby::resurrect(
            snapshot,
            10_000,
            &words,
            f.transport.clone(),
            f.clock.clone(),
        )
        .unwrap();

        assert_eq!(restored.id(), f.lobby.id());
        assert!(!restored.has_connected_players());
        restored.synchronized(|state| {
            assert_eq!(state.round_end(), round_end + 10_000);
            assert_eq!(state.current_word(), word);
            assert_eq!(state.game_state(), GameState::Ongoing);
            assert!(state.ticker().is_some());
            assert!(state
                .players()
                .iter()
                .all(|player| player.disconnect_time == Some(1_010_000)));
        });

        let session = f
            .lobby
            .synchronized(|state| state.player(f.players[1]).unwrap().session());
        assert_eq!(restored.player_by_session(session), Some(f.players[1]));
    }

    #[test]
    fn test_shutdown_notifies_and_closes() {
        let f = fixture(2);
        f.start_and_choose();
        f.lobby.shutdown();
        assert!(f.events(f.players[1]).contains(&ServerEvent::Shutdown));
        assert_eq!(f.transport.closed().len(), 2);
        assert!(f.lobby.synchronized(|state| state.ticker()).is_none());
    }
}
