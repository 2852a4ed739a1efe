//! # Drawing Game Server Library
//!
//! This library provides the lobby engine and network front end for a
//! multiplayer drawing-and-guessing game. One player draws a secret word,
//! everyone else guesses it in chat, and points are awarded for speed.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Game State
//! Every lobby owns its state exclusively. Clients only send intents
//! (a chat line, a stroke, a word choice, a kick vote); the lobby decides
//! what they mean and pushes the resulting events back out.
//!
//! ### Turn Management
//! Lobbies rotate the drawer through all eligible players, run the word
//! choice and drawing timers, reveal hints over time and score guessers and
//! drawers when a turn ends.
//!
//! ### Session Continuity
//! A player record survives disconnects. Reconnecting with the session token
//! restores score, role and canvas, and a graceful shutdown writes every
//! running lobby to a handoff file that the next process picks up.
//!
//! ## Architecture Design
//!
//! ### One Lock per Lobby
//! All mutations of a lobby happen under its single lock, whether they come
//! from a connection, the per-turn ticker or the registry. Handlers never
//! await while holding it; outbound events are serialized once and queued.
//!
//! ### Cooperative Timers
//! The per-turn ticker is a background task identified by a generation
//! number. Starting a new turn bumps the generation and the old task exits
//! on its next tick.
//!
//! ### Pluggable Seams
//! Time comes from a [`clock::Clock`] and delivery goes through a
//! [`transport::Transport`], so the whole engine can be driven
//! deterministically from tests.
//!
//! ## Module Organization
//!
//! ### Lobby Module (`lobby`)
//! The game engine: event dispatch, guess handling, drawing history with
//! undo, turn advancement, kick votes, readiness, spectating and snapshots.
//!
//! ### Registry Module (`registry`)
//! Process-wide lobby lookup, inactivity cleanup and the restart handoff.
//!
//! ### Network Module (`network`)
//! TCP listener speaking newline-delimited JSON: the create/join/reconnect
//! handshake, per-connection reader and writer tasks.
//!
//! ### Supporting Modules
//! - `player`: player records, name sanitizing, chat rate limiting
//! - `words`: embedded dictionaries and per-lobby word pools
//! - `normalize`: guess normalization and close-guess detection
//! - `scoring`: the `chill` and `competitive` score strategies
//! - `config`: setting bounds, lobby defaults and cleanup timing
//! - `transport`, `clock`, `error`: the seams and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::clock::{Clock, SystemClock};
//! use server::config::SettingBounds;
//! use server::network::{Server, ServerContext};
//! use server::registry::Registry;
//! use server::transport::ChannelTransport;
//! use server::words::WordCache;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//!     let context = Arc::new(ServerContext {
//!         registry: Arc::new(Registry::new(Arc::clone(&clock))),
//!         transport: Arc::new(ChannelTransport::new()),
//!         words: Arc::new(WordCache::new()),
//!         clock,
//!         bounds: SettingBounds::default(),
//!     });
//!
//!     let server = Server::bind("127.0.0.1:8080", context).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod lobby;
pub mod network;
pub mod normalize;
pub mod player;
pub mod registry;
pub mod scoring;
pub mod transport;
pub mod words;
