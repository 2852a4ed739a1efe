//! Error types for the lobby engine, the transport seam and the connection
//! handshake.

use shared::PlayerId;
use thiserror::Error;

use crate::words::Language;

#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),

    /// The dictionary for a language could not be read or contained no
    /// words. Fatal for lobby creation in that language.
    #[error("word list for {0:?} is empty or unreadable")]
    EmptyWordList(Language),

    #[error("unknown score calculation '{0}'")]
    UnknownScoring(String),

    #[error("invalid payload for '{event}': {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("word was chosen, even though no choice was available")]
    NoWordChoice,

    #[error("word choice was {index}, but should've been < {available}")]
    WordChoiceOutOfRange { index: usize, available: usize },

    #[error("only the lobby owner may do this")]
    NotOwner,

    #[error("player {0} is not part of this lobby")]
    PlayerNotFound(PlayerId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("player {0} has no live connection")]
    NotConnected(PlayerId),

    #[error("outbound queue for player {0} is closed")]
    ChannelClosed(PlayerId),
}

/// Reasons a connection is turned away before it is attached to a lobby.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("connection closed before handshake")]
    Closed,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("lobby '{0}' does not exist")]
    LobbyNotFound(String),

    #[error("lobby is full")]
    LobbyFull,

    #[error("too many clients from this address")]
    TooManyClients,

    #[error("unknown session")]
    UnknownSession,

    #[error(transparent)]
    Settings(#[from] crate::config::SettingsError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while writing or reading the lobby handoff file.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handoff file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}
