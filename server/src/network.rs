//! Server network layer handling TCP connections
//!
//! The wire format is newline-delimited JSON. The first line of every
//! connection is a [`Handshake`] (create, join or reconnect) answered with a
//! single [`HandshakeReply`]; every following line is an [`Envelope`] that is
//! dispatched to the player's lobby. Outbound events are queued by the
//! [`ChannelTransport`] and written by a per-connection writer task.

use crate::clock::Clock;
use crate::config::{validate, SettingBounds};
use crate::error::HandshakeError;
use crate::lobby::{Lobby, LobbyOptions};
use crate::registry::Registry;
use crate::scoring::ScoringKind;
use crate::transport::ChannelTransport;
use crate::words::{Language, WordCache};
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::{Envelope, Handshake, HandshakeReply, PlayerId};
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// How long queued events may take to flush after a connection ended.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest inbound line accepted, handshake included. Chat messages are
/// capped at 10 000 bytes, this leaves room for JSON escaping.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Shared services every connection needs.
pub struct ServerContext {
    pub registry: Arc<Registry>,
    pub transport: Arc<ChannelTransport>,
    pub words: Arc<WordCache>,
    pub clock: Arc<dyn Clock>,
    pub bounds: SettingBounds,
}

/// A connection that passed the handshake.
struct Attached {
    lobby: Arc<Lobby>,
    player: PlayerId,
    session: Uuid,
}

pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    pub async fn bind(addr: &str, context: Arc<ServerContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Server { listener, context })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Every connection is served by its own task.
    pub async fn run(self) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, context).await {
                            debug!("Connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ServerContext>,
) -> Result<(), HandshakeError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(reader, MAX_LINE_BYTES);

    let first = match lines.next_line().await {
        Ok(ReadLine::Line(line)) => Ok(line),
        Ok(ReadLine::TooLong) => Err(HandshakeError::LineTooLong(MAX_LINE_BYTES)),
        Ok(ReadLine::Closed) => Err(HandshakeError::Closed),
        Err(e) => Err(e.into()),
    };
    let attached = match first.and_then(|line| attach(&line, addr, &context)) {
        Ok(attached) => attached,
        Err(e) => {
            warn!("Rejected handshake from {}: {}", addr, e);
            let reply = HandshakeReply::Rejected {
                reason: e.to_string(),
            };
            write_line(&mut writer, &reply).await?;
            return Err(e);
        }
    };

    write_line(
        &mut writer,
        &HandshakeReply::Session {
            lobby_id: attached.lobby.id().to_string(),
            player_id: attached.player,
            session: attached.session,
        },
    )
    .await?;

    let connection = context.transport.register(attached.player);
    let writer_task = tokio::spawn(write_outbound(writer, connection.outbound));

    if let Err(e) = attached.lobby.on_connect(attached.player) {
        // Kicked between handshake and connect.
        context.transport.unregister(attached.player, connection.id);
        return Err(e.into());
    }
    read_events(lines, &attached.lobby, attached.player, &connection.closed).await;

    if context.transport.unregister(attached.player, connection.id) {
        attached.lobby.on_disconnect(attached.player);
    }

    // The queue sender is gone now, the writer stops once it is drained.
    if tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
        debug!("Writer for {} did not finish in time", addr);
    }
    Ok(())
}

/// Resolves a handshake line to a lobby and player.
fn attach(line: &str, addr: SocketAddr, context: &ServerContext) -> Result<Attached, HandshakeError> {
    let handshake: Handshake = serde_json::from_str(line.trim())?;
    let address = addr.ip().to_string();

    match handshake {
        Handshake::Create {
            name,
            language,
            scoring,
            settings,
            custom_words,
        } => {
            let language: Language = language.parse()?;
            let scoring: ScoringKind = scoring.parse()?;
            validate(&settings, &context.bounds)?;

            let options = LobbyOptions {
                settings,
                language,
                scoring,
                custom_words,
            };
            let (player, lobby) = Lobby::create(
                &name,
                Some(address),
                options,
                &context.words,
                context.transport.clone(),
                Arc::clone(&context.clock),
            )?;
            context.registry.add(Arc::clone(&lobby));

            Ok(Attached {
                lobby,
                player: player.id,
                session: player.session(),
            })
        }
        Handshake::Join { lobby_id, name } => {
            let lobby = context
                .registry
                .get(&lobby_id)
                .ok_or(HandshakeError::LobbyNotFound(lobby_id))?;
            let player = lobby.try_join(&name, &address)?;
            Ok(Attached {
                lobby,
                player: player.id,
                session: player.session(),
            })
        }
        Handshake::Reconnect { lobby_id, session } => {
            let lobby = context
                .registry
                .get(&lobby_id)
                .ok_or(HandshakeError::LobbyNotFound(lobby_id))?;
            let player = lobby
                .resume_session(session, &address)
                .ok_or(HandshakeError::UnknownSession)?;

            Ok(Attached {
                lobby,
                player,
                session,
            })
        }
    }
}

/// Reads events until the peer hangs up or the server closes the
/// connection.
async fn read_events(
    mut lines: LineReader<OwnedReadHalf>,
    lobby: &Lobby,
    player: PlayerId,
    closed: &Notify,
) {
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(ReadLine::Line(line)) => dispatch(lobby, player, &line),
                Ok(ReadLine::TooLong) => {
                    warn!("Dropping connection of {}: line exceeds {} bytes", player, MAX_LINE_BYTES);
                    lobby.send_system_message(player, "message too long");
                    break;
                }
                Ok(ReadLine::Closed) => break,
                Err(e) => {
                    debug!("Error reading from {}: {}", player, e);
                    break;
                }
            },
            _ = closed.notified() => {
                debug!("Connection of {} closed by server", player);
                break;
            }
        }
    }
}

fn dispatch(lobby: &Lobby, player: PlayerId, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let Envelope { event_type, data } = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Malformed message from {}: {}", player, e);
            lobby.send_system_message(player, "malformed message");
            return;
        }
    };

    // A bug in one handler must not take the connection down with it.
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        lobby.handle_event(&event_type, data, player)
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Rejected '{}' from {}: {}", event_type, player, e),
        Err(_) => {
            error!("Panic while handling '{}' from {}", event_type, player);
            lobby.send_system_message(player, &format!("invalid data for '{}'", event_type));
        }
    }
}

enum ReadLine {
    Line(String),
    /// No line break within the limit. The rest of the stream can't be
    /// framed any more.
    TooLong,
    Closed,
}

/// Newline-delimited reader that never buffers more than `max_len` bytes
/// of a single line.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_len,
        }
    }

    /// Partially read bytes stay in `buf`, so a cancelled call can be
    /// resumed by calling again.
    async fn next_line(&mut self) -> io::Result<ReadLine> {
        let limit = (self.max_len + 1).saturating_sub(self.buf.len()) as u64;
        let read = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if self.buf.len() > self.max_len {
            self.buf.clear();
            return Ok(ReadLine::TooLong);
        } else if read == 0 && self.buf.is_empty() {
            return Ok(ReadLine::Closed);
        }

        let line = std::mem::take(&mut self.buf);
        String::from_utf8(line)
            .map(ReadLine::Line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

async fn write_outbound(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Arc<str>>) {
    while let Some(message) = outbound.recv().await {
        let result = async {
            writer.write_all(message.as_bytes()).await?;
            writer.write_all(b"\n").await
        }
        .await;
        if let Err(e) = result {
            debug!("Failed to write to socket: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> io::Result<()> {
    let mut json = serde_json::to_string(value).map_err(io::Error::from)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await
}
