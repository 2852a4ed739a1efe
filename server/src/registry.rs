//! Process-wide lobby registry
//!
//! Owns every live [`Lobby`] by id. Besides lookup it runs the periodic
//! cleanup of abandoned lobbies and carries running games over a restart
//! through a handoff file.

use crate::clock::Clock;
use crate::config::CleanupConfig;
use crate::error::HandoffError;
use crate::lobby::{Lobby, LobbySnapshot};
use crate::transport::Transport;
use crate::words::WordCache;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub lobbies: usize,
    pub public_lobbies: usize,
    pub players: usize,
    pub connected_players: usize,
}

/// Everything written on shutdown and read back on the next start.
#[derive(Debug, Serialize, Deserialize)]
pub struct Handoff {
    /// Unix millis at the time of writing.
    pub saved_at: u64,
    pub lobbies: Vec<LobbySnapshot>,
}

pub struct Registry {
    lobbies: RwLock<HashMap<String, Arc<Lobby>>>,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            lobbies: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn add(&self, lobby: Arc<Lobby>) {
        self.lobbies.write().insert(lobby.id().to_string(), lobby);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Lobby>> {
        self.lobbies.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Lobby>> {
        self.lobbies.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lobbies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.read().is_empty()
    }

    /// Public lobbies that still have room, for lobby browsers.
    pub fn public_lobbies(&self) -> Vec<Arc<Lobby>> {
        self.lobbies
            .read()
            .values()
            .filter(|lobby| lobby.is_public() && lobby.has_free_player_slot())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let lobbies = self.lobbies.read();
        lobbies.values().fold(
            RegistryStats {
                lobbies: lobbies.len(),
                ..RegistryStats::default()
            },
            |mut stats, lobby| {
                if lobby.is_public() {
                    stats.public_lobbies += 1;
                }
                stats.players += lobby.player_count();
                stats.connected_players += lobby.connected_player_count();
                stats
            },
        )
    }

    /// Removes lobbies that nobody has been connected to for at least
    /// `inactivity_threshold_millis`. Returns how many were removed.
    pub fn sweep(&self, inactivity_threshold_millis: u64) -> usize {
        let now = self.clock.now_millis();
        let removed: Vec<Arc<Lobby>> = {
            let mut lobbies = self.lobbies.write();
            let abandoned: Vec<String> = lobbies
                .values()
                .filter(|lobby| {
                    !lobby.has_connected_players()
                        && now.saturating_sub(lobby.last_disconnect_time())
                            >= inactivity_threshold_millis
                })
                .map(|lobby| lobby.id().to_string())
                .collect();
            abandoned
                .iter()
                .filter_map(|id| lobbies.remove(id))
                .collect()
        };

        // Shut down outside the registry lock.
        for lobby in &removed {
            info!("Removing inactive lobby {}", lobby.id());
            lobby.shutdown();
        }
        removed.len()
    }

    /// Spawns the periodic sweep. Returns `None` if the interval is zero.
    pub fn launch_cleanup(self: &Arc<Self>, config: CleanupConfig) -> Option<JoinHandle<()>> {
        if config.interval.is_zero() {
            info!("Lobby cleanup disabled");
            return None;
        }

        let registry = Arc::clone(self);
        let threshold = config.inactivity_threshold.as_millis() as u64;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first tick since it fires immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let removed = registry.sweep(threshold);
                if removed > 0 {
                    debug!("Cleanup removed {} lobbies, {} left", removed, registry.len());
                }
            }
        }))
    }

    /// Empties the registry and tells every lobby's players the server is
    /// going away. Tickers stop with their lobby.
    pub fn shutdown_all(&self) {
        let lobbies: Vec<Arc<Lobby>> = self
            .lobbies
            .write()
            .drain()
            .map(|(_, lobby)| lobby)
            .collect();
        info!("Shutting down {} lobbies", lobbies.len());
        for lobby in lobbies {
            lobby.shutdown();
        }
    }

    pub fn snapshot_all(&self) -> Handoff {
        let lobbies = self
            .lobbies
            .read()
            .values()
            .map(|lobby| lobby.snapshot())
            .collect();
        Handoff {
            saved_at: self.clock.now_millis(),
            lobbies,
        }
    }

    /// Brings back the lobbies of a handoff. Lobbies that fail to restore
    /// are logged and skipped. Returns how many were restored.
    pub fn restore(
        &self,
        handoff: Handoff,
        words: &WordCache,
        transport: Arc<dyn Transport>,
    ) -> usize {
        let gap = self.clock.now_millis().saturating_sub(handoff.saved_at);
        let mut restored = 0;

        for snapshot in handoff.lobbies {
            let id = snapshot.id.clone();
            if self.get(&id).is_some() {
                warn!("Lobby {} is already running, not restoring it", id);
                continue;
            }
            match Lobby::resurrect(
                snapshot,
                gap,
                words,
                Arc::clone(&transport),
                Arc::clone(&self.clock),
            ) {
                Ok(lobby) => {
                    self.add(lobby);
                    restored += 1;
                }
                Err(e) => warn!("Failed to restore lobby {}: {}", id, e),
            }
        }

        info!("Restored {} lobbies ({}ms downtime)", restored, gap);
        restored
    }

    pub fn save_handoff(&self, path: &Path) -> Result<usize, HandoffError> {
        let handoff = self.snapshot_all();
        let count = handoff.lobbies.len();
        let json = serde_json::to_vec(&handoff)?;
        std::fs::write(path, json)?;
        info!("Wrote {} lobbies to {}", count, path.display());
        Ok(count)
    }

    /// Restores from `path` and deletes the file. A missing file is not an
    /// error and restores nothing.
    pub fn load_handoff(
        &self,
        path: &Path,
        words: &WordCache,
        transport: Arc<dyn Transport>,
    ) -> Result<usize, HandoffError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove handoff file {}: {}", path.display(), e);
        }

        let handoff: Handoff = serde_json::from_slice(&bytes)?;
        Ok(self.restore(handoff, words, transport))
    }
}
