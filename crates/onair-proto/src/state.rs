use crate::item::PlayableItem;
use crate::protocol::{ErrorInfo, PlaybackState, Presence, SessionState};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly view of the session.  Only the session core writes;
/// socket and HTTP handlers read snapshots.
pub struct StateManager {
    state: Arc<RwLock<SessionState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(SessionState {
                rev: 1,
                ..SessionState::default()
            })),
        }
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn set_playback_state(&self, playback_state: PlaybackState) {
        let mut state = self.state.write().await;
        state.playback_state = playback_state;
        if playback_state != PlaybackState::Error {
            state.error = None;
        }
        state.rev += 1;
    }

    /// Record a player failure.  The live flag comes from `item`.
    pub async fn set_error(&self, message: String, item: Option<&PlayableItem>) {
        let mut state = self.state.write().await;
        state.playback_state = PlaybackState::Error;
        state.error = Some(ErrorInfo {
            message,
            is_live: item.map(|i| i.is_live).unwrap_or(false),
        });
        state.rev += 1;
    }

    pub async fn set_playlist(
        &self,
        playlist: Vec<PlayableItem>,
        position: Option<usize>,
        looping: bool,
    ) {
        let mut state = self.state.write().await;
        state.current_item = position.and_then(|p| playlist.get(p).cloned());
        state.playlist = playlist;
        state.position = position;
        state.looping = looping;
        state.rev += 1;
    }

    pub async fn set_position_ms(&self, position_ms: u64) {
        let mut state = self.state.write().await;
        state.position_ms = position_ms;
        state.rev += 1;
    }

    pub async fn set_attached_clients(&self, count: usize) {
        let mut state = self.state.write().await;
        state.attached_clients = count;
        state.rev += 1;
    }

    pub async fn set_presence(&self, presence: Presence) {
        let mut state = self.state.write().await;
        state.presence = presence;
        state.rev += 1;
    }

    pub async fn set_catalog_len(&self, len: usize) {
        let mut state = self.state.write().await;
        state.catalog_len = len;
        state.rev += 1;
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
