//! The Player capability: the opaque engine the session core drives.
//!
//! Commands are queued by the implementation and return as soon as they are
//! accepted; their effects arrive later as [`PlayerEvent`]s on the core's
//! event channel.  Accessors report the engine's latest known state and must
//! be re-read at every decision point.

use onair_proto::item::PlayableItem;
use onair_proto::protocol::{CommandFailure, PlaybackState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    /// The engine is gone (process died, IPC closed) or never started.
    #[error("player unavailable")]
    Unavailable,
    #[error("player command failed: {0}")]
    Command(String),
}

impl From<PlayerError> for CommandFailure {
    fn from(_: PlayerError) -> Self {
        CommandFailure::PlayerUnavailable
    }
}

/// Why the player moved to another playlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Previous entry finished and the player advanced on its own.
    Auto,
    /// The playlist was replaced or an entry was selected explicitly.
    PlaylistChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged(PlaybackState),
    IsPlayingChanged(bool),
    ItemTransitioned {
        index: usize,
        reason: TransitionReason,
    },
    /// Raw in-stream title (ICY `StreamTitle` or equivalent).
    MetadataReceived {
        stream_title: String,
    },
    Error {
        message: String,
    },
}

pub trait Player: Send {
    fn prepare(&mut self) -> Result<(), PlayerError>;
    fn play(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self) -> Result<(), PlayerError>;
    fn stop(&mut self) -> Result<(), PlayerError>;
    fn seek_to(&mut self, position_ms: u64) -> Result<(), PlayerError>;
    fn set_items(
        &mut self,
        items: Vec<PlayableItem>,
        start_index: usize,
        start_position_ms: u64,
    ) -> Result<(), PlayerError>;
    /// Swap the loaded entry's descriptive metadata without interrupting
    /// output.  `item` carries the same id and source as the loaded entry.
    fn replace_current_item(&mut self, item: PlayableItem) -> Result<(), PlayerError>;

    fn current_item(&self) -> Option<PlayableItem>;
    fn current_index(&self) -> Option<usize>;
    fn state(&self) -> PlaybackState;
    fn position_ms(&self) -> u64;
    fn is_available(&self) -> bool;

    /// Release the engine on daemon exit.
    fn shutdown(&mut self) {}
}
