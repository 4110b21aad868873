use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::PlayableItem;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Controllers check it on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are treated as a broken peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Messages sent from a controller to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Empty `media_id` means "resume whatever is current".
    StartPlayback {
        #[serde(default)]
        media_id: String,
        #[serde(default = "default_auto_play")]
        auto_play: bool,
    },
    TogglePlayback,
    StopPlayback,
    /// `auto_play: None` keeps playing only if the session was already
    /// playing or buffering.
    SkipNext {
        #[serde(default)]
        auto_play: Option<bool>,
    },
    SkipPrevious {
        #[serde(default)]
        auto_play: Option<bool>,
    },
    SetPlaylist {
        items: Vec<PlayableItem>,
        #[serde(default)]
        start_index: usize,
        #[serde(default)]
        start_position_ms: u64,
    },
    SetLooping {
        enabled: bool,
    },
    /// A physical media button press.
    MediaKey {
        key: MediaKey,
    },
    /// Controller (re)attached without an explicit playback request.
    Reattach,
    QueryResumption,
    RefreshCatalog,
    GetState,
}

fn default_auto_play() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaKey {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Play/pause toggle key; also what wired headset hooks report.
    PlayPause,
}

/// Why a command could not be carried out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum CommandFailure {
    #[error("item not found")]
    ItemNotFound,
    #[error("player unavailable")]
    PlayerUnavailable,
    #[error("unsupported command")]
    UnsupportedCommand,
}

/// What the daemon resumes when asked with no explicit item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resumption {
    pub items: Vec<PlayableItem>,
    pub start_index: usize,
    pub start_position_ms: u64,
}

/// Answer to a single command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status")]
pub enum CommandReply {
    Done,
    /// The item that will play (answer to `SetPlaylist`).
    Item { item: Option<PlayableItem> },
    /// `None` means nothing to resume.
    Resumption { resumption: Option<Resumption> },
    Failed { reason: CommandFailure },
}

impl CommandReply {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommandReply::Failed { .. })
    }
}

impl From<Result<(), CommandFailure>> for CommandReply {
    fn from(result: Result<(), CommandFailure>) -> Self {
        match result {
            Ok(()) => CommandReply::Done,
            Err(reason) => CommandReply::Failed { reason },
        }
    }
}

/// Messages sent from the daemon to controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: SessionState,
    },
    State {
        data: SessionState,
    },
    /// In-stream metadata changed what is displayed for the current item.
    Metadata {
        artist: String,
        title: String,
    },
    Reply {
        reply: CommandReply,
    },
    Log {
        message: String,
    },
}

/// Session state as observed from the player.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    ReadyPlaying,
    ReadyPaused,
    Ended,
    Error,
}

impl PlaybackState {
    pub fn is_playing_or_buffering(self) -> bool {
        matches!(self, PlaybackState::ReadyPlaying | PlaybackState::Buffering)
    }
}

/// Foreground visibility of the session, kept apart from playback state.
///
/// `PendingForeground` is the placeholder announced as soon as playback is
/// requested; the first real player-state notification promotes it to
/// `ForegroundActive` and tears the placeholder down in the same step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Presence {
    #[default]
    Background,
    PendingForeground,
    ForegroundActive,
}

/// Player failure as shown to controllers.  `is_live` comes from the item
/// that failed, never from the kind of error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub message: String,
    pub is_live: bool,
}

/// Full observable session state.  `rev` increases on every change so
/// controllers can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionState {
    #[serde(default)]
    pub rev: u64,
    pub playback_state: PlaybackState,
    pub current_item: Option<PlayableItem>,
    #[serde(default)]
    pub playlist: Vec<PlayableItem>,
    pub position: Option<usize>,
    #[serde(default)]
    pub looping: bool,
    #[serde(default)]
    pub position_ms: u64,
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub attached_clients: usize,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub catalog_len: usize,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not enough bytes yet; read more and retry.
    #[error("incomplete frame")]
    Incomplete,
    /// A whole frame arrived but did not decode.  `consumed` bytes can be
    /// dropped to resynchronise.
    #[error("malformed frame ({consumed} bytes): {source}")]
    Malformed {
        consumed: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame too large: {0} bytes")]
    Oversized(usize),
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Incomplete);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::Oversized(len));
        }
        if data.len() < 4 + len {
            return Err(DecodeError::Incomplete);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len]).map_err(|source| {
            DecodeError::Malformed {
                consumed: 4 + len,
                source,
            }
        })?;
        Ok((msg, 4 + len))
    }
}
