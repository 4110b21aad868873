//! Foreground visibility of the session.
//!
//! A playback request immediately announces a placeholder
//! (`PendingForeground`).  The first real player-state notification promotes
//! it to `ForegroundActive` and tears the placeholder down in the same step,
//! so observers never see both or neither.

use onair_proto::protocol::{PlaybackState, Presence};
use tracing::info;

/// Whatever actually shows the session to the user.
pub trait PresenceHook: Send {
    fn show_placeholder(&mut self);
    /// Replace the placeholder with the real presentation.
    fn promote(&mut self);
    fn dismiss(&mut self);
}

/// Hook for a headless daemon: presence changes only go to the log.
pub struct LogPresence;

impl PresenceHook for LogPresence {
    fn show_placeholder(&mut self) {
        info!("presence: placeholder shown");
    }

    fn promote(&mut self) {
        info!("presence: foreground active");
    }

    fn dismiss(&mut self) {
        info!("presence: dismissed");
    }
}

pub struct PresenceMachine {
    presence: Presence,
    hook: Box<dyn PresenceHook>,
}

impl PresenceMachine {
    pub fn new(hook: Box<dyn PresenceHook>) -> Self {
        Self {
            presence: Presence::Background,
            hook,
        }
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Playback was asked for.  Returns true when the presence changed.
    pub fn playback_requested(&mut self) -> bool {
        if self.presence != Presence::Background {
            return false;
        }
        self.hook.show_placeholder();
        self.presence = Presence::PendingForeground;
        true
    }

    /// Feed a player-state notification.  Returns true when the presence
    /// changed.
    pub fn player_state(&mut self, state: PlaybackState) -> bool {
        match (self.presence, state) {
            (
                Presence::PendingForeground,
                PlaybackState::Buffering | PlaybackState::ReadyPlaying | PlaybackState::ReadyPaused,
            ) => {
                self.hook.promote();
                self.presence = Presence::ForegroundActive;
                true
            }
            (Presence::Background, _) => false,
            (_, PlaybackState::Ended | PlaybackState::Error) => self.dismiss(),
            (Presence::ForegroundActive, PlaybackState::Idle) => self.dismiss(),
            _ => false,
        }
    }

    /// Explicit stop or failure.  Returns true when the presence changed.
    pub fn dismiss(&mut self) -> bool {
        if self.presence == Presence::Background {
            return false;
        }
        self.hook.dismiss();
        self.presence = Presence::Background;
        true
    }
}
