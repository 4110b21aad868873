/// SessionCore: the single owner of all playback session state.
///
/// Every external input (client commands, player events, client count
/// changes, catalog refreshes, position ticks) arrives here as a
/// [`DaemonEvent`] through one mpsc channel.  Nothing else mutates the
/// cursor, the presence machine or the player.
///
/// ```text
///  socket / http ─┐
///  player events ─┼─► DaemonEvent (mpsc) ─► SessionCore::run ─► Player
///  catalog task  ─┤                               │
///  ticker        ─┘                               ├─► Store (write-through)
///                                                 └─► StateManager + broadcast
/// ```
use std::sync::Arc;
use std::time::{Duration, Instant};

use onair_proto::clicks::ClickAggregator;
use onair_proto::config::{CatalogConfig, Config};
use onair_proto::item::PlayableItem;
use onair_proto::metadata::reconcile;
use onair_proto::playlist::PlaylistCursor;
use onair_proto::protocol::{
    Command, CommandFailure, CommandReply, MediaKey, PlaybackState, Resumption,
};
use onair_proto::state::StateManager;
use onair_proto::store::Store;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::player::{Player, PlayerEvent, TransitionReason};
use crate::presence::{PresenceHook, PresenceMachine};
use crate::BroadcastMessage;

/// Everything that can wake the session core.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A controller command; the reply goes back on the oneshot when present.
    ClientCommand(Command, Option<oneshot::Sender<CommandReply>>),
    Player(PlayerEvent),
    ClientCountChanged(usize),
    CatalogLoaded(Vec<PlayableItem>),
    PositionTick,
    Shutdown,
}

/// Session-wide facts that are not part of the playlist or the player.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub attached_clients: usize,
    /// Resumption already offered to the attached controllers.
    pub reattached: bool,
    pub app_name: String,
}

type CommandResult = Result<(), CommandFailure>;

pub struct SessionCore<P: Player> {
    player: P,
    store: Arc<Store>,
    cursor: PlaylistCursor,
    clicks: ClickAggregator,
    presence: PresenceMachine,
    ctx: SessionContext,
    catalog_config: CatalogConfig,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl<P: Player> SessionCore<P> {
    pub async fn new(
        player: P,
        store: Arc<Store>,
        config: &Config,
        hook: Box<dyn PresenceHook>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let mut cursor = PlaylistCursor::new();
        cursor.set_looping(store.load_loop_state());

        let state_manager = Arc::new(StateManager::new());
        state_manager
            .set_catalog_len(store.load_catalog().len())
            .await;
        state_manager
            .set_playlist(Vec::new(), None, cursor.is_looping())
            .await;

        Self {
            player,
            store,
            cursor,
            clicks: ClickAggregator::new(Duration::from_millis(config.buttons.click_window_ms)),
            presence: PresenceMachine::new(hook),
            ctx: SessionContext {
                app_name: config.session.app_name.clone(),
                ..SessionContext::default()
            },
            catalog_config: config.catalog.clone(),
            state_manager,
            broadcast_tx,
            event_tx,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        self.state_manager.clone()
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        let tick_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if tick_tx.send(DaemonEvent::PositionTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(event) = event_rx.recv().await {
            if matches!(event, DaemonEvent::Shutdown) {
                info!("Shutdown requested");
                break;
            }
            self.handle_event(event).await;
        }

        self.save_resume_position();
        self.store.sync().await;
        self.player.shutdown();
        Ok(())
    }

    pub async fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::ClientCommand(cmd, reply_tx) => {
                let reply = self.handle_command(cmd).await;
                if !reply.is_success() {
                    warn!("Command failed: {:?}", reply);
                }
                if let Some(tx) = reply_tx {
                    let _ = tx.send(reply);
                }
            }
            DaemonEvent::Player(event) => self.handle_player_event(event).await,
            DaemonEvent::ClientCountChanged(count) => {
                self.ctx.attached_clients = count;
                if count == 0 {
                    self.ctx.reattached = false;
                }
                info!("Attached clients: {}", self.ctx.attached_clients);
                self.state_manager
                    .set_attached_clients(self.ctx.attached_clients)
                    .await;
                self.notify();
            }
            DaemonEvent::CatalogLoaded(items) => {
                info!("Catalog refreshed: {} entries", items.len());
                self.store.save_catalog(items);
                let len = self.store.load_catalog().len();
                self.state_manager.set_catalog_len(len).await;
                self.notify();
            }
            DaemonEvent::PositionTick => {
                let position_ms = self.player.position_ms();
                let state = self.state_manager.get_state().await;
                if state.position_ms != position_ms {
                    self.state_manager.set_position_ms(position_ms).await;
                    if state.playback_state == PlaybackState::ReadyPlaying {
                        self.notify();
                    }
                }
            }
            DaemonEvent::Shutdown => {}
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) -> CommandReply {
        info!("Command: {:?}", cmd);
        match cmd {
            Command::StartPlayback {
                media_id,
                auto_play,
            } => {
                if media_id.is_empty() {
                    return self.start_playback(None, auto_play).await.into();
                }
                match self.find_item(&media_id) {
                    Some(item) => self.start_playback(Some(item), auto_play).await.into(),
                    None => {
                        warn!("StartPlayback: unknown media id {}", media_id);
                        CommandReply::Failed {
                            reason: CommandFailure::ItemNotFound,
                        }
                    }
                }
            }
            Command::TogglePlayback => self.toggle_playback().await.into(),
            Command::StopPlayback => self.stop_playback().await.into(),
            Command::SkipNext { auto_play } => self.skip(true, auto_play).await.into(),
            Command::SkipPrevious { auto_play } => self.skip(false, auto_play).await.into(),
            Command::SetPlaylist {
                items,
                start_index,
                start_position_ms,
            } => CommandReply::Item {
                item: self.set_playlist(items, start_index, start_position_ms).await,
            },
            Command::SetLooping { enabled } => {
                self.set_looping(enabled).await;
                CommandReply::Done
            }
            Command::MediaKey { key } => self.dispatch_media_key(key, Instant::now()).await.into(),
            Command::Reattach => self.reattach().await.into(),
            Command::QueryResumption => CommandReply::Resumption {
                resumption: self.resumption(),
            },
            Command::RefreshCatalog => {
                self.spawn_catalog_refresh();
                CommandReply::Done
            }
            Command::GetState => CommandReply::Done,
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Start `item`, or whatever the cursor points at, or the last saved item.
    async fn start_playback(&mut self, item: Option<PlayableItem>, auto_play: bool) -> CommandResult {
        let (target, context) = match item {
            Some(item) => (item, None),
            None => match self.cursor.current().cloned() {
                Some(current) => {
                    let context = (
                        self.cursor.items().to_vec(),
                        self.cursor.position().unwrap_or(0),
                    );
                    (current, Some(context))
                }
                None => match self.store.load_last_item() {
                    Some(last) => (last, None),
                    None => {
                        info!("StartPlayback: nothing to play");
                        return self.stop_playback().await;
                    }
                },
            },
        };
        self.start_item(target, context, auto_play).await
    }

    /// Start `target`.  `context` is the list it should play within; when
    /// absent the catalog (or the current playlist) is used.
    async fn start_item(
        &mut self,
        target: PlayableItem,
        context: Option<(Vec<PlayableItem>, usize)>,
        auto_play: bool,
    ) -> CommandResult {
        if !target.is_valid() {
            warn!("StartPlayback: {} has no playable source", target.id);
            return self.stop_playback().await;
        }

        if auto_play && self.presence.playback_requested() {
            self.state_manager.set_presence(self.presence.presence()).await;
        }

        let loaded_same = self
            .player
            .current_item()
            .is_some_and(|loaded| loaded.id == target.id);

        if loaded_same {
            match self.player.state() {
                // A failed load leaves nothing to resume; load it again.
                PlaybackState::Idle | PlaybackState::Error => {
                    self.player.prepare()?;
                    if auto_play {
                        self.player.play()?;
                    }
                }
                PlaybackState::Ended => {
                    self.player.seek_to(0)?;
                    if auto_play {
                        self.player.play()?;
                    }
                }
                _ => {
                    if auto_play {
                        self.player.play()?;
                    }
                }
            }
            self.store.save_last_item(&target);
        } else {
            let last_id = self.store.load_last_item().map(|item| item.id);
            let resumes_last = last_id.as_deref() == Some(target.id.as_str());
            let start_ms = if resumes_last && !target.is_live {
                self.store.load_last_position()
            } else {
                0
            };
            if !resumes_last {
                self.store.save_last_position(0);
            }
            self.store.save_last_item(&target);

            let (items, index) = context.unwrap_or_else(|| self.playlist_for(&target));
            info!(
                "Loading {} ({} of {} entries) at {}ms",
                target.id,
                index + 1,
                items.len(),
                start_ms
            );
            self.cursor.set_playlist(items, index);
            self.player
                .set_items(self.cursor.items().to_vec(), index, start_ms)?;
            self.player.prepare()?;
            if auto_play {
                self.player.play()?;
            }
        }

        self.publish_playlist().await;
        Ok(())
    }

    /// List to play `target` within: the catalog when it lists the item, then
    /// the current playlist, else the item alone.
    fn playlist_for(&self, target: &PlayableItem) -> (Vec<PlayableItem>, usize) {
        let catalog = self.store.load_catalog();
        if let Some(index) = catalog.iter().position(|item| item.id == target.id) {
            let mut items = catalog;
            items[index] = target.clone();
            return (items, index);
        }
        if let Some(index) = self.cursor.index_of(&target.id) {
            let mut items = self.cursor.items().to_vec();
            items[index] = target.clone();
            return (items, index);
        }
        (vec![target.clone()], 0)
    }

    fn find_item(&self, media_id: &str) -> Option<PlayableItem> {
        if let Some(index) = self.cursor.index_of(media_id) {
            return self.cursor.items().get(index).cloned();
        }
        if let Some(item) = self
            .store
            .load_catalog()
            .into_iter()
            .find(|item| item.id == media_id)
        {
            return Some(item);
        }
        self.store
            .load_last_item()
            .filter(|item| item.id == media_id)
    }

    async fn stop_playback(&mut self) -> CommandResult {
        let result = match self.player.current_item() {
            Some(item) if !item.is_live => {
                match self.player.state() {
                    // Offered but never started: the saved position still holds.
                    PlaybackState::Idle => debug!("Stop: {} was never started", item.id),
                    PlaybackState::Ended => self.store.save_last_position(0),
                    _ => {
                        let position_ms = self.player.position_ms();
                        debug!("Stop: pausing {} at {}ms", item.id, position_ms);
                        self.store.save_last_position(position_ms);
                    }
                }
                self.player.pause()
            }
            _ => {
                self.store.save_last_position(0);
                self.player.stop()
            }
        };

        if self.presence.dismiss() {
            self.state_manager.set_presence(self.presence.presence()).await;
        }
        self.publish_playlist().await;
        result.map_err(CommandFailure::from)
    }

    async fn toggle_playback(&mut self) -> CommandResult {
        if self.player.state().is_playing_or_buffering() {
            self.stop_playback().await
        } else {
            self.start_playback(None, true).await
        }
    }

    async fn skip(&mut self, forward: bool, auto_play: Option<bool>) -> CommandResult {
        let auto_play =
            auto_play.unwrap_or_else(|| self.player.state().is_playing_or_buffering());
        let next = if forward {
            self.cursor.next().cloned()
        } else {
            self.cursor.previous().cloned()
        };

        let result = match next {
            Some(item) => {
                let context = (
                    self.cursor.items().to_vec(),
                    self.cursor.position().unwrap_or(0),
                );
                self.start_item(item, Some(context), auto_play).await
            }
            None => {
                info!("Skip: end of playlist");
                self.stop_playback().await
            }
        };
        self.store.save_last_position(0);
        result
    }

    async fn set_playlist(
        &mut self,
        items: Vec<PlayableItem>,
        start_index: usize,
        start_position_ms: u64,
    ) -> Option<PlayableItem> {
        self.cursor.set_playlist(items, start_index);
        let start = self.cursor.current().cloned();

        if let Some(item) = &start {
            let position_ms = if item.is_live { 0 } else { start_position_ms };
            self.store.save_last_item(item);
            self.store.save_last_position(position_ms);
            let index = self.cursor.position().unwrap_or(0);
            if let Err(e) = self
                .player
                .set_items(self.cursor.items().to_vec(), index, position_ms)
            {
                warn!("SetPlaylist: player rejected items: {}", e);
            }
        }

        self.publish_playlist().await;
        start
    }

    async fn set_looping(&mut self, enabled: bool) {
        self.cursor.set_looping(enabled);
        self.store.save_loop_state(enabled);
        self.publish_playlist().await;
    }

    /// Physical media buttons.  `now` is the press time.
    pub async fn dispatch_media_key(&mut self, key: MediaKey, now: Instant) -> CommandResult {
        match key {
            MediaKey::Play => self.start_playback(None, true).await,
            MediaKey::Pause | MediaKey::Stop => self.stop_playback().await,
            MediaKey::Next => self.skip(true, None).await,
            MediaKey::Previous => self.skip(false, None).await,
            MediaKey::PlayPause => {
                let count = self.clicks.register_click_at(now);
                debug!("PlayPause click #{}", count);
                match count {
                    1 => self.toggle_playback().await,
                    2 if self.cursor.len() > 1 => self.skip(true, Some(true)).await,
                    3 if self.cursor.len() > 1 => self.skip(false, Some(true)).await,
                    2 | 3 => Ok(()),
                    _ => self.toggle_playback().await,
                }
            }
        }
    }

    /// A controller attached without asking for anything: offer the last
    /// item, paused, once per attachment.
    async fn reattach(&mut self) -> CommandResult {
        if self.ctx.reattached {
            debug!("Reattach: already attached");
            return Ok(());
        }
        if self.player.current_item().is_some() {
            self.ctx.reattached = true;
            self.publish_playlist().await;
            return Ok(());
        }

        if let Some(resumption) = self.resumption() {
            info!(
                "Reattach: resuming {} at {}ms",
                resumption.items[0].id, resumption.start_position_ms
            );
            self.cursor
                .set_playlist(resumption.items.clone(), resumption.start_index);
            self.player.set_items(
                resumption.items,
                resumption.start_index,
                resumption.start_position_ms,
            )?;
        }
        self.ctx.reattached = true;
        self.publish_playlist().await;
        Ok(())
    }

    fn resumption(&self) -> Option<Resumption> {
        let item = self.store.load_last_item()?;
        let start_position_ms = if item.is_live {
            0
        } else {
            self.store.load_last_position()
        };
        Some(Resumption {
            items: vec![item],
            start_index: 0,
            start_position_ms,
        })
    }

    fn spawn_catalog_refresh(&self) {
        let config = self.catalog_config.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match crate::catalog::load_catalog(&config).await {
                Ok(items) => {
                    let _ = event_tx.send(DaemonEvent::CatalogLoaded(items)).await;
                }
                Err(e) => warn!("Catalog refresh failed: {}", e),
            }
        });
    }

    // ── player events ─────────────────────────────────────────────────────────

    async fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::StateChanged(_) => {
                // The event may be stale by now; decide on the current state.
                let state = self.player.state();
                info!("Playback state: {:?}", state);
                if state == PlaybackState::Ended {
                    self.store.save_last_position(0);
                }
                if state != PlaybackState::Error {
                    self.state_manager.set_playback_state(state).await;
                }
                if self.presence.player_state(state) {
                    self.state_manager.set_presence(self.presence.presence()).await;
                }
                self.notify();
            }
            PlayerEvent::IsPlayingChanged(playing) => {
                if !playing && self.player.state() != PlaybackState::Ended {
                    self.save_resume_position();
                }
            }
            PlayerEvent::ItemTransitioned { index, reason } => {
                debug!("Player moved to entry {} ({:?})", index, reason);
                self.cursor.select(index);
                let current = self
                    .player
                    .current_item()
                    .or_else(|| self.cursor.current().cloned());
                if let Some(item) = current {
                    self.store.save_last_item(&item);
                }
                if reason == TransitionReason::Auto {
                    self.store.save_last_position(0);
                }
                self.publish_playlist().await;
            }
            PlayerEvent::MetadataReceived { stream_title } => {
                self.apply_stream_title(&stream_title).await;
            }
            PlayerEvent::Error { message } => {
                let item = self.player.current_item();
                warn!("Player error: {}", message);
                self.state_manager.set_error(message, item.as_ref()).await;
                if self.presence.dismiss() {
                    self.state_manager.set_presence(self.presence.presence()).await;
                }
                self.notify();
            }
        }
    }

    async fn apply_stream_title(&mut self, stream_title: &str) {
        let Some(current) = self.player.current_item() else {
            debug!("Metadata with nothing loaded: {:?}", stream_title);
            return;
        };
        let reconciled = reconcile(
            stream_title,
            &current.subtitle,
            current.display_station(&self.ctx.app_name),
        );
        if reconciled.matches(&current.subtitle, &current.title) {
            debug!("Metadata unchanged for {}", current.id);
            return;
        }

        let updated = current.with_metadata(&reconciled.artist, &reconciled.title);
        if let Some(index) = self.player.current_index() {
            self.cursor.select(index);
        }
        if !self.cursor.replace_current(updated.clone()) {
            debug!("Metadata for {} not in the playlist", updated.id);
        }
        if let Err(e) = self.player.replace_current_item(updated) {
            warn!("Could not swap metadata on the player: {}", e);
        }

        info!("Now playing: {} - {}", reconciled.artist, reconciled.title);
        self.publish_playlist().await;
        let _ = self.broadcast_tx.send(BroadcastMessage::Metadata {
            artist: reconciled.artist,
            title: reconciled.title,
        });
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    /// Remember where an on-demand item stopped.
    fn save_resume_position(&self) {
        if let Some(item) = self.player.current_item() {
            let state = self.player.state();
            if !item.is_live && !matches!(state, PlaybackState::Ended | PlaybackState::Idle) {
                self.store.save_last_position(self.player.position_ms());
            }
        }
    }

    async fn publish_playlist(&self) {
        self.state_manager
            .set_playlist(
                self.cursor.items().to_vec(),
                self.cursor.position(),
                self.cursor.is_looping(),
            )
            .await;
        self.notify();
    }

    fn notify(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerError;
    use crate::presence::LogPresence;
    use onair_proto::protocol::Presence;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Prepare,
        Play,
        Pause,
        Stop,
        SeekTo(u64),
        SetItems {
            ids: Vec<String>,
            start_index: usize,
            start_position_ms: u64,
        },
        Replace(PlayableItem),
    }

    #[derive(Default)]
    struct FakeState {
        calls: Vec<Call>,
        items: Vec<PlayableItem>,
        index: Option<usize>,
        state: PlaybackState,
        position_ms: u64,
        unavailable: bool,
    }

    /// Records every call; state moves synchronously so tests can set it up.
    #[derive(Clone, Default)]
    struct FakePlayer(Arc<Mutex<FakeState>>);

    impl FakePlayer {
        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        fn clear_calls(&self) {
            self.0.lock().unwrap().calls.clear();
        }

        fn set_state(&self, state: PlaybackState) {
            self.0.lock().unwrap().state = state;
        }

        fn set_position(&self, position_ms: u64) {
            self.0.lock().unwrap().position_ms = position_ms;
        }

        fn record(&self, call: Call) -> Result<(), PlayerError> {
            let mut inner = self.0.lock().unwrap();
            if inner.unavailable {
                return Err(PlayerError::Unavailable);
            }
            inner.calls.push(call);
            Ok(())
        }
    }

    impl Player for FakePlayer {
        fn prepare(&mut self) -> Result<(), PlayerError> {
            self.record(Call::Prepare)?;
            self.set_state(PlaybackState::ReadyPaused);
            Ok(())
        }

        fn play(&mut self) -> Result<(), PlayerError> {
            self.record(Call::Play)?;
            self.set_state(PlaybackState::ReadyPlaying);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), PlayerError> {
            self.record(Call::Pause)?;
            // Pausing a player with nothing running changes nothing.
            if !matches!(self.state(), PlaybackState::Idle | PlaybackState::Ended) {
                self.set_state(PlaybackState::ReadyPaused);
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PlayerError> {
            self.record(Call::Stop)?;
            self.set_state(PlaybackState::Idle);
            Ok(())
        }

        fn seek_to(&mut self, position_ms: u64) -> Result<(), PlayerError> {
            self.record(Call::SeekTo(position_ms))?;
            self.set_position(position_ms);
            Ok(())
        }

        fn set_items(
            &mut self,
            items: Vec<PlayableItem>,
            start_index: usize,
            start_position_ms: u64,
        ) -> Result<(), PlayerError> {
            self.record(Call::SetItems {
                ids: items.iter().map(|i| i.id.clone()).collect(),
                start_index,
                start_position_ms,
            })?;
            let mut inner = self.0.lock().unwrap();
            inner.index = (!items.is_empty()).then_some(start_index);
            inner.items = items;
            inner.state = PlaybackState::Idle;
            Ok(())
        }

        fn replace_current_item(&mut self, item: PlayableItem) -> Result<(), PlayerError> {
            self.record(Call::Replace(item.clone()))?;
            let mut inner = self.0.lock().unwrap();
            if let Some(index) = inner.index {
                inner.items[index] = item;
            }
            Ok(())
        }

        fn current_item(&self) -> Option<PlayableItem> {
            let inner = self.0.lock().unwrap();
            inner.index.and_then(|i| inner.items.get(i).cloned())
        }

        fn current_index(&self) -> Option<usize> {
            self.0.lock().unwrap().index
        }

        fn state(&self) -> PlaybackState {
            self.0.lock().unwrap().state
        }

        fn position_ms(&self) -> u64 {
            self.0.lock().unwrap().position_ms
        }

        fn is_available(&self) -> bool {
            !self.0.lock().unwrap().unavailable
        }
    }

    fn station(id: &str) -> PlayableItem {
        PlayableItem {
            title: id.to_uppercase(),
            station_name: format!("Radio {id}"),
            is_live: true,
            ..PlayableItem::new(id, format!("https://radio.example/{id}.mp3"))
        }
    }

    fn episode(id: &str) -> PlayableItem {
        PlayableItem {
            title: format!("Episode {id}"),
            subtitle: "Host".to_string(),
            is_live: false,
            ..PlayableItem::new(id, format!("https://cdn.example/{id}.mp3"))
        }
    }

    struct Harness {
        core: SessionCore<FakePlayer>,
        player: FakePlayer,
        store: Arc<Store>,
        broadcast_rx: broadcast::Receiver<BroadcastMessage>,
    }

    async fn harness_with_store(store: Arc<Store>) -> Harness {
        let player = FakePlayer::default();
        let (broadcast_tx, broadcast_rx) = broadcast::channel(64);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let core = SessionCore::new(
            player.clone(),
            store.clone(),
            &Config::default(),
            Box::new(LogPresence),
            broadcast_tx,
            event_tx,
        )
        .await;
        Harness {
            core,
            player,
            store,
            broadcast_rx,
        }
    }

    async fn harness(catalog: Vec<PlayableItem>) -> Harness {
        let store = Arc::new(Store::in_memory());
        store.save_catalog(catalog);
        harness_with_store(store).await
    }

    fn start(media_id: &str) -> Command {
        Command::StartPlayback {
            media_id: media_id.to_string(),
            auto_play: true,
        }
    }

    #[tokio::test]
    async fn test_start_with_nothing_to_play_never_prepares() {
        let mut h = harness(Vec::new()).await;
        let reply = h.core.handle_command(start("")).await;
        assert_eq!(reply, CommandReply::Done);
        assert!(!h.player.calls().contains(&Call::Prepare));
        assert_eq!(h.player.calls(), vec![Call::Stop]);
    }

    #[tokio::test]
    async fn test_start_item_loads_whole_catalog_at_its_index() {
        let catalog: Vec<_> = ["a", "b", "c", "d", "e"].iter().map(|id| station(id)).collect();
        let mut h = harness(catalog).await;

        let reply = h.core.handle_command(start("c")).await;
        assert_eq!(reply, CommandReply::Done);

        assert_eq!(
            h.player.calls(),
            vec![
                Call::SetItems {
                    ids: vec!["a", "b", "c", "d", "e"].into_iter().map(String::from).collect(),
                    start_index: 2,
                    start_position_ms: 0,
                },
                Call::Prepare,
                Call::Play,
            ]
        );
        let state = h.core.state_manager().get_state().await;
        assert_eq!(state.position, Some(2));
        assert_eq!(state.playlist.len(), 5);
        assert_eq!(state.presence, Presence::PendingForeground);
        assert_eq!(h.store.load_last_item().map(|i| i.id), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_start_unknown_media_id_is_not_found() {
        let mut h = harness(vec![station("a")]).await;
        let reply = h.core.handle_command(start("nope")).await;
        assert_eq!(
            reply,
            CommandReply::Failed {
                reason: CommandFailure::ItemNotFound
            }
        );
        assert!(h.player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_catalog_plays_item_alone() {
        let mut h = harness(Vec::new()).await;
        h.store.save_last_item(&station("fip"));

        h.core.handle_command(start("fip")).await;
        assert_eq!(
            h.player.calls()[0],
            Call::SetItems {
                ids: vec!["fip".to_string()],
                start_index: 0,
                start_position_ms: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_start_loaded_item_depends_on_player_state() {
        let mut h = harness(vec![episode("ep1")]).await;
        h.core.handle_command(start("ep1")).await;
        h.player.clear_calls();

        h.player.set_state(PlaybackState::Idle);
        h.core.handle_command(start("ep1")).await;
        assert_eq!(h.player.calls(), vec![Call::Prepare, Call::Play]);
        h.player.clear_calls();

        h.player.set_state(PlaybackState::Ended);
        h.core.handle_command(start("ep1")).await;
        assert_eq!(h.player.calls(), vec![Call::SeekTo(0), Call::Play]);
        h.player.clear_calls();

        h.player.set_state(PlaybackState::ReadyPaused);
        h.core
            .handle_command(Command::StartPlayback {
                media_id: "ep1".into(),
                auto_play: false,
            })
            .await;
        assert!(h.player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_player_error_loads_again() {
        let mut h = harness(vec![station("fip")]).await;
        h.core.handle_command(start("fip")).await;
        h.player.set_state(PlaybackState::Error);
        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::Error {
                message: "connection refused".into(),
            }))
            .await;
        h.player.clear_calls();

        let reply = h.core.handle_command(start("fip")).await;
        assert_eq!(reply, CommandReply::Done);
        assert_eq!(h.player.calls(), vec![Call::Prepare, Call::Play]);

        // Toggle from the error state retries the same way.
        h.player.set_state(PlaybackState::Error);
        h.player.clear_calls();
        h.core.handle_command(Command::TogglePlayback).await;
        assert_eq!(h.player.calls(), vec![Call::Prepare, Call::Play]);
    }

    #[tokio::test]
    async fn test_start_resumes_saved_position_of_same_episode() {
        let mut h = harness(vec![episode("ep1"), episode("ep2")]).await;
        h.store.save_last_item(&episode("ep1"));
        h.store.save_last_position(95_000);

        h.core.handle_command(start("ep1")).await;
        assert!(matches!(
            h.player.calls()[0],
            Call::SetItems { start_position_ms: 95_000, .. }
        ));

        h.player.clear_calls();
        h.core.handle_command(start("ep2")).await;
        assert!(matches!(
            h.player.calls()[0],
            Call::SetItems { start_position_ms: 0, start_index: 1, .. }
        ));
        assert_eq!(h.store.load_last_position(), 0);
    }

    #[tokio::test]
    async fn test_stop_pauses_episode_and_keeps_position() {
        let mut h = harness(vec![episode("ep1")]).await;
        h.core.handle_command(start("ep1")).await;
        h.player.set_position(61_000);
        h.player.clear_calls();

        let reply = h.core.handle_command(Command::StopPlayback).await;
        assert_eq!(reply, CommandReply::Done);
        assert_eq!(h.player.calls(), vec![Call::Pause]);
        assert_eq!(h.store.load_last_position(), 61_000);
        assert_eq!(
            h.core.state_manager().get_state().await.presence,
            Presence::Background
        );
    }

    #[tokio::test]
    async fn test_stop_live_stream_resets_position() {
        let mut h = harness(vec![station("fip")]).await;
        h.core.handle_command(start("fip")).await;
        h.store.save_last_position(7_000);
        h.player.clear_calls();

        h.core.handle_command(Command::StopPlayback).await;
        assert_eq!(h.player.calls(), vec![Call::Stop]);
        assert_eq!(h.store.load_last_position(), 0);
    }

    #[tokio::test]
    async fn test_toggle_stops_when_playing_and_starts_otherwise() {
        let mut h = harness(vec![station("fip")]).await;
        h.core.handle_command(start("fip")).await;
        assert_eq!(h.player.state(), PlaybackState::ReadyPlaying);

        h.player.clear_calls();
        h.core.handle_command(Command::TogglePlayback).await;
        assert_eq!(h.player.calls(), vec![Call::Stop]);

        h.player.clear_calls();
        h.core.handle_command(Command::TogglePlayback).await;
        assert_eq!(h.player.calls(), vec![Call::Prepare, Call::Play]);
    }

    #[tokio::test]
    async fn test_skip_past_single_item_stops_and_resets_position() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![episode("ep1")],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;
        h.core.handle_command(start("")).await;
        h.player.set_position(42_000);
        h.player.clear_calls();

        let reply = h
            .core
            .handle_command(Command::SkipNext { auto_play: None })
            .await;
        assert_eq!(reply, CommandReply::Done);
        assert_eq!(h.player.calls(), vec![Call::Pause]);
        assert_eq!(h.store.load_last_position(), 0);
        assert_eq!(h.core.state_manager().get_state().await.position, None);
    }

    #[tokio::test]
    async fn test_skip_keeps_playlist_context() {
        let catalog: Vec<_> = ["a", "b", "c"].iter().map(|id| station(id)).collect();
        let mut h = harness(catalog).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![station("c"), station("a")],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;
        h.player.clear_calls();

        h.core
            .handle_command(Command::SkipNext {
                auto_play: Some(false),
            })
            .await;
        assert_eq!(
            h.player.calls(),
            vec![
                Call::SetItems {
                    ids: vec!["c".to_string(), "a".to_string()],
                    start_index: 1,
                    start_position_ms: 0,
                },
                Call::Prepare,
            ]
        );
    }

    #[tokio::test]
    async fn test_set_playlist_filters_and_keeps_start_position() {
        let mut h = harness(Vec::new()).await;
        let broken = PlayableItem::new("broken", "ftp://nowhere/x");
        let reply = h
            .core
            .handle_command(Command::SetPlaylist {
                items: vec![broken, episode("ep1"), episode("ep2")],
                start_index: 1,
                start_position_ms: 12_345,
            })
            .await;

        assert_eq!(
            reply,
            CommandReply::Item {
                item: Some(episode("ep2"))
            }
        );
        assert_eq!(h.store.load_last_position(), 12_345);
        assert_eq!(h.store.load_last_item().map(|i| i.id), Some("ep2".into()));
        assert!(!h.player.calls().contains(&Call::Prepare));
        assert!(!h.player.calls().contains(&Call::Play));
    }

    #[tokio::test]
    async fn test_set_playlist_live_start_ignores_position() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![station("fip")],
                start_index: 0,
                start_position_ms: 9_000,
            })
            .await;
        assert_eq!(h.store.load_last_position(), 0);
    }

    #[tokio::test]
    async fn test_looping_is_written_through() {
        let store = Arc::new(Store::in_memory());
        let mut h = harness_with_store(store.clone()).await;
        h.core
            .handle_command(Command::SetLooping { enabled: true })
            .await;
        assert!(store.load_loop_state());
        assert!(h.core.state_manager().get_state().await.looping);

        let h2 = harness_with_store(store).await;
        assert!(h2.core.cursor.is_looping());
    }

    #[tokio::test]
    async fn test_headset_click_counts() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![station("a"), station("b"), station("c")],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;
        h.player.clear_calls();
        let t0 = Instant::now();

        // One click: toggle from idle starts the current item.
        h.core.dispatch_media_key(MediaKey::PlayPause, t0).await.unwrap();
        assert_eq!(h.player.calls(), vec![Call::Prepare, Call::Play]);

        // Two clicks: next.
        h.core
            .dispatch_media_key(MediaKey::PlayPause, t0 + Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(h.core.cursor.position(), Some(1));

        // Three clicks: previous.
        h.core
            .dispatch_media_key(MediaKey::PlayPause, t0 + Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(h.core.cursor.position(), Some(0));

        // Four clicks: toggle again.
        h.player.clear_calls();
        h.core
            .dispatch_media_key(MediaKey::PlayPause, t0 + Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(h.player.calls(), vec![Call::Stop]);
    }

    #[tokio::test]
    async fn test_double_click_ignored_on_single_item_playlist() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![station("a")],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;
        let t0 = Instant::now();
        h.core.dispatch_media_key(MediaKey::PlayPause, t0).await.unwrap();
        h.player.clear_calls();

        h.core
            .dispatch_media_key(MediaKey::PlayPause, t0 + Duration::from_millis(50))
            .await
            .unwrap();
        assert!(h.player.calls().is_empty());
        assert_eq!(h.core.cursor.position(), Some(0));
    }

    #[tokio::test]
    async fn test_next_key_follows_playing_state() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![station("a"), station("b")],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;
        h.player.clear_calls();

        // Idle: skip without starting output.
        h.core
            .dispatch_media_key(MediaKey::Next, Instant::now())
            .await
            .unwrap();
        assert!(!h.player.calls().contains(&Call::Play));
    }

    #[tokio::test]
    async fn test_reattach_offers_last_episode_once() {
        let store = Arc::new(Store::in_memory());
        store.save_last_item(&episode("ep7"));
        store.save_last_position(30_000);
        let mut h = harness_with_store(store).await;

        h.core.handle_command(Command::Reattach).await;
        assert_eq!(
            h.player.calls(),
            vec![Call::SetItems {
                ids: vec!["ep7".to_string()],
                start_index: 0,
                start_position_ms: 30_000,
            }]
        );

        h.core.handle_command(Command::Reattach).await;
        assert_eq!(h.player.calls().len(), 1);

        // Detach and attach again: the item is already loaded.
        h.core.handle_event(DaemonEvent::ClientCountChanged(0)).await;
        h.core.handle_command(Command::Reattach).await;
        assert_eq!(h.player.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_offered_episode_started_keeps_saved_position() {
        let store = Arc::new(Store::in_memory());
        store.save_last_item(&episode("ep7"));
        store.save_last_position(30_000);
        let mut h = harness_with_store(store).await;
        // Position left over from whatever the player had before.
        h.player.set_position(4_000);

        h.core.handle_command(Command::Reattach).await;
        h.core.handle_command(Command::StopPlayback).await;
        assert_eq!(h.store.load_last_position(), 30_000);

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::IsPlayingChanged(false)))
            .await;
        assert_eq!(h.store.load_last_position(), 30_000);

        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![episode("ep8")],
                start_index: 0,
                start_position_ms: 12_000,
            })
            .await;
        h.core.handle_command(Command::StopPlayback).await;
        assert_eq!(h.store.load_last_position(), 12_000);
    }

    #[tokio::test]
    async fn test_resumption_of_live_item_starts_at_zero() {
        let store = Arc::new(Store::in_memory());
        store.save_last_item(&station("fip"));
        store.save_last_position(5_000);
        let mut h = harness_with_store(store).await;

        let reply = h.core.handle_command(Command::QueryResumption).await;
        match reply {
            CommandReply::Resumption {
                resumption: Some(r),
            } => {
                assert_eq!(r.items[0].id, "fip");
                assert_eq!(r.start_position_ms, 0);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        h.store.clear_resumption_record();
        assert_eq!(
            h.core.handle_command(Command::QueryResumption).await,
            CommandReply::Resumption { resumption: None }
        );
    }

    #[tokio::test]
    async fn test_identical_metadata_sends_no_replace() {
        let mut h = harness(Vec::new()).await;
        let item = PlayableItem {
            title: "Maria También".into(),
            subtitle: "Khruangbin".into(),
            is_live: true,
            ..PlayableItem::new("kexp", "https://kexp.example/live")
        };
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![item],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;
        h.player.clear_calls();

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::MetadataReceived {
                stream_title: " Khruangbin - Maria También ".into(),
            }))
            .await;
        assert!(h.player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_new_metadata_replaces_item_in_place() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![station("a"), station("kexp")],
                start_index: 1,
                start_position_ms: 0,
            })
            .await;
        h.player.clear_calls();
        while h.broadcast_rx.try_recv().is_ok() {}

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::MetadataReceived {
                stream_title: "Bonobo - Kerala".into(),
            }))
            .await;

        let calls = h.player.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Replace(item) => {
                assert_eq!(item.id, "kexp");
                assert_eq!(item.subtitle, "Bonobo");
                assert_eq!(item.title, "Kerala");
                assert_eq!(item.source_uri, station("kexp").source_uri);
            }
            other => panic!("unexpected call {:?}", other),
        }
        let state = h.core.state_manager().get_state().await;
        assert_eq!(state.position, Some(1));
        assert_eq!(state.playlist[1].title, "Kerala");

        let mut saw_metadata = false;
        while let Ok(msg) = h.broadcast_rx.try_recv() {
            if let BroadcastMessage::Metadata { artist, title } = msg {
                assert_eq!((artist.as_str(), title.as_str()), ("Bonobo", "Kerala"));
                saw_metadata = true;
            }
        }
        assert!(saw_metadata);
    }

    #[tokio::test]
    async fn test_empty_metadata_falls_back_to_station_name() {
        let mut h = harness(Vec::new()).await;
        let item = PlayableItem {
            title: "Some Song".into(),
            is_live: true,
            ..PlayableItem::new("x", "https://x.example/live")
        };
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![item],
                start_index: 0,
                start_position_ms: 0,
            })
            .await;

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::MetadataReceived {
                stream_title: "   ".into(),
            }))
            .await;
        let state = h.core.state_manager().get_state().await;
        assert_eq!(state.current_item.map(|i| i.title), Some("onair".to_string()));
    }

    #[tokio::test]
    async fn test_auto_transition_saves_item_and_resets_position() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_command(Command::SetPlaylist {
                items: vec![episode("ep1"), episode("ep2")],
                start_index: 0,
                start_position_ms: 80_000,
            })
            .await;
        {
            let mut inner = h.player.0.lock().unwrap();
            inner.index = Some(1);
        }

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::ItemTransitioned {
                index: 1,
                reason: TransitionReason::Auto,
            }))
            .await;
        assert_eq!(h.store.load_last_item().map(|i| i.id), Some("ep2".into()));
        assert_eq!(h.store.load_last_position(), 0);
        assert_eq!(h.core.cursor.position(), Some(1));
    }

    #[tokio::test]
    async fn test_state_changes_drive_presence_and_end_resets_position() {
        let mut h = harness(vec![episode("ep1")]).await;
        h.core.handle_command(start("ep1")).await;

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::StateChanged(
                PlaybackState::ReadyPlaying,
            )))
            .await;
        let state = h.core.state_manager().get_state().await;
        assert_eq!(state.presence, Presence::ForegroundActive);
        assert_eq!(state.playback_state, PlaybackState::ReadyPlaying);

        h.store.save_last_position(50_000);
        h.player.set_state(PlaybackState::Ended);
        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::StateChanged(
                PlaybackState::Ended,
            )))
            .await;
        assert_eq!(h.store.load_last_position(), 0);
        assert_eq!(
            h.core.state_manager().get_state().await.presence,
            Presence::Background
        );
    }

    #[tokio::test]
    async fn test_pause_event_saves_episode_position() {
        let mut h = harness(vec![episode("ep1")]).await;
        h.core.handle_command(start("ep1")).await;
        h.player.set_position(33_000);
        h.player.set_state(PlaybackState::ReadyPaused);

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::IsPlayingChanged(false)))
            .await;
        assert_eq!(h.store.load_last_position(), 33_000);
    }

    #[tokio::test]
    async fn test_player_error_keeps_item_live_flag() {
        let mut h = harness(vec![episode("ep1")]).await;
        h.core.handle_command(start("ep1")).await;

        h.core
            .handle_event(DaemonEvent::Player(PlayerEvent::Error {
                message: "HTTP 404".into(),
            }))
            .await;
        let state = h.core.state_manager().get_state().await;
        assert_eq!(state.playback_state, PlaybackState::Error);
        let error = state.error.unwrap();
        assert_eq!(error.message, "HTTP 404");
        assert!(!error.is_live);
        assert_eq!(state.presence, Presence::Background);
    }

    #[tokio::test]
    async fn test_unavailable_player_fails_command() {
        let mut h = harness(vec![station("fip")]).await;
        h.player.0.lock().unwrap().unavailable = true;
        let reply = h.core.handle_command(start("fip")).await;
        assert_eq!(
            reply,
            CommandReply::Failed {
                reason: CommandFailure::PlayerUnavailable
            }
        );
    }

    #[tokio::test]
    async fn test_catalog_loaded_is_filtered_and_counted() {
        let mut h = harness(Vec::new()).await;
        h.core
            .handle_event(DaemonEvent::CatalogLoaded(vec![
                station("a"),
                PlayableItem::new("", "https://x.example/"),
                station("b"),
            ]))
            .await;
        assert_eq!(h.store.load_catalog().len(), 2);
        assert_eq!(h.core.state_manager().get_state().await.catalog_len, 2);
    }

    #[tokio::test]
    async fn test_command_reply_goes_to_oneshot() {
        let mut h = harness(Vec::new()).await;
        let (tx, rx) = oneshot::channel();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::GetState, Some(tx)))
            .await;
        assert_eq!(rx.await.unwrap(), CommandReply::Done);
    }
}
