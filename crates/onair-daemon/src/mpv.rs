/// mpv-backed `Player` with separated reader/writer/translator tasks.
///
/// Architecture:
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task      ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task      ← reads JSON lines from socket
///                                   ├── response (has request_id) → matched oneshot::Sender
///                                   └── event / property-change   → MpvEvent channel
///
///   MpvPlayer
///         ├── queue_task       ← ordered Player commands → MpvHandle::send
///         └── translator_task  ← MpvEvent → PlayerSnapshot + PlayerEvent
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use onair_proto::item::PlayableItem;
use onair_proto::protocol::PlaybackState;

use crate::player::{Player, PlayerError, PlayerEvent, TransitionReason};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_ICY_TITLE: u64 = 3;
pub const OBS_TIME_POS: u64 = 4;
pub const OBS_IDLE_ACTIVE: u64 = 5;
pub const OBS_PLAYLIST_POS: u64 = 6;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Register observe_property for every property the translator reads.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_ICY_TITLE, "metadata/by-key/icy-title"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_IDLE_ACTIVE, "idle-active"),
            (OBS_PLAYLIST_POS, "playlist-pos"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and its IPC connection.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    process: Option<tokio::process::Child>,
    volume: f32,
}

impl MpvDriver {
    pub fn new(binary: Option<PathBuf>, volume: f32) -> Self {
        Self {
            socket_name: onair_proto::platform::mpv_socket_name(),
            binary,
            process: None,
            volume,
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let mpv_binary = onair_proto::platform::find_mpv_binary(self.binary.as_ref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = onair_proto::platform::mpv_socket_arg();

        info!("mpv: spawning {}", mpv_binary.display());
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process()?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // pending map: req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── player ────────────────────────────────────────────────────────────────────

/// What the translator knows about mpv, shared with the `Player` accessors.
#[derive(Debug, Default)]
struct PlayerSnapshot {
    items: Vec<PlayableItem>,
    index: Option<usize>,
    state: PlaybackState,
    is_playing: bool,
    position_ms: u64,
    paused: bool,
    core_idle: bool,
    idle_active: bool,
    /// Between start-file and file-loaded.
    loading: bool,
    /// Last end-file was a natural end of the entry.
    reached_eof: bool,
    failed: bool,
    /// playlist-pos we asked for ourselves; the matching change is not an
    /// automatic advance.
    requested_pos: Option<usize>,
    pending_seek_ms: Option<u64>,
    alive: bool,
}

impl PlayerSnapshot {
    fn derive_state(&self) -> PlaybackState {
        if self.failed {
            PlaybackState::Error
        } else if self.idle_active {
            if self.reached_eof {
                PlaybackState::Ended
            } else {
                PlaybackState::Idle
            }
        } else if self.loading || (self.core_idle && !self.paused) {
            PlaybackState::Buffering
        } else if self.paused {
            PlaybackState::ReadyPaused
        } else {
            PlaybackState::ReadyPlaying
        }
    }
}

type SharedSnapshot = Arc<std::sync::Mutex<PlayerSnapshot>>;

fn lock(shared: &SharedSnapshot) -> std::sync::MutexGuard<'_, PlayerSnapshot> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MpvPlayer {
    /// Holds the child process; dropping it kills mpv.
    _driver: MpvDriver,
    queue: mpsc::UnboundedSender<Value>,
    shared: SharedSnapshot,
}

impl MpvPlayer {
    /// Spawn mpv, register observations and start the translator.  Player
    /// events are delivered on `events`.
    pub async fn connect(
        binary: Option<PathBuf>,
        volume: f32,
        events: mpsc::Sender<PlayerEvent>,
    ) -> anyhow::Result<Self> {
        let mut driver = MpvDriver::new(binary, volume);
        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = driver.spawn_and_connect(mpv_tx).await?;
        handle.observe_all_properties().await;

        let shared: SharedSnapshot = Arc::new(std::sync::Mutex::new(PlayerSnapshot {
            idle_active: true,
            core_idle: true,
            alive: true,
            ..PlayerSnapshot::default()
        }));

        let (queue, queue_rx) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(queue_task(handle.clone(), queue_rx));
        tokio::spawn(translator_task(handle, mpv_rx, shared.clone(), events));

        Ok(Self {
            _driver: driver,
            queue,
            shared,
        })
    }

    fn enqueue(&self, command: Value) -> Result<(), PlayerError> {
        if !self.is_available() {
            return Err(PlayerError::Unavailable);
        }
        self.queue
            .send(command)
            .map_err(|_| PlayerError::Unavailable)
    }
}

impl Player for MpvPlayer {
    fn prepare(&mut self) -> Result<(), PlayerError> {
        let index = {
            let mut snap = lock(&self.shared);
            let index = snap.index.ok_or_else(|| {
                PlayerError::Command("prepare with an empty playlist".to_string())
            })?;
            snap.requested_pos = Some(index);
            index
        };
        // Load paused; play() releases it.
        self.enqueue(json!(["set_property", "pause", true]))?;
        self.enqueue(json!(["playlist-play-index", index]))
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        self.enqueue(json!(["set_property", "pause", false]))
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        self.enqueue(json!(["set_property", "pause", true]))
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        self.enqueue(json!(["stop", "keep-playlist"]))
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<(), PlayerError> {
        let action = plan_seek(&mut lock(&self.shared), position_ms);
        match action {
            SeekAction::Deferred => Ok(()),
            SeekAction::Reload(index) => {
                // Reload paused like prepare(); play() releases it.
                self.enqueue(json!(["set_property", "pause", true]))?;
                self.enqueue(json!(["playlist-play-index", index]))
            }
            SeekAction::Seek => {
                let secs = position_ms as f64 / 1000.0;
                self.enqueue(json!(["seek", secs, "absolute"]))
            }
        }
    }

    fn set_items(
        &mut self,
        items: Vec<PlayableItem>,
        start_index: usize,
        start_position_ms: u64,
    ) -> Result<(), PlayerError> {
        let uris: Vec<String> = items.iter().map(|i| i.source_uri.clone()).collect();
        {
            let mut snap = lock(&self.shared);
            snap.index = if items.is_empty() {
                None
            } else {
                Some(start_index.min(items.len() - 1))
            };
            snap.items = items;
            snap.position_ms = start_position_ms;
            snap.pending_seek_ms = (start_position_ms > 0).then_some(start_position_ms);
            snap.requested_pos = None;
            snap.reached_eof = false;
            snap.failed = false;
        }
        // Plain `stop` also clears the playlist.
        self.enqueue(json!(["stop"]))?;
        for uri in uris {
            self.enqueue(json!(["loadfile", uri, "append"]))?;
        }
        Ok(())
    }

    fn replace_current_item(&mut self, item: PlayableItem) -> Result<(), PlayerError> {
        let title = {
            let mut snap = lock(&self.shared);
            let Some(index) = snap.index else {
                return Err(PlayerError::Command("no current item".to_string()));
            };
            match snap.items.get_mut(index) {
                Some(slot) if slot.id == item.id => *slot = item.clone(),
                _ => return Err(PlayerError::Command(format!("{} is not loaded", item.id))),
            }
            if item.subtitle.is_empty() {
                item.title.clone()
            } else {
                format!("{} - {}", item.subtitle, item.title)
            }
        };
        // Only the displayed title changes; the stream keeps running.
        self.enqueue(json!(["set_property", "force-media-title", title]))
    }

    fn current_item(&self) -> Option<PlayableItem> {
        let snap = lock(&self.shared);
        snap.index.and_then(|i| snap.items.get(i).cloned())
    }

    fn current_index(&self) -> Option<usize> {
        lock(&self.shared).index
    }

    fn state(&self) -> PlaybackState {
        lock(&self.shared).state
    }

    fn position_ms(&self) -> u64 {
        lock(&self.shared).position_ms
    }

    fn is_available(&self) -> bool {
        !self.queue.is_closed() && lock(&self.shared).alive
    }

    fn shutdown(&mut self) {
        let _ = self.enqueue(json!(["quit"]));
    }
}

#[derive(Debug, PartialEq)]
enum SeekAction {
    /// Applied on the next file-loaded.
    Deferred,
    /// The entry finished and mpv went idle; it has to be loaded again.
    Reload(usize),
    Seek,
}

fn plan_seek(snap: &mut PlayerSnapshot, position_ms: u64) -> SeekAction {
    if snap.idle_active && snap.reached_eof {
        if let Some(index) = snap.index {
            snap.pending_seek_ms = (position_ms > 0).then_some(position_ms);
            snap.requested_pos = Some(index);
            return SeekAction::Reload(index);
        }
    }
    if snap.idle_active || snap.loading {
        snap.pending_seek_ms = Some(position_ms);
        return SeekAction::Deferred;
    }
    SeekAction::Seek
}

/// Sends queued commands one at a time so mpv sees them in issue order.
async fn queue_task(handle: MpvHandle, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(command) = rx.recv().await {
        if let Err(e) = handle.send(command.clone()).await {
            warn!("mpv: command {} failed: {}", command, e);
        }
    }
    debug!("mpv: command queue closed");
}

async fn translator_task(
    handle: MpvHandle,
    mut mpv_rx: mpsc::Receiver<MpvEvent>,
    shared: SharedSnapshot,
    events: mpsc::Sender<PlayerEvent>,
) {
    while let Some(evt) = mpv_rx.recv().await {
        let (out, seek) = {
            let mut snap = lock(&shared);
            translate(&mut snap, &evt)
        };
        if let Some(ms) = seek {
            let h = handle.clone();
            tokio::spawn(async move {
                let secs = ms as f64 / 1000.0;
                if let Err(e) = h.send(json!(["seek", secs, "absolute"])).await {
                    warn!("mpv: start-position seek failed: {}", e);
                }
            });
        }
        for event in out {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    warn!("mpv: event stream closed");
    lock(&shared).alive = false;
    let _ = events
        .send(PlayerEvent::Error {
            message: "mpv connection lost".to_string(),
        })
        .await;
}

/// Fold one mpv event into the snapshot.  Returns the player events to emit
/// and a start-position seek to issue, if any.
fn translate(snap: &mut PlayerSnapshot, evt: &MpvEvent) -> (Vec<PlayerEvent>, Option<u64>) {
    let mut out = Vec::new();
    let mut seek = None;

    if let Some((obs_id, data)) = evt.as_property_change() {
        match obs_id {
            OBS_CORE_IDLE => snap.core_idle = data.as_bool().unwrap_or(true),
            OBS_PAUSE => snap.paused = data.as_bool().unwrap_or(false),
            OBS_IDLE_ACTIVE => snap.idle_active = data.as_bool().unwrap_or(false),
            OBS_TIME_POS => {
                snap.position_ms = data
                    .as_f64()
                    .map(|secs| (secs.max(0.0) * 1000.0) as u64)
                    .unwrap_or(snap.position_ms);
            }
            OBS_ICY_TITLE => {
                if let Some(title) = data.as_str() {
                    out.push(PlayerEvent::MetadataReceived {
                        stream_title: title.to_string(),
                    });
                }
            }
            OBS_PLAYLIST_POS => {
                if let Some(pos) = data.as_i64().filter(|p| *p >= 0) {
                    let pos = pos as usize;
                    if snap.index != Some(pos) || snap.requested_pos == Some(pos) {
                        let reason = if snap.requested_pos.take() == Some(pos) {
                            TransitionReason::PlaylistChanged
                        } else {
                            TransitionReason::Auto
                        };
                        snap.index = Some(pos);
                        out.push(PlayerEvent::ItemTransitioned { index: pos, reason });
                    }
                }
            }
            _ => {}
        }
    } else {
        match evt.event_name() {
            Some("start-file") => {
                snap.loading = true;
                snap.reached_eof = false;
                snap.failed = false;
                snap.position_ms = 0;
            }
            Some("file-loaded") => {
                snap.loading = false;
                seek = snap.pending_seek_ms.take();
            }
            Some("end-file") => {
                snap.loading = false;
                let reason = evt
                    .raw
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                info!("mpv: end-file reason={}", reason);
                match reason {
                    "eof" => snap.reached_eof = true,
                    "error" => {
                        snap.failed = true;
                        let message = evt
                            .raw
                            .get("file_error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("playback failed")
                            .to_string();
                        out.push(PlayerEvent::Error { message });
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let state = snap.derive_state();
    if state != snap.state {
        debug!("mpv: state {:?} → {:?}", snap.state, state);
        snap.state = state;
        if state != PlaybackState::Error {
            out.push(PlayerEvent::StateChanged(state));
        }
    }
    let is_playing = state == PlaybackState::ReadyPlaying;
    if is_playing != snap.is_playing {
        snap.is_playing = is_playing;
        out.push(PlayerEvent::IsPlayingChanged(is_playing));
    }

    (out, seek)
}
