//! Durable key-value store for the catalog snapshot and the resumption record.
//!
//! Layout on disk is a single JSON object of key → scalar.  The catalog lives
//! under one key as an opaque JSON blob; the last item is spread over
//! `last_item.*` scalar keys so a damaged field can be detected on its own.
//!
//! Every public method takes `&self` and locks internally, so one `Arc<Store>`
//! can be shared by any number of tasks and threads.  The in-memory document
//! is the source of truth; saves hand a serialized copy to the disk writer
//! (temp file + rename).  Failures are logged and swallowed: a broken store
//! degrades to empty/defaults, it never stops playback.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::item::{parse_source_uri, retain_valid, PlayableItem};

const KEY_CATALOG: &str = "catalog";
const KEY_POSITION: &str = "last_position_ms";
const KEY_LOOP: &str = "loop_enabled";

const KEY_ID: &str = "last_item.id";
const KEY_URI: &str = "last_item.source_uri";
const KEY_TITLE: &str = "last_item.title";
const KEY_SUBTITLE: &str = "last_item.subtitle";
const KEY_ARTWORK: &str = "last_item.artwork_uri";
const KEY_STATION: &str = "last_item.station_name";
const KEY_REGION: &str = "last_item.region";
const KEY_MODULATION: &str = "last_item.modulation";
const KEY_IS_VIDEO: &str = "last_item.is_video";
const KEY_IS_LIVE: &str = "last_item.is_live";

const RESUMPTION_KEYS: &[&str] = &[
    KEY_ID,
    KEY_URI,
    KEY_TITLE,
    KEY_SUBTITLE,
    KEY_ARTWORK,
    KEY_STATION,
    KEY_REGION,
    KEY_MODULATION,
    KEY_IS_VIDEO,
    KEY_IS_LIVE,
    KEY_POSITION,
    KEY_LOOP,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct StoreData {
    values: BTreeMap<String, Value>,
    /// Decoded catalog, filled on first load and on every save.
    catalog: Option<Vec<PlayableItem>>,
}

/// Where saved documents go.
enum Persist {
    Memory,
    /// Written on the calling thread.
    Blocking(PathBuf),
    /// Handed to the writer task; only the newest document is written.
    Background {
        latest: watch::Sender<(u64, String)>,
        written: watch::Receiver<u64>,
    },
}

pub struct Store {
    persist: Persist,
    data: Mutex<StoreData>,
}

impl Store {
    /// Open the store at `path`, writing on the calling thread.  A missing or
    /// unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::with_persist(Self::load_values(&path), Persist::Blocking(path))
    }

    /// Open the store at `path` with a writer task that owns all disk I/O.
    /// Must be called from within a tokio runtime.
    pub fn open_with_writer(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = Self::load_values(&path);
        let (latest, latest_rx) = watch::channel((0, String::new()));
        let (written_tx, written) = watch::channel(0);
        tokio::spawn(writer_task(path, latest_rx, written_tx));
        Self::with_persist(values, Persist::Background { latest, written })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_persist(BTreeMap::new(), Persist::Memory)
    }

    fn with_persist(values: BTreeMap<String, Value>, persist: Persist) -> Self {
        Self {
            persist,
            data: Mutex::new(StoreData {
                values,
                catalog: None,
            }),
        }
    }

    fn load_values(path: &Path) -> BTreeMap<String, Value> {
        match Self::read_file(path) {
            Ok(values) => values,
            Err(e) => {
                warn!("store: could not read {}: {}, starting empty", path.display(), e);
                BTreeMap::new()
            }
        }
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        // A panic while holding the lock cannot leave the map half-written
        // (every mutation is a single insert/remove), so keep going.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush(&self, data: &StoreData) {
        if matches!(self.persist, Persist::Memory) {
            return;
        }
        let json = match serde_json::to_string_pretty(&data.values) {
            Ok(json) => json,
            Err(e) => {
                warn!("store: could not encode document: {}", e);
                return;
            }
        };
        match &self.persist {
            Persist::Memory => {}
            Persist::Blocking(path) => {
                if let Err(e) = write_file(path, &json) {
                    warn!("store: write failed: {}", e);
                }
            }
            Persist::Background { latest, .. } => {
                latest.send_modify(|(seq, doc)| {
                    *seq += 1;
                    *doc = json;
                });
            }
        }
    }

    /// Wait until every save issued so far is on disk.
    pub async fn sync(&self) {
        if let Persist::Background { latest, written } = &self.persist {
            let target = latest.borrow().0;
            let mut written = written.clone();
            if written.wait_for(|seq| *seq >= target).await.is_err() {
                warn!("store: writer stopped before sync");
            }
        }
    }

    // ── catalog ───────────────────────────────────────────────────────────────

    /// Replace the catalog snapshot with the valid subset of `items`.
    pub fn save_catalog(&self, items: Vec<PlayableItem>) {
        let items = retain_valid(items);
        let blob = match serde_json::to_string(&items) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("store: could not encode catalog: {}", e);
                return;
            }
        };
        let mut data = self.lock();
        data.values.insert(KEY_CATALOG.to_string(), Value::String(blob));
        debug!("store: catalog saved ({} items)", items.len());
        data.catalog = Some(items);
        self.flush(&data);
    }

    pub fn load_catalog(&self) -> Vec<PlayableItem> {
        let mut data = self.lock();
        if let Some(items) = data.catalog.as_ref() {
            return items.clone();
        }
        let items = match data.values.get(KEY_CATALOG) {
            Some(Value::String(blob)) => match serde_json::from_str::<Vec<PlayableItem>>(blob) {
                Ok(items) => retain_valid(items),
                Err(e) => {
                    warn!("store: corrupt catalog snapshot ignored: {}", e);
                    Vec::new()
                }
            },
            Some(other) => {
                warn!("store: unexpected catalog value {:?}, ignored", other);
                Vec::new()
            }
            None => Vec::new(),
        };
        data.catalog = Some(items.clone());
        items
    }

    // ── resumption record ─────────────────────────────────────────────────────

    /// Persist `item` as the last played item.  An item without a usable
    /// source URI clears the whole resumption record instead.
    pub fn save_last_item(&self, item: &PlayableItem) {
        let mut data = self.lock();
        if !item.is_valid() {
            warn!(
                "store: refusing to save unresumable item id={:?} uri={:?}, clearing record",
                item.id, item.source_uri
            );
            clear_record(&mut data.values);
            self.flush(&data);
            return;
        }

        let values = &mut data.values;
        put_str(values, KEY_ID, &item.id);
        put_str(values, KEY_URI, &item.source_uri);
        put_str(values, KEY_TITLE, &item.title);
        put_str(values, KEY_SUBTITLE, &item.subtitle);
        match item.artwork_uri.as_deref() {
            Some(uri) => put_str(values, KEY_ARTWORK, uri),
            None => {
                values.remove(KEY_ARTWORK);
            }
        }
        put_str(values, KEY_STATION, &item.station_name);
        put_str(values, KEY_REGION, &item.region);
        put_str(values, KEY_MODULATION, &item.modulation);
        values.insert(KEY_IS_VIDEO.to_string(), Value::Bool(item.is_video));
        values.insert(KEY_IS_LIVE.to_string(), Value::Bool(item.is_live));
        self.flush(&data);
    }

    /// Rebuild the last item from its scalar fields.  A stored URI that no
    /// longer parses clears the record so it is not retried on every start.
    pub fn load_last_item(&self) -> Option<PlayableItem> {
        let mut data = self.lock();
        let uri = get_str(&data.values, KEY_URI).unwrap_or_default();
        if uri.trim().is_empty() {
            return None;
        }
        let id = get_str(&data.values, KEY_ID).unwrap_or_default();
        if parse_source_uri(&uri).is_none() || id.trim().is_empty() {
            warn!("store: corrupt resumption record (id={:?} uri={:?}), clearing", id, uri);
            clear_record(&mut data.values);
            self.flush(&data);
            return None;
        }

        let values = &data.values;
        Some(PlayableItem {
            id,
            source_uri: uri,
            title: get_str(values, KEY_TITLE).unwrap_or_default(),
            subtitle: get_str(values, KEY_SUBTITLE).unwrap_or_default(),
            artwork_uri: get_str(values, KEY_ARTWORK),
            station_name: get_str(values, KEY_STATION).unwrap_or_default(),
            region: get_str(values, KEY_REGION).unwrap_or_default(),
            modulation: get_str(values, KEY_MODULATION).unwrap_or_default(),
            is_video: get_bool(values, KEY_IS_VIDEO),
            is_live: get_bool(values, KEY_IS_LIVE),
        })
    }

    pub fn save_last_position(&self, position_ms: u64) {
        let mut data = self.lock();
        data.values
            .insert(KEY_POSITION.to_string(), Value::from(position_ms));
        self.flush(&data);
    }

    pub fn load_last_position(&self) -> u64 {
        let data = self.lock();
        data.values
            .get(KEY_POSITION)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn save_loop_state(&self, enabled: bool) {
        let mut data = self.lock();
        data.values.insert(KEY_LOOP.to_string(), Value::Bool(enabled));
        self.flush(&data);
    }

    pub fn load_loop_state(&self) -> bool {
        get_bool(&self.lock().values, KEY_LOOP)
    }

    /// Drop every resumption field.  The catalog snapshot is untouched.
    pub fn clear_resumption_record(&self) {
        let mut data = self.lock();
        clear_record(&mut data.values);
        self.flush(&data);
    }
}

/// Writes the newest document after each change; intermediate documents
/// that were replaced before the writer got to them are skipped.
async fn writer_task(
    path: PathBuf,
    mut latest: watch::Receiver<(u64, String)>,
    written: watch::Sender<u64>,
) {
    while latest.changed().await.is_ok() {
        let (seq, json) = latest.borrow_and_update().clone();
        if let Err(e) = write_file_async(&path, &json).await {
            warn!("store: write failed: {}", e);
        }
        written.send_replace(seq);
    }
    debug!("store: writer task exiting");
}

fn write_file(path: &Path, json: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn write_file_async(path: &Path, json: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn clear_record(values: &mut BTreeMap<String, Value>) {
    for key in RESUMPTION_KEYS {
        values.remove(*key);
    }
}

fn put_str(values: &mut BTreeMap<String, Value>, key: &str, value: &str) {
    values.insert(key.to_string(), Value::String(value.to_string()));
}

fn get_str(values: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    values.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(values: &BTreeMap<String, Value>, key: &str) -> bool {
    values.get(key).and_then(Value::as_bool).unwrap_or(false)
}
