//! Playable items and their validity rules.
//!
//! An item is valid when its `id` is non-empty and its `source_uri` parses as
//! an absolute URI with one of the accepted schemes.  Invalid items are
//! filtered out before they reach the playlist or the store; nothing here
//! returns an error for them.

use serde::{Deserialize, Serialize};
use url::Url;

/// Schemes a source URI may use.
pub const ACCEPTED_SCHEMES: &[&str] = &["http", "https", "rtsp", "rtmp", "file", "content"];

/// One playable unit: a live stream or an on-demand track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlayableItem {
    pub id: String,
    pub source_uri: String,
    #[serde(default)]
    pub title: String,
    /// Artist for tracks, city for stations.
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub artwork_uri: Option<String>,
    #[serde(default)]
    pub station_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub modulation: String,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_live: bool,
}

impl PlayableItem {
    pub fn new(id: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_uri: source_uri.into(),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty() && parse_source_uri(&self.source_uri).is_some()
    }

    /// Copy carrying new descriptive metadata.  Identity, source and the
    /// extension fields are preserved.
    pub fn with_metadata(&self, artist: &str, title: &str) -> Self {
        Self {
            title: title.to_string(),
            subtitle: artist.to_string(),
            ..self.clone()
        }
    }

    /// Station name when present, otherwise `app_name`.
    pub fn display_station<'a>(&'a self, app_name: &'a str) -> &'a str {
        if self.station_name.trim().is_empty() {
            app_name
        } else {
            &self.station_name
        }
    }
}

/// Parse `raw` and check the scheme against [`ACCEPTED_SCHEMES`].
pub fn parse_source_uri(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = Url::parse(raw).ok()?;
    if ACCEPTED_SCHEMES.contains(&url.scheme()) {
        Some(url)
    } else {
        None
    }
}

/// Keep only valid items, preserving order.
pub fn retain_valid(items: Vec<PlayableItem>) -> Vec<PlayableItem> {
    let before = items.len();
    let valid: Vec<PlayableItem> = items.into_iter().filter(PlayableItem::is_valid).collect();
    if valid.len() != before {
        tracing::debug!("dropped {} invalid item(s)", before - valid.len());
    }
    valid
}
