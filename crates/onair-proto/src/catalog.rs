//! Catalog parsing: m3u playlists and TOML station files into playable items.
//!
//! Entries without an explicit id use their source URI, which is stable across
//! refreshes.  Nothing here validates; callers run the result through the
//! store, which keeps only valid items.

use crate::item::PlayableItem;

pub fn parse_m3u_from_str(content: &str) -> Vec<PlayableItem> {
    let mut items = Vec::new();
    let mut pending: Option<(i64, String)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                // Duration comes first; attributes may follow after a space.
                let duration = rest[..comma_idx]
                    .split_whitespace()
                    .next()
                    .and_then(|d| d.parse::<f64>().ok())
                    .map(|d| d as i64)
                    .unwrap_or(-1);
                pending = Some((duration, rest[comma_idx + 1..].trim().to_string()));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let (duration, name) = pending.take().unwrap_or_else(|| (-1, url.clone()));

        items.push(PlayableItem {
            title: name.clone(),
            station_name: name,
            // A positive EXTINF duration marks a finite track.
            is_live: duration <= 0,
            ..PlayableItem::new(url.clone(), url)
        });
    }

    items
}

/// Matches the TOML `[[station]]` table; kept apart from `PlayableItem` so the
/// file schema can evolve without touching the wire type.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    #[serde(default)]
    id: String,
    name: String,
    url: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    modulation: String,
    #[serde(default)]
    artwork: Option<String>,
    #[serde(default = "default_live")]
    live: bool,
    #[serde(default)]
    video: bool,
}

fn default_live() -> bool {
    true
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<PlayableItem>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let items = file
        .station
        .into_iter()
        .map(|s| PlayableItem {
            id: if s.id.trim().is_empty() { s.url.clone() } else { s.id },
            source_uri: s.url,
            title: s.name.clone(),
            subtitle: s.city,
            artwork_uri: s.artwork,
            station_name: s.name,
            region: s.region,
            modulation: s.modulation,
            is_video: s.video,
            is_live: s.live,
        })
        .collect();
    Ok(items)
}

pub fn load_stations_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<PlayableItem>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn load_stations_from_m3u(path: &std::path::Path) -> anyhow::Result<Vec<PlayableItem>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_m3u_from_str(&content))
}
