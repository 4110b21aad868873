use onair_proto::catalog::{load_stations_from_m3u, load_stations_from_toml, parse_m3u_from_str};
use onair_proto::config::CatalogConfig;
use onair_proto::item::PlayableItem;
use std::path::Path;
use tracing::{info, warn};

/// Load the catalog from the configured sources, richest first: the TOML
/// station file, then the m3u URL or path.
pub async fn load_catalog(config: &CatalogConfig) -> anyhow::Result<Vec<PlayableItem>> {
    let toml_path = &config.stations_toml;
    if toml_path.exists() {
        match load_stations_from_toml(toml_path) {
            Ok(items) => {
                info!("Loaded {} stations from TOML: {}", items.len(), toml_path.display());
                return Ok(items);
            }
            Err(e) => {
                warn!("Failed to parse TOML stations ({}): {}", toml_path.display(), e);
            }
        }
    } else {
        info!("TOML stations file not found ({}), trying m3u", toml_path.display());
    }

    let source = config.m3u_url.trim();
    if source.is_empty() {
        anyhow::bail!("no catalog source configured");
    }

    info!("Loading stations from m3u: {}", source);
    let items = if source.starts_with("http://") || source.starts_with("https://") {
        fetch_m3u_url(source).await?
    } else {
        load_stations_from_m3u(Path::new(source))?
    };
    info!("Loaded {} stations from m3u", items.len());
    Ok(items)
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<PlayableItem>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    Ok(parse_m3u_from_str(&text))
}
