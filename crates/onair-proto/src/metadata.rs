/// Separator between artist and title in ICY `StreamTitle` values.
pub const STREAM_TITLE_SEPARATOR: &str = " - ";

/// Artist/title pair derived from in-stream metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub artist: String,
    pub title: String,
}

/// Turn a raw stream title into an artist/title pair.
///
/// `"Artist - Title"` splits on the first separator.  A title without a
/// separator keeps `fallback_artist`.  An empty title yields
/// `(fallback_artist, fallback_title)`, where the caller passes the station
/// name (or the app name when the station has none).
pub fn reconcile(stream_title: &str, fallback_artist: &str, fallback_title: &str) -> Reconciled {
    let trimmed = stream_title.trim();
    if trimmed.is_empty() {
        return Reconciled {
            artist: fallback_artist.to_string(),
            title: fallback_title.to_string(),
        };
    }

    match trimmed.split_once(STREAM_TITLE_SEPARATOR) {
        Some((artist, title)) => Reconciled {
            artist: artist.trim().to_string(),
            title: title.trim().to_string(),
        },
        None => Reconciled {
            artist: fallback_artist.to_string(),
            title: trimmed.to_string(),
        },
    }
}

impl Reconciled {
    /// True when applying this would not change what observers already see.
    pub fn matches(&self, artist: &str, title: &str) -> bool {
        self.artist == artist && self.title == title
    }
}
