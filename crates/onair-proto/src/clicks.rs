use std::time::{Duration, Instant};

pub const DEFAULT_CLICK_WINDOW_MS: u64 = 300;

/// Counts consecutive button presses that land inside a time window.
///
/// Media keys report one event per press, so double and triple presses are
/// inferred from timing alone.  The aggregator does not know what the counts
/// mean.
#[derive(Debug, Clone)]
pub struct ClickAggregator {
    window: Duration,
    last_click: Option<Instant>,
    count: u32,
}

impl ClickAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_click: None,
            count: 0,
        }
    }

    pub fn register_click(&mut self) -> u32 {
        self.register_click_at(Instant::now())
    }

    pub fn register_click_at(&mut self, now: Instant) -> u32 {
        let within_window = self
            .last_click
            .map(|last| now.saturating_duration_since(last) <= self.window)
            .unwrap_or(false);
        self.count = if within_window { self.count + 1 } else { 1 };
        self.last_click = Some(now);
        self.count
    }
}

impl Default for ClickAggregator {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CLICK_WINDOW_MS))
    }
}
