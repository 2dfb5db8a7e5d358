//! Multiplexer configuration

use std::time::Duration;

/// Configuration for the subscription multiplexer
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Coalescing window for upstream updates (zero forwards immediately)
    pub debounce_window: Duration,

    /// Capacity of each stream's broadcast channel
    pub broadcast_capacity: usize,

    /// Capacity of the update channel of derived feeds
    pub feed_capacity: usize,

    /// Suppress updates equal to the current latest value
    pub dedupe: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(20),
            broadcast_capacity: 64,
            feed_capacity: 64,
            dedupe: true,
        }
    }
}

impl MuxConfig {
    /// Set the coalescing window
    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the broadcast channel capacity
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    /// Set the derived feed channel capacity
    pub fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    /// Forward every update, even when equal to the previous one
    pub fn disable_dedupe(mut self) -> Self {
        self.dedupe = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MuxConfig::default();

        assert_eq!(config.debounce_window, Duration::from_millis(20));
        assert_eq!(config.broadcast_capacity, 64);
        assert_eq!(config.feed_capacity, 64);
        assert!(config.dedupe);
    }

    #[test]
    fn test_capacity_never_zero() {
        let config = MuxConfig::default().broadcast_capacity(0).feed_capacity(0);

        assert_eq!(config.broadcast_capacity, 1);
        assert_eq!(config.feed_capacity, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let config = MuxConfig::default()
            .debounce_window(Duration::ZERO)
            .broadcast_capacity(8)
            .disable_dedupe();

        assert!(config.debounce_window.is_zero());
        assert_eq!(config.broadcast_capacity, 8);
        assert!(!config.dedupe);
    }
}
