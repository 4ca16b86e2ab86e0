//! Configuration for the refresh coordinator and its pollers

use crate::error::{RefreshError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Quiet period after the newest edit before a debounced regeneration fires.
pub const DEFAULT_DEBOUNCE_SECS: u64 = 30;

/// How often a poller re-reads a resource's summary version.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Buffer size of the status event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Coordinator configuration, usually loaded from a TOML file.
///
/// ```toml
/// debounce_secs = 30
/// poll_interval_secs = 10
/// summarizer_command = ["./summarize.sh"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    /// Debounce window in seconds
    pub debounce_secs: u64,
    /// Poll interval in seconds
    pub poll_interval_secs: u64,
    /// Capacity of the broadcast channel carrying status events
    pub event_capacity: usize,
    /// Program and leading arguments used by the command summarizer
    pub summarizer_command: Option<Vec<String>>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            debounce_secs: DEFAULT_DEBOUNCE_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            summarizer_command: None,
        }
    }
}

impl RefreshConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| RefreshError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded refresh config from {}", path.display());
        Self::from_toml_str(&source)
    }

    /// Reject settings that would make timers fire continuously.
    pub fn validate(&self) -> Result<()> {
        if self.debounce_secs == 0 {
            return Err(RefreshError::invalid_config("debounce_secs must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(RefreshError::invalid_config(
                "poll_interval_secs must be positive",
            ));
        }
        if self.event_capacity == 0 {
            return Err(RefreshError::invalid_config("event_capacity must be positive"));
        }
        if let Some(command) = &self.summarizer_command {
            if command.is_empty() {
                return Err(RefreshError::invalid_config(
                    "summarizer_command must name a program",
                ));
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Override the debounce window.
    pub fn with_debounce_secs(mut self, secs: u64) -> Self {
        self.debounce_secs = secs;
        self
    }

    /// Override the poll interval.
    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RefreshConfig::default();
        assert_eq!(config.debounce(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert!(config.summarizer_command.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RefreshConfig::from_toml_str("debounce_secs = 5").unwrap();
        assert_eq!(config.debounce_secs, 5);
        assert_eq!(config.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_rejects_zero_intervals() {
        assert!(RefreshConfig::from_toml_str("debounce_secs = 0").is_err());
        assert!(RefreshConfig::from_toml_str("poll_interval_secs = 0").is_err());
        assert!(RefreshConfig::from_toml_str("summarizer_command = []").is_err());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = RefreshConfig::from_toml_str("debounce = 3").unwrap_err();
        assert!(matches!(err, RefreshError::Config { .. }));
    }

    #[test]
    fn test_load_from_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("refresh.toml");
        std::fs::write(
            &path,
            "poll_interval_secs = 2\nsummarizer_command = [\"echo\", \"summary\"]\n",
        )?;

        let config = RefreshConfig::load(&path)?;
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(
            config.summarizer_command,
            Some(vec!["echo".to_string(), "summary".to_string()])
        );
        Ok(())
    }
}
