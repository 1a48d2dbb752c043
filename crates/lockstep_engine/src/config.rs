//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the application controller.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where the file-info registry persists. `None` keeps it in memory
    /// only, which is what tests use.
    pub registry_path: Option<PathBuf>,
    /// Debounce window for file-change notifications.
    pub file_change_sync: Duration,
    /// Bound on load+merge cycles within one sync.
    pub max_load_attempts: u32,
    /// Whether key-file hints are stored in the registry.
    pub remember_key_files: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            file_change_sync: Duration::from_secs(1),
            max_load_attempts: 3,
            remember_key_files: false,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the registry persistence path.
    #[must_use]
    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    /// Sets the file-change debounce window.
    #[must_use]
    pub fn with_file_change_sync(mut self, window: Duration) -> Self {
        self.file_change_sync = window;
        self
    }

    /// Sets the bound on load+merge cycles.
    #[must_use]
    pub fn with_max_load_attempts(mut self, attempts: u32) -> Self {
        self.max_load_attempts = attempts;
        self
    }

    /// Enables or disables stored key-file hints.
    #[must_use]
    pub fn with_remember_key_files(mut self, remember: bool) -> Self {
        self.remember_key_files = remember;
        self
    }
}
