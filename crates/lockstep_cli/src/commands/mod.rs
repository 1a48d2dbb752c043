//! Command implementations.

pub mod import;
pub mod list;
pub mod manage;
pub mod new;
pub mod open;
pub mod sync;

use lockstep_engine::{App, EngineConfig};
use lockstep_storage::DirCache;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

/// Builds the controller against the given application data directory.
pub fn build_app(dir: &Path) -> Result<App, Box<dyn Error>> {
    let cache = DirCache::open(dir.join("cache"))?;
    let config = EngineConfig::default()
        .with_registry_path(dir.join("files.lsfi"))
        .with_remember_key_files(true);
    Ok(App::new(config, Arc::new(cache))?)
}

/// Formats an epoch-milliseconds timestamp for display.
pub fn format_date(millis: Option<u64>) -> String {
    match millis {
        Some(millis) => {
            let secs = millis / 1000;
            format!("{secs}s since epoch")
        }
        None => "never".to_string(),
    }
}
