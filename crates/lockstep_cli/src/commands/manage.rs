//! Registry maintenance commands.

use super::build_app;
use std::error::Error;
use std::path::Path;

/// Drops a registry record and its cached bytes.
pub fn remove_info(dir: &Path, name: &str) -> Result<(), Box<dyn Error>> {
    let mut app = build_app(dir)?;

    let id = app
        .registry()
        .get_by_name(name)
        .map(|info| info.id)
        .ok_or_else(|| format!("no known file named {name}"))?;

    app.remove_file_info(&id)?;
    println!("{name}: forgotten");
    Ok(())
}

/// Strips key-file hints from every registry record.
pub fn clear_key_files(dir: &Path) -> Result<(), Box<dyn Error>> {
    let mut app = build_app(dir)?;
    app.clear_stored_key_files();
    println!("Stored key-file hints cleared.");
    Ok(())
}
