//! `list` command: show recently opened files.

use super::{build_app, format_date};
use std::error::Error;
use std::path::Path;

/// Prints the registry in most-recently-used order.
pub fn run(dir: &Path) -> Result<(), Box<dyn Error>> {
    let app = build_app(dir)?;

    if app.registry().is_empty() {
        println!("No files opened yet.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<30} {:<9} {}",
        "NAME", "STORAGE", "PATH", "MODIFIED", "LAST SYNC"
    );
    for info in app.registry().iter() {
        println!(
            "{:<20} {:<10} {:<30} {:<9} {}",
            info.name,
            info.storage.as_deref().unwrap_or("-"),
            info.path.as_deref().unwrap_or("-"),
            if info.modified { "yes" } else { "no" },
            format_date(info.sync_date),
        );
    }

    Ok(())
}
