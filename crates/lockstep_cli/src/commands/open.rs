//! `open` command: open a database and list its entries.

use super::build_app;
use lockstep_engine::{KeyFileSource, OpenRequest};
use std::error::Error;
use std::path::Path;

/// Opens a local database file and prints its entries.
pub fn run(
    dir: &Path,
    name: &str,
    path: Option<&str>,
    password: &str,
    key_file: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let mut app = build_app(dir)?;

    let mut request = OpenRequest::new(name, password);
    if let Some(path) = path {
        request = request.with_storage("file").with_path(path);
    }
    if let Some(key_file) = key_file {
        let data = std::fs::read(key_file)?;
        request = request.with_key_file(KeyFileSource::Bytes {
            name: key_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            data,
        });
    }

    let id = app.open_file(request)?;
    let vault = app.file(&id).ok_or("file vanished after open")?;

    println!("{name}: {} entries", vault.entry_count());
    for entry in vault.entries().filter(|e| !e.trashed) {
        let group = if entry.group.is_empty() {
            "-"
        } else {
            &entry.group
        };
        println!("  [{group}] {}", entry.title);
    }

    // Flush any reconciliation the open queued.
    for (_, result) in app.process_pending() {
        if let Err(e) = result {
            tracing::warn!(error = %e, "deferred sync failed");
        }
    }
    app.close_all_files();
    Ok(())
}
