//! `sync` command: reconcile a database with its backend.

use super::build_app;
use lockstep_engine::OpenRequest;
use std::error::Error;
use std::path::Path;

/// Opens a previously known database and runs one sync cycle.
pub fn run(dir: &Path, name: &str, password: &str) -> Result<(), Box<dyn Error>> {
    let mut app = build_app(dir)?;

    let info = app
        .registry()
        .get_by_name(name)
        .ok_or_else(|| format!("no known file named {name}"))?;
    let request = OpenRequest::new(name, password).with_id(info.id);

    let id = app.open_file(request)?;
    app.process_pending();
    app.sync_file(id, None)?;

    let vault = app.file(&id).ok_or("file vanished after sync")?;
    println!(
        "{name}: synced, {} entries, modified={}",
        vault.entry_count(),
        vault.modified()
    );
    app.close_all_files();
    Ok(())
}
