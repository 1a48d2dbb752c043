//! `new` command: create a fresh database.

use super::build_app;
use lockstep_vault::VaultKey;
use std::error::Error;
use std::path::Path;

/// Creates an empty database and persists it to the cache.
pub fn run(dir: &Path, name: &str, password: &str) -> Result<(), Box<dyn Error>> {
    let mut app = build_app(dir)?;

    let id = app.create_new_file(name, VaultKey::from_password(password))?;
    app.sync_file(id, None)?;

    println!("{name}: created ({id})");
    app.close_all_files();
    Ok(())
}
