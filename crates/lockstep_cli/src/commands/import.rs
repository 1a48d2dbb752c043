//! `import` command: build a database from a cleartext XML export.

use super::build_app;
use lockstep_vault::VaultKey;
use std::error::Error;
use std::path::Path;

/// Imports an XML export into a new database.
pub fn run(dir: &Path, name: &str, xml: &Path, password: &str) -> Result<(), Box<dyn Error>> {
    let mut app = build_app(dir)?;

    let contents = std::fs::read_to_string(xml)?;
    let id = app.import_file_with_xml(name, VaultKey::from_password(password), &contents)?;
    app.sync_file(id, None)?;

    let vault = app.file(&id).ok_or("file vanished after import")?;
    println!("{name}: imported {} entries", vault.entry_count());
    app.close_all_files();
    Ok(())
}
