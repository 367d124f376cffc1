use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Open or create the database at `path`.
///
/// The queue store and the cache storage each hold their own connection to
/// the same file, so WAL mode and a busy timeout are set up front.
pub fn open(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
    .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;

  Ok(conn)
}

/// Private in-memory database.
pub fn open_in_memory() -> Result<Connection> {
  Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))
}

/// Run schema migrations
pub fn migrate(conn: &Connection, schema: &str) -> Result<()> {
  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))
}
