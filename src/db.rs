use std::{fs, path::Path};

use rusqlite::{params, Connection};

use crate::{
    error::{LedgerError, Result},
    revenue::DEFAULT_SPLIT_PERCENTAGE,
};

/// Current schema version, kept in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_FALLBACK_ACTOR: &str = "system";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS machines (
      id TEXT PRIMARY KEY,
      serial_number TEXT,
      model TEXT,
      status TEXT NOT NULL,
      client_id TEXT,
      initial_counter INTEGER NOT NULL CHECK (initial_counter >= 0),
      current_counter INTEGER NOT NULL CHECK (current_counter >= 0),
      split_percentage REAL NOT NULL,
      created_ts_utc INTEGER NOT NULL,
      updated_ts_utc INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS counter_observations (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      machine_id TEXT NOT NULL,
      ts_utc INTEGER NOT NULL,
      previous_counter INTEGER NOT NULL,
      new_counter INTEGER NOT NULL,
      difference INTEGER NOT NULL CHECK (difference >= 0),
      source TEXT NOT NULL,
      note TEXT,
      actor TEXT NOT NULL,
      FOREIGN KEY(machine_id) REFERENCES machines(id)
    );
    CREATE INDEX IF NOT EXISTS idx_counter_observations_machine
      ON counter_observations (machine_id, ts_utc);
    CREATE TABLE IF NOT EXISTS machine_events (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      machine_id TEXT NOT NULL,
      ts_utc INTEGER NOT NULL,
      event TEXT NOT NULL,
      FOREIGN KEY(machine_id) REFERENCES machines(id)
    );
    CREATE TABLE IF NOT EXISTS collections (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      machine_id TEXT NOT NULL,
      client_id TEXT,
      ts_utc INTEGER NOT NULL,
      previous_counter INTEGER NOT NULL,
      current_counter INTEGER NOT NULL,
      difference INTEGER NOT NULL,
      distribution_percentage REAL NOT NULL,
      amount REAL NOT NULL,
      staff_member TEXT NOT NULL,
      payment_method TEXT,
      signature_data TEXT,
      ticket_number TEXT,
      invoice_number TEXT,
      note TEXT,
      FOREIGN KEY(machine_id) REFERENCES machines(id)
    );
    CREATE INDEX IF NOT EXISTS idx_collections_machine
      ON collections (machine_id, ts_utc);
    CREATE TABLE IF NOT EXISTS config (
      id INTEGER PRIMARY KEY CHECK (id = 1),
      default_split_percentage REAL NOT NULL,
      fallback_actor TEXT NOT NULL,
      created_ts_utc INTEGER NOT NULL,
      updated_ts_utc INTEGER NOT NULL
    );";

/// Storage client owned by a [`crate::Ledger`].
///
/// Opened explicitly, closed explicitly; there is no shared handle.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    /// Open or create a ledger database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened ledger database");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Flush and release the underlying connection.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| LedgerError::Storage(err))?;
        tracing::debug!("closed ledger database");
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(LedgerError::Migration(format!(
            "database version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if version == 0 {
        tracing::info!("initializing ledger schema v{SCHEMA_VERSION}");
    }
    conn.execute_batch(SCHEMA)?;
    ensure_config_row(conn)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn ensure_config_row(conn: &Connection) -> Result<()> {
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM config", [], |row| row.get(0))?;
    if existing == 0 {
        conn.execute(
            "INSERT INTO config (id, default_split_percentage, fallback_actor, created_ts_utc, updated_ts_utc)
             VALUES (1, ?1, ?2, ?3, ?3)",
            params![
                DEFAULT_SPLIT_PERCENTAGE,
                DEFAULT_FALLBACK_ACTOR,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
    }
    Ok(())
}
