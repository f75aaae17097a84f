use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{
    error::{LedgerError, Result},
    ledger::Ledger,
};

/// Ledger-wide defaults, persisted as a single row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Split given to machines registered without one.
    pub default_split_percentage: f64,
    /// Actor recorded on observations when the caller names none.
    pub fallback_actor: String,
}

impl LedgerConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.default_split_percentage) {
            return Err(LedgerError::InvalidConfig(
                "default_split_percentage must be between 0 and 100".to_string(),
            ));
        }
        if self.fallback_actor.trim().is_empty() {
            return Err(LedgerError::InvalidConfig(
                "fallback_actor must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn fetch_config(conn: &Connection) -> Result<LedgerConfig> {
    let config = conn.query_row(
        "SELECT default_split_percentage, fallback_actor FROM config WHERE id = 1",
        [],
        |row| {
            Ok(LedgerConfig {
                default_split_percentage: row.get(0)?,
                fallback_actor: row.get(1)?,
            })
        },
    )?;
    Ok(config)
}

impl Ledger {
    pub fn config(&self) -> Result<LedgerConfig> {
        fetch_config(&self.db.conn)
    }

    /// Replace the ledger defaults. Existing machines keep their split.
    pub fn update_config(&mut self, config: LedgerConfig) -> Result<LedgerConfig> {
        config.validate()?;
        self.db.conn.execute(
            "UPDATE config SET default_split_percentage = ?1, fallback_actor = ?2, updated_ts_utc = ?3 WHERE id = 1",
            params![
                config.default_split_percentage,
                config.fallback_actor,
                Utc::now().timestamp_millis()
            ],
        )?;
        tracing::info!(
            default_split_percentage = config.default_split_percentage,
            fallback_actor = %config.fallback_actor,
            "ledger config updated"
        );
        fetch_config(&self.db.conn)
    }
}
