//! Counter reconciliation and revenue ledger for coin-operated machines.
//!
//! Every machine carries a mechanical counter. The [`Ledger`] records each
//! reading as an immutable [`CounterObservation`], keeps the machine's
//! current counter in step with the latest one, and turns counter deltas
//! into money with [`revenue::compute_revenue`].

mod config;
mod db;
mod error;
mod flows;
mod ledger;
pub mod revenue;

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

pub use config::LedgerConfig;
pub use db::{Database, DEFAULT_FALLBACK_ACTOR, SCHEMA_VERSION};
pub use error::{LedgerError, Result};
pub use flows::{CollectionRequest, InstallRequest, RepairRequest, TransferRequest};
pub use ledger::{Ledger, Observation};

/// Placement of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Storage,
    Installed,
    Repair,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Storage => "storage",
            MachineStatus::Installed => "installed",
            MachineStatus::Repair => "repair",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "storage" => Ok(MachineStatus::Storage),
            "installed" => Ok(MachineStatus::Installed),
            "repair" => Ok(MachineStatus::Repair),
            other => Err(format!("unknown machine status '{other}'")),
        }
    }
}

/// Why a counter reading was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterSource {
    Installation,
    Collection,
    Maintenance,
    Transfer,
    Manual,
}

impl CounterSource {
    pub const ALL: [CounterSource; 5] = [
        CounterSource::Installation,
        CounterSource::Collection,
        CounterSource::Maintenance,
        CounterSource::Transfer,
        CounterSource::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterSource::Installation => "installation",
            CounterSource::Collection => "collection",
            CounterSource::Maintenance => "maintenance",
            CounterSource::Transfer => "transfer",
            CounterSource::Manual => "manual",
        }
    }
}

impl fmt::Display for CounterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        CounterSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| LedgerError::InvalidSource(s.to_string()))
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|err| FromSqlError::Other(format!("{err}").into()))
            }
        }
    };
}

text_column!(MachineStatus);
text_column!(CounterSource);

/// A registered machine as stored.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Machine {
    pub id: String,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub status: MachineStatus,
    pub client_id: Option<String>,
    pub initial_counter: u64,
    pub current_counter: u64,
    pub split_percentage: f64,
    pub created_ts_utc: i64,
    pub updated_ts_utc: i64,
}

/// Registration payload for [`Ledger::register_machine`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewMachine {
    pub id: String,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub initial_counter: u64,
    /// Falls back to the configured default split.
    pub split_percentage: Option<f64>,
}

/// An immutable counter reading for one machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CounterObservation {
    pub id: i64,
    pub machine_id: String,
    pub ts_utc: i64,
    pub previous_counter: u64,
    pub new_counter: u64,
    /// `max(0, new_counter - previous_counter)`.
    pub difference: u64,
    pub source: CounterSource,
    pub note: Option<String>,
    pub actor: String,
}

/// Entry in a machine's audit history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MachineEvent {
    Registered {
        initial_counter: u64,
    },
    CounterUpdated {
        source: CounterSource,
        previous_counter: u64,
        new_counter: u64,
        note: Option<String>,
    },
    Installed {
        client_id: String,
        technician: String,
        counter: u64,
    },
    Transferred {
        from_client_id: String,
        to_client_id: String,
        technician: String,
        counter: u64,
    },
    SentToRepair {
        counter: u64,
        note: Option<String>,
    },
    Collected {
        collection_id: i64,
        amount: f64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MachineEventRecord {
    pub id: i64,
    pub machine_id: String,
    pub ts_utc: i64,
    pub event: MachineEvent,
}

/// A completed cash pickup at one machine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CollectionRecord {
    pub id: i64,
    pub machine_id: String,
    pub client_id: Option<String>,
    pub ts_utc: i64,
    pub previous_counter: u64,
    pub current_counter: u64,
    pub difference: u64,
    pub distribution_percentage: f64,
    pub amount: f64,
    pub staff_member: String,
    pub payment_method: Option<String>,
    pub signature_data: Option<String>,
    pub ticket_number: Option<String>,
    pub invoice_number: Option<String>,
    pub note: Option<String>,
}

fn resolve_ts_utc(timestamp: Option<DateTime<Utc>>) -> i64 {
    timestamp.unwrap_or_else(Utc::now).timestamp_millis()
}
