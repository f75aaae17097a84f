use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use crate::{
    config::fetch_config,
    db::Database,
    error::{LedgerError, Result},
    resolve_ts_utc,
    revenue::counter_difference,
    CounterObservation, CounterSource, Machine, MachineEvent, MachineEventRecord, MachineStatus,
    NewMachine,
};

/// Result of [`Ledger::record_observation`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub observation: CounterObservation,
    pub current_counter: u64,
}

/// Source of truth for machine counters and their history.
///
/// Mutations take `&mut self` and run in a single immediate transaction, so
/// the previous-counter read and the counter/history writes land together or
/// not at all.
pub struct Ledger {
    pub(crate) db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn close(self) -> Result<()> {
        self.db.close()
    }

    pub fn register_machine(&mut self, new: NewMachine) -> Result<Machine> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row("SELECT id FROM machines WHERE id = ?1", [&new.id], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(LedgerError::MachineExists(new.id));
        }

        let split_percentage = match new.split_percentage {
            Some(split) => split,
            None => fetch_config(&tx)?.default_split_percentage,
        };
        let now = Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO machines (id, serial_number, model, status, client_id, initial_counter, current_counter, split_percentage, created_ts_utc, updated_ts_utc)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5, ?6, ?7, ?7)",
            params![
                new.id,
                new.serial_number,
                new.model,
                MachineStatus::Storage,
                counter_to_sql(new.initial_counter)?,
                split_percentage,
                now
            ],
        )?;
        insert_event(
            &tx,
            &new.id,
            now,
            &MachineEvent::Registered {
                initial_counter: new.initial_counter,
            },
        )?;
        let machine = fetch_machine(&tx, &new.id)?;
        tx.commit()?;

        tracing::info!(
            machine_id = %machine.id,
            initial_counter = machine.initial_counter,
            "machine registered"
        );
        Ok(machine)
    }

    pub fn machine(&self, machine_id: &str) -> Result<Machine> {
        fetch_machine(&self.db.conn, machine_id)
    }

    /// Record a counter reading for `machine_id`.
    ///
    /// A reading below the current counter still becomes the current counter,
    /// with a difference of 0.
    pub fn record_observation(
        &mut self,
        machine_id: &str,
        new_counter: u64,
        source: CounterSource,
        note: Option<&str>,
        actor: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Observation> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let machine = fetch_machine(&tx, machine_id)?;
        let observation = record_in_tx(
            &tx,
            &machine,
            new_counter,
            source,
            note,
            actor,
            resolve_ts_utc(timestamp),
        )?;
        tx.commit()?;

        Ok(Observation {
            current_counter: observation.new_counter,
            observation,
        })
    }

    pub fn latest_counter(&self, machine_id: &str) -> Result<u64> {
        self.db
            .conn
            .query_row(
                "SELECT current_counter FROM machines WHERE id = ?1",
                [machine_id],
                |row| counter_column(row, 0),
            )
            .optional()?
            .ok_or_else(|| LedgerError::MachineNotFound(machine_id.to_string()))
    }

    /// Counter observations for a machine, newest first.
    pub fn history_for(&self, machine_id: &str) -> Result<Vec<CounterObservation>> {
        ensure_machine_exists(&self.db.conn, machine_id)?;
        let mut stmt = self.db.conn.prepare(
            "SELECT id, machine_id, ts_utc, previous_counter, new_counter, difference, source, note, actor
             FROM counter_observations WHERE machine_id = ?1
             ORDER BY ts_utc DESC, id DESC",
        )?;
        let rows = stmt.query_map([machine_id], observation_from_row)?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    /// Current counter of every registered machine.
    pub fn all_counters(&self) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self
            .db
            .conn
            .prepare("SELECT id, current_counter FROM machines")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, counter_column(row, 1)?)))?;

        let mut counters = BTreeMap::new();
        for row in rows {
            let (id, counter) = row?;
            counters.insert(id, counter);
        }
        Ok(counters)
    }

    /// Audit history of a machine, newest first.
    pub fn events_for(&self, machine_id: &str) -> Result<Vec<MachineEventRecord>> {
        ensure_machine_exists(&self.db.conn, machine_id)?;
        let mut stmt = self.db.conn.prepare(
            "SELECT id, machine_id, ts_utc, event FROM machine_events
             WHERE machine_id = ?1 ORDER BY ts_utc DESC, id DESC",
        )?;
        let rows = stmt.query_map([machine_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, machine_id, ts_utc, event) = row?;
            events.push(MachineEventRecord {
                id,
                machine_id,
                ts_utc,
                event: serde_json::from_str(&event)?,
            });
        }
        Ok(events)
    }
}

/// Apply one reading inside an open transaction.
pub(crate) fn record_in_tx(
    conn: &Connection,
    machine: &Machine,
    new_counter: u64,
    source: CounterSource,
    note: Option<&str>,
    actor: Option<&str>,
    ts_utc: i64,
) -> Result<CounterObservation> {
    let new_counter_sql = counter_to_sql(new_counter)?;
    let previous_counter = machine.current_counter;
    let difference = counter_difference(previous_counter, new_counter);
    let actor = match actor {
        Some(actor) => actor.to_string(),
        None => fetch_config(conn)?.fallback_actor,
    };

    conn.execute(
        "UPDATE machines SET current_counter = ?1, updated_ts_utc = ?2 WHERE id = ?3",
        params![new_counter_sql, Utc::now().timestamp_millis(), machine.id],
    )?;
    conn.execute(
        "INSERT INTO counter_observations (machine_id, ts_utc, previous_counter, new_counter, difference, source, note, actor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            machine.id,
            ts_utc,
            counter_to_sql(previous_counter)?,
            new_counter_sql,
            counter_to_sql(difference)?,
            source,
            note,
            actor
        ],
    )?;
    let id = conn.last_insert_rowid();
    insert_event(
        conn,
        &machine.id,
        ts_utc,
        &MachineEvent::CounterUpdated {
            source,
            previous_counter,
            new_counter,
            note: note.map(str::to_string),
        },
    )?;

    if new_counter < previous_counter {
        tracing::warn!(
            machine_id = %machine.id,
            previous_counter,
            new_counter,
            %source,
            "counter reading went backwards; recording zero difference"
        );
    }
    tracing::info!(
        machine_id = %machine.id,
        previous_counter,
        new_counter,
        difference,
        %source,
        "counter updated"
    );

    Ok(CounterObservation {
        id,
        machine_id: machine.id.clone(),
        ts_utc,
        previous_counter,
        new_counter,
        difference,
        source,
        note: note.map(str::to_string),
        actor,
    })
}

pub(crate) fn insert_event(
    conn: &Connection,
    machine_id: &str,
    ts_utc: i64,
    event: &MachineEvent,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO machine_events (machine_id, ts_utc, event) VALUES (?1, ?2, ?3)",
        params![machine_id, ts_utc, serde_json::to_string(event)?],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn fetch_machine(conn: &Connection, machine_id: &str) -> Result<Machine> {
    conn.query_row(
        "SELECT id, serial_number, model, status, client_id, initial_counter, current_counter, split_percentage, created_ts_utc, updated_ts_utc
         FROM machines WHERE id = ?1",
        [machine_id],
        |row| {
            Ok(Machine {
                id: row.get(0)?,
                serial_number: row.get(1)?,
                model: row.get(2)?,
                status: row.get(3)?,
                client_id: row.get(4)?,
                initial_counter: counter_column(row, 5)?,
                current_counter: counter_column(row, 6)?,
                split_percentage: row.get(7)?,
                created_ts_utc: row.get(8)?,
                updated_ts_utc: row.get(9)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| LedgerError::MachineNotFound(machine_id.to_string()))
}

pub(crate) fn ensure_machine_exists(conn: &Connection, machine_id: &str) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM machines WHERE id = ?1",
        [machine_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(LedgerError::MachineNotFound(machine_id.to_string()));
    }
    Ok(())
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<CounterObservation> {
    Ok(CounterObservation {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        ts_utc: row.get(2)?,
        previous_counter: counter_column(row, 3)?,
        new_counter: counter_column(row, 4)?,
        difference: counter_column(row, 5)?,
        source: row.get(6)?,
        note: row.get(7)?,
        actor: row.get(8)?,
    })
}

pub(crate) fn counter_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| LedgerError::CounterOutOfRange(value))
}

pub(crate) fn counter_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err)))
}
