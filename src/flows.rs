//! Commercial flows that move a machine through its lifecycle.
//!
//! Each flow reads the counter once through the ledger and commits its own
//! bookkeeping in the same transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde::Deserialize;

use crate::{
    error::{LedgerError, Result},
    ledger::{
        counter_column, counter_to_sql, ensure_machine_exists, fetch_machine, insert_event,
        record_in_tx, Ledger,
    },
    resolve_ts_utc,
    revenue::compute_revenue,
    CollectionRecord, CounterSource, Machine, MachineEvent, MachineStatus,
};

#[derive(Clone, Debug, Deserialize)]
pub struct InstallRequest {
    pub machine_id: String,
    pub client_id: String,
    /// Counter read on site at installation.
    pub counter: u64,
    pub technician: String,
    pub note: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TransferRequest {
    pub machine_id: String,
    pub to_client_id: String,
    pub counter: u64,
    pub technician: String,
    pub note: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RepairRequest {
    pub machine_id: String,
    pub counter: u64,
    pub technician: Option<String>,
    pub note: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CollectionRequest {
    pub machine_id: String,
    pub counter: u64,
    pub staff_member: String,
    /// Overrides the machine's split for this collection only.
    pub distribution_percentage: Option<f64>,
    pub payment_method: Option<String>,
    pub signature_data: Option<String>,
    pub ticket_number: Option<String>,
    pub invoice_number: Option<String>,
    pub note: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Ledger {
    /// Place a stored or repaired machine at a client venue.
    pub fn install_machine(&mut self, request: InstallRequest) -> Result<Machine> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let machine = fetch_machine(&tx, &request.machine_id)?;
        if machine.status == MachineStatus::Installed {
            return Err(invalid_transition(&machine, "install"));
        }

        let ts_utc = resolve_ts_utc(request.timestamp);
        record_in_tx(
            &tx,
            &machine,
            request.counter,
            CounterSource::Installation,
            request.note.as_deref(),
            Some(request.technician.as_str()),
            ts_utc,
        )?;
        set_placement(&tx, &machine.id, MachineStatus::Installed, Some(request.client_id.as_str()))?;
        insert_event(
            &tx,
            &machine.id,
            ts_utc,
            &MachineEvent::Installed {
                client_id: request.client_id.clone(),
                technician: request.technician.clone(),
                counter: request.counter,
            },
        )?;
        let machine = fetch_machine(&tx, &machine.id)?;
        tx.commit()?;

        tracing::info!(
            machine_id = %machine.id,
            client_id = %request.client_id,
            counter = request.counter,
            "machine installed"
        );
        Ok(machine)
    }

    /// Move an installed machine to another client.
    pub fn transfer_machine(&mut self, request: TransferRequest) -> Result<Machine> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let machine = fetch_machine(&tx, &request.machine_id)?;
        let from_client_id = match (&machine.status, &machine.client_id) {
            (MachineStatus::Installed, Some(client_id)) if *client_id != request.to_client_id => {
                client_id.clone()
            }
            _ => return Err(invalid_transition(&machine, "transfer")),
        };

        let ts_utc = resolve_ts_utc(request.timestamp);
        record_in_tx(
            &tx,
            &machine,
            request.counter,
            CounterSource::Transfer,
            request.note.as_deref(),
            Some(request.technician.as_str()),
            ts_utc,
        )?;
        set_placement(
            &tx,
            &machine.id,
            MachineStatus::Installed,
            Some(request.to_client_id.as_str()),
        )?;
        insert_event(
            &tx,
            &machine.id,
            ts_utc,
            &MachineEvent::Transferred {
                from_client_id: from_client_id.clone(),
                to_client_id: request.to_client_id.clone(),
                technician: request.technician.clone(),
                counter: request.counter,
            },
        )?;
        let machine = fetch_machine(&tx, &machine.id)?;
        tx.commit()?;

        tracing::info!(
            machine_id = %machine.id,
            from_client_id = %from_client_id,
            to_client_id = %request.to_client_id,
            counter = request.counter,
            "machine transferred"
        );
        Ok(machine)
    }

    /// Pull a machine into repair. The client assignment is kept.
    pub fn send_to_repair(&mut self, request: RepairRequest) -> Result<Machine> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let machine = fetch_machine(&tx, &request.machine_id)?;
        if machine.status == MachineStatus::Repair {
            return Err(invalid_transition(&machine, "repair"));
        }

        let ts_utc = resolve_ts_utc(request.timestamp);
        record_in_tx(
            &tx,
            &machine,
            request.counter,
            CounterSource::Maintenance,
            request.note.as_deref(),
            request.technician.as_deref(),
            ts_utc,
        )?;
        set_placement(
            &tx,
            &machine.id,
            MachineStatus::Repair,
            machine.client_id.as_deref(),
        )?;
        insert_event(
            &tx,
            &machine.id,
            ts_utc,
            &MachineEvent::SentToRepair {
                counter: request.counter,
                note: request.note.clone(),
            },
        )?;
        let machine = fetch_machine(&tx, &machine.id)?;
        tx.commit()?;

        tracing::info!(machine_id = %machine.id, counter = request.counter, "machine sent to repair");
        Ok(machine)
    }

    /// Read the counter, settle the revenue since the last reading and store
    /// the collection.
    pub fn record_collection(&mut self, request: CollectionRequest) -> Result<CollectionRecord> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let machine = fetch_machine(&tx, &request.machine_id)?;

        let ts_utc = resolve_ts_utc(request.timestamp);
        let observation = record_in_tx(
            &tx,
            &machine,
            request.counter,
            CounterSource::Collection,
            request.note.as_deref(),
            Some(request.staff_member.as_str()),
            ts_utc,
        )?;
        let distribution_percentage = request
            .distribution_percentage
            .unwrap_or(machine.split_percentage);
        let amount = compute_revenue(observation.difference, Some(distribution_percentage));

        tx.execute(
            "INSERT INTO collections (machine_id, client_id, ts_utc, previous_counter, current_counter, difference, distribution_percentage, amount, staff_member, payment_method, signature_data, ticket_number, invoice_number, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                machine.id,
                machine.client_id,
                ts_utc,
                counter_to_sql(observation.previous_counter)?,
                counter_to_sql(observation.new_counter)?,
                counter_to_sql(observation.difference)?,
                distribution_percentage,
                amount,
                request.staff_member,
                request.payment_method,
                request.signature_data,
                request.ticket_number,
                request.invoice_number,
                request.note
            ],
        )?;
        let collection_id = tx.last_insert_rowid();
        insert_event(
            &tx,
            &machine.id,
            ts_utc,
            &MachineEvent::Collected {
                collection_id,
                amount,
            },
        )?;
        tx.commit()?;

        tracing::info!(
            machine_id = %machine.id,
            collection_id,
            difference = observation.difference,
            distribution_percentage,
            amount,
            "collection recorded"
        );

        Ok(CollectionRecord {
            id: collection_id,
            machine_id: machine.id,
            client_id: machine.client_id,
            ts_utc,
            previous_counter: observation.previous_counter,
            current_counter: observation.new_counter,
            difference: observation.difference,
            distribution_percentage,
            amount,
            staff_member: request.staff_member,
            payment_method: request.payment_method,
            signature_data: request.signature_data,
            ticket_number: request.ticket_number,
            invoice_number: request.invoice_number,
            note: request.note,
        })
    }

    /// Collections for a machine, newest first.
    pub fn collections_for(&self, machine_id: &str) -> Result<Vec<CollectionRecord>> {
        ensure_machine_exists(&self.db.conn, machine_id)?;
        let mut stmt = self.db.conn.prepare(
            "SELECT id, machine_id, client_id, ts_utc, previous_counter, current_counter, difference, distribution_percentage, amount, staff_member, payment_method, signature_data, ticket_number, invoice_number, note
             FROM collections WHERE machine_id = ?1
             ORDER BY ts_utc DESC, id DESC",
        )?;
        let rows = stmt.query_map([machine_id], collection_from_row)?;

        let mut collections = Vec::new();
        for row in rows {
            collections.push(row?);
        }
        Ok(collections)
    }
}

fn invalid_transition(machine: &Machine, action: &'static str) -> LedgerError {
    LedgerError::InvalidTransition {
        machine_id: machine.id.clone(),
        status: machine.status,
        action,
    }
}

fn set_placement(
    conn: &Connection,
    machine_id: &str,
    status: MachineStatus,
    client_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE machines SET status = ?1, client_id = ?2, updated_ts_utc = ?3 WHERE id = ?4",
        params![status, client_id, Utc::now().timestamp_millis(), machine_id],
    )?;
    Ok(())
}

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionRecord> {
    Ok(CollectionRecord {
        id: row.get(0)?,
        machine_id: row.get(1)?,
        client_id: row.get(2)?,
        ts_utc: row.get(3)?,
        previous_counter: counter_column(row, 4)?,
        current_counter: counter_column(row, 5)?,
        difference: counter_column(row, 6)?,
        distribution_percentage: row.get(7)?,
        amount: row.get(8)?,
        staff_member: row.get(9)?,
        payment_method: row.get(10)?,
        signature_data: row.get(11)?,
        ticket_number: row.get(12)?,
        invoice_number: row.get(13)?,
        note: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, NewMachine};

    fn ledger_with(machine_id: &str, initial_counter: u64, split: Option<f64>) -> Ledger {
        let mut ledger = Ledger::new(Database::open_in_memory().expect("open in-memory"));
        ledger
            .register_machine(NewMachine {
                id: machine_id.to_string(),
                initial_counter,
                split_percentage: split,
                ..Default::default()
            })
            .expect("register");
        ledger
    }

    fn install(ledger: &mut Ledger, machine_id: &str, client_id: &str, counter: u64) -> Machine {
        ledger
            .install_machine(InstallRequest {
                machine_id: machine_id.to_string(),
                client_id: client_id.to_string(),
                counter,
                technician: "ana".to_string(),
                note: None,
                timestamp: None,
            })
            .expect("install")
    }

    fn collection(machine_id: &str, counter: u64) -> CollectionRequest {
        CollectionRequest {
            machine_id: machine_id.to_string(),
            counter,
            staff_member: "luis".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn install_assigns_client_and_records_counter() {
        let mut ledger = ledger_with("M1", 100, None);
        let machine = install(&mut ledger, "M1", "bar-sol", 104);

        assert_eq!(machine.status, MachineStatus::Installed);
        assert_eq!(machine.client_id.as_deref(), Some("bar-sol"));
        assert_eq!(machine.current_counter, 104);

        let history = ledger.history_for("M1").expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source, CounterSource::Installation);
        assert_eq!(history[0].difference, 4);
        assert_eq!(history[0].actor, "ana");

        let events = ledger.events_for("M1").expect("events");
        assert!(matches!(
            &events[0].event,
            MachineEvent::Installed { client_id, counter: 104, .. } if client_id == "bar-sol"
        ));
    }

    #[test]
    fn install_twice_rejected() {
        let mut ledger = ledger_with("M1", 0, None);
        install(&mut ledger, "M1", "bar-sol", 0);
        let result = ledger.install_machine(InstallRequest {
            machine_id: "M1".to_string(),
            client_id: "cafe-luna".to_string(),
            counter: 10,
            technician: "ana".to_string(),
            note: None,
            timestamp: None,
        });
        assert!(matches!(
            result,
            Err(LedgerError::InvalidTransition { status: MachineStatus::Installed, action: "install", .. })
        ));
        assert_eq!(ledger.latest_counter("M1").expect("latest"), 0);
    }

    #[test]
    fn transfer_moves_client() {
        let mut ledger = ledger_with("M1", 0, None);
        install(&mut ledger, "M1", "bar-sol", 0);
        let machine = ledger
            .transfer_machine(TransferRequest {
                machine_id: "M1".to_string(),
                to_client_id: "cafe-luna".to_string(),
                counter: 420,
                technician: "ana".to_string(),
                note: Some("owner request".to_string()),
                timestamp: None,
            })
            .expect("transfer");

        assert_eq!(machine.status, MachineStatus::Installed);
        assert_eq!(machine.client_id.as_deref(), Some("cafe-luna"));
        assert_eq!(machine.current_counter, 420);

        let history = ledger.history_for("M1").expect("history");
        assert_eq!(history[0].source, CounterSource::Transfer);
        assert_eq!(history[0].difference, 420);

        let events = ledger.events_for("M1").expect("events");
        assert_eq!(
            events[0].event,
            MachineEvent::Transferred {
                from_client_id: "bar-sol".to_string(),
                to_client_id: "cafe-luna".to_string(),
                technician: "ana".to_string(),
                counter: 420,
            }
        );
    }

    #[test]
    fn transfer_requires_installed_machine_and_new_client() {
        let mut ledger = ledger_with("M1", 0, None);
        let request = TransferRequest {
            machine_id: "M1".to_string(),
            to_client_id: "bar-sol".to_string(),
            counter: 5,
            technician: "ana".to_string(),
            note: None,
            timestamp: None,
        };
        assert!(matches!(
            ledger.transfer_machine(request.clone()),
            Err(LedgerError::InvalidTransition { status: MachineStatus::Storage, .. })
        ));

        install(&mut ledger, "M1", "bar-sol", 0);
        assert!(matches!(
            ledger.transfer_machine(request),
            Err(LedgerError::InvalidTransition { action: "transfer", .. })
        ));
        assert_eq!(ledger.history_for("M1").expect("history").len(), 1);
    }

    #[test]
    fn repair_then_reinstall() {
        let mut ledger = ledger_with("M1", 0, None);
        install(&mut ledger, "M1", "bar-sol", 0);
        let machine = ledger
            .send_to_repair(RepairRequest {
                machine_id: "M1".to_string(),
                counter: 55,
                technician: None,
                note: Some("coin jam".to_string()),
                timestamp: None,
            })
            .expect("repair");
        assert_eq!(machine.status, MachineStatus::Repair);
        assert_eq!(machine.client_id.as_deref(), Some("bar-sol"));

        let history = ledger.history_for("M1").expect("history");
        assert_eq!(history[0].source, CounterSource::Maintenance);
        assert_eq!(history[0].actor, "system");

        let again = ledger.send_to_repair(RepairRequest {
            machine_id: "M1".to_string(),
            counter: 55,
            technician: None,
            note: None,
            timestamp: None,
        });
        assert!(matches!(again, Err(LedgerError::InvalidTransition { .. })));

        let machine = install(&mut ledger, "M1", "cafe-luna", 55);
        assert_eq!(machine.status, MachineStatus::Installed);
        assert_eq!(machine.client_id.as_deref(), Some("cafe-luna"));
    }

    #[test]
    fn collection_uses_machine_split() {
        let mut ledger = ledger_with("M1", 0, Some(40.0));
        install(&mut ledger, "M1", "bar-sol", 0);

        let request = collection("M1", 1000);
        let record = ledger.record_collection(request).expect("collect");
        assert_eq!(record.difference, 1000);
        assert_eq!(record.distribution_percentage, 40.0);
        assert_eq!(record.amount, 400.0);
        assert_eq!(record.client_id.as_deref(), Some("bar-sol"));

        let history = ledger.history_for("M1").expect("history");
        assert_eq!(history[0].source, CounterSource::Collection);
        assert_eq!(history[0].actor, "luis");
    }

    #[test]
    fn collection_override_beats_machine_split() {
        let mut ledger = ledger_with("M1", 0, Some(40.0));
        let mut request = collection("M1", 1000);
        request.distribution_percentage = Some(60.0);
        request.ticket_number = Some("T-0042".to_string());

        let record = ledger.record_collection(request).expect("collect");
        assert_eq!(record.amount, 600.0);

        let stored = ledger.collections_for("M1").expect("collections");
        assert_eq!(stored, vec![record]);
    }

    #[test]
    fn collection_after_counter_reset_is_zero() {
        let mut ledger = ledger_with("M1", 500, None);
        let request = collection("M1", 20);
        let record = ledger.record_collection(request).expect("collect");
        assert_eq!(record.previous_counter, 500);
        assert_eq!(record.difference, 0);
        assert_eq!(record.amount, 0.0);
        assert_eq!(ledger.latest_counter("M1").expect("latest"), 20);
    }

    #[test]
    fn collection_event_references_record() {
        let mut ledger = ledger_with("M1", 0, None);
        let request = collection("M1", 80);
        let record = ledger.record_collection(request).expect("collect");

        let events = ledger.events_for("M1").expect("events");
        assert_eq!(
            events[0].event,
            MachineEvent::Collected {
                collection_id: record.id,
                amount: 40.0,
            }
        );
    }

    #[test]
    fn failed_collection_write_leaves_no_trace() {
        let mut ledger = ledger_with("M1", 100, None);
        ledger
            .db
            .conn
            .execute_batch(
                "CREATE TRIGGER fail_collection BEFORE INSERT ON collections
                 BEGIN SELECT RAISE(ABORT, 'injected write failure'); END;",
            )
            .expect("install trigger");

        let request = collection("M1", 150);
        let result = ledger.record_collection(request);
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(ledger.latest_counter("M1").expect("latest"), 100);
        assert!(ledger.history_for("M1").expect("history").is_empty());
        assert!(ledger.collections_for("M1").expect("collections").is_empty());
    }

    #[test]
    fn unknown_machine_collection_fails() {
        let mut ledger = ledger_with("M1", 0, None);
        let request = collection("ghost", 10);
        assert!(matches!(
            ledger.record_collection(request),
            Err(LedgerError::MachineNotFound(_))
        ));
        assert!(matches!(
            ledger.collections_for("ghost"),
            Err(LedgerError::MachineNotFound(_))
        ));
    }
}
