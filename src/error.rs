use crate::MachineStatus;

/// Errors surfaced by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("machine already registered: {0}")]
    MachineExists(String),

    #[error("unrecognized counter source: {0}")]
    InvalidSource(String),

    /// The requested lifecycle step does not apply to the machine's status.
    #[error("cannot {action} machine {machine_id} while it is {status}")]
    InvalidTransition {
        machine_id: String,
        status: MachineStatus,
        action: &'static str,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Counter readings are stored as signed 64-bit integers.
    #[error("counter value {0} exceeds the storable range")]
    CounterOutOfRange(u64),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
