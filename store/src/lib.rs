//! SQLite-backed record of every claim the orchestrator has decided.
//!
//! - [`RecordStore`] - append-only submission records with idempotent writes
//! - [`PersistOutcome`] - what a write did (inserted, already present, or conflicting)

mod record_store;
mod secure_fs;

pub use record_store::{PersistOutcome, RecordStore, StoredRecord};
