// Record Store - durable decision trail for claim verification
//
// One row per observed claim event. Writing the same event twice is a no-op, and
// a (claimant, parcel) pair can hold at most one valid row. Both rules are
// enforced by unique indexes as well as by the checks in `persist`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use verigreen_types::{
    BoundingBox, ClaimStatus, ClaimantAddress, CommitmentHash, EventMarker, ParcelId, RecordId,
    Sample, SubmissionRecord, VerificationGrid,
};

use crate::secure_fs::open_secure_db;

/// Result of attempting to persist a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A new row was written.
    Inserted(RecordId),
    /// This claim event already has a row; nothing was written.
    AlreadyRecorded(RecordId),
    /// The record claims validity but the pair already has a valid row; nothing was written.
    Conflict { existing: RecordId },
}

impl PersistOutcome {
    #[must_use]
    pub const fn record_id(self) -> RecordId {
        match self {
            PersistOutcome::Inserted(id)
            | PersistOutcome::AlreadyRecorded(id)
            | PersistOutcome::Conflict { existing: id } => id,
        }
    }
}

/// A record together with its row id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub record: SubmissionRecord,
}

pub struct RecordStore {
    db: Connection,
}

const SELECT_COLUMNS: &str = "record_id, claimant, parcel_id, marker, coordinates_json, \
     sample_json, commitment_hash, valid, transaction_ref, random_seed, grid_json, \
     processing_time_secs, status, error, recorded_at";

impl RecordStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS submission_records (
            record_id INTEGER PRIMARY KEY,
            claimant TEXT NOT NULL,
            parcel_id TEXT NOT NULL,
            marker INTEGER NOT NULL,
            coordinates_json TEXT NOT NULL,
            sample_json TEXT NOT NULL,
            commitment_hash TEXT,
            valid INTEGER NOT NULL,
            transaction_ref TEXT,
            random_seed TEXT,
            grid_json TEXT,
            processing_time_secs REAL,
            status TEXT NOT NULL,
            error TEXT,
            recorded_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_records_event
        ON submission_records(claimant, parcel_id, marker);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_records_single_valid
        ON submission_records(claimant, parcel_id) WHERE valid = 1;

        CREATE INDEX IF NOT EXISTS idx_records_claimant
        ON submission_records(claimant, record_id);
    ";

    /// Open or create the record store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = open_secure_db(path.as_ref())?;
        Self::initialize(db)
    }

    /// Open an in-memory store (for testing and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory record store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .context("Failed to set record store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create record store schema")?;
        Ok(Self { db })
    }

    /// Write `record` unless its event is already recorded or it would be a second valid row.
    ///
    /// The checks and the insert run in one immediate transaction, so a crash never
    /// leaves a partial row behind.
    pub fn persist(&mut self, record: &SubmissionRecord) -> Result<PersistOutcome> {
        let marker = marker_to_sql(record.marker)?;
        let coordinates_json = serde_json::to_string(&record.coordinates)
            .context("Failed to serialize record coordinates")?;
        let sample_json = serde_json::to_string(&record.sample_indices)
            .context("Failed to serialize record sample")?;
        let grid_json = record
            .grid
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize grid snapshot")?;

        let tx = self
            .db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to start record transaction")?;

        let existing_event: Option<RecordId> = tx
            .query_row(
                "SELECT record_id FROM submission_records
                 WHERE claimant = ?1 AND parcel_id = ?2 AND marker = ?3",
                params![record.claimant.as_str(), record.parcel.as_str(), marker],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up existing event record")?;
        if let Some(id) = existing_event {
            return Ok(PersistOutcome::AlreadyRecorded(id));
        }

        if record.valid {
            let existing_valid: Option<RecordId> = tx
                .query_row(
                    "SELECT record_id FROM submission_records
                     WHERE claimant = ?1 AND parcel_id = ?2 AND valid = 1",
                    params![record.claimant.as_str(), record.parcel.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to look up existing valid record")?;
            if let Some(existing) = existing_valid {
                return Ok(PersistOutcome::Conflict { existing });
            }
        }

        tx.execute(
            "INSERT INTO submission_records (
                claimant, parcel_id, marker, coordinates_json, sample_json, commitment_hash,
                valid, transaction_ref, random_seed, grid_json, processing_time_secs,
                status, error, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.claimant.as_str(),
                record.parcel.as_str(),
                marker,
                coordinates_json,
                sample_json,
                record.commitment_hash.map(|h| h.to_hex()),
                record.valid,
                record.transaction_ref.as_deref(),
                record.random_seed.map(|seed| seed.to_string()),
                grid_json,
                record.processing_time_secs,
                record.status.as_str(),
                record.error.as_deref(),
                record.recorded_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert submission record")?;
        let id = tx.last_insert_rowid();

        tx.commit().context("Failed to commit submission record")?;

        tracing::debug!(
            record_id = id,
            claimant = %record.claimant,
            parcel = %record.parcel,
            status = %record.status,
            "Persisted submission record"
        );
        Ok(PersistOutcome::Inserted(id))
    }

    /// Row for one specific claim event, if any.
    pub fn find_by_event(
        &self,
        claimant: &ClaimantAddress,
        parcel: &ParcelId,
        marker: EventMarker,
    ) -> Result<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM submission_records
             WHERE claimant = ?1 AND parcel_id = ?2 AND marker = ?3"
        );
        let raw = self
            .db
            .query_row(
                &sql,
                params![claimant.as_str(), parcel.as_str(), marker_to_sql(marker)?],
                RawRecord::from_row,
            )
            .optional()
            .context("Failed to query record by event")?;
        raw.map(RawRecord::decode).transpose()
    }

    /// The pair's valid row, if the parcel is already verified.
    pub fn valid_record(
        &self,
        claimant: &ClaimantAddress,
        parcel: &ParcelId,
    ) -> Result<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM submission_records
             WHERE claimant = ?1 AND parcel_id = ?2 AND valid = 1"
        );
        let raw = self
            .db
            .query_row(
                &sql,
                params![claimant.as_str(), parcel.as_str()],
                RawRecord::from_row,
            )
            .optional()
            .context("Failed to query valid record")?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Most recently written row for the pair.
    pub fn latest(
        &self,
        claimant: &ClaimantAddress,
        parcel: &ParcelId,
    ) -> Result<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM submission_records
             WHERE claimant = ?1 AND parcel_id = ?2
             ORDER BY record_id DESC LIMIT 1"
        );
        let raw = self
            .db
            .query_row(
                &sql,
                params![claimant.as_str(), parcel.as_str()],
                RawRecord::from_row,
            )
            .optional()
            .context("Failed to query latest record")?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Rows in write order, optionally restricted to one claimant.
    pub fn list(
        &self,
        claimant: Option<&ClaimantAddress>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raws = match claimant {
            Some(claimant) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM submission_records
                     WHERE claimant = ?1 ORDER BY record_id LIMIT ?2"
                );
                let mut stmt = self
                    .db
                    .prepare(&sql)
                    .context("Failed to prepare record listing")?;
                stmt.query_map(params![claimant.as_str(), limit], RawRecord::from_row)
                    .context("Failed to list records")?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .context("Failed to read record row")?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM submission_records ORDER BY record_id LIMIT ?1"
                );
                let mut stmt = self
                    .db
                    .prepare(&sql)
                    .context("Failed to prepare record listing")?;
                stmt.query_map(params![limit], RawRecord::from_row)
                    .context("Failed to list records")?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .context("Failed to read record row")?
            }
        };
        raws.into_iter().map(RawRecord::decode).collect()
    }
}

fn marker_to_sql(marker: EventMarker) -> Result<i64> {
    i64::try_from(marker.value())
        .with_context(|| format!("Event marker {marker} does not fit in a SQLite integer"))
}

/// Column values before domain validation.
struct RawRecord {
    id: RecordId,
    claimant: String,
    parcel_id: String,
    marker: i64,
    coordinates_json: String,
    sample_json: String,
    commitment_hash: Option<String>,
    valid: bool,
    transaction_ref: Option<String>,
    random_seed: Option<String>,
    grid_json: Option<String>,
    processing_time_secs: Option<f64>,
    status: String,
    error: Option<String>,
    recorded_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            claimant: row.get(1)?,
            parcel_id: row.get(2)?,
            marker: row.get(3)?,
            coordinates_json: row.get(4)?,
            sample_json: row.get(5)?,
            commitment_hash: row.get(6)?,
            valid: row.get(7)?,
            transaction_ref: row.get(8)?,
            random_seed: row.get(9)?,
            grid_json: row.get(10)?,
            processing_time_secs: row.get(11)?,
            status: row.get(12)?,
            error: row.get(13)?,
            recorded_at: row.get(14)?,
        })
    }

    fn decode(self) -> Result<StoredRecord> {
        let id = self.id;
        let ctx = || format!("Corrupt submission record {id}");

        let Ok(marker) = u64::try_from(self.marker) else {
            bail!("Corrupt submission record {id}: negative marker {}", self.marker);
        };
        let coordinates: BoundingBox =
            serde_json::from_str(&self.coordinates_json).with_context(ctx)?;
        let sample_indices: Sample = serde_json::from_str(&self.sample_json).with_context(ctx)?;
        let commitment_hash = self
            .commitment_hash
            .map(CommitmentHash::try_from)
            .transpose()
            .with_context(ctx)?;
        let random_seed = self
            .random_seed
            .map(|seed| seed.parse::<u64>())
            .transpose()
            .with_context(ctx)?;
        let grid = self
            .grid_json
            .map(|json| serde_json::from_str::<VerificationGrid>(&json))
            .transpose()
            .with_context(ctx)?;
        let status: ClaimStatus = self
            .status
            .parse()
            .map_err(anyhow::Error::msg)
            .with_context(ctx)?;
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .with_context(ctx)?
            .with_timezone(&Utc);

        let record = SubmissionRecord {
            claimant: ClaimantAddress::new(self.claimant).with_context(ctx)?,
            parcel: ParcelId::new(self.parcel_id).with_context(ctx)?,
            coordinates,
            marker: EventMarker::new(marker),
            sample_indices,
            commitment_hash,
            valid: self.valid,
            transaction_ref: self.transaction_ref,
            random_seed,
            grid,
            processing_time_secs: self.processing_time_secs,
            status,
            error: self.error,
            recorded_at,
        };
        Ok(StoredRecord { id, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verigreen_types::{Cell, ContentRef};

    fn claimant(last: char) -> ClaimantAddress {
        ClaimantAddress::new(format!("0x{}", last.to_string().repeat(40))).unwrap()
    }

    fn record(marker: u64, valid: bool, status: ClaimStatus) -> SubmissionRecord {
        SubmissionRecord {
            claimant: claimant('a'),
            parcel: ParcelId::new("parcel-1").unwrap(),
            coordinates: BoundingBox::new([0.0, 0.0, 1.0, 1.0]).unwrap(),
            marker: EventMarker::new(marker),
            sample_indices: Sample::new(vec![2, 5, 7, 1]),
            commitment_hash: Some(CommitmentHash::from_bytes([7; 32])),
            valid,
            transaction_ref: valid.then(|| "0xabc".to_string()),
            random_seed: Some(u64::MAX),
            grid: Some(VerificationGrid {
                cells: vec![Cell {
                    index: 0,
                    x: 0,
                    y: 0,
                    health_score: 0.9,
                    vegetation_index: 0.7,
                    coordinates: vec![0.0, 0.0, 0.5, 0.5],
                }],
                content_ref: ContentRef::new("bafy"),
                processing_time_secs: 2.0,
                generated_at: Utc::now(),
            }),
            processing_time_secs: Some(2.0),
            status,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn persist_then_read_back() {
        let mut store = RecordStore::open_in_memory().unwrap();
        let original = record(1, true, ClaimStatus::Verified);

        let outcome = store.persist(&original).unwrap();
        let PersistOutcome::Inserted(id) = outcome else {
            panic!("expected insert, got {outcome:?}");
        };

        let stored = store
            .find_by_event(&original.claimant, &original.parcel, original.marker)
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.record.sample_indices, original.sample_indices);
        assert_eq!(stored.record.random_seed, Some(u64::MAX));
        assert_eq!(stored.record.commitment_hash, original.commitment_hash);
        assert_eq!(stored.record.grid, original.grid);
        assert_eq!(stored.record.status, ClaimStatus::Verified);
    }

    #[test]
    fn same_event_twice_is_a_noop() {
        let mut store = RecordStore::open_in_memory().unwrap();
        let first = store.persist(&record(1, true, ClaimStatus::Verified)).unwrap();
        let second = store.persist(&record(1, true, ClaimStatus::Verified)).unwrap();

        assert_eq!(second, PersistOutcome::AlreadyRecorded(first.record_id()));
        assert_eq!(store.list(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn redelivered_event_keeps_original_verdict() {
        let mut store = RecordStore::open_in_memory().unwrap();
        store.persist(&record(4, false, ClaimStatus::Failed)).unwrap();
        let again = store.persist(&record(4, true, ClaimStatus::Verified)).unwrap();

        assert!(matches!(again, PersistOutcome::AlreadyRecorded(_)));
        let rows = store.list(None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].record.valid);
    }

    #[test]
    fn second_valid_record_for_pair_conflicts() {
        let mut store = RecordStore::open_in_memory().unwrap();
        let first = store.persist(&record(1, true, ClaimStatus::Verified)).unwrap();
        let second = store.persist(&record(2, true, ClaimStatus::Verified)).unwrap();

        assert_eq!(
            second,
            PersistOutcome::Conflict {
                existing: first.record_id()
            }
        );
    }

    #[test]
    fn invalid_records_accumulate_alongside_a_valid_one() {
        let mut store = RecordStore::open_in_memory().unwrap();
        store.persist(&record(1, true, ClaimStatus::Verified)).unwrap();
        let rejected = store.persist(&record(2, false, ClaimStatus::Rejected)).unwrap();
        assert!(matches!(rejected, PersistOutcome::Inserted(_)));

        let pair = record(0, false, ClaimStatus::Error);
        let latest = store.latest(&pair.claimant, &pair.parcel).unwrap().unwrap();
        assert_eq!(latest.record.status, ClaimStatus::Rejected);

        let valid = store.valid_record(&pair.claimant, &pair.parcel).unwrap().unwrap();
        assert_eq!(valid.record.marker, EventMarker::new(1));
    }

    #[test]
    fn partial_record_with_empty_fields_round_trips() {
        let mut store = RecordStore::open_in_memory().unwrap();
        let mut partial = record(9, false, ClaimStatus::Error);
        partial.sample_indices = Sample::empty();
        partial.commitment_hash = None;
        partial.random_seed = None;
        partial.grid = None;
        partial.processing_time_secs = None;
        partial.error = Some("randomness beacon did not respond".to_string());

        store.persist(&partial).unwrap();
        let stored = store
            .find_by_event(&partial.claimant, &partial.parcel, partial.marker)
            .unwrap()
            .unwrap();
        assert!(stored.record.sample_indices.is_empty());
        assert!(stored.record.grid.is_none());
        assert_eq!(stored.record.error, partial.error);
    }

    #[test]
    fn list_filters_by_claimant() {
        let mut store = RecordStore::open_in_memory().unwrap();
        store.persist(&record(1, false, ClaimStatus::Failed)).unwrap();
        let mut other = record(2, false, ClaimStatus::Failed);
        other.claimant = claimant('b');
        store.persist(&other).unwrap();

        let only_b = store.list(Some(&claimant('b')), 10).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].record.claimant, claimant('b'));
        assert_eq!(store.list(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        {
            let mut store = RecordStore::open(&path).unwrap();
            store.persist(&record(3, true, ClaimStatus::Verified)).unwrap();
        }

        let store = RecordStore::open(&path).unwrap();
        let rows = store.list(None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.transaction_ref.as_deref(), Some("0xabc"));
    }
}
