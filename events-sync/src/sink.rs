use std::collections::BTreeSet;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Status flag written on every row the loader touches.
pub const STATUS_ACTIVE: i16 = 1;

/// A row type with a natural key used for upsert lookups.
pub trait Record: Send + Sync {
    type Key: fmt::Debug + Send + Sync;

    /// Table name, used for logging and error reports.
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;
}

/// Normalized `tevo_events` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub event_id: i64,
    pub event_name: String,
    pub event_date: DateTime<Utc>,
    pub venue_id: i64,
    pub category_id: i64,
    pub configuration_id: Option<i64>,
    pub products_count: i64,
    pub event_url: String,
    pub updated_at: DateTime<Utc>,
    pub event_status: i16,
    pub event_state: String,
    pub last_modified: DateTime<Utc>,
}

impl Record for EventRow {
    type Key = i64;
    const TABLE: &'static str = "tevo_events";

    fn key(&self) -> i64 {
        self.event_id
    }
}

/// Normalized `tevo_event_performers` row, keyed by (event id, performer id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPerformerRow {
    pub event_id: i64,
    pub performer_id: i64,
    pub is_primary: bool,
    pub status: i16,
    pub last_modified: DateTime<Utc>,
}

impl Record for EventPerformerRow {
    type Key = (i64, i64);
    const TABLE: &'static str = "tevo_event_performers";

    fn key(&self) -> (i64, i64) {
        (self.event_id, self.performer_id)
    }
}

/// Last successful run of a loader, one per target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub table: String,
    pub kind: String,
    pub last_run: DateTime<Utc>,
}

/// Keyed find / insert / update over one table.
#[async_trait]
pub trait Table<R: Record>: Send + Sync {
    async fn find(&self, key: &R::Key) -> Result<Option<R>>;
    async fn insert(&self, row: &R) -> Result<()>;
    async fn update(&self, row: &R) -> Result<()>;
}

/// Bulk delete over the event/performer association table.
#[async_trait]
pub trait PerformerLinks: Send + Sync {
    /// Delete links of `event_id` whose performer id is not in `keep`. Returns rows deleted.
    async fn delete_except(&self, event_id: i64, keep: &BTreeSet<i64>) -> Result<u64>;
}

/// Persistence for run status records.
#[async_trait]
pub trait StatusLedger: Send + Sync {
    async fn load_status(&self, table: &str) -> Result<Option<RunStatus>>;
    async fn save_status(&self, status: &RunStatus) -> Result<()>;
}

/// Everything the sync loop needs from the local store.
pub trait EventStore: Table<EventRow> + Table<EventPerformerRow> + PerformerLinks {}

impl<T> EventStore for T where T: Table<EventRow> + Table<EventPerformerRow> + PerformerLinks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    Update,
}

impl fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertAction::Insert => f.write_str("INSERT"),
            UpsertAction::Update => f.write_str("UPDATE"),
        }
    }
}

/// Store operation that failed for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStage {
    Find,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for PersistStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistStage::Find => "find",
            PersistStage::Insert => "insert",
            PersistStage::Update => "update",
            PersistStage::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A single record failed to persist. Reported by the caller, never fatal to a run.
#[derive(Debug, Error)]
#[error("failed to {stage} {key} in `{table}`")]
pub struct RecordPersistError {
    pub table: &'static str,
    pub key: String,
    pub stage: PersistStage,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl RecordPersistError {
    fn new(table: &'static str, key: String, stage: PersistStage, err: anyhow::Error) -> Self {
        Self {
            table,
            key,
            stage,
            source: err.into(),
        }
    }
}

/// Insert `row`, or overwrite the stored row with the same key.
pub async fn upsert<R, T>(table: &T, row: &R) -> Result<UpsertAction, RecordPersistError>
where
    R: Record,
    T: Table<R> + ?Sized,
{
    let key = row.key();
    let fail = |stage, err| RecordPersistError::new(R::TABLE, format!("{key:?}"), stage, err);

    let existing = table
        .find(&key)
        .await
        .map_err(|e| fail(PersistStage::Find, e))?;

    match existing {
        Some(_) => {
            table
                .update(row)
                .await
                .map_err(|e| fail(PersistStage::Update, e))?;
            Ok(UpsertAction::Update)
        }
        None => {
            table
                .insert(row)
                .await
                .map_err(|e| fail(PersistStage::Insert, e))?;
            Ok(UpsertAction::Insert)
        }
    }
}

/// Drop stored performer links of `event_id` that were not observed this run.
///
/// An empty `observed` set carries no information and deletes nothing.
pub async fn reconcile_performers<T>(
    links: &T,
    event_id: i64,
    observed: &BTreeSet<i64>,
) -> Result<u64, RecordPersistError>
where
    T: PerformerLinks + ?Sized,
{
    if observed.is_empty() {
        return Ok(0);
    }

    links.delete_except(event_id, observed).await.map_err(|e| {
        RecordPersistError::new(
            EventPerformerRow::TABLE,
            format!("event {event_id}"),
            PersistStage::Delete,
            e,
        )
    })
}
