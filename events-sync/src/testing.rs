//! In-memory store and scripted page source used by unit tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::sink::{
    EventPerformerRow, EventRow, PerformerLinks, RunStatus, StatusLedger, Table, STATUS_ACTIVE,
};
use crate::source::{
    FetchError, Filters, IdRef, OptionalIdRef, Page, PageSource, RawEvent, RawPerformance,
};

pub fn run_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap()
}

pub fn raw_event(id: i64, performers: &[(i64, bool)]) -> RawEvent {
    RawEvent {
        id,
        name: format!("Event {id}"),
        occurs_at: Utc.with_ymd_and_hms(2026, 12, 1, 20, 0, 0).unwrap(),
        venue: IdRef { id: 10 },
        category: IdRef { id: 3 },
        configuration: Some(OptionalIdRef { id: Some(55) }),
        products_count: 12,
        url: format!("/events/{id}"),
        updated_at: Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
        state: "shown".to_string(),
        performances: performers
            .iter()
            .map(|(performer, primary)| RawPerformance {
                performer: Some(OptionalIdRef {
                    id: Some(*performer),
                }),
                primary: *primary,
            })
            .collect(),
    }
}

pub fn event_row(id: i64, run_started: DateTime<Utc>) -> EventRow {
    crate::mapping::map_event(&raw_event(id, &[]), run_started).event
}

pub fn performer_row(
    event_id: i64,
    performer_id: i64,
    is_primary: bool,
    run_started: DateTime<Utc>,
) -> EventPerformerRow {
    EventPerformerRow {
        event_id,
        performer_id,
        is_primary,
        status: STATUS_ACTIVE,
        last_modified: run_started,
    }
}

#[derive(Default)]
struct MemoryTables {
    events: BTreeMap<i64, EventRow>,
    performers: BTreeMap<(i64, i64), EventPerformerRow>,
    statuses: BTreeMap<String, RunStatus>,
    failing_events: BTreeSet<i64>,
    delete_calls: usize,
}

/// Store double keeping every table in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryTables>,
}

impl MemoryStore {
    /// Make inserts and updates of this event's row fail.
    pub fn fail_writes_for_event(&self, event_id: i64) {
        self.inner.lock().unwrap().failing_events.insert(event_id);
    }

    pub fn events(&self) -> BTreeMap<i64, EventRow> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn performers(&self) -> BTreeMap<(i64, i64), EventPerformerRow> {
        self.inner.lock().unwrap().performers.clone()
    }

    pub fn performer_ids(&self, event_id: i64) -> BTreeSet<i64> {
        self.inner
            .lock()
            .unwrap()
            .performers
            .keys()
            .filter(|(event, _)| *event == event_id)
            .map(|(_, performer)| *performer)
            .collect()
    }

    pub fn delete_calls(&self) -> usize {
        self.inner.lock().unwrap().delete_calls
    }

    pub fn status(&self, table: &str) -> Option<RunStatus> {
        self.inner.lock().unwrap().statuses.get(table).cloned()
    }

    pub fn seed_status(&self, status: RunStatus) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(status.table.clone(), status);
    }

    fn check_event_writable(tables: &MemoryTables, event_id: i64) -> Result<()> {
        if tables.failing_events.contains(&event_id) {
            return Err(anyhow!("simulated write failure for event {event_id}"));
        }
        Ok(())
    }
}

#[async_trait]
impl Table<EventRow> for MemoryStore {
    async fn find(&self, key: &i64) -> Result<Option<EventRow>> {
        Ok(self.inner.lock().unwrap().events.get(key).cloned())
    }

    async fn insert(&self, row: &EventRow) -> Result<()> {
        let mut tables = self.inner.lock().unwrap();
        Self::check_event_writable(&tables, row.event_id)?;
        if tables.events.contains_key(&row.event_id) {
            return Err(anyhow!("duplicate key {}", row.event_id));
        }
        tables.events.insert(row.event_id, row.clone());
        Ok(())
    }

    async fn update(&self, row: &EventRow) -> Result<()> {
        let mut tables = self.inner.lock().unwrap();
        Self::check_event_writable(&tables, row.event_id)?;
        match tables.events.get_mut(&row.event_id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(anyhow!("no row for key {}", row.event_id)),
        }
    }
}

#[async_trait]
impl Table<EventPerformerRow> for MemoryStore {
    async fn find(&self, key: &(i64, i64)) -> Result<Option<EventPerformerRow>> {
        Ok(self.inner.lock().unwrap().performers.get(key).cloned())
    }

    async fn insert(&self, row: &EventPerformerRow) -> Result<()> {
        let mut tables = self.inner.lock().unwrap();
        let key = (row.event_id, row.performer_id);
        if tables.performers.contains_key(&key) {
            return Err(anyhow!("duplicate key {key:?}"));
        }
        tables.performers.insert(key, row.clone());
        Ok(())
    }

    async fn update(&self, row: &EventPerformerRow) -> Result<()> {
        let mut tables = self.inner.lock().unwrap();
        let key = (row.event_id, row.performer_id);
        match tables.performers.get_mut(&key) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(anyhow!("no row for key {key:?}")),
        }
    }
}

#[async_trait]
impl PerformerLinks for MemoryStore {
    async fn delete_except(&self, event_id: i64, keep: &BTreeSet<i64>) -> Result<u64> {
        let mut tables = self.inner.lock().unwrap();
        tables.delete_calls += 1;
        let before = tables.performers.len();
        tables
            .performers
            .retain(|(event, performer), _| *event != event_id || keep.contains(performer));
        Ok((before - tables.performers.len()) as u64)
    }
}

#[async_trait]
impl StatusLedger for MemoryStore {
    async fn load_status(&self, table: &str) -> Result<Option<RunStatus>> {
        Ok(self.status(table))
    }

    async fn save_status(&self, status: &RunStatus) -> Result<()> {
        self.seed_status(status.clone());
        Ok(())
    }
}

/// Page source answering calls from a fixed script, in call order.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Page, FetchError>>>,
    requested: Mutex<Vec<u32>>,
    filters: Mutex<Vec<Filters>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Page, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requested: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Page numbers in the order they were requested.
    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }

    pub fn filters_seen(&self) -> Vec<Filters> {
        self.filters.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn list_page(&self, filters: &Filters, page: u32) -> Result<Page, FetchError> {
        self.requested.lock().unwrap().push(page);
        self.filters.lock().unwrap().push(filters.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Malformed(format!("no scripted response for page {page}"))))
    }
}
