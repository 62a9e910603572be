use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::config::{Config, StateBackendKind};
use crate::mapping::map_event;
use crate::retry::{fetch_with_retry, RetryPolicy};
use crate::sink::{
    reconcile_performers, upsert, EventRow, EventStore, Record, RunStatus, StatusLedger,
    UpsertAction,
};
use crate::sink_pg::PgStore;
use crate::source::{page_source_from_config, Filters, PageSource, RawEvent};
use crate::state::FileStatusLedger;

/// Filter key restricting the listing to events changed since a timestamp.
const UPDATED_SINCE_FILTER: &str = "updated_at.gte";

/// Settings for a single sync run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub start_page: u32,
    pub max_pages: Option<u32>,
    pub retry: RetryPolicy,
    pub status_table: String,
    pub status_type: String,
    pub incremental: bool,
    pub filters: Filters,
}

impl RunOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            start_page: cfg.sync.start_page.max(1),
            max_pages: cfg.sync.max_pages,
            retry: RetryPolicy {
                max_attempts: cfg.sync.max_attempts,
                backoff: Duration::from_millis(cfg.sync.retry_backoff_ms),
            },
            status_table: cfg.sync.status_table.clone(),
            status_type: cfg.sync.status_type.clone(),
            incremental: cfg.sync.incremental,
            filters: cfg.api.filters.clone(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: None,
            retry: RetryPolicy::default(),
            status_table: "events".to_string(),
            status_type: "active".to_string(),
            incremental: false,
            filters: Filters::new(),
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub pages: u32,
    pub events_inserted: u64,
    pub events_updated: u64,
    pub performers_saved: u64,
    pub performers_pruned: u64,
    /// Records (or prunes) that failed to persist and were skipped.
    pub failures: u64,
}

/// Where a run stands between pages.
enum RunState {
    Init,
    Paging { page: u32, bound: Option<u32> },
    Finalizing,
    Done,
}

/// Sync every page from the source into the store, then record the run status.
///
/// A fatal fetch error aborts the run before the status is written, so a failed
/// run leaves the previous status untouched.
pub async fn run_sync<P, S, L>(
    source: &P,
    store: &S,
    ledger: &L,
    opts: &RunOptions,
    run_started: DateTime<Utc>,
) -> Result<RunSummary>
where
    P: PageSource + ?Sized,
    S: EventStore + ?Sized,
    L: StatusLedger + ?Sized,
{
    let mut summary = RunSummary::default();
    let mut filters = opts.filters.clone();
    let mut state = RunState::Init;

    loop {
        state = match state {
            RunState::Init => {
                if opts.incremental {
                    let previous = ledger
                        .load_status(&opts.status_table)
                        .await
                        .context("Failed to read previous run status")?;
                    if let Some(previous) = previous {
                        let since = previous.last_run.to_rfc3339();
                        tracing::info!(since = %since, "Only fetching events updated since last run");
                        filters.insert(UPDATED_SINCE_FILTER.to_string(), since);
                    }
                }
                RunState::Paging {
                    page: opts.start_page,
                    bound: opts.max_pages,
                }
            }
            RunState::Paging { page, bound } => {
                if bound.is_some_and(|max| page > max) {
                    RunState::Finalizing
                } else {
                    let fetched = fetch_with_retry(source, &filters, page, &opts.retry)
                        .await
                        .with_context(|| format!("Failed to fetch page {page}"))?;

                    // The first page that succeeds fixes the bound for the whole run.
                    let bound = bound.or_else(|| {
                        tracing::info!(total_pages = fetched.page.total_pages, "Discovered page count");
                        Some(fetched.page.total_pages)
                    });

                    for raw in &fetched.page.records {
                        sync_event(store, raw, run_started, &mut summary).await;
                    }

                    summary.pages += 1;
                    tracing::info!(
                        page,
                        attempts = fetched.attempts,
                        records = fetched.page.records.len(),
                        "Done with page",
                    );

                    RunState::Paging {
                        page: page + 1,
                        bound,
                    }
                }
            }
            RunState::Finalizing => {
                let status = RunStatus {
                    table: opts.status_table.clone(),
                    kind: opts.status_type.clone(),
                    last_run: run_started,
                };
                ledger
                    .save_status(&status)
                    .await
                    .context("Failed to record run status")?;
                RunState::Done
            }
            RunState::Done => break,
        };
    }

    Ok(summary)
}

/// Upsert one event and its performer links, then prune links no longer listed.
///
/// Persistence failures are logged and counted; they never abort the page.
async fn sync_event<S>(store: &S, raw: &RawEvent, run_started: DateTime<Utc>, summary: &mut RunSummary)
where
    S: EventStore + ?Sized,
{
    let mapped = map_event(raw, run_started);

    match upsert(store, &mapped.event).await {
        Ok(action) => {
            match action {
                UpsertAction::Insert => summary.events_inserted += 1,
                UpsertAction::Update => summary.events_updated += 1,
            }
            tracing::info!(
                event_id = raw.id,
                name = %raw.name,
                action = %action,
                "Successful {action} to `{}`",
                EventRow::TABLE,
            );
        }
        Err(e) => {
            summary.failures += 1;
            tracing::error!(event_id = raw.id, name = %raw.name, error = %e, "Error saving event");
        }
    }

    let mut observed = BTreeSet::new();
    for link in &mapped.performers {
        match upsert(store, link).await {
            Ok(_) => summary.performers_saved += 1,
            Err(e) => {
                summary.failures += 1;
                tracing::error!(
                    event_id = link.event_id,
                    performer_id = link.performer_id,
                    error = %e,
                    "Error saving performer link",
                );
            }
        }
        observed.insert(link.performer_id);
    }

    if !observed.is_empty() {
        tracing::info!(event_id = raw.id, performers = ?observed, "Saved performer links");
    }

    match reconcile_performers(store, raw.id, &observed).await {
        Ok(0) => {}
        Ok(pruned) => {
            summary.performers_pruned += pruned;
            tracing::info!(event_id = raw.id, pruned, "Removed stale performer links");
        }
        Err(e) => {
            summary.failures += 1;
            tracing::error!(event_id = raw.id, error = %e, "Error pruning performer links");
        }
    }
}

/// CLI overrides applied on top of the config file.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunOverrides {
    pub start_page: Option<u32>,
    pub max_pages: Option<u32>,
}

/// Run a single synchronization using the configured source, store and ledger.
pub async fn run_once(cfg: &Config, overrides: RunOverrides) -> Result<RunSummary> {
    let run_started = Utc::now();

    let store = PgStore::connect(&cfg.postgres).await?;
    store.ensure_schema().await?;

    let source = page_source_from_config(&cfg.api)?;

    let mut opts = RunOptions::from_config(cfg);
    if let Some(page) = overrides.start_page {
        opts.start_page = page.max(1);
    }
    if overrides.max_pages.is_some() {
        opts.max_pages = overrides.max_pages;
    }

    let summary = match cfg.state_backend() {
        StateBackendKind::Postgres => {
            run_sync(source.as_ref(), &store, &store, &opts, run_started).await?
        }
        StateBackendKind::File => {
            let ledger = FileStatusLedger::from_config(cfg);
            run_sync(source.as_ref(), &store, &ledger, &opts, run_started).await?
        }
    };

    tracing::info!(
        pages = summary.pages,
        inserted = summary.events_inserted,
        updated = summary.events_updated,
        performers = summary.performers_saved,
        pruned = summary.performers_pruned,
        failures = summary.failures,
        "Sync run finished",
    );

    Ok(summary)
}

/// Run daemon mode: repeatedly call run_once at a fixed interval.
pub async fn run_daemon(cfg: &Config, overrides: RunOverrides, interval_secs: u64) -> Result<()> {
    use tokio::time::interval;

    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        ticker.tick().await;

        tracing::info!("Starting sync run");
        if let Err(e) = run_once(cfg, overrides).await {
            tracing::error!(error = %format!("{e:#}"), "Sync run failed");
        }
    }
}
