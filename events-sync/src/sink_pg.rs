use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls, Row};

use crate::config::PostgresConfig;
use crate::sink::{
    EventPerformerRow, EventRow, PerformerLinks, RunStatus, StatusLedger, Table,
};

const SCHEMA: &[(&str, &str)] = &[
    (
        "tevo_events",
        "CREATE TABLE IF NOT EXISTS tevo_events (
            event_id          BIGINT PRIMARY KEY,
            event_name        TEXT NOT NULL,
            event_date        TIMESTAMPTZ NOT NULL,
            venue_id          BIGINT NOT NULL,
            category_id       BIGINT NOT NULL,
            configuration_id  BIGINT,
            products_count    BIGINT NOT NULL DEFAULT 0,
            event_url         TEXT NOT NULL,
            updated_at        TIMESTAMPTZ NOT NULL,
            event_status      SMALLINT NOT NULL,
            event_state       TEXT NOT NULL,
            last_modified     TIMESTAMPTZ NOT NULL
        )",
    ),
    (
        "tevo_event_performers",
        "CREATE TABLE IF NOT EXISTS tevo_event_performers (
            event_id          BIGINT NOT NULL,
            performer_id      BIGINT NOT NULL,
            is_primary        SMALLINT NOT NULL,
            status            SMALLINT NOT NULL,
            last_modified     TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (event_id, performer_id)
        )",
    ),
    (
        "tevo_data_loader_status",
        "CREATE TABLE IF NOT EXISTS tevo_data_loader_status (
            table_name        TEXT PRIMARY KEY,
            sync_type         TEXT NOT NULL,
            last_run          TIMESTAMPTZ NOT NULL
        )",
    ),
];

/// PostgreSQL-backed event store and status ledger.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let client = connect_postgres(cfg).await?;
        Ok(Self { client })
    }

    /// Create the loader tables if they are missing.
    ///
    /// Failures are logged and tolerated; a missing table surfaces later as
    /// record-level errors.
    pub async fn ensure_schema(&self) -> Result<()> {
        for (table, ddl) in SCHEMA {
            tracing::info!(table = %table, "Ensuring table exists");
            if let Err(e) = self.client.batch_execute(ddl).await {
                tracing::warn!(
                    table = %table,
                    error = %e,
                    "Failed to create table (it may already exist with another definition)",
                );
            }
        }
        Ok(())
    }
}

/// Open a client and drive its connection on a background task.
async fn connect_postgres(cfg: &PostgresConfig) -> Result<Client> {
    let (client, connection) = pg_config(cfg)?
        .connect(NoTls)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });

    if let Some(ms) = cfg.query_timeout_ms {
        client
            .batch_execute(&format!("SET statement_timeout = {ms}"))
            .await
            .context("Failed to set PostgreSQL statement_timeout")?;
    }

    Ok(client)
}

/// Connection settings: the URL when given, otherwise the discrete fields.
fn pg_config(cfg: &PostgresConfig) -> Result<tokio_postgres::Config> {
    if let Some(url) = &cfg.url {
        return url
            .parse()
            .context("Invalid postgres.url connection string");
    }

    let mut pg = tokio_postgres::Config::new();
    pg.host(cfg.host.as_deref().unwrap_or("localhost"))
        .port(cfg.port.unwrap_or(5432))
        .user(cfg.user.as_deref().unwrap_or("postgres"))
        .dbname(cfg.dbname.as_deref().unwrap_or("postgres"));
    if let Some(password) = &cfg.password {
        pg.password(password);
    }
    if let Some(mode) = &cfg.sslmode {
        pg.ssl_mode(match mode.as_str() {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            other => anyhow::bail!("Unsupported postgres.sslmode `{other}`"),
        });
    }
    Ok(pg)
}

fn expect_one_row(affected: u64, what: &str) -> Result<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(anyhow!("{what} affected {affected} rows, expected 1"))
    }
}

fn event_from_row(row: &Row) -> Result<EventRow> {
    Ok(EventRow {
        event_id: row.try_get("event_id")?,
        event_name: row.try_get("event_name")?,
        event_date: row.try_get("event_date")?,
        venue_id: row.try_get("venue_id")?,
        category_id: row.try_get("category_id")?,
        configuration_id: row.try_get("configuration_id")?,
        products_count: row.try_get("products_count")?,
        event_url: row.try_get("event_url")?,
        updated_at: row.try_get("updated_at")?,
        event_status: row.try_get("event_status")?,
        event_state: row.try_get("event_state")?,
        last_modified: row.try_get("last_modified")?,
    })
}

fn performer_from_row(row: &Row) -> Result<EventPerformerRow> {
    let is_primary: i16 = row.try_get("is_primary")?;
    Ok(EventPerformerRow {
        event_id: row.try_get("event_id")?,
        performer_id: row.try_get("performer_id")?,
        is_primary: is_primary != 0,
        status: row.try_get("status")?,
        last_modified: row.try_get("last_modified")?,
    })
}

#[async_trait]
impl Table<EventRow> for PgStore {
    async fn find(&self, key: &i64) -> Result<Option<EventRow>> {
        let row = self
            .client
            .query_opt("SELECT * FROM tevo_events WHERE event_id = $1", &[key])
            .await
            .with_context(|| format!("Failed to look up event {key}"))?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn insert(&self, row: &EventRow) -> Result<()> {
        let affected = self
            .client
            .execute(
                "INSERT INTO tevo_events (
                    event_id, event_name, event_date, venue_id, category_id,
                    configuration_id, products_count, event_url, updated_at,
                    event_status, event_state, last_modified
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &row.event_id,
                    &row.event_name,
                    &row.event_date,
                    &row.venue_id,
                    &row.category_id,
                    &row.configuration_id,
                    &row.products_count,
                    &row.event_url,
                    &row.updated_at,
                    &row.event_status,
                    &row.event_state,
                    &row.last_modified,
                ],
            )
            .await?;
        expect_one_row(affected, "INSERT into tevo_events")
    }

    async fn update(&self, row: &EventRow) -> Result<()> {
        let affected = self
            .client
            .execute(
                "UPDATE tevo_events SET
                    event_name = $2, event_date = $3, venue_id = $4, category_id = $5,
                    configuration_id = $6, products_count = $7, event_url = $8,
                    updated_at = $9, event_status = $10, event_state = $11,
                    last_modified = $12
                 WHERE event_id = $1",
                &[
                    &row.event_id,
                    &row.event_name,
                    &row.event_date,
                    &row.venue_id,
                    &row.category_id,
                    &row.configuration_id,
                    &row.products_count,
                    &row.event_url,
                    &row.updated_at,
                    &row.event_status,
                    &row.event_state,
                    &row.last_modified,
                ],
            )
            .await?;
        expect_one_row(affected, "UPDATE of tevo_events")
    }
}

#[async_trait]
impl Table<EventPerformerRow> for PgStore {
    async fn find(&self, key: &(i64, i64)) -> Result<Option<EventPerformerRow>> {
        let (event_id, performer_id) = key;
        let row = self
            .client
            .query_opt(
                "SELECT * FROM tevo_event_performers WHERE event_id = $1 AND performer_id = $2",
                &[event_id, performer_id],
            )
            .await
            .with_context(|| format!("Failed to look up performer link {key:?}"))?;
        row.as_ref().map(performer_from_row).transpose()
    }

    async fn insert(&self, row: &EventPerformerRow) -> Result<()> {
        let is_primary = i16::from(row.is_primary);
        let affected = self
            .client
            .execute(
                "INSERT INTO tevo_event_performers (
                    event_id, performer_id, is_primary, status, last_modified
                 ) VALUES ($1, $2, $3, $4, $5)",
                &[
                    &row.event_id,
                    &row.performer_id,
                    &is_primary,
                    &row.status,
                    &row.last_modified,
                ],
            )
            .await?;
        expect_one_row(affected, "INSERT into tevo_event_performers")
    }

    async fn update(&self, row: &EventPerformerRow) -> Result<()> {
        let is_primary = i16::from(row.is_primary);
        let affected = self
            .client
            .execute(
                "UPDATE tevo_event_performers SET
                    is_primary = $3, status = $4, last_modified = $5
                 WHERE event_id = $1 AND performer_id = $2",
                &[
                    &row.event_id,
                    &row.performer_id,
                    &is_primary,
                    &row.status,
                    &row.last_modified,
                ],
            )
            .await?;
        expect_one_row(affected, "UPDATE of tevo_event_performers")
    }
}

#[async_trait]
impl PerformerLinks for PgStore {
    async fn delete_except(&self, event_id: i64, keep: &BTreeSet<i64>) -> Result<u64> {
        let keep: Vec<i64> = keep.iter().copied().collect();
        let deleted = self
            .client
            .execute(
                "DELETE FROM tevo_event_performers
                 WHERE event_id = $1 AND NOT (performer_id = ANY($2))",
                &[&event_id, &keep],
            )
            .await
            .with_context(|| format!("Failed to prune performer links of event {event_id}"))?;
        Ok(deleted)
    }
}

#[async_trait]
impl StatusLedger for PgStore {
    async fn load_status(&self, table: &str) -> Result<Option<RunStatus>> {
        let row = self
            .client
            .query_opt(
                "SELECT table_name, sync_type, last_run
                 FROM tevo_data_loader_status WHERE table_name = $1",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to read loader status for {table}"))?;

        row.map(|r| -> Result<RunStatus> {
            Ok(RunStatus {
                table: r.try_get("table_name")?,
                kind: r.try_get("sync_type")?,
                last_run: r.try_get("last_run")?,
            })
        })
        .transpose()
    }

    async fn save_status(&self, status: &RunStatus) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO tevo_data_loader_status (table_name, sync_type, last_run)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (table_name)
                 DO UPDATE SET sync_type = EXCLUDED.sync_type, last_run = EXCLUDED.last_run",
                &[&status.table, &status.kind, &status.last_run],
            )
            .await
            .with_context(|| format!("Failed to write loader status for {}", status.table))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{reconcile_performers, upsert, UpsertAction};
    use crate::testing::{event_row, performer_row, run_start};
    use tokio_postgres::config::Host;

    fn url_config(url: String) -> PostgresConfig {
        PostgresConfig {
            url: Some(url),
            host: None,
            port: None,
            user: None,
            password: None,
            dbname: None,
            sslmode: None,
            query_timeout_ms: Some(10_000),
        }
    }

    fn discrete_config() -> PostgresConfig {
        PostgresConfig {
            url: None,
            host: Some("db.internal".to_string()),
            port: None,
            user: Some("loader".to_string()),
            password: Some("pw".to_string()),
            dbname: Some("catalog".to_string()),
            sslmode: Some("require".to_string()),
            query_timeout_ms: None,
        }
    }

    #[test]
    fn connection_settings_from_discrete_fields() -> Result<()> {
        let pg = pg_config(&discrete_config())?;

        assert_eq!(pg.get_hosts(), [Host::Tcp("db.internal".to_string())]);
        assert_eq!(pg.get_ports(), [5432]);
        assert_eq!(pg.get_user(), Some("loader"));
        assert_eq!(pg.get_dbname(), Some("catalog"));
        assert_eq!(pg.get_password(), Some(&b"pw"[..]));
        assert_eq!(pg.get_ssl_mode(), SslMode::Require);
        Ok(())
    }

    #[test]
    fn connection_settings_prefer_url() -> Result<()> {
        let mut cfg = discrete_config();
        cfg.url = Some("postgres://etl@warehouse:6543/events".to_string());

        let pg = pg_config(&cfg)?;
        assert_eq!(pg.get_hosts(), [Host::Tcp("warehouse".to_string())]);
        assert_eq!(pg.get_ports(), [6543]);
        assert_eq!(pg.get_user(), Some("etl"));
        assert_eq!(pg.get_dbname(), Some("events"));
        Ok(())
    }

    #[test]
    fn unknown_sslmode_is_rejected() {
        let mut cfg = discrete_config();
        cfg.sslmode = Some("verify-everything".to_string());

        let err = pg_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("verify-everything"));
    }

    /// Optional PostgreSQL round trip through the upsert engine and reconciler.
    ///
    /// Uses environment variable:
    /// - POSTGRES_URL
    ///
    /// If POSTGRES_URL is not set, the test is a no-op and returns Ok(()).
    #[tokio::test]
    async fn postgres_upsert_and_reconcile_smoke_test() -> Result<()> {
        let url = match std::env::var("POSTGRES_URL") {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };

        let store = PgStore::connect(&url_config(url)).await?;
        store.ensure_schema().await?;

        let event_id = 9_000_000_001;
        let started = run_start();
        store
            .client
            .execute("DELETE FROM tevo_event_performers WHERE event_id = $1", &[&event_id])
            .await?;
        store
            .client
            .execute("DELETE FROM tevo_events WHERE event_id = $1", &[&event_id])
            .await?;

        let event = event_row(event_id, started);
        assert_eq!(upsert(&store, &event).await?, UpsertAction::Insert);
        assert_eq!(upsert(&store, &event).await?, UpsertAction::Update);
        let stored = <PgStore as Table<EventRow>>::find(&store, &event_id).await?;
        assert_eq!(stored.as_ref(), Some(&event));

        for performer in [1, 2, 3] {
            upsert(&store, &performer_row(event_id, performer, false, started)).await?;
        }
        let keep: BTreeSet<i64> = [2, 3].into_iter().collect();
        assert_eq!(reconcile_performers(&store, event_id, &keep).await?, 1);
        let gone =
            <PgStore as Table<EventPerformerRow>>::find(&store, &(event_id, 1)).await?;
        assert!(gone.is_none());
        Ok(())
    }
}
