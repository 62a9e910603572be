use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::sink::{RunStatus, StatusLedger};

const DEFAULT_STATE_FILE: &str = "state.json";

/// On-disk layout: table name -> last successful run.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    tables: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    #[serde(rename = "type")]
    kind: String,
    last_run: DateTime<Utc>,
}

/// Status ledger kept in a local JSON file instead of the database.
pub struct FileStatusLedger {
    path: PathBuf,
}

impl FileStatusLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let path = cfg
            .state
            .as_ref()
            .and_then(|s| s.file_path.as_deref())
            .unwrap_or(DEFAULT_STATE_FILE);
        Self::new(path)
    }

    fn read(&self) -> Result<FileState> {
        read_state(&self.path)
    }
}

fn read_state(path: &Path) -> Result<FileState> {
    if !path.exists() {
        return Ok(FileState::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;

    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse JSON state from {}", path.display()))
}

#[async_trait]
impl StatusLedger for FileStatusLedger {
    async fn load_status(&self, table: &str) -> Result<Option<RunStatus>> {
        let state = self.read()?;
        Ok(state.tables.get(table).map(|entry| RunStatus {
            table: table.to_string(),
            kind: entry.kind.clone(),
            last_run: entry.last_run,
        }))
    }

    async fn save_status(&self, status: &RunStatus) -> Result<()> {
        let mut state = self.read()?;
        state.tables.insert(
            status.table.clone(),
            FileEntry {
                kind: status.kind.clone(),
                last_run: status.last_run,
            },
        );

        let contents = serde_json::to_string_pretty(&state)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))?;

        Ok(())
    }
}
