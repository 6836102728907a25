use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rules_console_core::{validate_document, RemoteError, Ruleset, RulesRemote};
use rules_console_store_sqlite::{DocumentState, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod client;

pub use client::{
    HttpRulesRemote, RemoteConfig, BASE_URL_ENV, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_MS,
    TIMEOUT_MS_ENV,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Body of a whole-document save, shared by the service and the HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveRulesRequest {
    pub data: Vec<Ruleset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub source: String,
    pub imported_rulesets: usize,
    pub imported_rules: usize,
    pub state: DocumentState,
}

/// Server-side entry points over one `SQLite` database file.
#[derive(Debug, Clone)]
pub struct RulesConsoleApi {
    db_path: PathBuf,
}

impl RulesConsoleApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Read the stored rules document.
    ///
    /// # Errors
    /// Returns an error when the store cannot be migrated or read.
    pub fn fetch_rulesets(&self) -> Result<Vec<Ruleset>> {
        let store = self.open_migrated_store()?;
        store.load_rulesets()
    }

    /// Replace the stored document and return it as persisted.
    ///
    /// # Errors
    /// Returns an error when the document is invalid or persistence fails.
    pub fn save_rulesets(&self, rulesets: &[Ruleset]) -> Result<Vec<Ruleset>> {
        let mut store = self.open_migrated_store()?;
        let state = store.replace_rulesets(rulesets)?;
        debug!(revision = state.revision, "saved rules document");
        store.load_rulesets()
    }

    /// Load a JSON rules document from `path` and make it the stored document.
    ///
    /// Accepts a bare ruleset list or an object with the list under `data`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or the document is invalid.
    pub fn import_document(&self, path: &Path) -> Result<ImportSummary> {
        let rulesets = read_document_file(path)?;
        let mut store = self.open_migrated_store()?;
        let state = store.replace_rulesets(&rulesets)?;
        Ok(ImportSummary {
            source: path.display().to_string(),
            imported_rulesets: state.rulesets,
            imported_rules: state.rules,
            state,
        })
    }

    /// Report revision and digest of the stored document.
    ///
    /// # Errors
    /// Returns an error when the store cannot be migrated or read.
    pub fn document_state(&self) -> Result<DocumentState> {
        let store = self.open_migrated_store()?;
        store.document_state()
    }
}

impl RulesRemote for RulesConsoleApi {
    fn fetch_rulesets(&self) -> Result<Option<Vec<Ruleset>>, RemoteError> {
        Self::fetch_rulesets(self)
            .map(Some)
            .map_err(|err| RemoteError::Unavailable(format!("{err:#}")))
    }

    fn save_rulesets(&self, rulesets: &[Ruleset]) -> Result<Vec<Ruleset>, RemoteError> {
        validate_document(rulesets).map_err(|err| RemoteError::Rejected(err.to_string()))?;
        Self::save_rulesets(self, rulesets).map_err(|err| RemoteError::Unavailable(format!("{err:#}")))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentFile {
    Bare(Vec<Ruleset>),
    Wrapped { data: Vec<Ruleset> },
}

fn read_document_file(path: &Path) -> Result<Vec<Ruleset>> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read rules document {}", path.display()))?;
    let document: DocumentFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse rules document {}", path.display()))?;
    let rulesets = match document {
        DocumentFile::Bare(rulesets) | DocumentFile::Wrapped { data: rulesets } => rulesets,
    };
    validate_document(&rulesets)
        .map_err(|err| anyhow!("rules document {} is invalid: {err}", path.display()))?;
    Ok(rulesets)
}
