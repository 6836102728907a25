use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rules_console_core::{validate_document, Rule, RuleId, Ruleset, RulesetId};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rulesets (
  ruleset_id TEXT PRIMARY KEY CHECK (length(ruleset_id) > 0),
  position INTEGER NOT NULL CHECK (position >= 0),
  name TEXT NOT NULL,
  active INTEGER CHECK (active IS NULL OR active IN (0, 1)),
  tuning_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
  ruleset_id TEXT NOT NULL,
  rule_id TEXT NOT NULL CHECK (length(rule_id) > 0),
  position INTEGER NOT NULL CHECK (position >= 0),
  code TEXT NOT NULL,
  codename TEXT,
  name TEXT NOT NULL,
  description TEXT,
  premium INTEGER NOT NULL CHECK (premium IN (0, 1)),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  mark_as_unauthorized INTEGER NOT NULL CHECK (mark_as_unauthorized IN (0, 1)),
  mark_as_fraud INTEGER NOT NULL CHECK (mark_as_fraud IN (0, 1)),
  custom_parameters TEXT NOT NULL,
  extra_json TEXT NOT NULL,
  PRIMARY KEY (ruleset_id, rule_id),
  CHECK (active = 1 OR (mark_as_unauthorized = 0 AND mark_as_fraud = 0)),
  CHECK (NOT (mark_as_unauthorized = 1 AND mark_as_fraud = 1)),
  FOREIGN KEY (ruleset_id) REFERENCES rulesets(ruleset_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_rulesets_position ON rulesets(position);
CREATE INDEX IF NOT EXISTS idx_rules_position ON rules(ruleset_id, position);
CREATE INDEX IF NOT EXISTS idx_rules_rule_id ON rules(rule_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS document_state (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  revision INTEGER NOT NULL CHECK (revision >= 1),
  updated_at TEXT NOT NULL,
  sha256 TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Bookkeeping for the stored document. `revision` is 0 until the first save.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentState {
    pub revision: i64,
    pub updated_at: Option<String>,
    pub sha256: String,
    pub rulesets: usize,
    pub rules: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed rules store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied schema migration");
        Ok(())
    }

    /// Load the stored document in stored order. Every rule comes back unflagged.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn load_rulesets(&self) -> Result<Vec<Ruleset>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ruleset_id, name, active, tuning_json
                 FROM rulesets
                 ORDER BY position ASC, ruleset_id ASC",
            )
            .context("failed to prepare ruleset query")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<bool>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut rulesets = Vec::new();
        for row in rows {
            let (ruleset_id, name, active, tuning_json) = row?;
            let tuning: Map<String, Value> = serde_json::from_str(&tuning_json)
                .with_context(|| format!("invalid tuning_json for ruleset {ruleset_id}"))?;
            let rules = self.load_rules(&ruleset_id)?;
            rulesets.push(Ruleset { id: RulesetId(ruleset_id), name, active, rules, tuning });
        }

        Ok(rulesets)
    }

    fn load_rules(&self, ruleset_id: &str) -> Result<Vec<Rule>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT
                    rule_id, code, codename, name, description, premium,
                    active, mark_as_unauthorized, mark_as_fraud, custom_parameters, extra_json
                 FROM rules
                 WHERE ruleset_id = ?1
                 ORDER BY position ASC, rule_id ASC",
            )
            .context("failed to prepare rule query")?;

        let rows = stmt.query_map(params![ruleset_id], |row| {
            let rule = Rule {
                rule_id: RuleId(row.get(0)?),
                code: row.get(1)?,
                codename: row.get(2)?,
                name: row.get(3)?,
                description: row.get(4)?,
                premium: row.get(5)?,
                active: row.get(6)?,
                mark_as_unauthorized: row.get(7)?,
                mark_as_fraud: row.get(8)?,
                custom_parameters: row.get(9)?,
                is_changed: false,
                extra: Map::new(),
            };
            Ok((rule, row.get::<_, String>(10)?))
        })?;

        let mut rules = Vec::new();
        for row in rows {
            let (mut rule, extra_json) =
                row.with_context(|| format!("failed to decode rule in ruleset {ruleset_id}"))?;
            rule.extra = serde_json::from_str(&extra_json).with_context(|| {
                format!("invalid extra_json for rule {} in ruleset {ruleset_id}", rule.rule_id)
            })?;
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Replace the whole stored document with `rulesets` in one transaction.
    ///
    /// The last writer wins. Change markers are not persisted.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write in the transaction fails.
    pub fn replace_rulesets(&mut self, rulesets: &[Ruleset]) -> Result<DocumentState> {
        validate_document(rulesets).map_err(|err| anyhow!("document validation failed: {err}"))?;

        let normalized = normalized_document(rulesets);
        let digest = document_digest(&normalized)?;
        let updated_at = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM rules", []).context("failed to clear rules")?;
        tx.execute("DELETE FROM rulesets", []).context("failed to clear rulesets")?;

        for (position, ruleset) in normalized.iter().enumerate() {
            insert_ruleset(&tx, position, ruleset)?;
        }

        tx.execute(
            "INSERT INTO document_state(id, revision, updated_at, sha256)
             VALUES (1, 1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               revision = revision + 1,
               updated_at = excluded.updated_at,
               sha256 = excluded.sha256",
            params![updated_at, digest],
        )
        .context("failed to update document state")?;

        tx.commit().context("failed to commit document replacement")?;

        let state = self.document_state()?;
        info!(
            revision = state.revision,
            rulesets = state.rulesets,
            rules = state.rules,
            sha256 = %state.sha256,
            "replaced rules document"
        );
        Ok(state)
    }

    /// Report the revision, digest and size of the stored document.
    ///
    /// # Errors
    /// Returns an error when the state row or the counts cannot be read.
    pub fn document_state(&self) -> Result<DocumentState> {
        let stored = self
            .conn
            .query_row(
                "SELECT revision, updated_at, sha256 FROM document_state WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()
            .context("failed to read document state")?;

        let rulesets = count_rows(&self.conn, "rulesets")?;
        let rules = count_rows(&self.conn, "rules")?;

        let state = match stored {
            Some((revision, updated_at, sha256)) => {
                DocumentState { revision, updated_at: Some(updated_at), sha256, rulesets, rules }
            }
            None => DocumentState {
                revision: 0,
                updated_at: None,
                sha256: document_digest(&[])?,
                rulesets,
                rules,
            },
        };
        debug!(revision = state.revision, "read document state");
        Ok(state)
    }
}

fn insert_ruleset(tx: &Transaction<'_>, position: usize, ruleset: &Ruleset) -> Result<()> {
    let tuning_json =
        serde_json::to_string(&ruleset.tuning).context("failed to serialize ruleset tuning")?;
    tx.execute(
        "INSERT INTO rulesets(ruleset_id, position, name, active, tuning_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![ruleset.id.as_str(), position_value(position)?, ruleset.name, ruleset.active, tuning_json],
    )
    .with_context(|| format!("failed to insert ruleset {}", ruleset.id))?;

    for (position, rule) in ruleset.rules.iter().enumerate() {
        let extra_json = serde_json::to_string(&rule.extra)
            .with_context(|| format!("failed to serialize extra fields of rule {}", rule.rule_id))?;
        tx.execute(
            "INSERT INTO rules(
                ruleset_id, rule_id, position, code, codename, name, description, premium,
                active, mark_as_unauthorized, mark_as_fraud, custom_parameters, extra_json
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12, ?13
            )",
            params![
                ruleset.id.as_str(),
                rule.rule_id.as_str(),
                position_value(position)?,
                rule.code,
                rule.codename,
                rule.name,
                rule.description,
                rule.premium,
                rule.active,
                rule.mark_as_unauthorized,
                rule.mark_as_fraud,
                rule.custom_parameters,
                extra_json,
            ],
        )
        .with_context(|| format!("failed to insert rule {} in ruleset {}", rule.rule_id, ruleset.id))?;
    }

    Ok(())
}

fn normalized_document(rulesets: &[Ruleset]) -> Vec<Ruleset> {
    let mut normalized = rulesets.to_vec();
    for rule in normalized.iter_mut().flat_map(|ruleset| ruleset.rules.iter_mut()) {
        rule.is_changed = false;
    }
    normalized
}

fn document_digest(rulesets: &[Ruleset]) -> Result<String> {
    let bytes = serde_json::to_vec(rulesets).context("failed to serialize rules document")?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).with_context(|| format!("negative row count in {table}"))
}

fn position_value(position: usize) -> Result<i64> {
    i64::try_from(position).context("document position exceeds sqlite integer range")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
