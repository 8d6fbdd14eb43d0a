use std::path::Path;

use anyhow::{anyhow, Context, Result};
use attribute_store_core::{Entry, EntryStore};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entries (
  user_id INTEGER NOT NULL CHECK (user_id >= 0),
  key TEXT NOT NULL CHECK (length(key) BETWEEN 1 AND 128),
  value TEXT NOT NULL,
  PRIMARY KEY (user_id, key)
);
";

const UPSERT_ENTRY_SQL: &str = r"
INSERT INTO entries(user_id, key, value) VALUES (?1, ?2, ?3)
ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub entry_count: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed entry store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
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
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// A database whose `entries` table predates migration tracking is adopted as
    /// version 1 without rewriting its rows.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.apply_migration_1()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<i64> {
        if table_exists(&self.conn, "entries")? {
            for column in ["user_id", "key", "value"] {
                if !table_has_column(&self.conn, "entries", column)? {
                    return Err(anyhow!(
                        "database schema is invalid: entries is missing column {column}"
                    ));
                }
            }
        }

        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(1)
    }

    /// Look up one entry by its composite key.
    ///
    /// # Errors
    /// Returns an error when the query fails; a missing entry is `Ok(None)`.
    pub fn get_entry(&self, user_id: i64, key: &str) -> Result<Option<Entry>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM entries WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to load entry ({user_id}, {key})"))?;

        Ok(value.map(|value| Entry::new(user_id, key, value)))
    }

    /// Insert or replace every entry inside a single transaction.
    ///
    /// # Errors
    /// Returns an error when any entry fails validation (before anything is written)
    /// or when any write fails, in which case the whole batch is rolled back.
    pub fn upsert_entries(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            entry
                .validate()
                .map_err(|err| anyhow!("entry validation failed for {entry}: {err}"))?;
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        {
            let mut stmt = tx.prepare(UPSERT_ENTRY_SQL).context("failed to prepare upsert")?;
            for entry in entries {
                stmt.execute(params![entry.user_id, entry.key, entry.value])
                    .with_context(|| format!("failed to upsert entry {entry}"))?;
            }
        }
        tx.commit().context("failed to commit upsert transaction")?;
        Ok(())
    }

    /// Load every stored entry ordered by user id, then key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn list_entries(&self) -> Result<Vec<Entry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, key, value FROM entries ORDER BY user_id ASC, key ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Entry { user_id: row.get(0)?, key: row.get(1)?, value: row.get(2)? })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode entry row")?);
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_entries(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get::<_, i64>(0))
            .context("failed to count entries")
    }

    /// Run `SQLite` `quick_check` and report schema state alongside it.
    ///
    /// # Errors
    /// Returns an error when the checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run quick_check")?;
        let schema_status = self.schema_status()?;
        let entry_count =
            if table_exists(&self.conn, "entries")? { self.count_entries()? } else { 0 };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            entry_count,
            schema_status,
        })
    }
}

impl EntryStore for SqliteStore {
    type Error = anyhow::Error;

    fn get(&self, user_id: i64, key: &str) -> Result<Option<Entry>> {
        self.get_entry(user_id, key)
    }

    fn upsert_all(&mut self, entries: &[Entry]) -> Result<()> {
        self.upsert_entries(entries)
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_has_column(conn, "entries", "value")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
