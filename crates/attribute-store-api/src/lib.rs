use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use attribute_store_core::{
    export_entries, import_entries, AppConfig, CsvExport, Entry, ImportSummary, PipelineError,
    UploadPolicy, Validator,
};
use attribute_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// CSV export materialised in the export directory.
///
/// The backing file is removed when the artifact is dropped.
#[derive(Debug)]
pub struct ExportArtifact {
    file: NamedTempFile,
    filename: &'static str,
    rows: usize,
}

impl ExportArtifact {
    #[must_use]
    pub fn filename(&self) -> &str {
        self.filename
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// # Errors
    /// Returns an error when the artifact file cannot be read back.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        fs::read(self.path())
            .with_context(|| format!("failed to read export artifact {}", self.path().display()))
    }
}

/// Load configuration from an optional YAML file. Missing keys keep their defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or is not valid YAML for [`AppConfig`].
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(AppConfig::default());
    }

    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct AttributeStoreApi {
    db_path: PathBuf,
    validator: Validator,
    upload: UploadPolicy,
    export_dir: PathBuf,
}

impl AttributeStoreApi {
    /// Build the API, compiling the configured patterns up front.
    ///
    /// # Errors
    /// Returns an error when any configured pattern is not a valid regular expression.
    pub fn new(db_path: PathBuf, config: &AppConfig) -> Result<Self> {
        let validator = Validator::new(&config.patterns)?;
        Ok(Self {
            db_path,
            validator,
            upload: config.upload.clone(),
            export_dir: config.export_dir.clone(),
        })
    }

    #[must_use]
    pub fn upload_policy(&self) -> &UploadPolicy {
        &self.upload
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
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
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the integrity checks cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = SqliteStore::open(&self.db_path)?;
        store.integrity_check()
    }

    /// Build the CSV snapshot for the requested user ids and attributes.
    ///
    /// The parameters are validated before the database is opened.
    ///
    /// # Errors
    /// Returns an [`attribute_store_core::AttrError`] (downcastable) for invalid
    /// parameters, or a store error when lookups fail.
    pub fn export(&self, user_ids: &str, attributes: &str) -> Result<CsvExport> {
        self.validator.check_export_params(user_ids, attributes)?;
        let store = self.open_store()?;
        let export = export_entries(&self.validator, &store, user_ids, attributes)
            .map_err(pipeline_error)?;
        tracing::debug!(rows = export.rows, "export built");
        Ok(export)
    }

    /// Build the CSV snapshot and write it to a scoped file in the export directory.
    ///
    /// # Errors
    /// Returns the errors of [`Self::export`], or an error when the file cannot be written.
    pub fn export_artifact(&self, user_ids: &str, attributes: &str) -> Result<ExportArtifact> {
        let export = self.export(user_ids, attributes)?;

        fs::create_dir_all(&self.export_dir).with_context(|| {
            format!("failed to create export directory {}", self.export_dir.display())
        })?;
        let mut file = tempfile::Builder::new()
            .prefix("export-")
            .suffix(".csv")
            .tempfile_in(&self.export_dir)
            .with_context(|| {
                format!("failed to create export file in {}", self.export_dir.display())
            })?;
        file.write_all(&export.bytes).context("failed to write export file")?;
        file.flush().context("failed to flush export file")?;

        Ok(ExportArtifact { file, filename: export.filename, rows: export.rows })
    }

    /// Validate a CSV body and merge every row into the store, all or nothing.
    ///
    /// # Errors
    /// Returns [`attribute_store_core::AttrError::MalformedRow`] (downcastable) for the
    /// first invalid row, or a store error when the commit fails.
    pub fn import_csv(&self, body: &[u8]) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        let summary = match import_entries(&self.validator, &mut store, body) {
            Ok(summary) => summary,
            Err(err) => {
                let err = pipeline_error(err);
                tracing::warn!(error = %err, "import rejected");
                return Err(err);
            }
        };
        tracing::info!(rows = summary.rows, "import committed");
        Ok(summary)
    }

    /// Check an uploaded file against the upload policy, then import it.
    ///
    /// # Errors
    /// Returns [`attribute_store_core::AttrError::UploadRejected`] before the store is
    /// opened when the file is missing or has a disallowed extension, otherwise the
    /// errors of [`Self::import_csv`].
    pub fn import_upload(&self, filename: Option<&str>, body: &[u8]) -> Result<ImportSummary> {
        if let Err(err) = self.upload.check_upload(filename) {
            tracing::warn!(filename = ?filename, "upload rejected");
            return Err(err.into());
        }
        self.import_csv(body)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_entries(&self) -> Result<Vec<Entry>> {
        let store = self.open_store()?;
        store.list_entries()
    }
}

fn pipeline_error(err: PipelineError<anyhow::Error>) -> anyhow::Error {
    match err {
        PipelineError::Rejected(err) => err.into(),
        PipelineError::Store(err) => err.context("entry store failure"),
    }
}
